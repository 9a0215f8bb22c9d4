//! The embedding API: the surface a host program actually uses to load
//! scripts, register native functions, and drive calls, without having to
//! reach into `State`/`vm`/`heap` internals directly.

use std::rc::Rc;

use crate::closure::Closure;
use crate::compiler;
use crate::config::Limits;
use crate::error::{VmError, VmResult};
use crate::function::FunctionTemplate;
use crate::heap::{GcConfig, Handle, ObjectKind};
use crate::native::{Directive, NativeFn};
use crate::object::table::Table;
use crate::object::type_descriptor::TypeDescriptor;
use crate::state::State;
use crate::trace;
use crate::value::Value;
use crate::vm;

pub struct Vm {
    pub state: State,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(Limits::default(), GcConfig::default())
    }

    pub fn with_config(limits: Limits, gc_config: GcConfig) -> Self {
        Self { state: State::new(limits, gc_config) }
    }

    /// Compiles `source` into a callable closure without running it.
    pub fn load(&mut self, source: &str) -> VmResult<Value> {
        let template_handle = compiler::compile(&mut self.state.heap, source)?;
        let closure = Closure::new(template_handle, None, false);
        let handle = self.state.heap.alloc(ObjectKind::Closure(closure), false);
        Ok(Value::Heap(handle))
    }

    /// Compiles and immediately runs `source` with no arguments, the way a
    /// host typically runs a whole script file.
    pub fn run(&mut self, source: &str) -> VmResult<Vec<Value>> {
        let closure = self.load(source)?;
        self.call(closure, Vec::new())
    }

    pub fn call(&mut self, callee: Value, args: Vec<Value>) -> VmResult<Vec<Value>> {
        match vm::call_value(&mut self.state, callee, args) {
            Ok(values) => {
                self.state.panic_caught = false;
                Ok(values)
            }
            Err(e) => {
                self.state.stack_trace = Some(trace::format(&trace::capture(&self.state)));
                self.state.last_error = Some(e.clone());
                Err(e)
            }
        }
    }

    /// Registers a native function as a global, callable from script the
    /// same way any other function is.
    pub fn register_native(
        &mut self,
        name: &str,
        n_args: u8,
        opt_args: u8,
        variadic: bool,
        f: impl Fn(&mut State, usize, u32) -> VmResult<Directive> + 'static,
    ) {
        let native: NativeFn = Rc::new(f);
        let template = FunctionTemplate::new_native(Some(name.to_string()), n_args, opt_args, variadic, native);
        let template_handle = self.state.heap.alloc(ObjectKind::Function(template), true);
        let closure = Closure::new(template_handle, None, false);
        let closure_handle = self.state.heap.alloc(ObjectKind::Closure(closure), false);
        self.state.set_global(name.as_bytes(), Value::Heap(closure_handle));
    }

    /// Installs the fallback invoked for a `CMD` whose name doesn't match
    /// any global: it's called with the command name as its first
    /// argument, followed by the command's own arguments.
    pub fn set_command_dispatcher(&mut self, dispatcher: Value) {
        self.state.command_dispatcher = dispatcher;
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.state.set_global(name.as_bytes(), value);
    }

    pub fn get_global(&self, name: &str) -> Value {
        self.state.get_global(name.as_bytes())
    }

    pub fn new_object(&mut self) -> Value {
        let handle = self.state.heap.alloc(ObjectKind::Object(Table::new()), false);
        Value::Heap(handle)
    }

    pub fn new_string(&mut self, bytes: &[u8]) -> Value {
        Value::new_string(&mut self.state.heap, bytes)
    }

    pub fn get_field(&self, obj: Value, key: &[u8]) -> Option<Value> {
        let handle = obj.as_handle()?;
        match self.state.heap.get(handle) {
            ObjectKind::Object(t) => t.get(key).copied(),
            _ => None,
        }
    }

    pub fn set_field(&mut self, obj: Value, key: &[u8], value: Value) -> VmResult<()> {
        let handle = obj.as_handle().ok_or(VmError::IndexOnNonObject)?;
        if self.state.heap.is_const(handle) {
            return Err(VmError::MutateConst);
        }
        self.state.heap.write_barrier(handle);
        match self.state.heap.get_mut(handle) {
            ObjectKind::Object(t) => {
                t.set(key, value);
                Ok(())
            }
            _ => Err(VmError::IndexOnNonObject),
        }
    }

    /// Attaches a type descriptor (destructor and/or `next` hook) to an
    /// object the host allocated.
    pub fn set_type_descriptor(&mut self, obj: Value, descriptor: TypeDescriptor) -> VmResult<()> {
        let handle = obj.as_handle().ok_or(VmError::IndexOnNonObject)?;
        self.state.heap.set_type_descriptor(handle, Rc::new(descriptor));
        Ok(())
    }

    pub fn collect_garbage_now(&mut self) {
        self.state.collect_garbage_now();
    }

    pub fn configure_gc(&mut self, config: GcConfig) {
        self.state.heap.config = config;
    }

    pub fn last_error(&self) -> Option<&VmError> {
        self.state.last_error.as_ref()
    }

    pub fn stack_trace(&self) -> Option<&str> {
        self.state.stack_trace.as_deref()
    }

    pub fn panic_caught(&self) -> bool {
        self.state.panic_caught
    }

    pub fn heap_live_count(&self) -> usize {
        self.state.heap.live_count()
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
