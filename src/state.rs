//! The process-wide interpreter state: the heap, globals, the running
//! thread and its suspended parents, and the bits of bookkeeping the
//! embedding API exposes (limits, the last panic, the cached stack trace).

use crate::config::Limits;
use crate::error::{VmError, VmResult};
use crate::gc;
use crate::heap::{GcConfig, Handle, Heap, ObjectKind};
use crate::object::table::Table;
use crate::thread::Thread;
use crate::value::Value;

pub struct State {
    pub heap: Heap,
    pub globals: Handle,
    /// Value invoked for a `CMD` instruction that doesn't resolve to a
    /// global function; `Null` means no dispatcher is registered.
    pub command_dispatcher: Value,
    pub current_thread: Handle,
    /// LIFO stack of threads suspended while `current_thread` (a coroutine
    /// resumed from within another coroutine) runs.
    pub parent_threads: Vec<Handle>,
    pub limits: Limits,
    pub last_error: Option<VmError>,
    pub panic_caught: bool,
    pub stack_trace: Option<String>,
    gc_cycle_active: bool,
}

impl State {
    pub fn new(limits: Limits, gc_config: GcConfig) -> Self {
        let mut heap = Heap::new(gc_config);
        let globals = heap.alloc(ObjectKind::Object(Table::new()), false);
        let current_thread = heap.alloc(ObjectKind::Thread(Thread::new()), false);

        Self {
            heap,
            globals,
            command_dispatcher: Value::Null,
            current_thread,
            parent_threads: Vec::new(),
            limits,
            last_error: None,
            panic_caught: false,
            stack_trace: None,
            gc_cycle_active: false,
        }
    }

    pub fn current_thread(&self) -> &Thread {
        match self.heap.get(self.current_thread) {
            ObjectKind::Thread(t) => t,
            _ => unreachable!("current_thread handle must always name a Thread"),
        }
    }

    pub fn current_thread_mut(&mut self) -> &mut Thread {
        match self.heap.get_mut(self.current_thread) {
            ObjectKind::Thread(t) => t,
            _ => unreachable!("current_thread handle must always name a Thread"),
        }
    }

    pub fn globals(&self) -> &Table {
        match self.heap.get(self.globals) {
            ObjectKind::Object(t) => t,
            _ => unreachable!("globals handle must always name an Object"),
        }
    }

    pub fn globals_mut(&mut self) -> &mut Table {
        let handle = self.globals;
        self.heap.write_barrier(handle);
        match self.heap.get_mut(handle) {
            ObjectKind::Object(t) => t,
            _ => unreachable!("globals handle must always name an Object"),
        }
    }

    pub fn set_global(&mut self, name: &[u8], value: Value) {
        self.globals_mut().set(name, value);
    }

    pub fn get_global(&self, name: &[u8]) -> Value {
        self.globals().get(name).copied().unwrap_or(Value::Null)
    }

    /// Records a fresh panic as the last error, ready for `try` or the host
    /// to inspect, and clears any stale cached trace.
    pub fn raise(&mut self, error: VmError) -> VmError {
        self.last_error = Some(error.clone());
        self.stack_trace = None;
        error
    }

    /// Returns the current operand stack depth: a checkpoint a caller can
    /// later pass to [`Self::restore_stack`] to discard everything pushed
    /// since, used to clean up a thread's stack after a panic is caught
    /// partway through evaluating an expression.
    pub fn save_stack(&self) -> usize {
        self.current_thread().stack.len()
    }

    /// Truncates the current thread's operand stack back to a checkpoint
    /// taken by [`Self::save_stack`]. A no-op if the stack is already
    /// shorter (can't ever happen in well-formed unwinding, but truncate
    /// tolerates it rather than panicking).
    pub fn restore_stack(&mut self, mark: usize) {
        let thread = self.current_thread_mut();
        if thread.stack.len() > mark {
            thread.stack.truncate(mark);
        }
    }

    pub fn push(&mut self, v: Value) -> VmResult<()> {
        if self.current_thread().stack.len() >= self.limits.max_stack_size {
            return Err(VmError::StackOverflow {
                max: self.limits.max_stack_size,
            });
        }
        // The thread is traced through its `stack`/`frames` fields; pushing
        // onto an already-Black thread mid-cycle must re-grey it or the new
        // value can be swept as unreachable before the next mark pass sees it.
        self.heap.write_barrier(self.current_thread);
        self.current_thread_mut().push(v);
        Ok(())
    }

    pub fn pop(&mut self) -> VmResult<Value> {
        self.heap.write_barrier(self.current_thread);
        self.current_thread_mut().pop().ok_or(VmError::StackUnderflow {
            requested: 1,
            available: 0,
        })
    }

    /// Reads the `index`-th argument of the native function currently on
    /// top of the current thread's frame stack. Out-of-range reads (an
    /// optional argument the caller didn't supply) return `Null`.
    pub fn arg(&self, index: usize) -> Value {
        let thread = self.current_thread();
        let frame = thread.frames.last().expect("arg() called outside a native call");
        thread.stack.get(frame.base + index).copied().unwrap_or(Value::Null)
    }

    pub fn arg_count(&self) -> usize {
        self.current_thread()
            .frames
            .last()
            .map(|f| f.arg_count)
            .unwrap_or(0)
    }

    /// Gives the running native function a place to stash scratch values
    /// across re-entries, allocating it on first use.
    pub fn native_locals_mut(&mut self) -> &mut Vec<Value> {
        let thread = self.current_thread_mut();
        let frame = thread.frames.last_mut().expect("native_locals_mut() called outside a native call");
        &mut frame
            .native_locals
            .get_or_insert_with(|| crate::frame::NativeLocals { values: Vec::new(), destructor: None })
            .values
    }

    pub fn set_native_locals_destructor(&mut self, destructor: Box<dyn FnOnce(&mut [Value])>) {
        let thread = self.current_thread_mut();
        let frame = thread.frames.last_mut().expect("set_native_locals_destructor() called outside a native call");
        let locals = frame
            .native_locals
            .get_or_insert_with(|| crate::frame::NativeLocals { values: Vec::new(), destructor: None });
        locals.destructor = Some(destructor);
    }

    pub fn invocation_depth(&self) -> usize {
        self.parent_threads
            .iter()
            .map(|&h| match self.heap.get(h) {
                ObjectKind::Thread(t) => t.frames.len(),
                _ => 0,
            })
            .sum::<usize>()
            + self.current_thread().frames.len()
    }

    /// Runs one bounded increment of garbage collection if pacing says one
    /// is due. Safe to call after every allocation-heavy instruction; most
    /// calls are no-ops because `Heap::should_step` only trips every
    /// `gc_freq` allocations.
    pub fn gc_maybe_step(&mut self) {
        if !self.gc_cycle_active {
            if !self.heap.should_step() {
                return;
            }
            gc::mark_roots(
                &mut self.heap,
                self.globals,
                self.command_dispatcher,
                self.current_thread,
                &self.parent_threads,
            );
            self.gc_cycle_active = true;
        }

        let budget = self.heap.config.gc_step_size;
        if gc::step(&mut self.heap, budget) {
            self.heap.sweep();
            self.gc_cycle_active = false;
        }
    }

    /// Forces an entire collection cycle to completion, bypassing pacing.
    /// Exposed to hosts that want a deterministic "collect now" control.
    pub fn collect_garbage_now(&mut self) {
        gc::collect_full(
            &mut self.heap,
            self.globals,
            self.command_dispatcher,
            self.current_thread,
            &self.parent_threads,
        );
        self.gc_cycle_active = false;
    }
}
