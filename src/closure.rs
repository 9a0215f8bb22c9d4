//! Closures and the heap-allocated environments that back upvalues.

use crate::heap::Handle;
use crate::value::Value;

/// A function template bound to an (optional) captured environment.
///
/// `env` is `None` for functions that capture nothing (the common case,
/// since only functions whose locals are referenced by a nested function get
/// `upval_locals` set on their template and therefore need one).
pub struct Closure {
    pub template: Handle,
    pub env: Option<Handle>,
    /// Set when this closure was built from a `coroutine` expression rather
    /// than a plain function literal: calling it creates a new [`crate::thread::Thread`]
    /// instead of running inline on the caller's frame stack.
    pub is_coroutine: bool,
}

impl Closure {
    pub fn new(template: Handle, env: Option<Handle>, is_coroutine: bool) -> Self {
        Self {
            template,
            env,
            is_coroutine,
        }
    }
}

/// A heap-allocated bank of local slots, used in place of a frame's flat
/// locals whenever a nested function closes over them. `parent` chains to the
/// enclosing function's environment, mirroring nested-block/nested-function
/// scoping.
pub struct Environment {
    pub slots: Vec<Value>,
    pub parent: Option<Handle>,
}

impl Environment {
    pub fn new(n_slots: usize, parent: Option<Handle>) -> Self {
        Self {
            slots: vec![Value::Null; n_slots],
            parent,
        }
    }
}
