//! The host-callable ("native function") protocol.
//!
//! A native function doesn't get its own native call stack frame the way a
//! bytecode function does; instead it runs synchronously and tells the
//! interpreter what to do next by returning a [`Directive`]. Most native
//! functions return `Directive::Return` immediately, but a function that
//! needs to call back into scripted code (e.g. a `map` implementation
//! invoking its callback argument) returns `Directive::Call` with a `step`
//! number, and the interpreter re-invokes the same native function at that
//! step once the callback has run, passing its result back in.

use std::rc::Rc;

use crate::error::VmError;
use crate::state::State;
use crate::value::Value;

pub type NativeFn = Rc<dyn Fn(&mut State, usize, u32) -> crate::error::VmResult<Directive>>;

/// What a native function wants the interpreter to do after one invocation.
pub enum Directive {
    /// Done: these values are the call's results.
    Return(Vec<Value>),
    /// Call `callee` with `args`, then re-invoke this native function at
    /// `resume_step` with the callee's results pushed onto the stack.
    Call {
        callee: Value,
        args: Vec<Value>,
        resume_step: u32,
    },
    /// Like `Call`, but a panic raised by `callee` is caught and delivered to
    /// the resumed step as an error value rather than propagating.
    TryCall {
        callee: Value,
        args: Vec<Value>,
        resume_step: u32,
    },
    /// Raise a panic as if the native function had triggered one directly.
    Err(VmError),
    /// Suspend the current coroutine, handing these values to whoever
    /// resumes it, then re-invoke this native function at the next step once
    /// resumed.
    Yield { values: Vec<Value>, resume_step: u32 },
    /// Like `Yield`, but this is the thread's final value: the thread is
    /// marked done immediately rather than waiting to be resumed again.
    YieldLast(Vec<Value>),
    /// Pull the next value out of an iterable argument and resume at the
    /// next step with it (or with nothing, if exhausted).
    Next { target: Value, resume_step: u32 },
    /// Like `Next`, but addressing a specific slot/cursor rather than the
    /// implicit iteration position (used by explicit-cursor iteration).
    NextS {
        target: Value,
        slot: usize,
        resume_step: u32,
    },
    /// Re-invoke this same native function immediately with the same
    /// arguments, at the next step, without yielding control back to the
    /// bytecode loop in between.
    Repeat { resume_step: u32 },
}
