//! The bytecode dispatch loop.
//!
//! Frames for a single thread are driven by one flat loop rather than by
//! recursing through Rust's call stack for every scripted call: `CALL`/`CMD`
//! push a [`Frame`] and the loop just keeps going, and `RETURN` pops one and
//! feeds its results to whichever frame is now on top. Native functions are
//! driven the same way, one [`Directive`] at a time, so a native function
//! that calls back into script never needs its own native stack frame either
//! — the one exception is coroutine suspension, which really does have to
//! stop the loop and hand control back to whoever resumed the thread.

use crate::closure::Closure;
use crate::error::{VmError, VmResult};
use crate::frame::{Frame, TryFrame};
use crate::function::FunctionCode;
use crate::heap::{Handle, ObjectKind};
use crate::native::Directive;
use crate::object::table::Table;
use crate::opcode::{cmd_unpack, OpCode};
use crate::state::State;
use crate::thread::Thread;
use crate::value::Value;

/// What happened to the thread being driven by [`run_until`]: it unwound
/// back to the target frame depth with values pushed for the caller, or it
/// suspended (via `yield`) with values to hand to whoever resumed it.
pub enum RunOutcome {
    Returned,
    Yielded(Vec<Value>),
}

/// Calls a closure value with `args`, running it to completion (including
/// any nested calls) on the current thread, and returns its result values.
/// This is the entry point both the embedding API and native functions use.
pub fn call_value(state: &mut State, callee: Value, args: Vec<Value>) -> VmResult<Vec<Value>> {
    let closure_handle = match callee.as_handle() {
        Some(h) if matches!(state.heap.get(h), ObjectKind::Closure(_)) => h,
        _ => {
            return Err(VmError::TypeMismatch {
                expected: "closure".into(),
                actual: state.heap.type_name_of_value(&callee),
            })
        }
    };

    if state.invocation_depth() >= state.limits.max_invocation_stack_size {
        return Err(VmError::StackOverflow {
            max: state.limits.max_invocation_stack_size,
        });
    }

    let is_coroutine = match state.heap.get(closure_handle) {
        ObjectKind::Closure(c) => c.is_coroutine,
        _ => unreachable!(),
    };

    if is_coroutine {
        let handle = spawn_coroutine(state, closure_handle, args)?;
        return Ok(vec![Value::Heap(handle)]);
    }

    let target_depth = state.current_thread().frames.len();
    push_call_frame(state, closure_handle, args, None)?;
    match run_until(state, target_depth)? {
        RunOutcome::Returned => {
            let thread = state.current_thread_mut();
            let values = thread.stack.split_off(target_depth_stack_mark(thread, target_depth));
            Ok(values)
        }
        RunOutcome::Yielded(_) => unreachable!("a non-coroutine call can never yield"),
    }
}

/// The operand-stack index a call at `target_depth` left its results at:
/// the base of the frame that was at `target_depth` before the call (i.e.
/// the frame just below the one we pushed), or 0 if this was the outermost
/// call on the thread.
fn target_depth_stack_mark(thread: &Thread, target_depth: usize) -> usize {
    if target_depth == 0 {
        0
    } else {
        thread.frames[target_depth - 1].base + thread.frames[target_depth - 1].arg_count
    }
}

/// Builds a fresh [`Frame`] for `closure_handle` with `args` as its
/// arguments and pushes it onto the current thread. For a scripted closure,
/// arguments are copied into flat locals (or the heap environment, if the
/// template forces one) and popped off the operand stack; for a native
/// closure they stay on the stack, to be read back by the native function.
fn push_call_frame(
    state: &mut State,
    closure_handle: Handle,
    args: Vec<Value>,
    expected_returns: Option<u8>,
) -> VmResult<()> {
    let template_handle = match state.heap.get(closure_handle) {
        ObjectKind::Closure(c) => c.template,
        _ => unreachable!(),
    };
    let env = match state.heap.get(closure_handle) {
        ObjectKind::Closure(c) => c.env,
        _ => unreachable!(),
    };

    let (n_args, opt_args, variadic, n_locals, upval_locals, is_native) =
        match state.heap.get(template_handle) {
            ObjectKind::Function(f) => (
                f.n_args as usize,
                f.opt_args as usize,
                f.variadic,
                f.n_locals as usize,
                f.upval_locals,
                f.is_native(),
            ),
            _ => unreachable!(),
        };

    let min_args = n_args;
    let max_args = n_args + opt_args;
    if args.len() < min_args || (!variadic && args.len() > max_args) {
        return Err(VmError::ArityMismatch {
            name: closure_name(state, closure_handle),
            min: min_args,
            max_desc: if variadic {
                "unbounded".to_string()
            } else {
                max_args.to_string()
            },
            got: args.len(),
        });
    }

    let base = state.current_thread().stack.len();
    let arg_count = args.len();
    for v in &args {
        state.push(*v)?;
    }

    let mut frame = Frame::new(closure_handle, base, arg_count, 0, None, expected_returns);

    if is_native {
        state.current_thread_mut().frames.push(frame);
        return Ok(());
    }

    // Scripted call: move arguments off the operand stack into locals (or a
    // heap environment, if any nested closure captures this frame's locals).
    let mut locals = args;
    locals.resize(n_locals.max(locals.len()), Value::Null);
    state.current_thread_mut().stack.truncate(base);

    if upval_locals {
        let env_obj = crate::closure::Environment { slots: locals, parent: env };
        let env_handle = state.heap.alloc(ObjectKind::Environment(env_obj), false);
        frame.env = Some(env_handle);
    } else {
        frame.locals = locals;
        frame.env = env;
    }

    state.current_thread_mut().frames.push(frame);
    Ok(())
}

fn closure_name(state: &State, closure_handle: Handle) -> String {
    let template_handle = match state.heap.get(closure_handle) {
        ObjectKind::Closure(c) => c.template,
        _ => return "<closure>".to_string(),
    };
    match state.heap.get(template_handle) {
        ObjectKind::Function(f) => f.name.clone().unwrap_or_else(|| "<anonymous>".to_string()),
        _ => "<closure>".to_string(),
    }
}

fn spawn_coroutine(state: &mut State, closure_handle: Handle, args: Vec<Value>) -> VmResult<Handle> {
    let thread_handle = state.heap.alloc(ObjectKind::Thread(Thread::new()), false);

    let previous = state.current_thread;
    state.current_thread = thread_handle;
    let result = push_call_frame(state, closure_handle, args, None);
    state.current_thread = previous;
    result?;
    Ok(thread_handle)
}

/// Resumes a suspended or fresh coroutine thread, running it until it
/// yields or finishes. Returns the values it produced and whether it is now
/// done (exhausted, can't be resumed again).
pub fn resume_thread(state: &mut State, target: Handle) -> VmResult<(Vec<Value>, bool)> {
    if !matches!(state.heap.get(target), ObjectKind::Thread(_)) {
        return Err(VmError::CoroutineMisuse {
            reason: "NEXT target is not a thread".into(),
        });
    }
    if matches!(state.heap.get(target), ObjectKind::Thread(t) if t.is_done) {
        return Ok((Vec::new(), true));
    }

    state.parent_threads.push(state.current_thread);
    state.current_thread = target;

    let outcome = run_until(state, 0);

    state.current_thread = state.parent_threads.pop().unwrap();

    match outcome {
        Ok(RunOutcome::Returned) => {
            let values = match state.heap.get_mut(target) {
                ObjectKind::Thread(t) => std::mem::take(&mut t.stack),
                _ => unreachable!(),
            };
            if let ObjectKind::Thread(t) = state.heap.get_mut(target) {
                t.is_done = true;
            }
            Ok((values, true))
        }
        Ok(RunOutcome::Yielded(values)) => Ok((values, false)),
        Err(e) => {
            if let ObjectKind::Thread(t) = state.heap.get_mut(target) {
                t.is_done = true;
            }
            Err(e)
        }
    }
}

/// Drives the current thread until its frame stack unwinds back to
/// `target_depth`, or it suspends via `yield`.
fn run_until(state: &mut State, target_depth: usize) -> VmResult<RunOutcome> {
    loop {
        if state.current_thread().frames.len() <= target_depth {
            return Ok(RunOutcome::Returned);
        }

        match step(state) {
            Ok(Some(values)) => return Ok(RunOutcome::Yielded(values)),
            Ok(None) => {}
            Err(e) => {
                if let Some(()) = unwind_to_catch(state, target_depth, &e)? {
                    continue;
                }
                return Err(e);
            }
        }

        state.gc_maybe_step();
    }
}

/// Searches for an active `try` region at or above `target_depth` and, if
/// found, unwinds to it and jumps to its catch handler. Returns `Some(())`
/// if the panic was caught, `None` if it should keep propagating.
fn unwind_to_catch(state: &mut State, target_depth: usize, error: &VmError) -> VmResult<Option<()>> {
    let idx = {
        let thread = state.current_thread();
        (target_depth..thread.frames.len())
            .rev()
            .find(|&idx| !thread.frames[idx].try_stack.is_empty())
    };
    let idx = match idx {
        Some(idx) => idx,
        None => return Ok(None),
    };

    let try_frame = {
        let thread = state.current_thread_mut();
        thread.frames.truncate(idx + 1);
        let try_frame = thread.frames[idx].try_stack.pop().expect("checked non-empty above");
        thread.stack.truncate(try_frame.stack_depth);
        try_frame
    };

    let payload = error.as_payload().unwrap_or_else(Value::null);
    let message_obj = make_error_object(state, error, payload);
    state.push(message_obj)?;
    state.current_thread_mut().frames[idx].ip = try_frame.catch_target;
    state.panic_caught = true;
    Ok(Some(()))
}

fn make_error_object(state: &mut State, error: &VmError, payload: Value) -> Value {
    let mut table = Table::new();
    let message = Value::new_string(&mut state.heap, error.to_string().as_bytes());
    table.set(b"message", message);
    if !matches!(payload, Value::Null) {
        table.set(b"payload", payload);
    }
    let handle = state.heap.alloc(ObjectKind::Object(table), false);
    Value::Heap(handle)
}

/// Executes one step of the thread currently on top: either one bytecode
/// instruction, or one re-entry into a native function. Returns `Ok(Some(values))`
/// if this step suspended the thread (a coroutine yielding).
fn step(state: &mut State) -> VmResult<Option<Vec<Value>>> {
    let depth = state.current_thread().frames.len() - 1;
    let template_handle = current_template(state, depth);
    let is_native = matches!(
        state.heap.get(template_handle),
        ObjectKind::Function(f) if f.is_native()
    );

    if is_native {
        step_native(state, depth, template_handle)
    } else {
        step_bytecode(state, depth, template_handle)
    }
}

fn current_template(state: &State, depth: usize) -> Handle {
    let closure_handle = state.current_thread().frames[depth].closure;
    match state.heap.get(closure_handle) {
        ObjectKind::Closure(c) => c.template,
        _ => unreachable!(),
    }
}

fn step_native(state: &mut State, depth: usize, template_handle: Handle) -> VmResult<Option<Vec<Value>>> {
    let native_fn = match state.heap.get(template_handle) {
        ObjectKind::Function(f) => match &f.code {
            FunctionCode::Native(f) => f.clone(),
            FunctionCode::Bytecode(_) => unreachable!(),
        },
        _ => unreachable!(),
    };

    let (arg_count, resume_step) = {
        let frame = &state.current_thread().frames[depth];
        (frame.arg_count, frame.ip)
    };

    match native_fn(state, arg_count, resume_step)? {
        Directive::Return(values) => {
            finish_return(state, depth, values)?;
            Ok(None)
        }
        Directive::Err(e) => {
            state.current_thread_mut().frames.truncate(depth);
            Err(e)
        }
        Directive::Call { callee, args, resume_step } => {
            let result = call_value(state, callee, args)?;
            for v in &result {
                state.push(*v)?;
            }
            state.current_thread_mut().frames[depth].ip = resume_step;
            Ok(None)
        }
        Directive::TryCall { callee, args, resume_step } => {
            let mark = state.save_stack();
            let (result_obj, ok) = match call_value(state, callee, args) {
                Ok(values) => {
                    let v = values.into_iter().next().unwrap_or(Value::Null);
                    (v, true)
                }
                Err(e) => {
                    state.restore_stack(mark);
                    (make_error_object(state, &e, e.as_payload().unwrap_or(Value::Null)), false)
                }
            };
            state.push(Value::from_bool(ok))?;
            state.push(result_obj)?;
            state.current_thread_mut().frames[depth].ip = resume_step;
            Ok(None)
        }
        Directive::Yield { values, resume_step } => {
            state.current_thread_mut().frames[depth].ip = resume_step;
            Ok(Some(values))
        }
        Directive::YieldLast(values) => {
            state.current_thread_mut().frames.truncate(depth);
            state.current_thread_mut().is_done = true;
            Ok(Some(values))
        }
        Directive::Next { target, resume_step } => {
            let value = next_value(state, target, None)?;
            state.push(value.unwrap_or(Value::Null))?;
            state.current_thread_mut().frames[depth].ip = resume_step;
            Ok(None)
        }
        Directive::NextS { target, slot, resume_step } => {
            let value = next_value(state, target, Some(slot))?;
            state.push(value.unwrap_or(Value::Null))?;
            state.current_thread_mut().frames[depth].ip = resume_step;
            Ok(None)
        }
        Directive::Repeat { resume_step } => {
            state.current_thread_mut().frames[depth].ip = resume_step;
            Ok(None)
        }
    }
}

/// Pulls the next value out of an iterable: a suspended coroutine thread is
/// resumed, an object with a `next` type-descriptor hook is invoked with an
/// explicit cursor slot. Anything else has no notion of iteration.
fn next_value(state: &mut State, target: Value, slot: Option<usize>) -> VmResult<Option<Value>> {
    let handle = target.as_handle().ok_or_else(|| VmError::CoroutineMisuse {
        reason: "NEXT target is not iterable".into(),
    })?;

    match state.heap.get(handle) {
        ObjectKind::Thread(_) => {
            let (mut values, done) = resume_thread(state, handle)?;
            if done && values.is_empty() {
                Ok(None)
            } else {
                Ok(Some(values.drain(..).next().unwrap_or(Value::Null)))
            }
        }
        ObjectKind::Object(_) => {
            let td = state.heap.type_descriptor(handle);
            match td.and_then(|td| td.next.as_ref().map(|_| td)) {
                Some(td) => {
                    let next_fn = td.next.as_ref().unwrap();
                    next_fn(&mut state.heap, handle, slot.unwrap_or(0))
                }
                None => Err(VmError::CoroutineMisuse {
                    reason: "object has no next hook".into(),
                }),
            }
        }
        _ => Err(VmError::CoroutineMisuse {
            reason: "NEXT target is not iterable".into(),
        }),
    }
}

fn finish_return(state: &mut State, depth: usize, values: Vec<Value>) -> VmResult<()> {
    let expected = {
        let thread = state.current_thread_mut();
        let frame = thread.frames.remove(depth);
        thread.stack.truncate(frame.base);
        frame.expected_returns
    };
    let out = reconcile_returns(state, expected, values);
    for v in out {
        state.push(v)?;
    }
    Ok(())
}

/// Reconciles a callee's actual return values against the caller's folded
/// expected count: an exact match passes through unchanged. `expected == 1`
/// with more than one actual value packs them all into a single array-form
/// object, so a caller that only ever consumes one value still gets
/// everything the callee produced. `expected > 1` with exactly one actual
/// value unpacks it the same way if it's itself an array-form object
/// (otherwise the first target gets it and the rest are null-padded). Any
/// other mismatch just pads with `NULL` or truncates.
fn reconcile_returns(state: &mut State, expected: Option<u8>, mut values: Vec<Value>) -> Vec<Value> {
    let n = match expected {
        Some(n) => n as usize,
        None => return values,
    };
    if values.len() == n {
        return values;
    }
    if n == 1 && values.len() != 1 {
        let mut table = Table::new();
        for v in values {
            table.append(v);
        }
        let handle = state.heap.alloc(ObjectKind::Object(table), false);
        return vec![Value::Heap(handle)];
    }
    if n > 1 && values.len() == 1 {
        if let Some(h) = values[0].as_handle() {
            if let ObjectKind::Object(t) = state.heap.get(h) {
                if let Some(len) = t.array_len() {
                    let mut out: Vec<Value> =
                        (0..len).map(|i| t.get(i.to_string().as_bytes()).copied().unwrap_or(Value::Null)).collect();
                    out.resize(n, Value::Null);
                    return out;
                }
            }
        }
    }
    values.resize(n, Value::Null);
    values
}

fn step_bytecode(state: &mut State, depth: usize, template_handle: Handle) -> VmResult<Option<Vec<Value>>> {
    let instr = {
        let ip = state.current_thread().frames[depth].ip;
        match state.heap.get(template_handle) {
            ObjectKind::Function(f) => match &f.code {
                FunctionCode::Bytecode(code) => code[ip as usize],
                FunctionCode::Native(_) => unreachable!(),
            },
            _ => unreachable!(),
        }
    };

    state.current_thread_mut().frames[depth].ip += 1;

    use OpCode::*;
    match instr.op {
        Nop => {}
        PushNull => state.push(Value::Null)?,
        PushImm => {
            let v = imm(state, template_handle, instr.arg);
            state.push(v)?;
        }
        Pop => {
            state.pop()?;
        }
        Dup => {
            let v = *state.current_thread().stack.last().ok_or(VmError::StackUnderflow {
                requested: 1,
                available: 0,
            })?;
            state.push(v)?;
        }
        Swap => {
            let thread = state.current_thread_mut();
            let len = thread.stack.len();
            if len < 2 {
                return Err(VmError::StackUnderflow { requested: 2, available: len });
            }
            thread.stack.swap(len - 1, len - 2);
        }
        LoadLocal => {
            let v = read_local(state, depth, instr.arg as usize)?;
            state.push(v)?;
        }
        StoreLocal => {
            let v = state.pop()?;
            write_local(state, depth, instr.arg as usize, v);
        }
        LoadUpval => {
            let v = read_upval(state, depth, instr.arg as usize);
            state.push(v)?;
        }
        StoreUpval => {
            let v = state.pop()?;
            write_upval(state, depth, instr.arg as usize, v);
        }
        LoadGlobal => {
            let name = imm(state, template_handle, instr.arg);
            let bytes = name.read_string_owned(&state.heap).unwrap_or_default();
            let value = state.globals().get(&bytes).copied().ok_or_else(|| VmError::UndefinedGlobal {
                name: String::from_utf8_lossy(&bytes).into_owned(),
            })?;
            state.push(value)?;
        }
        StoreGlobal => {
            let name = imm(state, template_handle, instr.arg);
            let bytes = name.read_string_owned(&state.heap).unwrap_or_default();
            let v = state.pop()?;
            state.set_global(&bytes, v);
        }
        NewObject => {
            let handle = state.heap.alloc(ObjectKind::Object(Table::new()), false);
            state.push(Value::Heap(handle))?;
        }
        NewArray => {
            let n = instr.l as usize;
            let thread = state.current_thread_mut();
            let start = thread.stack.len() - n;
            let elems: Vec<Value> = thread.stack.split_off(start);
            let mut table = Table::new();
            for v in elems {
                table.append(v);
            }
            let handle = state.heap.alloc(ObjectKind::Object(table), false);
            state.push(Value::Heap(handle))?;
        }
        GetField => {
            let key = state.pop()?;
            let obj = state.pop()?;
            let key_bytes = key.read_string_owned(&state.heap).unwrap_or_default();
            let value = read_field(state, obj, &key_bytes)?;
            state.push(value)?;
        }
        SetField => {
            let value = state.pop()?;
            let key = state.pop()?;
            let obj = state.pop()?;
            let key_bytes = key.read_string_owned(&state.heap).unwrap_or_default();
            write_field(state, obj, &key_bytes, value)?;
        }
        Append => {
            let value = state.pop()?;
            let obj = state.pop()?;
            let handle = obj.as_handle().ok_or(VmError::IndexOnNonObject)?;
            if state.heap.is_const(handle) {
                return Err(VmError::MutateConst);
            }
            state.heap.write_barrier(handle);
            match state.heap.get_mut(handle) {
                ObjectKind::Object(t) => t.append(value),
                _ => return Err(VmError::IndexOnNonObject),
            }
        }
        Add | Sub | Mul | Div | Mod => {
            let b = state.pop()?;
            let a = state.pop()?;
            let ai = require_int(state, a)?;
            let bi = require_int(state, b)?;
            let result = match instr.op {
                Add => ai.wrapping_add(bi),
                Sub => ai.wrapping_sub(bi),
                Mul => ai.wrapping_mul(bi),
                Div => {
                    if bi == 0 {
                        0
                    } else {
                        ai.wrapping_div(bi)
                    }
                }
                Mod => {
                    if bi == 0 {
                        0
                    } else {
                        ai.wrapping_rem(bi)
                    }
                }
                _ => unreachable!(),
            };
            let v = Value::from_int(&mut state.heap, result);
            state.push(v)?;
        }
        Neg => {
            let a = state.pop()?;
            let ai = require_int(state, a)?;
            let v = Value::from_int(&mut state.heap, -ai);
            state.push(v)?;
        }
        Concat => {
            // `arg` is always 0: the grammar only ever emits this binary
            // (two operands), never as an n-ary join, so it isn't read.
            let b = state.pop()?;
            let a = state.pop()?;
            let mut bytes = a
                .read_string_owned(&state.heap)
                .ok_or_else(|| VmError::CoerceFailure { target: "string".to_string() })?;
            bytes.extend(
                b.read_string_owned(&state.heap)
                    .ok_or_else(|| VmError::CoerceFailure { target: "string".to_string() })?,
            );
            let v = Value::new_string(&mut state.heap, &bytes);
            state.push(v)?;
        }
        Eq | Neq => {
            let b = state.pop()?;
            let a = state.pop()?;
            let eq = a.equals(&b, &state.heap);
            state.push(Value::from_bool(if instr.op == Eq { eq } else { !eq }))?;
        }
        Lt | Le | Gt | Ge => {
            let b = state.pop()?;
            let a = state.pop()?;
            let ai = require_int(state, a)?;
            let bi = require_int(state, b)?;
            let result = match instr.op {
                Lt => ai < bi,
                Le => ai <= bi,
                Gt => ai > bi,
                Ge => ai >= bi,
                _ => unreachable!(),
            };
            state.push(Value::from_bool(result))?;
        }
        Not => {
            let a = state.pop()?;
            state.push(Value::from_bool(!a.truthy()))?;
        }
        Jmp => {
            state.current_thread_mut().frames[depth].ip = instr.arg as u32;
        }
        JmpIfFalse => {
            let v = state.pop()?;
            if !v.truthy() {
                state.current_thread_mut().frames[depth].ip = instr.arg as u32;
            }
        }
        JmpIfTrue => {
            let v = state.pop()?;
            if v.truthy() {
                state.current_thread_mut().frames[depth].ip = instr.arg as u32;
            }
        }
        Call => {
            let n_args = instr.arg as usize;
            let expected = if instr.l == 0xff { None } else { Some(instr.l) };
            let thread = state.current_thread_mut();
            let start = thread.stack.len() - n_args;
            let args = thread.stack.split_off(start);
            let callee = state.pop()?;
            push_call_frame(state, resolve_closure(state, callee)?, args, expected)?;
        }
        Cmd => {
            let n_args = instr.arg as usize;
            let (expected, capture_output, pipe_in) = cmd_unpack(instr.l);
            let thread = state.current_thread_mut();
            let start = thread.stack.len() - n_args;
            let args = thread.stack.split_off(start);
            let name = state.pop()?;
            dispatch_command(state, name, args, expected, capture_output, pipe_in)?;
        }
        Return => {
            let n = instr.arg as usize;
            let thread = state.current_thread_mut();
            let start = thread.stack.len() - n;
            let values = thread.stack.split_off(start);
            finish_return(state, depth, values)?;
        }
        Unpack => {
            // Emitted by a destructuring `let a, b = expr;` whose right-hand
            // side wasn't a bare call: splits the single value `expr` left
            // on the stack into `instr.arg` targets the same way a callee's
            // multi-return reconciliation would.
            let n = instr.arg as usize;
            let value = state.pop()?;
            let out = reconcile_returns(state, Some(n as u8), vec![value]);
            for v in out {
                state.push(v)?;
            }
        }
        Prop => {
            // `?`-chain propagation: a `NULL` on top short-circuits the
            // enclosing function, returning that `NULL` immediately;
            // anything else is left on the stack for the chain to continue.
            let top = *state.current_thread().stack.last().ok_or(VmError::StackUnderflow {
                requested: 1,
                available: 0,
            })?;
            if matches!(top, Value::Null) {
                let thread = state.current_thread_mut();
                let start = thread.stack.len() - 1;
                let values = thread.stack.split_off(start);
                finish_return(state, depth, values)?;
            }
        }
        MakeClosure => {
            let template = imm(state, template_handle, instr.arg)
                .as_handle()
                .expect("MakeClosure immediate must reference a function template");
            let env = state.current_thread().frames[depth].env;
            let needs_env = matches!(state.heap.get(template), ObjectKind::Function(f) if f.upval_locals)
                || env.is_some();
            let closure = Closure::new(template, if needs_env { env } else { None }, instr.l != 0);
            let handle = state.heap.alloc(ObjectKind::Closure(closure), false);
            state.push(Value::Heap(handle))?;
        }
        Try => {
            let stack_depth = state.current_thread().stack.len();
            state.current_thread_mut().frames[depth].try_stack.push(TryFrame {
                catch_target: instr.arg as u32,
                stack_depth,
            });
        }
        EndTry => {
            state.current_thread_mut().frames[depth].try_stack.pop();
        }
        EndFinally => {}
        Throw => {
            let payload = state.pop()?;
            let message = payload
                .read_string_owned(&state.heap)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_else(|| "panic".to_string());
            return Err(VmError::user_with_payload(message, payload));
        }
        Yield => {
            let n = instr.l as usize;
            let thread = state.current_thread_mut();
            let start = thread.stack.len() - n;
            let values = thread.stack.split_off(start);
            return Ok(Some(values));
        }
        Next | NextS => {
            let slot = if instr.op == NextS { Some(instr.arg as usize) } else { None };
            let target = state.pop()?;
            let value = next_value(state, target, slot)?;
            state.push(value.unwrap_or(Value::Null))?;
        }
        Halt => {
            state.current_thread_mut().frames.truncate(depth);
        }
    }

    Ok(None)
}

/// Coerces a value to an integer for an arithmetic/comparison opcode,
/// failing rather than silently treating a non-string-readable value (a
/// closure, object, or coroutine thread) as zero. A string always succeeds,
/// even with no leading digits, matching `coerce_int`'s own contract.
fn require_int(state: &State, v: Value) -> VmResult<i64> {
    v.coerce_int(&state.heap).ok_or_else(|| VmError::CoerceFailure { target: "integer".to_string() })
}

fn resolve_closure(state: &State, v: Value) -> VmResult<Handle> {
    match v.as_handle() {
        Some(h) if matches!(state.heap.get(h), ObjectKind::Closure(_)) => Ok(h),
        _ => Err(VmError::TypeMismatch {
            expected: "closure".into(),
            actual: state.heap.type_name_of_value(&v),
        }),
    }
}

/// A `CMD` first tries the bareword as a global function (a plain call in
/// disguise, `expected`/`capture_output`/`pipe_in` irrelevant). Failing
/// that, it falls through to the registered command dispatcher, which
/// receives the name and original arguments plus the two piping/capture
/// bits decoded from the instruction, appended in the order the original
/// engine pushes them (`pipe_in` then `capture_output`). With no matching
/// global and no dispatcher registered at all, this is `NoCommandHandler`;
/// `UnknownCommand` is reserved for a dispatcher that itself rejects the
/// name, a host-side concern this function never raises.
fn dispatch_command(
    state: &mut State,
    name: Value,
    args: Vec<Value>,
    expected: Option<u8>,
    capture_output: bool,
    pipe_in: bool,
) -> VmResult<()> {
    let name_bytes = name.read_string_owned(&state.heap).unwrap_or_default();
    let global = state.get_global(&name_bytes);
    if let Some(h) = global.as_handle() {
        if matches!(state.heap.get(h), ObjectKind::Closure(_)) {
            push_call_frame(state, h, args, expected)?;
            return Ok(());
        }
    }

    let dispatcher = state.command_dispatcher;
    match dispatcher.as_handle() {
        Some(h) if matches!(state.heap.get(h), ObjectKind::Closure(_)) => {
            let mut full_args = Vec::with_capacity(args.len() + 3);
            full_args.push(name);
            full_args.extend(args);
            full_args.push(Value::from_bool(pipe_in));
            full_args.push(Value::from_bool(capture_output));
            push_call_frame(state, h, full_args, expected)?;
            Ok(())
        }
        _ => Err(VmError::NoCommandHandler {
            name: String::from_utf8_lossy(&name_bytes).into_owned(),
        }),
    }
}

fn imm(state: &State, template_handle: Handle, index: u16) -> Value {
    match state.heap.get(template_handle) {
        ObjectKind::Function(f) => f.imms[index as usize],
        _ => unreachable!(),
    }
}

fn read_local(state: &State, depth: usize, index: usize) -> VmResult<Value> {
    let frame = &state.current_thread().frames[depth];
    match frame.env {
        Some(env) => match state.heap.get(env) {
            ObjectKind::Environment(e) => Ok(e.slots[index]),
            _ => unreachable!(),
        },
        None => Ok(frame.locals[index]),
    }
}

fn write_local(state: &mut State, depth: usize, index: usize, value: Value) {
    let env = state.current_thread().frames[depth].env;
    match env {
        Some(env) => {
            state.heap.write_barrier(env);
            match state.heap.get_mut(env) {
                ObjectKind::Environment(e) => e.slots[index] = value,
                _ => unreachable!(),
            }
        }
        None => {
            state.current_thread_mut().frames[depth].locals[index] = value;
        }
    }
}

fn read_upval(state: &State, depth: usize, index: usize) -> Value {
    let mut env = state.current_thread().frames[depth].env;
    // Upvalue slot indices are encoded as (hops << 12 | slot); walk `hops`
    // parent links before reading, matching the resolver in the compiler.
    let hops = index >> 12;
    let slot = index & 0xfff;
    for _ in 0..hops {
        env = env.and_then(|e| match state.heap.get(e) {
            ObjectKind::Environment(e) => e.parent,
            _ => None,
        });
    }
    match env {
        Some(e) => match state.heap.get(e) {
            ObjectKind::Environment(e) => e.slots[slot],
            _ => Value::Null,
        },
        None => Value::Null,
    }
}

fn write_upval(state: &mut State, depth: usize, index: usize, value: Value) {
    let mut env = state.current_thread().frames[depth].env;
    let hops = index >> 12;
    let slot = index & 0xfff;
    for _ in 0..hops {
        env = env.and_then(|e| match state.heap.get(e) {
            ObjectKind::Environment(e) => e.parent,
            _ => None,
        });
    }
    if let Some(e) = env {
        state.heap.write_barrier(e);
        if let ObjectKind::Environment(e) = state.heap.get_mut(e) {
            e.slots[slot] = value;
        }
    }
}

/// `obj[key]`: a miss, or a receiver that isn't an object at all (`Null`, a
/// string, a closure, a coroutine thread), yields `NULL` rather than
/// panicking — only `SET_FIELD` on a non-object is an error.
fn read_field(state: &State, obj: Value, key: &[u8]) -> VmResult<Value> {
    let handle = match obj.as_handle() {
        Some(h) => h,
        None => return Ok(Value::Null),
    };
    match state.heap.get(handle) {
        ObjectKind::Object(t) => Ok(t.get(key).copied().unwrap_or(Value::Null)),
        _ => Ok(Value::Null),
    }
}

fn write_field(state: &mut State, obj: Value, key: &[u8], value: Value) -> VmResult<()> {
    let handle = obj.as_handle().ok_or(VmError::IndexOnNonObject)?;
    if state.heap.is_const(handle) {
        return Err(VmError::MutateConst);
    }
    state.heap.write_barrier(handle);
    match state.heap.get_mut(handle) {
        ObjectKind::Object(t) => {
            t.set(key, value);
            Ok(())
        }
        _ => Err(VmError::IndexOnNonObject),
    }
}
