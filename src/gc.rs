//! The incremental tri-color mark-and-sweep collector.
//!
//! Marking is cooperative with allocation: [`Heap::should_step`] paces full
//! trace-to-black passes against `gc_freq` allocations, and each pass only
//! processes `gc_step_size` gray objects before giving control back to the
//! interpreter, so a single collection never stalls a long-running script.
//! Root marking (globals, every live thread, the command dispatcher) always
//! runs to completion before any incremental stepping, since roots are cheap
//! and re-scanning them mid-cycle would be more complex than just eagerly
//! greying them once per cycle start.

use crate::heap::{Handle, Heap, ObjectKind};
use crate::value::Value;

/// Greys every root. Call this once at the start of a collection cycle,
/// before any calls to [`step`]. Roots are passed explicitly rather than as
/// a `&State` so that callers can hold `&mut Heap` and the rest of `State`
/// split apart at the same time.
pub fn mark_roots(
    heap: &mut Heap,
    globals: Handle,
    command_dispatcher: Value,
    current_thread: Handle,
    parent_threads: &[Handle],
) {
    heap.mark_gray_if_white(globals);
    if let Some(dispatcher) = command_dispatcher.as_handle() {
        heap.mark_gray_if_white(dispatcher);
    }
    heap.mark_gray_if_white(current_thread);
    for &t in parent_threads {
        heap.mark_gray_if_white(t);
    }
}

/// Processes up to `budget` gray objects, tracing their children. Returns
/// `true` if the gray list is now empty (marking is complete and `sweep` can
/// run), `false` if there's more work left for a future call.
pub fn step(heap: &mut Heap, budget: u32) -> bool {
    for _ in 0..budget {
        match heap.pop_gray() {
            Some(h) => {
                mark_children(heap, h);
                heap.mark_black(h);
            }
            None => return true,
        }
    }
    heap.pop_gray().is_none()
}

/// Runs an entire collection cycle to completion: marks roots, traces every
/// gray object without budget limits, then sweeps. Used for the host's
/// explicit "collect now" entry point, where an unbounded pause is fine.
pub fn collect_full(
    heap: &mut Heap,
    globals: Handle,
    command_dispatcher: Value,
    current_thread: Handle,
    parent_threads: &[Handle],
) {
    mark_roots(heap, globals, command_dispatcher, current_thread, parent_threads);
    while !step(heap, u32::MAX) {}
    heap.sweep();
}

fn mark_children(heap: &mut Heap, h: Handle) {
    let children = child_handles(heap.get(h));
    for c in children {
        heap.mark_gray_if_white(c);
    }
}

fn child_handles(kind: &ObjectKind) -> Vec<Handle> {
    match kind {
        ObjectKind::Object(table) => table.values().filter_map(|v| v.as_handle()).collect(),
        ObjectKind::Str(_) => Vec::new(),
        ObjectKind::Function(f) => f.imms.iter().filter_map(|v| v.as_handle()).collect(),
        ObjectKind::Closure(c) => {
            let mut out = vec![c.template];
            if let Some(env) = c.env {
                out.push(env);
            }
            out
        }
        ObjectKind::Environment(env) => {
            let mut out: Vec<Handle> = env.slots.iter().filter_map(|v| v.as_handle()).collect();
            if let Some(parent) = env.parent {
                out.push(parent);
            }
            out
        }
        ObjectKind::Thread(thread) => {
            let mut out: Vec<Handle> = thread.stack.iter().filter_map(|v| v.as_handle()).collect();
            for frame in &thread.frames {
                out.push(frame.closure);
                if let Some(env) = frame.env {
                    out.push(env);
                }
                out.extend(frame.locals.iter().filter_map(|v| v.as_handle()));
                if let Some(native_locals) = &frame.native_locals {
                    out.extend(native_locals.values.iter().filter_map(|v| v.as_handle()));
                }
            }
            out
        }
    }
}
