//! Stack-trace formatting for uncaught panics.

use crate::heap::ObjectKind;
use crate::state::State;

/// One reconstructed frame in a formatted trace: the function name (or
/// `<anonymous>`/`<native>`) and the source line active at the moment of
/// the panic (0 for native frames, which carry no line table).
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceEntry {
    pub name: String,
    pub line: u32,
}

/// Walks the current thread's live frames, innermost first, and resolves
/// each to a name + source line using its template's line-directive table.
pub fn capture(state: &State) -> Vec<TraceEntry> {
    let thread = state.current_thread();
    thread
        .frames
        .iter()
        .rev()
        .map(|frame| {
            let template_handle = match state.heap.get(frame.closure) {
                ObjectKind::Closure(c) => c.template,
                _ => return TraceEntry { name: "<unknown>".into(), line: 0 },
            };
            match state.heap.get(template_handle) {
                ObjectKind::Function(f) if f.is_native() => TraceEntry {
                    name: f.name.clone().map(|n| format!("{n} (native)")).unwrap_or_else(|| "<native>".into()),
                    line: 0,
                },
                ObjectKind::Function(f) => TraceEntry {
                    name: f.name.clone().unwrap_or_else(|| "<anonymous>".into()),
                    line: f.line_for(frame.ip),
                },
                _ => TraceEntry { name: "<unknown>".into(), line: 0 },
            }
        })
        .collect()
}

/// Renders a captured trace the way the host sees it via the error-message
/// API: one `"at <name>:<line>"` line per frame, innermost first.
pub fn format(entries: &[TraceEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&format!("  at {}:{}\n", entry.name, entry.line));
    }
    out
}
