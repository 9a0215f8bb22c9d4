//! The single-pass compiler: lexer, token types, and the recursive-descent
//! parser/code generator.

pub mod lexer;
pub mod parser;
pub mod token;

use crate::error::VmResult;
use crate::heap::Handle;
use crate::heap::Heap;

/// Compiles `source` into a top-level function template (zero arguments,
/// never variadic) and returns its heap handle. Wrap it in a `Closure` to
/// get something callable.
pub fn compile(heap: &mut Heap, source: &str) -> VmResult<Handle> {
    parser::Parser::compile(heap, source)
}
