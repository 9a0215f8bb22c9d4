//! Compiled function templates.
//!
//! A [`FunctionTemplate`] is the immutable, shareable "code" half of a
//! function: bytecode (or a native implementation), its immediate pool, and
//! the metadata the VM needs to set up a call frame. The mutable half (bound
//! upvalues) lives in [`crate::closure::Closure`], since the same template is
//! reused across every closure created from it.

use crate::native::NativeFn;
use crate::opcode::{Instruction, LineEntry};
use crate::value::Value;

pub enum FunctionCode {
    Bytecode(Vec<Instruction>),
    Native(NativeFn),
}

pub struct FunctionTemplate {
    pub name: Option<String>,
    pub n_args: u8,
    pub opt_args: u8,
    pub variadic: bool,
    pub n_locals: u16,
    /// Set by the resolver when any nested function closes over one of this
    /// function's locals, forcing this function to allocate a heap
    /// [`crate::closure::Environment`] for its locals instead of using the
    /// frame's flat local slots.
    pub upval_locals: bool,
    pub code: FunctionCode,
    pub imms: Vec<Value>,
    pub lines: Vec<LineEntry>,
}

impl FunctionTemplate {
    pub fn new_bytecode(
        name: Option<String>,
        n_args: u8,
        opt_args: u8,
        variadic: bool,
        n_locals: u16,
        upval_locals: bool,
        code: Vec<Instruction>,
        imms: Vec<Value>,
        lines: Vec<LineEntry>,
    ) -> Self {
        Self {
            name,
            n_args,
            opt_args,
            variadic,
            n_locals,
            upval_locals,
            code: FunctionCode::Bytecode(code),
            imms,
            lines,
        }
    }

    pub fn new_native(
        name: Option<String>,
        n_args: u8,
        opt_args: u8,
        variadic: bool,
        f: NativeFn,
    ) -> Self {
        Self {
            name,
            n_args,
            opt_args,
            variadic,
            n_locals: 0,
            upval_locals: false,
            code: FunctionCode::Native(f),
            imms: Vec::new(),
            lines: Vec::new(),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self.code, FunctionCode::Native(_))
    }

    pub fn max_args(&self) -> usize {
        self.n_args as usize + self.opt_args as usize
    }

    /// Looks up the source line a given instruction index falls under, by
    /// scanning the (monotonically increasing) line-directive table.
    pub fn line_for(&self, instruction_index: u32) -> u32 {
        let mut line = 0;
        for entry in &self.lines {
            if entry.instruction_index > instruction_index {
                break;
            }
            line = entry.line;
        }
        line
    }
}
