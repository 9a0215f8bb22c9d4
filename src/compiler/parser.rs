//! The single-pass recursive-descent compiler: parses and emits bytecode in
//! the same walk, resolving locals and upvalues against a stack of
//! in-progress function frames rather than building a separate AST.

use crate::compiler::lexer::Lexer;
use crate::compiler::token::{StrPart, Token, TokenKind};
use crate::error::VmError;
use crate::function::FunctionTemplate;
use crate::heap::{Handle, Heap, ObjectKind};
use crate::opcode::{cmd_pack, cmd_unpack, Instruction, LineEntry, OpCode};
use crate::value::Value;

struct Local {
    name: String,
    slot: u16,
}

/// One function literal's in-progress compilation state. Nested function
/// literals push a new frame; resolving a name that isn't a local in the
/// innermost frame walks outward through enclosing frames, registering an
/// upvalue chain as it goes.
struct CompilerFrame {
    locals: Vec<Local>,
    scope_starts: Vec<usize>,
    instructions: Vec<Instruction>,
    imms: Vec<Value>,
    lines: Vec<LineEntry>,
    last_line: u32,
    n_locals: u16,
    upval_locals: bool,
    name: Option<String>,
    n_args: u8,
    opt_args: u8,
    variadic: bool,
}

impl CompilerFrame {
    fn new(name: Option<String>) -> Self {
        Self {
            locals: Vec::new(),
            scope_starts: vec![0],
            instructions: Vec::new(),
            imms: Vec::new(),
            lines: Vec::new(),
            last_line: 0,
            n_locals: 0,
            upval_locals: false,
            name,
            n_args: 0,
            opt_args: 0,
            variadic: false,
        }
    }

    fn emit(&mut self, instr: Instruction, line: u32) {
        if self.lines.last().map(|l| l.line) != Some(line) {
            self.lines.push(LineEntry { instruction_index: self.instructions.len() as u32, line });
        }
        self.last_line = line;
        self.instructions.push(instr);
    }

    fn here(&self) -> u32 {
        self.instructions.len() as u32
    }

    fn patch_jump(&mut self, at: u32) {
        self.instructions[at as usize].arg = self.here() as u16;
    }

    fn add_imm(&mut self, v: Value) -> u16 {
        self.imms.push(v);
        (self.imms.len() - 1) as u16
    }

    fn declare_local(&mut self, name: String) -> u16 {
        let slot = self.n_locals;
        self.n_locals += 1;
        self.locals.push(Local { name, slot });
        slot
    }

    fn resolve_local(&self, name: &str) -> Option<u16> {
        self.locals.iter().rev().find(|l| l.name == name).map(|l| l.slot)
    }
}

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    heap: &'a mut Heap,
    frames: Vec<CompilerFrame>,
}

impl<'a> Parser<'a> {
    pub fn compile(heap: &'a mut Heap, source: &str) -> Result<Handle, VmError> {
        let tokens = Lexer::new(source).tokenize()?;
        let mut parser = Parser { tokens, pos: 0, heap, frames: vec![CompilerFrame::new(None)] };
        parser.program()?;
        let frame = parser.frames.pop().unwrap();
        Ok(parser.finish_frame(frame))
    }

    fn finish_frame(&mut self, frame: CompilerFrame) -> Handle {
        let template = FunctionTemplate::new_bytecode(
            frame.name,
            frame.n_args,
            frame.opt_args,
            frame.variadic,
            frame.n_locals,
            frame.upval_locals,
            frame.instructions,
            frame.imms,
            frame.lines,
        );
        self.heap.alloc(ObjectKind::Function(template), true)
    }

    fn frame(&mut self) -> &mut CompilerFrame {
        self.frames.last_mut().unwrap()
    }

    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn peek_line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek() == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), VmError> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.err(format!("expected {what}")))
        }
    }

    fn err(&self, message: String) -> VmError {
        VmError::Syntax {
            line: self.peek_line() as usize,
            message,
            snippet: format!("near token {:?}", self.peek()),
        }
    }

    fn expect_ident(&mut self) -> Result<String, VmError> {
        match self.advance().kind {
            TokenKind::Ident(name) => Ok(name),
            other => Err(self.err(format!("expected identifier, found {other:?}"))),
        }
    }

    fn emit(&mut self, op: OpCode, arg: u16, l: u8) {
        let line = self.peek_line();
        self.frame().emit(Instruction::new(op, arg, l), line);
    }

    // ---- grammar ---------------------------------------------------

    fn program(&mut self) -> Result<(), VmError> {
        while !self.check(&TokenKind::Eof) {
            self.statement()?;
        }
        self.emit(OpCode::PushNull, 0, 0);
        self.emit(OpCode::Return, 1, 0);
        Ok(())
    }

    fn block(&mut self) -> Result<(), VmError> {
        self.expect(&TokenKind::LBrace, "'{'")?;
        let start = self.frame().locals.len();
        self.frame().scope_starts.push(start);
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.statement()?;
        }
        self.expect(&TokenKind::RBrace, "'}'")?;
        self.frame().scope_starts.pop();
        self.frame().locals.truncate(start);
        Ok(())
    }

    fn statement(&mut self) -> Result<(), VmError> {
        match self.peek().clone() {
            TokenKind::Let => self.let_stmt(),
            TokenKind::Fn => self.fn_decl_stmt(),
            TokenKind::If => self.if_stmt(),
            TokenKind::While => self.while_stmt(),
            TokenKind::For => self.for_stmt(),
            TokenKind::Return => self.return_stmt(),
            TokenKind::Try => self.try_stmt(),
            TokenKind::Throw => self.throw_stmt(),
            TokenKind::LBrace => self.block(),
            _ => self.expr_stmt(),
        }
    }

    /// `let name = expr;` or the destructuring form `let a, b = expr;`. The
    /// single-target form is just a store; the multi-target form widens the
    /// expression's trailing call (if it is one) to return that many values,
    /// or falls back to an explicit `UNPACK` when the expression isn't a
    /// bare call, then stores the results right-to-left off the stack.
    fn let_stmt(&mut self) -> Result<(), VmError> {
        self.advance();
        let mut names = vec![self.expect_ident()?];
        while self.eat(&TokenKind::Comma) {
            names.push(self.expect_ident()?);
        }
        self.expect(&TokenKind::Assign, "'='")?;
        self.expression()?;
        self.expect(&TokenKind::Semicolon, "';'")?;

        if names.len() == 1 {
            let slot = self.frame().declare_local(names.into_iter().next().unwrap());
            self.emit(OpCode::StoreLocal, slot, 0);
            return Ok(());
        }

        self.fold_or_unpack_returns(names.len() as u8);
        let slots: Vec<u16> = names.into_iter().map(|n| self.frame().declare_local(n)).collect();
        for &slot in slots.iter().rev() {
            self.emit(OpCode::StoreLocal, slot, 0);
        }
        Ok(())
    }

    /// Widens a trailing `CALL`/`CMD`'s folded expected-return count to `n`
    /// when the expression just compiled was exactly such a call, so the
    /// callee's `RETURN` pushes all `n` values directly onto the stack;
    /// otherwise emits an explicit `UNPACK` that splits the single value the
    /// expression left behind (an array-form object, or not) into `n`
    /// targets at runtime.
    fn fold_or_unpack_returns(&mut self, n: u8) {
        let last_op = self.frame().instructions.last().map(|i| i.op);
        match last_op {
            Some(OpCode::Call) => {
                let idx = self.frame().instructions.len() - 1;
                self.frame().instructions[idx].l = n;
            }
            Some(OpCode::Cmd) => {
                let idx = self.frame().instructions.len() - 1;
                let old_l = self.frame().instructions[idx].l;
                let (_, capture, pipe) = cmd_unpack(old_l);
                self.frame().instructions[idx].l = cmd_pack(Some(n), capture, pipe);
            }
            _ => self.emit(OpCode::Unpack, n as u16, 0),
        }
    }

    /// `fn name(params) { ... }`: unlike an anonymous `fn(...) { ... }`
    /// expression, the name is declared as a local *before* the body is
    /// compiled, so a self-reference inside the body resolves to it (as a
    /// local, or as an upvalue from a nested function) instead of falling
    /// through to a global/command lookup — the only way this grammar
    /// supports recursive named functions. A declaration at the top level
    /// additionally mirrors itself into a global of the same name, matching
    /// how a bare script's top-level functions are meant to be host- and
    /// cross-call-visible.
    fn fn_decl_stmt(&mut self) -> Result<(), VmError> {
        self.advance();
        let name = self.expect_ident()?;
        let is_top_level = self.frames.len() == 1;
        let slot = self.frame().declare_local(name.clone());
        self.fn_literal(false)?;
        self.emit(OpCode::StoreLocal, slot, 0);
        if is_top_level {
            self.emit(OpCode::LoadLocal, slot, 0);
            let v = Value::new_string(self.heap, name.as_bytes());
            let idx = self.frame().add_imm(v);
            self.emit(OpCode::StoreGlobal, idx, 0);
        }
        Ok(())
    }

    fn if_stmt(&mut self) -> Result<(), VmError> {
        self.advance();
        self.expect(&TokenKind::LParen, "'('")?;
        self.expression()?;
        self.expect(&TokenKind::RParen, "')'")?;
        self.emit(OpCode::JmpIfFalse, 0, 0);
        let else_jump = self.frame().here() - 1;
        self.block()?;
        if self.eat(&TokenKind::Else) {
            self.emit(OpCode::Jmp, 0, 0);
            let end_jump = self.frame().here() - 1;
            self.frame().patch_jump(else_jump);
            if self.check(&TokenKind::If) {
                self.if_stmt()?;
            } else {
                self.block()?;
            }
            self.frame().patch_jump(end_jump);
        } else {
            self.frame().patch_jump(else_jump);
        }
        Ok(())
    }

    fn while_stmt(&mut self) -> Result<(), VmError> {
        self.advance();
        let loop_start = self.frame().here();
        self.expect(&TokenKind::LParen, "'('")?;
        self.expression()?;
        self.expect(&TokenKind::RParen, "')'")?;
        self.emit(OpCode::JmpIfFalse, 0, 0);
        let exit_jump = self.frame().here() - 1;
        self.block()?;
        self.emit(OpCode::Jmp, loop_start as u16, 0);
        self.frame().patch_jump(exit_jump);
        Ok(())
    }

    /// `for (v in iterable) { ... }` desugars to a `NEXT`-driven loop: the
    /// iterable (a coroutine thread, or any object with a `next` hook) is
    /// evaluated once and held in a hidden local, and the loop body runs
    /// once per non-null value `NEXT` produces, stopping the first time it
    /// yields `NULL` — the same signal a resumed, exhausted coroutine
    /// produces forever, so a loop over a finished producer just never
    /// executes its body again.
    fn for_stmt(&mut self) -> Result<(), VmError> {
        self.advance();
        self.expect(&TokenKind::LParen, "'('")?;
        let var_name = self.expect_ident()?;
        self.expect(&TokenKind::In, "'in'")?;
        self.expression()?;
        self.expect(&TokenKind::RParen, "')'")?;

        let scope_start = self.frame().locals.len();
        let iter_slot = self.frame().declare_local(format!("$for_iter@{}", self.frame().here()));
        self.emit(OpCode::StoreLocal, iter_slot, 0);

        let loop_start = self.frame().here();
        self.emit(OpCode::LoadLocal, iter_slot, 0);
        self.emit(OpCode::Next, 0, 0);
        let var_slot = self.frame().declare_local(var_name);
        self.emit(OpCode::StoreLocal, var_slot, 0);
        self.emit(OpCode::LoadLocal, var_slot, 0);
        self.emit(OpCode::JmpIfFalse, 0, 0);
        let exit_jump = self.frame().here() - 1;

        self.block()?;
        self.emit(OpCode::Jmp, loop_start as u16, 0);
        self.frame().patch_jump(exit_jump);
        self.frame().locals.truncate(scope_start);
        Ok(())
    }

    fn return_stmt(&mut self) -> Result<(), VmError> {
        self.advance();
        let mut n = 0u16;
        if !self.check(&TokenKind::Semicolon) {
            self.expression()?;
            n = 1;
            while self.eat(&TokenKind::Comma) {
                self.expression()?;
                n += 1;
            }
        }
        self.expect(&TokenKind::Semicolon, "';'")?;
        self.emit(OpCode::Return, n, 0);
        Ok(())
    }

    fn throw_stmt(&mut self) -> Result<(), VmError> {
        self.advance();
        self.expression()?;
        self.expect(&TokenKind::Semicolon, "';'")?;
        self.emit(OpCode::Throw, 0, 0);
        Ok(())
    }

    fn try_stmt(&mut self) -> Result<(), VmError> {
        self.advance();
        self.emit(OpCode::Try, 0, 0);
        let try_instr = self.frame().here() - 1;
        self.block()?;
        self.emit(OpCode::EndTry, 0, 0);
        self.emit(OpCode::Jmp, 0, 0);
        let skip_catch = self.frame().here() - 1;
        self.frame().patch_jump(try_instr);

        self.expect(&TokenKind::Catch, "'catch'")?;
        self.expect(&TokenKind::LParen, "'('")?;
        let name = self.expect_ident()?;
        self.expect(&TokenKind::RParen, "')'")?;
        let start = self.frame().locals.len();
        let slot = self.frame().declare_local(name);
        self.emit(OpCode::StoreLocal, slot, 0);
        self.block()?;
        self.frame().locals.truncate(start);
        self.frame().patch_jump(skip_catch);

        if self.eat(&TokenKind::Finally) {
            self.block()?;
        }
        Ok(())
    }

    fn expr_stmt(&mut self) -> Result<(), VmError> {
        self.expression()?;
        self.expect(&TokenKind::Semicolon, "';'")?;
        self.emit(OpCode::Pop, 0, 0);
        Ok(())
    }

    // ---- expressions (precedence climbing) --------------------------

    fn expression(&mut self) -> Result<(), VmError> {
        self.assignment()
    }

    fn assignment(&mut self) -> Result<(), VmError> {
        if let TokenKind::Ident(name) = self.peek().clone() {
            if self.tokens.get(self.pos + 1).map(|t| &t.kind) == Some(&TokenKind::Assign) {
                self.advance();
                self.advance();
                self.expression()?;
                self.store_name(&name)?;
                return Ok(());
            }
        }
        self.logic_or()
    }

    fn store_name(&mut self, name: &str) -> Result<(), VmError> {
        if let Some(slot) = self.frame().resolve_local(name) {
            self.emit(OpCode::StoreLocal, slot, 0);
            return Ok(());
        }
        if let Some(encoded) = self.resolve_upvalue(name) {
            self.emit(OpCode::StoreUpval, encoded, 0);
            return Ok(());
        }
        let v = Value::new_string(self.heap, name.as_bytes());
        let idx = self.frame().add_imm(v);
        self.emit(OpCode::StoreGlobal, idx, 0);
        Ok(())
    }

    fn logic_or(&mut self) -> Result<(), VmError> {
        self.logic_and()?;
        while self.eat(&TokenKind::OrOr) {
            self.logic_and()?;
            self.emit(OpCode::Not, 0, 0);
            self.emit(OpCode::Not, 0, 0);
        }
        Ok(())
    }

    fn logic_and(&mut self) -> Result<(), VmError> {
        self.equality()?;
        while self.eat(&TokenKind::AndAnd) {
            self.equality()?;
        }
        Ok(())
    }

    fn equality(&mut self) -> Result<(), VmError> {
        self.comparison()?;
        loop {
            let op = match self.peek() {
                TokenKind::EqEq => OpCode::Eq,
                TokenKind::NotEq => OpCode::Neq,
                _ => break,
            };
            self.advance();
            self.comparison()?;
            self.emit(op, 0, 0);
        }
        Ok(())
    }

    fn comparison(&mut self) -> Result<(), VmError> {
        self.additive()?;
        loop {
            let op = match self.peek() {
                TokenKind::Lt => OpCode::Lt,
                TokenKind::Le => OpCode::Le,
                TokenKind::Gt => OpCode::Gt,
                TokenKind::Ge => OpCode::Ge,
                _ => break,
            };
            self.advance();
            self.additive()?;
            self.emit(op, 0, 0);
        }
        Ok(())
    }

    fn additive(&mut self) -> Result<(), VmError> {
        self.multiplicative()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => OpCode::Add,
                TokenKind::Minus => OpCode::Sub,
                _ => break,
            };
            self.advance();
            self.multiplicative()?;
            self.emit(op, 0, 0);
        }
        Ok(())
    }

    fn multiplicative(&mut self) -> Result<(), VmError> {
        self.unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => OpCode::Mul,
                TokenKind::Slash => OpCode::Div,
                TokenKind::Percent => OpCode::Mod,
                _ => break,
            };
            self.advance();
            self.unary()?;
            self.emit(op, 0, 0);
        }
        Ok(())
    }

    fn unary(&mut self) -> Result<(), VmError> {
        match self.peek() {
            TokenKind::Minus => {
                self.advance();
                self.unary()?;
                self.emit(OpCode::Neg, 0, 0);
                Ok(())
            }
            TokenKind::Not => {
                self.advance();
                self.unary()?;
                self.emit(OpCode::Not, 0, 0);
                Ok(())
            }
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<(), VmError> {
        self.primary()?;
        loop {
            match self.peek().clone() {
                TokenKind::LParen => {
                    self.advance();
                    let n = self.arg_list()?;
                    self.expect(&TokenKind::RParen, "')'")?;
                    // Defaults to one expected return; a destructuring
                    // `let a, b = ...;` widens this byte after the fact
                    // when this call turns out to be its whole right-hand
                    // side (see `fold_or_unpack_returns`).
                    self.emit(OpCode::Call, n, 1);
                }
                TokenKind::Question => {
                    self.advance();
                    self.emit(OpCode::Prop, 0, 0);
                }
                TokenKind::Dot => {
                    self.advance();
                    let name = self.expect_ident()?;
                    let v = Value::new_string(self.heap, name.as_bytes());
                    let idx = self.frame().add_imm(v);
                    if self.eat(&TokenKind::Assign) {
                        self.expression()?;
                        self.emit(OpCode::PushImm, idx, 0);
                        self.emit(OpCode::Swap, 0, 0);
                        self.emit(OpCode::SetField, 0, 0);
                    } else {
                        self.emit(OpCode::PushImm, idx, 0);
                        self.emit(OpCode::GetField, 0, 0);
                    }
                }
                TokenKind::LBracket => {
                    self.advance();
                    self.expression()?;
                    self.expect(&TokenKind::RBracket, "']'")?;
                    if self.eat(&TokenKind::Assign) {
                        self.expression()?;
                        self.emit(OpCode::SetField, 0, 0);
                    } else {
                        self.emit(OpCode::GetField, 0, 0);
                    }
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn arg_list(&mut self) -> Result<u16, VmError> {
        let mut n = 0u16;
        if !self.check(&TokenKind::RParen) {
            self.expression()?;
            n += 1;
            while self.eat(&TokenKind::Comma) {
                self.expression()?;
                n += 1;
            }
        }
        Ok(n)
    }

    fn primary(&mut self) -> Result<(), VmError> {
        let line = self.peek_line();
        match self.advance().kind {
            TokenKind::Number(n) => {
                let v = Value::from_int(self.heap, n);
                let idx = self.frame().add_imm(v);
                self.emit_at(OpCode::PushImm, idx, 0, line);
            }
            TokenKind::Str(bytes) => {
                let v = Value::new_string(self.heap, &bytes);
                let idx = self.frame().add_imm(v);
                self.emit_at(OpCode::PushImm, idx, 0, line);
            }
            TokenKind::StrInterp(parts) => self.compile_str_interp(parts, line)?,
            TokenKind::True => {
                let v = Value::from_bool(true);
                let idx = self.frame().add_imm(v);
                self.emit_at(OpCode::PushImm, idx, 0, line);
            }
            TokenKind::False | TokenKind::Null => self.emit_at(OpCode::PushNull, 0, 0, line),
            TokenKind::Ident(name) => self.load_name(&name)?,
            TokenKind::LParen => {
                self.expression()?;
                self.expect(&TokenKind::RParen, "')'")?;
            }
            TokenKind::LBracket => {
                let mut n: u8 = 0;
                if !self.check(&TokenKind::RBracket) {
                    self.expression()?;
                    n += 1;
                    while self.eat(&TokenKind::Comma) {
                        self.expression()?;
                        n += 1;
                    }
                }
                self.expect(&TokenKind::RBracket, "']'")?;
                self.emit_at(OpCode::NewArray, 0, n, line);
            }
            TokenKind::LBrace => {
                self.emit_at(OpCode::NewObject, 0, 0, line);
                if !self.check(&TokenKind::RBrace) {
                    loop {
                        let key = self.expect_ident()?;
                        self.expect(&TokenKind::Arrow, "'->'")?;
                        let kv = Value::new_string(self.heap, key.as_bytes());
                        let idx = self.frame().add_imm(kv);
                        self.emit(OpCode::Dup, 0, 0);
                        self.emit(OpCode::PushImm, idx, 0);
                        self.expression()?;
                        self.emit(OpCode::SetField, 0, 0);
                        if !self.eat(&TokenKind::Comma) {
                            break;
                        }
                    }
                }
                self.expect(&TokenKind::RBrace, "'}'")?;
            }
            TokenKind::Fn => self.fn_literal(false)?,
            TokenKind::Coroutine => self.fn_literal(true)?,
            TokenKind::Yield => {
                let mut n: u8 = 0;
                if !self.check(&TokenKind::Semicolon) && !self.check(&TokenKind::RParen) {
                    self.expression()?;
                    n = 1;
                }
                self.emit_at(OpCode::Yield, 0, n, line);
            }
            other => return Err(self.err(format!("unexpected token {other:?}"))),
        }
        Ok(())
    }

    fn emit_at(&mut self, op: OpCode, arg: u16, l: u8, line: u32) {
        self.frame().emit(Instruction::new(op, arg, l), line);
    }

    fn load_name(&mut self, name: &str) -> Result<(), VmError> {
        if let Some(slot) = self.frame().resolve_local(name) {
            self.emit(OpCode::LoadLocal, slot, 0);
            return Ok(());
        }
        if let Some(encoded) = self.resolve_upvalue(name) {
            self.emit(OpCode::LoadUpval, encoded, 0);
            return Ok(());
        }

        // Not a known local/upvalue: either a global or a bare command
        // name used as a `CMD` callee. Compiled as a global load; callers
        // that immediately invoke it fall back to the command dispatcher
        // at runtime when no such global exists (see `vm::dispatch_command`).
        if self.check(&TokenKind::LParen) {
            let v = Value::new_string(self.heap, name.as_bytes());
            let idx = self.frame().add_imm(v);
            self.emit(OpCode::PushImm, idx, 0);
            self.advance();
            let n = self.arg_list()?;
            self.expect(&TokenKind::RParen, "')'")?;
            self.emit(OpCode::Cmd, n, cmd_pack(Some(1), false, false));
            return Ok(());
        }

        let v = Value::new_string(self.heap, name.as_bytes());
        let idx = self.frame().add_imm(v);
        self.emit(OpCode::LoadGlobal, idx, 0);
        Ok(())
    }

    /// Walks enclosing frames looking for `name` as a local, encoding the
    /// number of frame-hops in the high bits of the slot index the way
    /// `vm::read_upval`/`write_upval` expect. Marks every walked frame as
    /// needing a heap environment (`upval_locals`), since a captured local
    /// can't live in a flat stack-indexed slot anymore.
    fn resolve_upvalue(&mut self, name: &str) -> Option<u16> {
        let depth = self.frames.len();
        if depth < 2 {
            return None;
        }
        for hops in 1..depth {
            let frame_idx = depth - 1 - hops;
            if let Some(slot) = self.frames[frame_idx].resolve_local(name) {
                self.frames[frame_idx].upval_locals = true;
                return Some(((hops as u16) << 12) | slot);
            }
        }
        None
    }

    fn fn_literal(&mut self, is_coroutine: bool) -> Result<(), VmError> {
        self.expect(&TokenKind::LParen, "'('")?;
        let mut param_names = Vec::new();
        let mut variadic = false;
        if !self.check(&TokenKind::RParen) {
            loop {
                param_names.push(self.expect_ident()?);
                if self.eat(&TokenKind::Comma) {
                    continue;
                }
                break;
            }
        }
        self.expect(&TokenKind::RParen, "')'")?;
        if let Some(last) = param_names.last() {
            if last == "..." {
                variadic = true;
                param_names.pop();
            }
        }

        self.frames.push(CompilerFrame::new(None));
        self.frame().n_args = param_names.len() as u8;
        self.frame().variadic = variadic;
        for p in param_names {
            self.frame().declare_local(p);
        }

        self.block()?;
        self.emit(OpCode::PushNull, 0, 0);
        self.emit(OpCode::Return, 1, 0);

        let finished = self.frames.pop().unwrap();
        let template_handle = self.finish_frame(finished);
        let v = Value::Heap(template_handle);
        let idx = self.frame().add_imm(v);
        let line = self.peek_line();
        self.emit_at(OpCode::MakeClosure, idx, is_coroutine as u8, line);
        Ok(())
    }

    fn compile_str_interp(&mut self, parts: Vec<StrPart>, line: u32) -> Result<(), VmError> {
        let mut first = true;
        for part in parts {
            match part {
                StrPart::Literal(bytes) => {
                    if bytes.is_empty() && !first {
                        continue;
                    }
                    let v = Value::new_string(self.heap, &bytes);
                    let idx = self.frame().add_imm(v);
                    self.emit_at(OpCode::PushImm, idx, 0, line);
                }
                StrPart::Expr(src) => {
                    let sub_tokens = Lexer::new(&src).tokenize()?;
                    let saved = std::mem::replace(&mut self.tokens, sub_tokens);
                    let saved_pos = std::mem::replace(&mut self.pos, 0);
                    self.expression()?;
                    self.tokens = saved;
                    self.pos = saved_pos;
                }
            }
            if !first {
                self.emit_at(OpCode::Concat, 0, 0, line);
            }
            first = false;
        }
        if first {
            let v = Value::new_string(self.heap, b"");
            let idx = self.frame().add_imm(v);
            self.emit_at(OpCode::PushImm, idx, 0, line);
        }
        Ok(())
    }
}
