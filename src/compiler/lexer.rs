//! The lexer: turns source text into a flat token stream, folding keyword
//! lookup through a static table built once per process.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::compiler::token::{StrPart, Token, TokenKind};
use crate::error::VmError;

static KEYWORDS: Lazy<HashMap<&'static str, TokenKind>> = Lazy::new(|| {
    use TokenKind::*;
    HashMap::from([
        ("let", Let),
        ("fn", Fn),
        ("coroutine", Coroutine),
        ("if", If),
        ("else", Else),
        ("while", While),
        ("for", For),
        ("in", In),
        ("return", Return),
        ("try", Try),
        ("catch", Catch),
        ("finally", Finally),
        ("throw", Throw),
        ("yield", Yield),
        ("true", True),
        ("false", False),
        ("null", Null),
    ])
});

pub struct Lexer<'a> {
    src: &'a [u8],
    pos: usize,
    line: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src: src.as_bytes(), pos: 0, line: 1 }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                    self.advance();
                }
                Some(b'#') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, VmError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_trivia();
            let line = self.line;
            let Some(c) = self.peek() else {
                tokens.push(Token { kind: TokenKind::Eof, line });
                break;
            };

            let kind = match c {
                b'(' => { self.advance(); TokenKind::LParen }
                b')' => { self.advance(); TokenKind::RParen }
                b'{' => { self.advance(); TokenKind::LBrace }
                b'}' => { self.advance(); TokenKind::RBrace }
                b'[' => { self.advance(); TokenKind::LBracket }
                b']' => { self.advance(); TokenKind::RBracket }
                b',' => { self.advance(); TokenKind::Comma }
                b';' => { self.advance(); TokenKind::Semicolon }
                b'.' => { self.advance(); TokenKind::Dot }
                b'?' => { self.advance(); TokenKind::Question }
                b'+' => { self.advance(); TokenKind::Plus }
                b'-' => {
                    self.advance();
                    if self.peek() == Some(b'>') {
                        self.advance();
                        TokenKind::Arrow
                    } else {
                        TokenKind::Minus
                    }
                }
                b'*' => { self.advance(); TokenKind::Star }
                b'/' => { self.advance(); TokenKind::Slash }
                b'%' => { self.advance(); TokenKind::Percent }
                b'=' => {
                    self.advance();
                    if self.peek() == Some(b'=') {
                        self.advance();
                        TokenKind::EqEq
                    } else {
                        TokenKind::Assign
                    }
                }
                b'!' => {
                    self.advance();
                    if self.peek() == Some(b'=') {
                        self.advance();
                        TokenKind::NotEq
                    } else {
                        TokenKind::Not
                    }
                }
                b'<' => {
                    self.advance();
                    if self.peek() == Some(b'=') {
                        self.advance();
                        TokenKind::Le
                    } else {
                        TokenKind::Lt
                    }
                }
                b'>' => {
                    self.advance();
                    if self.peek() == Some(b'=') {
                        self.advance();
                        TokenKind::Ge
                    } else {
                        TokenKind::Gt
                    }
                }
                b'&' if self.peek_at(1) == Some(b'&') => {
                    self.advance();
                    self.advance();
                    TokenKind::AndAnd
                }
                b'|' if self.peek_at(1) == Some(b'|') => {
                    self.advance();
                    self.advance();
                    TokenKind::OrOr
                }
                b'"' => self.lex_string(line)?,
                b'0'..=b'9' => self.lex_number(),
                c if c.is_ascii_alphabetic() || c == b'_' => self.lex_ident(),
                other => {
                    return Err(VmError::Syntax {
                        line: line as usize,
                        message: format!("unexpected character '{}'", other as char),
                        snippet: self.snippet(line),
                    })
                }
            };

            tokens.push(Token { kind, line });
        }
        Ok(tokens)
    }

    fn lex_number(&mut self) -> TokenKind {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        TokenKind::Number(text.parse().unwrap_or(0))
    }

    fn lex_ident(&mut self) -> TokenKind {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.advance();
        }
        let text = std::str::from_utf8(&self.src[start..self.pos]).unwrap();
        KEYWORDS.get(text).cloned().unwrap_or_else(|| TokenKind::Ident(text.to_string()))
    }

    fn lex_string(&mut self, line: u32) -> Result<TokenKind, VmError> {
        self.advance(); // opening quote
        let mut parts: Vec<StrPart> = Vec::new();
        let mut literal = Vec::new();
        let mut had_interp = false;

        loop {
            match self.advance() {
                None => {
                    return Err(VmError::Syntax {
                        line: line as usize,
                        message: "unterminated string literal".into(),
                        snippet: self.snippet(line),
                    })
                }
                Some(b'"') => break,
                Some(b'\\') => match self.advance() {
                    Some(b'n') => literal.push(b'\n'),
                    Some(b't') => literal.push(b'\t'),
                    Some(b'"') => literal.push(b'"'),
                    Some(b'\\') => literal.push(b'\\'),
                    Some(c) => literal.push(c),
                    None => {
                        return Err(VmError::Syntax {
                            line: line as usize,
                            message: "unterminated escape sequence".into(),
                            snippet: self.snippet(line),
                        })
                    }
                },
                Some(b'$') if self.peek() == Some(b'{') => {
                    had_interp = true;
                    self.advance(); // '{'
                    parts.push(StrPart::Literal(std::mem::take(&mut literal)));
                    let start = self.pos;
                    let mut depth = 1;
                    while depth > 0 {
                        match self.advance() {
                            Some(b'{') => depth += 1,
                            Some(b'}') => depth -= 1,
                            Some(_) => {}
                            None => {
                                return Err(VmError::Syntax {
                                    line: line as usize,
                                    message: "unterminated interpolation".into(),
                                    snippet: self.snippet(line),
                                })
                            }
                        }
                    }
                    let expr_src = std::str::from_utf8(&self.src[start..self.pos - 1]).unwrap().to_string();
                    parts.push(StrPart::Expr(expr_src));
                }
                Some(c) => literal.push(c),
            }
        }

        if had_interp {
            parts.push(StrPart::Literal(literal));
            Ok(TokenKind::StrInterp(parts))
        } else {
            Ok(TokenKind::Str(literal))
        }
    }

    fn snippet(&self, line: u32) -> String {
        format!("line {line}")
    }
}
