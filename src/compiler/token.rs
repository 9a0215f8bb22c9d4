//! Token kinds produced by the lexer.

#[derive(Clone, Debug, PartialEq)]
pub enum TokenKind {
    // Literals
    Ident(String),
    Number(i64),
    Str(Vec<u8>),
    /// A string literal containing `${...}` interpolation: the literal
    /// pieces and, between them, the raw source text of each embedded
    /// expression (re-lexed and parsed recursively by the parser).
    StrInterp(Vec<StrPart>),

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Dot,
    Assign,
    Arrow,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    AndAnd,
    OrOr,
    Question,

    // Keywords
    Let,
    Fn,
    Coroutine,
    If,
    Else,
    While,
    For,
    In,
    Return,
    Try,
    Catch,
    Finally,
    Throw,
    Yield,
    True,
    False,
    Null,

    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub enum StrPart {
    Literal(Vec<u8>),
    Expr(String),
}

#[derive(Clone, Debug)]
pub struct Token {
    pub kind: TokenKind,
    pub line: u32,
}
