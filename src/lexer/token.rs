use std::collections::HashMap;

/// Source region of a token or AST node, as `(line, column)` pairs. Lines and
/// columns are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: (usize, usize),
    pub end: (usize, usize),
}

impl Default for Span {
    fn default() -> Self {
        Self {
            start: (1, 1),
            end: (1, 1),
        }
    }
}

impl Span {
    pub fn line(&self) -> usize {
        self.start.0
    }

    /// Combine two spans into one covering both.
    pub fn merge(&self, other: &Span) -> Span {
        Span {
            start: self.start,
            end: other.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident(String),
    IntLit(i64),
    FloatLit(f64),
    StrLit(String),

    Agent,
    Environment,
    Const,
    Function,
    Interact,
    Step,
    Simulate,
    Parfor,
    For,
    While,
    If,
    Else,
    Return,
    Break,
    Continue,
    New,
    In,
    Out,
    Position,
    True,
    False,

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    Colon,
    Question,
    Dot,
    DotDot,
    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Shl,
    Shr,
    AndAnd,
    OrOr,
    Amp,
    Pipe,
    Caret,
    Not,
    Tilde,
}

impl TokenKind {
    /// Human readable description for error messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(name) => format!("identifier '{name}'"),
            TokenKind::IntLit(value) => format!("integer '{value}'"),
            TokenKind::FloatLit(value) => format!("float '{value}'"),
            TokenKind::StrLit(value) => format!("string \"{value}\""),
            other => format!("'{}'", other.sigil()),
        }
    }

    fn sigil(&self) -> &'static str {
        match self {
            TokenKind::Ident(_)
            | TokenKind::IntLit(_)
            | TokenKind::FloatLit(_)
            | TokenKind::StrLit(_) => "",
            TokenKind::Agent => "agent",
            TokenKind::Environment => "environment",
            TokenKind::Const => "const",
            TokenKind::Function => "function",
            TokenKind::Interact => "interact",
            TokenKind::Step => "step",
            TokenKind::Simulate => "simulate",
            TokenKind::Parfor => "parfor",
            TokenKind::For => "for",
            TokenKind::While => "while",
            TokenKind::If => "if",
            TokenKind::Else => "else",
            TokenKind::Return => "return",
            TokenKind::Break => "break",
            TokenKind::Continue => "continue",
            TokenKind::New => "new",
            TokenKind::In => "in",
            TokenKind::Out => "out",
            TokenKind::Position => "position",
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::Comma => ",",
            TokenKind::Semicolon => ";",
            TokenKind::Colon => ":",
            TokenKind::Question => "?",
            TokenKind::Dot => ".",
            TokenKind::DotDot => "..",
            TokenKind::Assign => "=",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Star => "*",
            TokenKind::Slash => "/",
            TokenKind::Percent => "%",
            TokenKind::PlusAssign => "+=",
            TokenKind::MinusAssign => "-=",
            TokenKind::StarAssign => "*=",
            TokenKind::SlashAssign => "/=",
            TokenKind::PercentAssign => "%=",
            TokenKind::EqEq => "==",
            TokenKind::NotEq => "!=",
            TokenKind::Lt => "<",
            TokenKind::Le => "<=",
            TokenKind::Gt => ">",
            TokenKind::Ge => ">=",
            TokenKind::Shl => "<<",
            TokenKind::Shr => ">>",
            TokenKind::AndAnd => "&&",
            TokenKind::OrOr => "||",
            TokenKind::Amp => "&",
            TokenKind::Pipe => "|",
            TokenKind::Caret => "^",
            TokenKind::Not => "!",
            TokenKind::Tilde => "~",
        }
    }
}

/// Terminal lookup table used by the lexer. Keys are matched with maximal
/// munch via [`LexMap::can_match`].
#[derive(Debug, Clone, Default)]
pub struct LexMap {
    map: HashMap<&'static str, TokenKind>,
}

impl LexMap {
    pub fn insert(&mut self, key: &'static str, value: TokenKind) {
        self.map.insert(key, value);
    }

    pub fn can_match(&self, key: &str) -> bool {
        self.map.keys().any(|map_key| map_key.starts_with(key))
    }

    pub fn get(&self, key: &str) -> Option<TokenKind> {
        self.map.get(key).cloned()
    }
}
