//! Lexer for ABL source scripts.
//!
//! Tokenization is driven by a terminal map for keywords and punctuation;
//! identifiers, numbers and strings are scanned by hand. Every token carries
//! a [`Span`] for diagnostics.
mod token;

pub use self::token::*;

use lazy_static::lazy_static;
use std::{error::Error, fmt::Display, iter::Peekable, str::Chars};

#[macro_export]
macro_rules! terminal {
    ($map:ident, $name:ident, $value:expr) => {
        $map.insert($value, TokenKind::$name);
    };
}

lazy_static! {
    static ref LEX_MAP: LexMap = {
        let mut m = LexMap::default();

        terminal!(m, Agent, "agent");
        terminal!(m, Environment, "environment");
        terminal!(m, Const, "const");
        terminal!(m, Function, "function");
        terminal!(m, Interact, "interact");
        terminal!(m, Step, "step");
        terminal!(m, Simulate, "simulate");
        terminal!(m, Parfor, "parfor");
        terminal!(m, For, "for");
        terminal!(m, While, "while");
        terminal!(m, If, "if");
        terminal!(m, Else, "else");
        terminal!(m, Return, "return");
        terminal!(m, Break, "break");
        terminal!(m, Continue, "continue");
        terminal!(m, New, "new");
        terminal!(m, In, "in");
        terminal!(m, Out, "out");
        terminal!(m, Position, "position");
        terminal!(m, True, "true");
        terminal!(m, False, "false");

        terminal!(m, LParen, "(");
        terminal!(m, RParen, ")");
        terminal!(m, LBrace, "{");
        terminal!(m, RBrace, "}");
        terminal!(m, LBracket, "[");
        terminal!(m, RBracket, "]");
        terminal!(m, Comma, ",");
        terminal!(m, Semicolon, ";");
        terminal!(m, Colon, ":");
        terminal!(m, Question, "?");
        terminal!(m, Dot, ".");
        terminal!(m, DotDot, "..");
        terminal!(m, Assign, "=");
        terminal!(m, Plus, "+");
        terminal!(m, Minus, "-");
        terminal!(m, Star, "*");
        terminal!(m, Slash, "/");
        terminal!(m, Percent, "%");
        terminal!(m, PlusAssign, "+=");
        terminal!(m, MinusAssign, "-=");
        terminal!(m, StarAssign, "*=");
        terminal!(m, SlashAssign, "/=");
        terminal!(m, PercentAssign, "%=");
        terminal!(m, EqEq, "==");
        terminal!(m, NotEq, "!=");
        terminal!(m, Lt, "<");
        terminal!(m, Le, "<=");
        terminal!(m, Gt, ">");
        terminal!(m, Ge, ">=");
        terminal!(m, Shl, "<<");
        terminal!(m, Shr, ">>");
        terminal!(m, AndAnd, "&&");
        terminal!(m, OrOr, "||");
        terminal!(m, Amp, "&");
        terminal!(m, Pipe, "|");
        terminal!(m, Caret, "^");
        terminal!(m, Not, "!");
        terminal!(m, Tilde, "~");

        m
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub line: usize,
}

impl Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} on line {}", self.message, self.line)
    }
}

impl Error for LexError {}

pub type LexResult<T> = Result<T, LexError>;

#[derive(Debug, Clone)]
pub struct Lexer<'a> {
    tokens: Vec<Token>,
    iterator: Peekable<Chars<'a>>,
    line: usize,
    col: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            tokens: vec![],
            iterator: input.chars().peekable(),
            line: 1,
            col: 1,
        }
    }

    fn peek(&mut self) -> Option<&char> {
        self.iterator.peek()
    }

    fn peek_second(&self) -> Option<char> {
        let mut ahead = self.iterator.clone();
        ahead.next();
        ahead.next()
    }

    fn next(&mut self) -> Option<char> {
        let next = self.iterator.next();
        match next {
            Some('\n') => {
                self.line += 1;
                self.col = 1;
            }
            Some(_) => self.col += 1,
            None => {}
        }
        next
    }

    fn next_if(&mut self, func: impl FnOnce(&char) -> bool) -> Option<char> {
        let next = self.iterator.next_if(func)?;
        if next == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(next)
    }

    fn eat_whitespace_and_comments(&mut self) -> LexResult<()> {
        loop {
            while self.next_if(|item| item.is_whitespace()).is_some() {}

            match (self.peek().copied(), self.peek_second()) {
                (Some('/'), Some('/')) => {
                    while let Some(next) = self.next() {
                        if next == '\n' {
                            break;
                        }
                    }
                }
                (Some('/'), Some('*')) => {
                    let line = self.line;
                    self.next();
                    self.next();
                    let mut closed = false;
                    while let Some(next) = self.next() {
                        if next == '*' && self.peek() == Some(&'/') {
                            self.next();
                            closed = true;
                            break;
                        }
                    }
                    if !closed {
                        return Err(LexError {
                            message: "unterminated block comment".into(),
                            line,
                        });
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    pub fn lex(mut self) -> LexResult<Vec<Token>> {
        self.lex_internal()?;

        Ok(self.tokens)
    }

    fn lex_internal(&mut self) -> LexResult<()> {
        self.eat_whitespace_and_comments()?;

        let Some(next) = self.peek() else {
            return Ok(());
        };

        match next {
            'a'..='z' | 'A'..='Z' | '_' => self.lex_alphanumeric()?,
            '0'..='9' => self.lex_numeric()?,
            '"' => self.lex_string()?,
            _ => self.lex_special()?,
        };

        self.lex_internal()
    }

    fn push(&mut self, kind: TokenKind, start: (usize, usize)) {
        let span = Span {
            start,
            end: (self.line, self.col),
        };
        self.tokens.push(Token { kind, span });
    }

    fn lex_special(&mut self) -> LexResult<()> {
        let mut stack = vec![];

        let start = (self.line, self.col);

        while let Some(next) = self.next() {
            stack.push(next);

            let read = stack.iter().collect::<String>();

            let can_read_next = self
                .peek()
                .map(|item| {
                    let mut longer = stack.clone();
                    longer.push(*item);
                    let read = longer.iter().collect::<String>();
                    LEX_MAP.can_match(read.as_str())
                })
                .unwrap_or(false);

            if can_read_next {
                continue;
            }

            let Some(kind) = LEX_MAP.get(read.as_str()) else {
                return Err(LexError {
                    message: format!("failed to lex '{read}'"),
                    line: start.0,
                });
            };

            self.push(kind, start);
            break;
        }

        Ok(())
    }

    fn lex_alphanumeric(&mut self) -> LexResult<()> {
        let mut stack = vec![];

        let start = (self.line, self.col);

        while let Some(next) = self.next_if(|item| item.is_alphanumeric() || *item == '_') {
            stack.push(next);
        }

        let read = stack.iter().collect::<String>();

        if let Some(kind) = LEX_MAP.get(read.as_str()) {
            self.push(kind, start);
        } else {
            self.push(TokenKind::Ident(read), start);
        }

        Ok(())
    }

    fn lex_numeric(&mut self) -> LexResult<()> {
        let mut stack = vec![];

        let start = (self.line, self.col);

        while let Some(next) = self.next_if(|item| item.is_ascii_digit()) {
            stack.push(next);
        }

        // A '.' followed by a digit continues a float literal; '..' is the
        // range operator and must stay untouched.
        let is_float = self.peek() == Some(&'.')
            && self
                .peek_second()
                .map(|item| item.is_ascii_digit())
                .unwrap_or(false);

        if is_float {
            stack.push(self.next().unwrap());
            while let Some(next) = self.next_if(|item| item.is_ascii_digit()) {
                stack.push(next);
            }
        }

        let read = stack.iter().collect::<String>();

        if is_float {
            let value = read.parse::<f64>().map_err(|_| LexError {
                message: format!("failed to parse float literal '{read}'"),
                line: start.0,
            })?;
            self.push(TokenKind::FloatLit(value), start);
        } else {
            let value = read.parse::<i64>().map_err(|_| LexError {
                message: format!("failed to parse integer literal '{read}'"),
                line: start.0,
            })?;
            self.push(TokenKind::IntLit(value), start);
        }

        Ok(())
    }

    fn lex_string(&mut self) -> LexResult<()> {
        let start = (self.line, self.col);

        self.next();

        let mut stack = vec![];
        loop {
            match self.next() {
                Some('"') => break,
                Some('\\') => {
                    stack.push('\\');
                    if let Some(escaped) = self.next() {
                        stack.push(escaped);
                    }
                }
                Some(next) => stack.push(next),
                None => {
                    return Err(LexError {
                        message: "unterminated string literal".into(),
                        line: start.0,
                    })
                }
            }
        }

        let raw = stack.iter().collect::<String>();
        let value = unescape::unescape(&raw).ok_or_else(|| LexError {
            message: format!("invalid escape sequence in string literal '{raw}'"),
            line: start.0,
        })?;

        self.push(TokenKind::StrLit(value), start);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        Lexer::new(input)
            .lex()
            .expect("should lex")
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn test_lex_identifier() {
        assert_eq!(kinds("predator"), vec![TokenKind::Ident("predator".into())]);
    }

    #[test]
    fn test_lex_keywords() {
        assert_eq!(
            kinds("agent parfor in out"),
            vec![
                TokenKind::Agent,
                TokenKind::Parfor,
                TokenKind::In,
                TokenKind::Out
            ]
        );
    }

    #[test]
    fn test_lex_numbers() {
        assert_eq!(
            kinds("42 3.25"),
            vec![TokenKind::IntLit(42), TokenKind::FloatLit(3.25)]
        );
    }

    #[test]
    fn test_lex_range_is_not_a_float() {
        assert_eq!(
            kinds("0..10"),
            vec![
                TokenKind::IntLit(0),
                TokenKind::DotDot,
                TokenKind::IntLit(10)
            ]
        );
    }

    #[test]
    fn test_lex_string_escapes() {
        assert_eq!(
            kinds(r#""a\"b\\c""#),
            vec![TokenKind::StrLit("a\"b\\c".into())]
        );
    }

    #[test]
    fn test_lex_maximal_munch() {
        assert_eq!(
            kinds("a<=b << c"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::Le,
                TokenKind::Ident("b".into()),
                TokenKind::Shl,
                TokenKind::Ident("c".into())
            ]
        );
    }

    #[test]
    fn test_lex_comments() {
        assert_eq!(
            kinds("a // trailing\n/* block\n comment */ b"),
            vec![TokenKind::Ident("a".into()), TokenKind::Ident("b".into())]
        );
    }

    #[test]
    fn test_lex_spans() {
        let tokens = Lexer::new("agent\n  Cell").lex().expect("should lex");
        assert_eq!(tokens[0].span.start, (1, 1));
        assert_eq!(tokens[1].span.start, (2, 3));
    }

    #[test]
    fn test_lex_error_carries_line() {
        let err = Lexer::new("agent\n  @").lex().unwrap_err();
        assert_eq!(err.line, 2);
    }
}
