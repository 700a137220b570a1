//! Recursive descent parser for ABL.
//!
//! The parser consumes the token stream produced by the lexer and builds a
//! [`Script`]. It fails fast: the first syntax error aborts parsing.
pub mod ast;
mod parse_state;

pub use self::parse_state::*;

use std::{error::Error, fmt::Display};

use crate::lexer::{Span, Token, TokenKind};

use self::ast::{
    AgentDeclaration, AgentMember, BinaryOp, Block, CallExpression, ConstDeclaration, Declaration,
    EnvironmentDeclaration, Expression, ExpressionKind, ForStatement, FunctionDeclaration,
    FunctionInfo, FunctionKind, MemberInit, Param, ParamRole, ParforStatement, Script,
    SimulateStatement, Statement, TypeName, UnaryOp, Var, VarDeclaration,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub span: Option<Span>,
}

impl ParseError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span: Some(span),
        }
    }

    pub fn eof(item: &str) -> ParseError {
        ParseError {
            message: format!("hit end of file while parsing {item}"),
            span: None,
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.span {
            Some(span) => write!(f, "{} on line {}", self.message, span.line()),
            None => f.write_str(&self.message),
        }
    }
}

impl Error for ParseError {}

type PResult<T> = Result<T, ParseError>;

/// Parse a whole script from its token stream.
pub fn parse(tokens: Vec<Token>) -> PResult<Script> {
    let mut parser = Parser {
        state: ParseState::new(tokens),
    };
    parser.parse_script()
}

struct Parser {
    state: ParseState,
}

impl Parser {
    fn error_here(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.state.current_span())
    }

    fn expect(&mut self, kind: TokenKind, context: &str) -> PResult<Token> {
        match self.state.peek() {
            Some(token) if token.kind == kind => Ok(self.state.next().unwrap()),
            Some(token) => Err(ParseError::new(
                format!(
                    "expected {} but found {} while parsing {context}",
                    kind.describe(),
                    token.kind.describe()
                ),
                token.span,
            )),
            None => Err(ParseError::eof(context)),
        }
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.state.peek_kind() == Some(kind) {
            self.state.next();
            return true;
        }
        false
    }

    fn expect_ident(&mut self, context: &str) -> PResult<(String, Span)> {
        match self.state.peek().cloned() {
            Some(Token {
                kind: TokenKind::Ident(name),
                span,
            }) => {
                self.state.next();
                Ok((name, span))
            }
            Some(token) => Err(ParseError::new(
                format!(
                    "expected an identifier but found {} while parsing {context}",
                    token.kind.describe()
                ),
                token.span,
            )),
            None => Err(ParseError::eof(context)),
        }
    }

    fn parse_script(&mut self) -> PResult<Script> {
        let mut decls = vec![];

        while let Some(kind) = self.state.peek_kind() {
            let decl = match kind {
                TokenKind::Environment => {
                    Declaration::Environment(self.parse_environment_declaration()?)
                }
                TokenKind::Agent => Declaration::Agent(self.parse_agent_declaration()?),
                TokenKind::Const => Declaration::Const(self.parse_const_declaration()?),
                TokenKind::Function => Declaration::Function(self.parse_function(false)?),
                TokenKind::Interact => {
                    self.state.next();
                    Declaration::Function(self.parse_function(true)?)
                }
                TokenKind::Step => Declaration::Function(self.parse_step_function()?),
                TokenKind::Simulate => Declaration::Simulate(self.parse_simulate()?),
                other => {
                    return Err(self.error_here(format!(
                        "expected a declaration but found {}",
                        other.describe()
                    )))
                }
            };
            decls.push(decl);
        }

        Ok(Script { decls, sim: None })
    }

    fn parse_environment_declaration(&mut self) -> PResult<EnvironmentDeclaration> {
        let start = self.state.current_span();
        self.expect(TokenKind::Environment, "environment declaration")?;
        self.expect(TokenKind::LBrace, "environment declaration")?;

        let mut min = None;
        let mut max = None;
        let mut granularity = None;

        loop {
            if self.eat(&TokenKind::RBrace) {
                break;
            }

            let (key, key_span) = self.expect_ident("environment member")?;
            self.expect(TokenKind::Colon, "environment member")?;
            let expr = self.parse_expression()?;

            let slot = match key.as_str() {
                "min" => &mut min,
                "max" => &mut max,
                "granularity" => &mut granularity,
                other => {
                    return Err(ParseError::new(
                        format!("unknown environment member '{other}'"),
                        key_span,
                    ))
                }
            };
            if slot.replace(expr).is_some() {
                return Err(ParseError::new(
                    format!("duplicate environment member '{key}'"),
                    key_span,
                ));
            }

            if !self.eat(&TokenKind::Comma) {
                self.expect(TokenKind::RBrace, "environment declaration")?;
                break;
            }
        }

        let span = start.merge(&self.state.previous_span());
        let Some(max) = max else {
            return Err(ParseError::new(
                "environment declaration is missing 'max'",
                span,
            ));
        };

        Ok(EnvironmentDeclaration {
            min,
            max,
            granularity,
            bounds: None,
            span,
        })
    }

    fn parse_agent_declaration(&mut self) -> PResult<AgentDeclaration> {
        let start = self.state.current_span();
        self.expect(TokenKind::Agent, "agent declaration")?;
        let (name, _) = self.expect_ident("agent declaration")?;
        self.expect(TokenKind::LBrace, "agent declaration")?;

        let mut members = vec![];
        while !self.eat(&TokenKind::RBrace) {
            let member_start = self.state.current_span();
            let is_position = self.eat(&TokenKind::Position);
            let ty = self.parse_type("agent member")?;
            let (member_name, _) = self.expect_ident("agent member")?;
            self.expect(TokenKind::Semicolon, "agent member")?;

            members.push(AgentMember {
                is_position,
                ty,
                name: member_name,
                resolved: Default::default(),
                span: member_start.merge(&self.state.previous_span()),
            });
        }

        Ok(AgentDeclaration {
            name,
            members,
            span: start.merge(&self.state.previous_span()),
        })
    }

    fn parse_const_declaration(&mut self) -> PResult<ConstDeclaration> {
        let start = self.state.current_span();
        self.expect(TokenKind::Const, "const declaration")?;
        let (name, _) = self.expect_ident("const declaration")?;
        self.expect(TokenKind::Assign, "const declaration")?;
        let expr = self.parse_expression()?;
        self.expect(TokenKind::Semicolon, "const declaration")?;

        Ok(ConstDeclaration {
            var: Var::new(name),
            expr,
            value: None,
            span: start.merge(&self.state.previous_span()),
        })
    }

    fn parse_function(&mut self, is_interact: bool) -> PResult<FunctionDeclaration> {
        let start = self.state.current_span();
        self.expect(TokenKind::Function, "function declaration")?;
        let (name, _) = self.expect_ident("function declaration")?;
        self.expect(TokenKind::LParen, "function parameters")?;

        let mut params = vec![];
        if !self.eat(&TokenKind::RParen) {
            loop {
                params.push(self.parse_param()?);
                if !self.eat(&TokenKind::Comma) {
                    self.expect(TokenKind::RParen, "function parameters")?;
                    break;
                }
            }
        }

        let return_type = if self.eat(&TokenKind::Colon) {
            Some(self.parse_type("return type")?)
        } else {
            None
        };

        let body = self.parse_block()?;

        let kind = if is_interact {
            FunctionKind::Step
        } else {
            FunctionKind::Plain
        };

        Ok(FunctionDeclaration {
            kind,
            name,
            params,
            return_type,
            resolved_return: Default::default(),
            body,
            info: FunctionInfo::default(),
            span: start.merge(&self.state.previous_span()),
        })
    }

    fn parse_step_function(&mut self) -> PResult<FunctionDeclaration> {
        let start = self.state.current_span();
        self.expect(TokenKind::Step, "step function")?;
        let (name, _) = self.expect_ident("step function")?;
        self.expect(TokenKind::LParen, "step function parameters")?;

        let mut params = vec![self.parse_param()?];
        while self.eat(&TokenKind::Comma) {
            params.push(self.parse_param()?);
        }
        self.expect(TokenKind::RParen, "step function parameters")?;

        let body = self.parse_block()?;

        Ok(FunctionDeclaration {
            kind: FunctionKind::Step,
            name,
            params,
            return_type: None,
            resolved_return: Default::default(),
            body,
            info: FunctionInfo::default(),
            span: start.merge(&self.state.previous_span()),
        })
    }

    fn parse_param(&mut self) -> PResult<Param> {
        let start = self.state.current_span();
        let ty = self.parse_type("parameter")?;
        let (name, _) = self.expect_ident("parameter")?;

        let role = if self.eat(&TokenKind::In) {
            ParamRole::In
        } else if self.eat(&TokenKind::Out) {
            ParamRole::Out
        } else {
            ParamRole::None
        };

        Ok(Param {
            ty,
            var: Var::new(name),
            role,
            resolved: Default::default(),
            span: start.merge(&self.state.previous_span()),
        })
    }

    fn parse_simulate(&mut self) -> PResult<SimulateStatement> {
        let start = self.state.current_span();
        self.expect(TokenKind::Simulate, "simulate")?;
        let steps = self.parse_expression()?;
        self.expect(TokenKind::LBrace, "simulate")?;

        let mut step_fns = vec![];
        loop {
            let (name, _) = self.expect_ident("simulate step list")?;
            step_fns.push(name);
            if !self.eat(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(TokenKind::RBrace, "simulate")?;

        Ok(SimulateStatement {
            steps,
            step_fns,
            span: start.merge(&self.state.previous_span()),
        })
    }

    fn parse_type(&mut self, context: &str) -> PResult<TypeName> {
        let (name, span) = self.expect_ident(context)?;

        let mut is_array = false;
        if self.state.peek_kind() == Some(&TokenKind::LBracket)
            && self.state.peek_at(1) == Some(&TokenKind::RBracket)
        {
            self.state.next();
            self.state.next();
            is_array = true;
        }

        Ok(TypeName {
            name,
            is_array,
            span: span.merge(&self.state.previous_span()),
        })
    }

    fn parse_block(&mut self) -> PResult<Block> {
        let start = self.state.current_span();
        self.expect(TokenKind::LBrace, "block")?;

        let mut stmts = vec![];
        while !self.eat(&TokenKind::RBrace) {
            if self.state.is_at_end() {
                return Err(ParseError::eof("block"));
            }
            stmts.push(self.parse_statement()?);
        }

        Ok(Block {
            stmts,
            span: start.merge(&self.state.previous_span()),
        })
    }

    fn parse_statement(&mut self) -> PResult<Statement> {
        let Some(kind) = self.state.peek_kind() else {
            return Err(ParseError::eof("statement"));
        };

        match kind {
            TokenKind::LBrace => Ok(Statement::Block(self.parse_block()?)),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::For => self.parse_for(),
            TokenKind::Parfor => self.parse_parfor(),
            TokenKind::Simulate => Ok(Statement::Simulate(self.parse_simulate()?)),
            TokenKind::Return => self.parse_return(),
            TokenKind::Break => {
                let span = self.state.current_span();
                self.state.next();
                self.expect(TokenKind::Semicolon, "break")?;
                Ok(Statement::Break { span })
            }
            TokenKind::Continue => {
                let span = self.state.current_span();
                self.state.next();
                self.expect(TokenKind::Semicolon, "continue")?;
                Ok(Statement::Continue { span })
            }
            _ if self.at_var_declaration() => self.parse_var_declaration(),
            _ => self.parse_expression_statement(),
        }
    }

    /// `T x ...` or `T[] x ...` starts a variable declaration.
    fn at_var_declaration(&self) -> bool {
        let Some(TokenKind::Ident(_)) = self.state.peek_kind() else {
            return false;
        };
        match (self.state.peek_at(1), self.state.peek_at(2), self.state.peek_at(3)) {
            (Some(TokenKind::Ident(_)), _, _) => true,
            (
                Some(TokenKind::LBracket),
                Some(TokenKind::RBracket),
                Some(TokenKind::Ident(_)),
            ) => true,
            _ => false,
        }
    }

    fn parse_var_declaration(&mut self) -> PResult<Statement> {
        let start = self.state.current_span();
        let ty = self.parse_type("variable declaration")?;
        let (name, _) = self.expect_ident("variable declaration")?;

        let initializer = if self.eat(&TokenKind::Assign) {
            Some(self.parse_expression()?)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "variable declaration")?;

        Ok(Statement::VarDeclaration(VarDeclaration {
            ty,
            var: Var::new(name),
            initializer,
            resolved: Default::default(),
            span: start.merge(&self.state.previous_span()),
        }))
    }

    fn parse_if(&mut self) -> PResult<Statement> {
        self.expect(TokenKind::If, "if statement")?;
        self.expect(TokenKind::LParen, "if condition")?;
        let cond = self.parse_expression()?;
        self.expect(TokenKind::RParen, "if condition")?;

        let then_stmt = Box::new(self.parse_statement()?);
        let else_stmt = if self.eat(&TokenKind::Else) {
            Some(Box::new(self.parse_statement()?))
        } else {
            None
        };

        Ok(Statement::If {
            cond,
            then_stmt,
            else_stmt,
        })
    }

    fn parse_while(&mut self) -> PResult<Statement> {
        self.expect(TokenKind::While, "while statement")?;
        self.expect(TokenKind::LParen, "while condition")?;
        let cond = self.parse_expression()?;
        self.expect(TokenKind::RParen, "while condition")?;
        let body = Box::new(self.parse_statement()?);

        Ok(Statement::While { cond, body })
    }

    fn parse_for(&mut self) -> PResult<Statement> {
        let start = self.state.current_span();
        self.expect(TokenKind::For, "for statement")?;
        self.expect(TokenKind::LParen, "for statement")?;
        let ty = self.parse_type("for statement")?;
        let (name, _) = self.expect_ident("for statement")?;
        self.expect(TokenKind::Colon, "for statement")?;
        let iterable = self.parse_expression()?;
        self.expect(TokenKind::RParen, "for statement")?;
        let body = Box::new(self.parse_statement()?);

        Ok(Statement::For(ForStatement {
            ty,
            var: Var::new(name),
            iterable,
            body,
            span: start.merge(&self.state.previous_span()),
        }))
    }

    fn parse_parfor(&mut self) -> PResult<Statement> {
        let start = self.state.current_span();
        self.expect(TokenKind::Parfor, "parfor statement")?;
        self.expect(TokenKind::LParen, "parfor statement")?;
        let ty = self.parse_type("parfor statement")?;
        let (in_name, _) = self.expect_ident("parfor statement")?;
        self.expect(TokenKind::In, "parfor statement")?;
        self.expect(TokenKind::Comma, "parfor statement")?;
        let out_ty = self.parse_type("parfor statement")?;
        let (out_name, out_span) = self.expect_ident("parfor statement")?;
        self.expect(TokenKind::Out, "parfor statement")?;
        self.expect(TokenKind::Colon, "parfor statement")?;
        let iterable = self.parse_expression()?;
        self.expect(TokenKind::RParen, "parfor statement")?;
        let body = Box::new(self.parse_statement()?);

        if out_ty != ty {
            return Err(ParseError::new(
                "parfor 'in' and 'out' bindings must have the same type",
                out_span,
            ));
        }

        Ok(Statement::Parfor(ParforStatement {
            ty,
            in_var: Var::new(in_name),
            out_var: Var::new(out_name),
            iterable,
            body,
            span: start.merge(&self.state.previous_span()),
        }))
    }

    fn parse_return(&mut self) -> PResult<Statement> {
        let start = self.state.current_span();
        self.expect(TokenKind::Return, "return statement")?;

        let expr = if self.state.peek_kind() == Some(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expression()?)
        };
        self.expect(TokenKind::Semicolon, "return statement")?;

        Ok(Statement::Return {
            expr,
            span: start.merge(&self.state.previous_span()),
        })
    }

    fn parse_expression_statement(&mut self) -> PResult<Statement> {
        let left = self.parse_expression()?;

        let assign_op = match self.state.peek_kind() {
            Some(TokenKind::Assign) => None,
            Some(TokenKind::PlusAssign) => Some(BinaryOp::Add),
            Some(TokenKind::MinusAssign) => Some(BinaryOp::Sub),
            Some(TokenKind::StarAssign) => Some(BinaryOp::Mul),
            Some(TokenKind::SlashAssign) => Some(BinaryOp::Div),
            Some(TokenKind::PercentAssign) => Some(BinaryOp::Mod),
            _ => {
                self.expect(TokenKind::Semicolon, "expression statement")?;
                return Ok(Statement::Expression(left));
            }
        };

        self.state.next();
        let right = self.parse_expression()?;
        self.expect(TokenKind::Semicolon, "assignment")?;

        match assign_op {
            None => Ok(Statement::Assign { left, right }),
            Some(op) => Ok(Statement::AssignOp { op, left, right }),
        }
    }

    fn parse_expression(&mut self) -> PResult<Expression> {
        self.parse_ternary()
    }

    fn parse_ternary(&mut self) -> PResult<Expression> {
        let cond = self.parse_binary(0)?;

        if !self.eat(&TokenKind::Question) {
            return Ok(cond);
        }

        let then_expr = self.parse_expression()?;
        self.expect(TokenKind::Colon, "ternary expression")?;
        let else_expr = self.parse_ternary()?;

        let span = cond.span.merge(&else_expr.span);
        Ok(Expression::new(
            ExpressionKind::Ternary {
                cond: Box::new(cond),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            },
            span,
        ))
    }

    /// Binary operator tiers, loosest first.
    const BINARY_TIERS: &'static [&'static [(TokenKind, BinaryOp)]] = &[
        &[(TokenKind::OrOr, BinaryOp::LogicalOr)],
        &[(TokenKind::AndAnd, BinaryOp::LogicalAnd)],
        &[(TokenKind::Pipe, BinaryOp::BitwiseOr)],
        &[(TokenKind::Caret, BinaryOp::BitwiseXor)],
        &[(TokenKind::Amp, BinaryOp::BitwiseAnd)],
        &[
            (TokenKind::EqEq, BinaryOp::Equals),
            (TokenKind::NotEq, BinaryOp::NotEquals),
        ],
        &[
            (TokenKind::Lt, BinaryOp::Smaller),
            (TokenKind::Le, BinaryOp::SmallerEquals),
            (TokenKind::Gt, BinaryOp::Greater),
            (TokenKind::Ge, BinaryOp::GreaterEquals),
        ],
        &[
            (TokenKind::Shl, BinaryOp::ShiftLeft),
            (TokenKind::Shr, BinaryOp::ShiftRight),
        ],
        &[(TokenKind::DotDot, BinaryOp::Range)],
        &[
            (TokenKind::Plus, BinaryOp::Add),
            (TokenKind::Minus, BinaryOp::Sub),
        ],
        &[
            (TokenKind::Star, BinaryOp::Mul),
            (TokenKind::Slash, BinaryOp::Div),
            (TokenKind::Percent, BinaryOp::Mod),
        ],
    ];

    fn parse_binary(&mut self, tier: usize) -> PResult<Expression> {
        let Some(ops) = Self::BINARY_TIERS.get(tier) else {
            return self.parse_unary();
        };

        let mut left = self.parse_binary(tier + 1)?;

        loop {
            let Some(kind) = self.state.peek_kind() else {
                return Ok(left);
            };
            let Some((_, op)) = ops.iter().find(|(token, _)| token == kind) else {
                return Ok(left);
            };
            let op = *op;
            self.state.next();

            let right = self.parse_binary(tier + 1)?;
            let span = left.span.merge(&right.span);
            left = Expression::new(
                ExpressionKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                span,
            );

            // `..` is non-associative.
            if op == BinaryOp::Range {
                return Ok(left);
            }
        }
    }

    fn parse_unary(&mut self) -> PResult<Expression> {
        let op = match self.state.peek_kind() {
            Some(TokenKind::Minus) => Some(UnaryOp::Minus),
            Some(TokenKind::Plus) => Some(UnaryOp::Plus),
            Some(TokenKind::Not) => Some(UnaryOp::LogicalNot),
            Some(TokenKind::Tilde) => Some(UnaryOp::BitwiseNot),
            _ => None,
        };

        let Some(op) = op else {
            return self.parse_postfix();
        };

        let start = self.state.current_span();
        self.state.next();
        let expr = self.parse_unary()?;
        let span = start.merge(&expr.span);

        Ok(Expression::new(
            ExpressionKind::Unary {
                op,
                expr: Box::new(expr),
            },
            span,
        ))
    }

    fn parse_postfix(&mut self) -> PResult<Expression> {
        let mut expr = self.parse_primary()?;

        loop {
            match self.state.peek_kind() {
                Some(TokenKind::Dot) => {
                    self.state.next();
                    let (member, member_span) = self.expect_ident("member access")?;
                    let span = expr.span.merge(&member_span);
                    expr = Expression::new(
                        ExpressionKind::Member {
                            expr: Box::new(expr),
                            member,
                        },
                        span,
                    );
                }
                Some(TokenKind::LBracket) => {
                    self.state.next();
                    let index = self.parse_expression()?;
                    self.expect(TokenKind::RBracket, "array access")?;
                    let span = expr.span.merge(&self.state.previous_span());
                    expr = Expression::new(
                        ExpressionKind::Index {
                            array: Box::new(expr),
                            index: Box::new(index),
                        },
                        span,
                    );
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> PResult<Expression> {
        let Some(token) = self.state.peek().cloned() else {
            return Err(ParseError::eof("expression"));
        };

        match token.kind {
            TokenKind::IntLit(value) => {
                self.state.next();
                Ok(Expression::new(ExpressionKind::IntLit(value), token.span))
            }
            TokenKind::FloatLit(value) => {
                self.state.next();
                Ok(Expression::new(ExpressionKind::FloatLit(value), token.span))
            }
            TokenKind::StrLit(value) => {
                self.state.next();
                Ok(Expression::new(ExpressionKind::StrLit(value), token.span))
            }
            TokenKind::True => {
                self.state.next();
                Ok(Expression::new(ExpressionKind::BoolLit(true), token.span))
            }
            TokenKind::False => {
                self.state.next();
                Ok(Expression::new(ExpressionKind::BoolLit(false), token.span))
            }
            TokenKind::LParen => {
                self.state.next();
                let expr = self.parse_expression()?;
                self.expect(TokenKind::RParen, "parenthesized expression")?;
                Ok(expr)
            }
            TokenKind::LBracket => self.parse_array_init(),
            TokenKind::New => self.parse_new_array(),
            TokenKind::Ident(name) => self.parse_ident_expression(name, token.span),
            other => Err(ParseError::new(
                format!("expected an expression but found {}", other.describe()),
                token.span,
            )),
        }
    }

    fn parse_array_init(&mut self) -> PResult<Expression> {
        let start = self.state.current_span();
        self.expect(TokenKind::LBracket, "vector literal")?;

        let mut exprs = vec![self.parse_expression()?];
        while self.eat(&TokenKind::Comma) {
            exprs.push(self.parse_expression()?);
        }
        self.expect(TokenKind::RBracket, "vector literal")?;

        Ok(Expression::new(
            ExpressionKind::ArrayInit { exprs },
            start.merge(&self.state.previous_span()),
        ))
    }

    fn parse_new_array(&mut self) -> PResult<Expression> {
        let start = self.state.current_span();
        self.expect(TokenKind::New, "array allocation")?;
        let elem = self.parse_type("array allocation")?;
        self.expect(TokenKind::LBracket, "array allocation")?;
        let len = self.parse_expression()?;
        self.expect(TokenKind::RBracket, "array allocation")?;

        Ok(Expression::new(
            ExpressionKind::NewArray {
                elem,
                len: Box::new(len),
            },
            start.merge(&self.state.previous_span()),
        ))
    }

    fn parse_ident_expression(&mut self, name: String, span: Span) -> PResult<Expression> {
        self.state.next();

        match self.state.peek_kind() {
            Some(TokenKind::LParen) => {
                self.state.next();
                let mut args = vec![];
                if !self.eat(&TokenKind::RParen) {
                    loop {
                        args.push(self.parse_expression()?);
                        if !self.eat(&TokenKind::Comma) {
                            self.expect(TokenKind::RParen, "call arguments")?;
                            break;
                        }
                    }
                }

                Ok(Expression::new(
                    ExpressionKind::Call(CallExpression {
                        name,
                        args,
                        target: Default::default(),
                    }),
                    span.merge(&self.state.previous_span()),
                ))
            }
            // `A { member: expr, ... }` — distinguished from a trailing
            // block by the `ident ':'` lookahead.
            Some(TokenKind::LBrace)
                if matches!(self.state.peek_at(1), Some(TokenKind::Ident(_)))
                    && self.state.peek_at(2) == Some(&TokenKind::Colon) =>
            {
                self.state.next();
                let mut members = vec![];
                loop {
                    let member_start = self.state.current_span();
                    let (member_name, _) = self.expect_ident("agent creation")?;
                    self.expect(TokenKind::Colon, "agent creation")?;
                    let expr = self.parse_expression()?;
                    members.push(MemberInit {
                        name: member_name,
                        expr,
                        span: member_start.merge(&self.state.previous_span()),
                    });
                    if !self.eat(&TokenKind::Comma) {
                        self.expect(TokenKind::RBrace, "agent creation")?;
                        break;
                    }
                    if self.eat(&TokenKind::RBrace) {
                        break;
                    }
                }

                Ok(Expression::new(
                    ExpressionKind::AgentCreation { name, members },
                    span.merge(&self.state.previous_span()),
                ))
            }
            _ => Ok(Expression::new(
                ExpressionKind::Var(Var::new(name)),
                span,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;

    fn parse_source(input: &str) -> PResult<Script> {
        let tokens = Lexer::new(input).lex().expect("should lex");
        parse(tokens)
    }

    fn parse_stmt(input: &str) -> Statement {
        let source = format!("function f() {{ {input} }}");
        let script = parse_source(&source).expect("should parse");
        let Declaration::Function(func) = &script.decls[0] else {
            unreachable!()
        };
        func.body.stmts[0].clone()
    }

    #[test]
    fn test_parse_minimal_script() {
        let script = parse_source(
            "environment { min: [0, 0], max: [10, 10], granularity: 1 }\n\
             agent A { position vec2 p; }\n\
             step f(A a in, A a out) {}\n\
             simulate 0 { f }",
        )
        .expect("should parse");

        assert_eq!(script.decls.len(), 4);
        assert!(script.environment().is_some());
        assert_eq!(script.agents().count(), 1);
        let func = script.function("f").expect("step function");
        assert_eq!(func.kind, FunctionKind::Step);
        assert_eq!(func.in_param().map(|p| p.ty.name.as_str()), Some("A"));
    }

    #[test]
    fn test_parse_precedence() {
        let Statement::Expression(expr) = parse_stmt("1 + 2 * 3;") else {
            panic!("expected expression statement");
        };
        let ExpressionKind::Binary { op, right, .. } = expr.kind else {
            panic!("expected binary expression");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(
            right.kind,
            ExpressionKind::Binary {
                op: BinaryOp::Mul,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_range_for() {
        let Statement::For(stmt) = parse_stmt("for (int i : 0..10) { }") else {
            panic!("expected for statement");
        };
        assert!(matches!(
            stmt.iterable.kind,
            ExpressionKind::Binary {
                op: BinaryOp::Range,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_parfor() {
        let Statement::Parfor(stmt) = parse_stmt("parfor (A x in, A y out : ants) { }") else {
            panic!("expected parfor statement");
        };
        assert_eq!(stmt.in_var.name, "x");
        assert_eq!(stmt.out_var.name, "y");
    }

    #[test]
    fn test_parse_parfor_type_mismatch() {
        let tokens = Lexer::new("function f() { parfor (A x in, B y out : ants) { } }")
            .lex()
            .expect("should lex");
        assert!(parse(tokens).is_err());
    }

    #[test]
    fn test_parse_agent_creation_vs_block() {
        let Statement::Expression(expr) = parse_stmt("add(A { p: [1.0, 2.0] });") else {
            panic!("expected expression statement");
        };
        let ExpressionKind::Call(call) = expr.kind else {
            panic!("expected call");
        };
        assert!(matches!(
            call.args[0].kind,
            ExpressionKind::AgentCreation { .. }
        ));
    }

    #[test]
    fn test_parse_compound_assignment() {
        let Statement::AssignOp { op, .. } = parse_stmt("x += 1;") else {
            panic!("expected compound assignment");
        };
        assert_eq!(op, BinaryOp::Add);
    }

    #[test]
    fn test_parse_error_has_line() {
        let tokens = Lexer::new("agent A {\n  vec2;\n}").lex().expect("should lex");
        let err = parse(tokens).unwrap_err();
        assert_eq!(err.span.map(|span| span.line()), Some(2));
    }

    #[test]
    fn test_parse_ternary() {
        let Statement::Expression(expr) = parse_stmt("f(a > b ? 1 : 2);") else {
            panic!("expected expression statement");
        };
        let ExpressionKind::Call(call) = expr.kind else {
            panic!("expected call");
        };
        assert!(matches!(call.args[0].kind, ExpressionKind::Ternary { .. }));
    }
}
