//! Streaming printer infrastructure shared by all backends.
//!
//! [`Printer`] is a text writer that owns indentation; callers only mark
//! indent/outdent around blocks. [`TargetPrinter`] realizes the printing of
//! all nodes whose surface form is language-agnostic; each backend
//! implements the handful of target-specific methods and overrides the
//! defaults where its lowering differs. The `*_default` free functions hold
//! the generic behavior so an override can fall back to it for the cases it
//! does not handle.
use crate::analysis::Type;
use crate::parser::ast::{
    BinaryOp, Block, CallExpression, Expression, ExpressionKind, ForStatement, ParforStatement,
    SimulateStatement, Statement, Var, VarDeclaration,
};

const INDENT: &str = "    ";

#[derive(Debug, Clone, Default)]
pub struct Printer {
    out: String,
    indent: usize,
    at_line_start: bool,
}

impl Printer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.at_line_start {
            for _ in 0..self.indent {
                self.out.push_str(INDENT);
            }
            self.at_line_start = false;
        }
        self.out.push_str(text);
    }

    pub fn newline(&mut self) {
        self.out.push('\n');
        self.at_line_start = true;
    }

    pub fn indent(&mut self) {
        self.indent += 1;
    }

    pub fn outdent(&mut self) {
        self.indent = self.indent.saturating_sub(1);
    }

    pub fn extract(self) -> String {
        self.out
    }
}

/// Print a float so that it reads back as a floating point literal: finite
/// values always carry a decimal point.
pub fn float_literal(value: f64) -> String {
    let text = format!("{value}");
    if value.is_finite() && !text.contains('.') && !text.contains('e') {
        format!("{text}.0")
    } else {
        text
    }
}

/// Quote a string literal, escaping `"` and `\`.
pub fn string_literal(value: &str) -> String {
    let mut out = String::from("\"");
    for c in value.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}

pub trait TargetPrinter {
    fn out(&mut self) -> &mut Printer;

    /// Whether the target language supports function overloading. When it
    /// does not, calls print the mangled name chosen during overload
    /// resolution.
    fn supports_overloads(&self) -> bool {
        false
    }

    fn print_type(&mut self, ty: &Type);
    fn print_call(&mut self, call: &CallExpression);
    fn print_agent_creation(&mut self, expr: &Expression);
    fn print_new_array(&mut self, expr: &Expression);
    fn print_for(&mut self, stmt: &ForStatement);
    fn print_parfor(&mut self, stmt: &ParforStatement);
    fn print_simulate(&mut self, stmt: &SimulateStatement);

    fn print_var(&mut self, var: &Var) {
        let name = var.name.clone();
        self.out().emit(&name);
    }

    fn print_member(&mut self, base: &Expression, member: &str) {
        self.print_expression(base);
        self.out().emit(".");
        self.out().emit(member);
    }

    fn print_index(&mut self, array: &Expression, index: &Expression) {
        self.print_expression(array);
        self.out().emit("[");
        self.print_expression(index);
        self.out().emit("]");
    }

    /// `[x, y]` vector initializers; targets usually lower these to a
    /// constructor call.
    fn print_vector_init(&mut self, expr: &Expression) {
        let ExpressionKind::ArrayInit { exprs } = &expr.kind else {
            return;
        };
        self.out().emit("{ ");
        for (index, component) in exprs.iter().enumerate() {
            if index > 0 {
                self.out().emit(", ");
            }
            self.print_expression(component);
        }
        self.out().emit(" }");
    }

    /// Binary operations the target cannot spell with an infix operator
    /// (e.g. vector arithmetic through runtime calls).
    fn is_special_binary(&self, _op: BinaryOp, _left: &Expression, _right: &Expression) -> bool {
        false
    }

    fn print_special_binary(&mut self, _op: BinaryOp, _left: &Expression, _right: &Expression) {}

    fn print_expression(&mut self, expr: &Expression) {
        print_expression_default(self, expr);
    }

    /// Arguments of a call, comma separated.
    fn print_args(&mut self, call: &CallExpression) {
        for (index, arg) in call.args.iter().enumerate() {
            if index > 0 {
                self.out().emit(", ");
            }
            self.print_expression(arg);
        }
    }

    fn print_block(&mut self, block: &Block) {
        self.out().emit("{");
        self.out().indent();
        for stmt in &block.stmts {
            self.out().newline();
            self.print_statement(stmt);
        }
        self.out().outdent();
        self.out().newline();
        self.out().emit("}");
    }

    fn print_var_declaration(&mut self, decl: &VarDeclaration) {
        let ty = decl.resolved.clone();
        self.print_type(&ty);
        self.out().emit(" ");
        self.print_var(&decl.var);
        if let Some(initializer) = &decl.initializer {
            self.out().emit(" = ");
            self.print_expression(initializer);
        }
        self.out().emit(";");
    }

    fn print_assign(&mut self, left: &Expression, right: &Expression) {
        self.print_expression(left);
        self.out().emit(" = ");
        self.print_expression(right);
        self.out().emit(";");
    }

    fn print_assign_op(&mut self, op: BinaryOp, left: &Expression, right: &Expression) {
        if self.is_special_binary(op, left, right) {
            self.print_expression(left);
            self.out().emit(" = ");
            self.print_special_binary(op, left, right);
            self.out().emit(";");
            return;
        }
        self.print_expression(left);
        self.out().emit(" ");
        self.out().emit(op.sigil());
        self.out().emit("= ");
        self.print_expression(right);
        self.out().emit(";");
    }

    fn print_statement(&mut self, stmt: &Statement) {
        print_statement_default(self, stmt);
    }
}

/// Generic expression printing: fully parenthesized binary and unary
/// operators, C-style literals.
pub fn print_expression_default<P: TargetPrinter + ?Sized>(p: &mut P, expr: &Expression) {
    match &expr.kind {
        ExpressionKind::BoolLit(value) => {
            let text = if *value { "true" } else { "false" };
            p.out().emit(text);
        }
        ExpressionKind::IntLit(value) => {
            let text = value.to_string();
            p.out().emit(&text);
        }
        ExpressionKind::FloatLit(value) => {
            let text = float_literal(*value);
            p.out().emit(&text);
        }
        ExpressionKind::StrLit(value) => {
            let text = string_literal(value);
            p.out().emit(&text);
        }
        ExpressionKind::Var(var) => p.print_var(var),
        ExpressionKind::Unary { op, expr: inner } => {
            p.out().emit("(");
            p.out().emit(op.sigil());
            p.print_expression(inner);
            p.out().emit(")");
        }
        ExpressionKind::Binary { op, left, right } => {
            if p.is_special_binary(*op, left, right) {
                p.print_special_binary(*op, left, right);
                return;
            }
            p.out().emit("(");
            p.print_expression(left);
            p.out().emit(" ");
            p.out().emit(op.sigil());
            p.out().emit(" ");
            p.print_expression(right);
            p.out().emit(")");
        }
        ExpressionKind::Ternary {
            cond,
            then_expr,
            else_expr,
        } => {
            p.out().emit("(");
            p.print_expression(cond);
            p.out().emit(" ? ");
            p.print_expression(then_expr);
            p.out().emit(" : ");
            p.print_expression(else_expr);
            p.out().emit(")");
        }
        ExpressionKind::Call(call) => p.print_call(call),
        ExpressionKind::Member { expr: base, member } => p.print_member(base, member),
        ExpressionKind::Index { array, index } => p.print_index(array, index),
        ExpressionKind::ArrayInit { .. } => p.print_vector_init(expr),
        ExpressionKind::AgentCreation { .. } => p.print_agent_creation(expr),
        ExpressionKind::NewArray { .. } => p.print_new_array(expr),
    }
}

/// Generic statement printing.
pub fn print_statement_default<P: TargetPrinter + ?Sized>(p: &mut P, stmt: &Statement) {
    match stmt {
        Statement::Expression(expr) => {
            p.print_expression(expr);
            p.out().emit(";");
        }
        Statement::Assign { left, right } => p.print_assign(left, right),
        Statement::AssignOp { op, left, right } => p.print_assign_op(*op, left, right),
        Statement::Block(block) => p.print_block(block),
        Statement::VarDeclaration(decl) => p.print_var_declaration(decl),
        Statement::If {
            cond,
            then_stmt,
            else_stmt,
        } => {
            p.out().emit("if (");
            p.print_expression(cond);
            p.out().emit(") ");
            p.print_statement(then_stmt);
            if let Some(else_stmt) = else_stmt {
                p.out().emit(" else ");
                p.print_statement(else_stmt);
            }
        }
        Statement::While { cond, body } => {
            p.out().emit("while (");
            p.print_expression(cond);
            p.out().emit(") ");
            p.print_statement(body);
        }
        Statement::For(stmt) => p.print_for(stmt),
        Statement::Parfor(stmt) => p.print_parfor(stmt),
        Statement::Simulate(stmt) => p.print_simulate(stmt),
        Statement::Return { expr, .. } => match expr {
            Some(expr) => {
                p.out().emit("return ");
                p.print_expression(expr);
                p.out().emit(";");
            }
            None => p.out().emit("return;"),
        },
        Statement::Break { .. } => p.out().emit("break;"),
        Statement::Continue { .. } => p.out().emit("continue;"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_literal_gets_decimal_point() {
        assert_eq!(float_literal(1.0), "1.0");
        assert_eq!(float_literal(0.5), "0.5");
        assert_eq!(float_literal(-3.0), "-3.0");
    }

    #[test]
    fn test_string_literal_escapes() {
        assert_eq!(string_literal("a\"b\\c"), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn test_printer_manages_indentation() {
        let mut printer = Printer::new();
        printer.emit("{");
        printer.indent();
        printer.newline();
        printer.emit("x;");
        printer.outdent();
        printer.newline();
        printer.emit("}");
        assert_eq!(printer.extract(), "{\n    x;\n}");
    }
}
