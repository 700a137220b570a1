//! Sequential C backend.
//!
//! Lowers the script to a single-threaded `main.c` over flat `dyn_array`
//! populations (one per agent type plus a scratch buffer for the
//! double-buffered step sweep). `near` becomes a brute-force scan over the
//! population, `simulate` a plain loop, and `save` uses the runtime type
//! information tables consumed by the copied `libabl` assets.
use std::collections::{HashMap, HashSet};

use crate::analysis::{Type, Value, VarId};
use crate::parser::ast::{
    AgentDeclaration, BinaryOp, CallExpression, CallTarget, Expression, ExpressionKind,
    ForStatement, FunctionDeclaration, FunctionKind, ParamRole, ParforStatement, Script,
    SimulateStatement, Statement, UnaryOp, Var,
};

use super::{
    float_literal, print_expression_default, string_literal, Backend, BackendContext,
    BackendError, Printer, ProjectFiles, TargetPrinter,
};

pub struct CBackend;

impl Backend for CBackend {
    fn generate(
        &self,
        script: &Script,
        ctx: &BackendContext,
    ) -> Result<ProjectFiles, BackendError> {
        let use_float = ctx.config.get_bool("use_float", false);

        let mut printer = CPrinter::new(script);
        printer.print_script();

        let mut files = ProjectFiles::default();
        files.write("main.c", printer.extract());
        files.write("build.sh", build_script(use_float));
        files.write("run.sh", "#!/bin/sh\n./main\n".to_owned());
        files.copy("c/libabl.h", "libabl.h");
        files.copy("c/libabl.c", "libabl.c");
        files.make_executable("build.sh");
        files.make_executable("run.sh");
        files.create_dir("iterations");
        Ok(files)
    }
}

fn build_script(use_float: bool) -> String {
    if use_float {
        "#!/bin/sh\ngcc -O2 -std=c99 -DLIBABL_USE_FLOAT=1 main.c libabl.c -lm -o main\n"
            .to_owned()
    } else {
        "#!/bin/sh\ngcc -O2 -std=c99 main.c libabl.c -lm -o main\n".to_owned()
    }
}

fn c_type(ty: &Type) -> String {
    match ty {
        Type::Void => "void".to_owned(),
        Type::Bool => "bool".to_owned(),
        Type::Int32 => "int".to_owned(),
        Type::Float32 => "float".to_owned(),
        Type::String => "const char *".to_owned(),
        Type::Vec2 => "float2".to_owned(),
        Type::Vec3 => "float3".to_owned(),
        Type::Agent(name) => name.clone(),
        Type::Array(_) => "dyn_array".to_owned(),
        Type::Invalid => "void".to_owned(),
    }
}

fn rtti_id(ty: &Type) -> &'static str {
    match ty {
        Type::Bool => "TYPE_BOOL",
        Type::Int32 => "TYPE_INT",
        Type::Float32 => "TYPE_FLOAT",
        Type::String => "TYPE_STRING",
        Type::Vec2 => "TYPE_FLOAT2",
        Type::Vec3 => "TYPE_FLOAT3",
        _ => "TYPE_END",
    }
}

fn value_literal(value: &Value) -> String {
    match value {
        Value::Bool(true) => "true".to_owned(),
        Value::Bool(false) => "false".to_owned(),
        Value::Int(value) => value.to_string(),
        Value::Float(value) => float_literal(*value),
        Value::Str(value) => string_literal(value),
        Value::Vec2(x, y) => format!("{{ {}, {} }}", float_literal(*x), float_literal(*y)),
        Value::Vec3(x, y, z) => format!(
            "{{ {}, {}, {} }}",
            float_literal(*x),
            float_literal(*y),
            float_literal(*z)
        ),
    }
}

fn vec_prefix(ty: &Type) -> &'static str {
    if *ty == Type::Vec3 {
        "float3"
    } else {
        "float2"
    }
}

/// Vector arithmetic has no C operators; it lowers to the `libabl` vector
/// calls. Shared by the C and FLAME printers.
pub(super) fn is_vec_binary(op: BinaryOp, left: &Expression, right: &Expression) -> bool {
    matches!(
        op,
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div
    ) && (left.ty.is_vec() || right.ty.is_vec())
}

pub(super) fn print_vec_binary<P: TargetPrinter + ?Sized>(
    p: &mut P,
    op: BinaryOp,
    left: &Expression,
    right: &Expression,
) {
    let prefix = vec_prefix(if left.ty.is_vec() { &left.ty } else { &right.ty });

    match (left.ty.is_vec(), right.ty.is_vec(), op) {
        (true, true, BinaryOp::Add) | (true, true, BinaryOp::Sub) => {
            let name = if op == BinaryOp::Add { "add" } else { "sub" };
            p.out().emit(&format!("{prefix}_{name}("));
            p.print_expression(left);
            p.out().emit(", ");
            p.print_expression(right);
            p.out().emit(")");
        }
        (true, false, BinaryOp::Mul) | (true, false, BinaryOp::Div) => {
            let name = if op == BinaryOp::Mul {
                "mul_scalar"
            } else {
                "div_scalar"
            };
            p.out().emit(&format!("{prefix}_{name}("));
            p.print_expression(left);
            p.out().emit(", ");
            p.print_expression(right);
            p.out().emit(")");
        }
        (false, true, BinaryOp::Mul) => {
            p.out().emit(&format!("{prefix}_mul_scalar("));
            p.print_expression(right);
            p.out().emit(", ");
            p.print_expression(left);
            p.out().emit(")");
        }
        (true, false, _) => {
            // Broadcast the scalar, then add or subtract.
            let name = if op == BinaryOp::Add { "add" } else { "sub" };
            p.out().emit(&format!("{prefix}_{name}("));
            p.print_expression(left);
            p.out().emit(&format!(", {prefix}_fill("));
            p.print_expression(right);
            p.out().emit("))");
        }
        (false, true, _) => {
            let name = if op == BinaryOp::Add { "add" } else { "sub" };
            p.out().emit(&format!("{prefix}_{name}({prefix}_fill("));
            p.print_expression(left);
            p.out().emit("), ");
            p.print_expression(right);
            p.out().emit(")");
        }
        _ => {}
    }
}

pub(super) struct CPrinter<'a> {
    out: Printer,
    script: &'a Script,
    /// C names per binding; `out` params are renamed when they collide with
    /// the `in` binding.
    names: HashMap<VarId, String>,
    /// Bindings held by pointer (step params, parfor bindings, near loop
    /// variables); member access prints `->`.
    ptr_vars: HashSet<VarId>,
    in_binding: Option<VarId>,
    step_agent: Option<&'a AgentDeclaration>,
    in_main: bool,
    in_step: bool,
    /// Initial-state runner for the FLAME targets: step execution stays
    /// with the platform, so `simulate` and `save` are dropped and `main`
    /// ends by dumping the seeded populations to `iterations/0.xml`.
    runner: bool,
    tmp: usize,
}

impl<'a> CPrinter<'a> {
    fn new(script: &'a Script) -> Self {
        Self {
            out: Printer::new(),
            script,
            names: HashMap::default(),
            ptr_vars: HashSet::default(),
            in_binding: None,
            step_agent: None,
            in_main: false,
            in_step: false,
            runner: false,
            tmp: 0,
        }
    }

    pub(super) fn new_runner(script: &'a Script) -> Self {
        let mut printer = Self::new(script);
        printer.runner = true;
        printer
    }

    pub(super) fn extract(self) -> String {
        self.out.extract()
    }

    fn fresh(&mut self, stem: &str) -> String {
        let name = format!("{stem}{}", self.tmp);
        self.tmp += 1;
        name
    }

    fn var_name(&self, var: &Var) -> String {
        var.id
            .and_then(|id| self.names.get(&id).cloned())
            .unwrap_or_else(|| var.name.clone())
    }

    fn line(&mut self, text: &str) {
        self.out.emit(text);
        self.out.newline();
    }

    pub(super) fn print_script(&mut self) {
        self.line("#include <stdbool.h>");
        self.line("#include <stddef.h>");
        if self.runner {
            self.line("#include <stdio.h>");
        }
        self.line("#include <stdlib.h>");
        self.line("#include \"libabl.h\"");
        self.out.newline();

        for decl in self.script.consts() {
            if let Some(value) = &decl.value {
                let text = format!(
                    "static const {} {} = {};",
                    c_type(&value.type_of()),
                    decl.var.name,
                    value_literal(value)
                );
                self.line(&text);
            }
        }
        self.out.newline();

        let agents: Vec<_> = self.script.agents().collect();
        for agent in &agents {
            self.print_agent_struct(agent);
        }
        for agent in &agents {
            self.print_populations(agent);
        }
        self.out.newline();

        let functions: Vec<_> = self
            .script
            .functions()
            .filter(|func| func.name != "main")
            .filter(|func| !self.runner || func.kind != FunctionKind::Step)
            .collect();

        for func in &functions {
            self.print_signature(func);
            self.line(";");
        }
        self.out.newline();

        for func in &functions {
            self.print_function(func);
            self.out.newline();
        }

        if self.runner {
            self.print_initial_state_writer();
            self.out.newline();
        } else {
            let steps = self.script.step_functions();
            for func in steps {
                self.print_run_step(func);
                self.out.newline();
            }
        }

        self.print_main();
    }

    /// Dump the seeded populations as `iterations/0.xml` for the FLAME
    /// runtimes.
    fn print_initial_state_writer(&mut self) {
        self.line("static void write_initial_state(void) {");
        self.out.indent();
        self.line("FILE *file = fopen(\"iterations/0.xml\", \"w\");");
        self.line("if (!file) return;");
        self.line("fprintf(file, \"<states>\\n<itno>0</itno>\\n\");");

        let agents: Vec<_> = self.script.agents().cloned().collect();
        for agent in &agents {
            let name = &agent.name;
            let text =
                format!("for (size_t i = 0; i < agents_{name}.len; i++) {{");
            self.line(&text);
            self.out.indent();
            let text = format!("{name} *a = DYN_ARRAY_GET(&agents_{name}, {name}, i);");
            self.line(&text);

            let mut fmt = format!("<xagent>\\n<name>{name}</name>\\n");
            let mut args = vec![];
            for member in &agent.members {
                match &member.resolved {
                    Type::Vec2 => {
                        fmt.push_str(&format!(
                            "<{m}_x>%g</{m}_x>\\n<{m}_y>%g</{m}_y>\\n",
                            m = member.name
                        ));
                        args.push(format!("a->{}.x", member.name));
                        args.push(format!("a->{}.y", member.name));
                    }
                    Type::Vec3 => {
                        fmt.push_str(&format!(
                            "<{m}_x>%g</{m}_x>\\n<{m}_y>%g</{m}_y>\\n<{m}_z>%g</{m}_z>\\n",
                            m = member.name
                        ));
                        args.push(format!("a->{}.x", member.name));
                        args.push(format!("a->{}.y", member.name));
                        args.push(format!("a->{}.z", member.name));
                    }
                    Type::Float32 => {
                        fmt.push_str(&format!("<{m}>%g</{m}>\\n", m = member.name));
                        args.push(format!("a->{}", member.name));
                    }
                    _ => {
                        fmt.push_str(&format!("<{m}>%d</{m}>\\n", m = member.name));
                        args.push(format!("a->{}", member.name));
                    }
                }
            }
            fmt.push_str("</xagent>\\n");

            let text = format!("fprintf(file, \"{fmt}\", {});", args.join(", "));
            self.line(&text);
            self.out.outdent();
            self.line("}");
        }

        self.line("fprintf(file, \"</states>\\n\");");
        self.line("fclose(file);");
        self.out.outdent();
        self.line("}");
    }

    fn print_agent_struct(&mut self, agent: &AgentDeclaration) {
        self.line("typedef struct {");
        self.out.indent();
        for member in &agent.members {
            let text = format!("{} {};", c_type(&member.resolved), member.name);
            self.line(&text);
        }
        self.out.outdent();
        let text = format!("}} {};", agent.name);
        self.line(&text);
        self.out.newline();

        let text = format!("static const type_info {}_info[] = {{", agent.name);
        self.line(&text);
        self.out.indent();
        for member in &agent.members {
            let text = format!(
                "{{ {}, offsetof({}, {}), \"{}\" }},",
                rtti_id(&member.resolved),
                agent.name,
                member.name,
                member.name
            );
            self.line(&text);
        }
        self.line("{ TYPE_END, 0, NULL },");
        self.out.outdent();
        self.line("};");
        self.out.newline();
    }

    fn print_populations(&mut self, agent: &AgentDeclaration) {
        let name = &agent.name;
        let text = format!("static dyn_array agents_{name};");
        self.line(&text);
        let text = format!("static dyn_array agents_{name}_dbuf;");
        self.line(&text);
        let text = format!("static dyn_array agents_{name}_new;");
        self.line(&text);
        self.out.newline();

        let text = format!("static void push_{name}(dyn_array *ary, {name} agent) {{");
        self.line(&text);
        self.out.indent();
        self.line("if (ary->len == ary->cap) {");
        self.out.indent();
        self.line("ary->cap = ary->cap == 0 ? 16 : ary->cap * 2;");
        let text = format!("ary->values = realloc(ary->values, ary->cap * sizeof({name}));");
        self.line(&text);
        self.out.outdent();
        self.line("}");
        let text = format!("(({name} *) ary->values)[ary->len++] = agent;");
        self.line(&text);
        self.out.outdent();
        self.line("}");
        self.out.newline();
    }

    fn print_signature(&mut self, func: &FunctionDeclaration) {
        let ret = c_type(&func.resolved_return);
        self.out.emit("static ");
        self.out.emit(&ret);
        self.out.emit(" ");
        self.out.emit(&func.name);
        self.out.emit("(");

        if func.params.is_empty() {
            self.out.emit("void");
        }

        let mut in_name: Option<String> = None;
        for (index, param) in func.params.iter().enumerate() {
            if index > 0 {
                self.out.emit(", ");
            }

            let ty = param.resolved.clone();

            let mut name = param.var.name.clone();
            match param.role {
                ParamRole::In => in_name = Some(name.clone()),
                ParamRole::Out => {
                    if in_name.as_deref() == Some(name.as_str()) {
                        name = format!("{name}_out");
                    }
                }
                ParamRole::None => {}
            }

            if let Some(id) = param.var.id {
                self.names.insert(id, name.clone());
            }

            if param.role == ParamRole::None {
                let text = format!("{} {name}", c_type(&ty));
                self.out.emit(&text);
            } else {
                if let Some(id) = param.var.id {
                    self.ptr_vars.insert(id);
                }
                let text = format!("{} *{name}", c_type(&ty));
                self.out.emit(&text);
            }
        }
        self.out.emit(")");
    }

    fn print_function(&mut self, func: &FunctionDeclaration) {
        let saved_in = self.in_binding;
        let saved_agent = self.step_agent;
        self.in_step = func.kind == FunctionKind::Step;
        if self.in_step {
            self.in_binding = func.in_param().and_then(|param| param.var.id);
            self.step_agent = func
                .step_agent()
                .and_then(|name| self.script.agent(name));
        }

        self.print_signature(func);
        self.out.emit(" ");
        self.print_block(&func.body);
        self.out.newline();

        self.in_step = false;
        self.in_binding = saved_in;
        self.step_agent = saved_agent;
    }

    fn print_run_step(&mut self, func: &FunctionDeclaration) {
        let Some(agent) = func.step_agent() else {
            return;
        };
        let agent = agent.to_owned();
        let name = &func.name;

        let text = format!("static void run_step_{name}(void) {{");
        self.line(&text);
        self.out.indent();

        let text = format!("if (agents_{agent}_dbuf.cap < agents_{agent}.len) {{");
        self.line(&text);
        self.out.indent();
        let text = format!("dyn_array_release(&agents_{agent}_dbuf);");
        self.line(&text);
        let text = format!(
            "agents_{agent}_dbuf = dyn_array_create_fixed(sizeof({agent}), agents_{agent}.len);"
        );
        self.line(&text);
        self.out.outdent();
        self.line("}");
        let text = format!("agents_{agent}_dbuf.len = agents_{agent}.len;");
        self.line(&text);

        let text = format!("for (size_t i = 0; i < agents_{agent}.len; i++) {{");
        self.line(&text);
        self.out.indent();
        let text = format!("{agent} *in = DYN_ARRAY_GET(&agents_{agent}, {agent}, i);");
        self.line(&text);
        let text = format!("{agent} *out = DYN_ARRAY_GET(&agents_{agent}_dbuf, {agent}, i);");
        self.line(&text);
        self.line("*out = *in;");
        let text = format!("{name}(in, out);");
        self.line(&text);
        self.out.outdent();
        self.line("}");

        let text = format!("dyn_array swap = agents_{agent};");
        self.line(&text);
        let text = format!("agents_{agent} = agents_{agent}_dbuf;");
        self.line(&text);
        let text = format!("agents_{agent}_dbuf = swap;");
        self.line(&text);

        let text = format!("for (size_t i = 0; i < agents_{agent}_new.len; i++) {{");
        self.line(&text);
        self.out.indent();
        let text = format!(
            "push_{agent}(&agents_{agent}, *DYN_ARRAY_GET(&agents_{agent}_new, {agent}, i));"
        );
        self.line(&text);
        self.out.outdent();
        self.line("}");
        let text = format!("agents_{agent}_new.len = 0;");
        self.line(&text);

        self.out.outdent();
        self.line("}");
    }

    fn print_main(&mut self) {
        self.line("int main(void) {");
        self.out.indent();

        if let Some(func) = self.script.main_function() {
            self.in_main = true;
            for stmt in &func.body.stmts {
                if self.runner && skipped_in_runner(stmt) {
                    continue;
                }
                self.print_statement(stmt);
                self.out.newline();
            }
            self.in_main = false;
        } else if !self.runner && self.script.sim.is_some() {
            self.print_simulate_plan();
            self.out.newline();
        }

        if self.runner {
            self.line("write_initial_state();");
        }
        self.line("return 0;");
        self.out.outdent();
        self.line("}");
    }

    fn print_simulate_plan(&mut self) {
        let Some(sim) = &self.script.sim else {
            return;
        };
        let steps = sim.steps;
        let step_fns = sim.step_fns.clone();

        let text = format!("for (int _t = 0; _t < {steps}; _t++) {{");
        self.line(&text);
        self.out.indent();
        for name in &step_fns {
            let text = format!("run_step_{name}();");
            self.line(&text);
        }
        self.out.outdent();
        self.out.emit("}");
    }

    /// Body of a `for`, flattened into the enclosing generated braces.
    fn print_loop_body(&mut self, body: &Statement) {
        match body {
            Statement::Block(block) => {
                for stmt in &block.stmts {
                    self.print_statement(stmt);
                    self.out.newline();
                }
            }
            other => {
                self.print_statement(other);
                self.out.newline();
            }
        }
    }

    fn print_near_for(&mut self, stmt: &ForStatement, call: &CallExpression) {
        let agent_ty = stmt.iterable.ty.element().cloned().unwrap_or_default();
        let Some(agent) = agent_ty.agent_name().and_then(|name| self.script.agent(name)) else {
            return;
        };
        let agent_name = agent.name.clone();
        let position = agent
            .position_member()
            .map(|member| (member.name.clone(), member.resolved.clone()))
            .unwrap_or(("pos".to_owned(), Type::Vec2));

        let receiver = call
            .args
            .first()
            .and_then(|arg| arg.as_var())
            .map(|var| self.var_name(var))
            .unwrap_or_default();

        let counter = self.fresh("_i");
        let var_name = stmt.var.name.clone();
        if let Some(id) = stmt.var.id {
            self.names.insert(id, var_name.clone());
            self.ptr_vars.insert(id);
        }

        let text = format!(
            "for (size_t {counter} = 0; {counter} < agents_{agent_name}.len; {counter}++) {{"
        );
        self.line(&text);
        self.out.indent();
        let text = format!(
            "{agent_name} *{var_name} = DYN_ARRAY_GET(&agents_{agent_name}, {agent_name}, {counter});"
        );
        self.line(&text);
        let text = format!("if ({var_name} == {receiver}) continue;");
        self.line(&text);

        let dist = if position.1 == Type::Vec3 {
            "dist_float3"
        } else {
            "dist_float2"
        };
        self.out.emit(&format!(
            "if (!({dist}({var_name}->{pos}, {receiver}->{pos}) < ",
            pos = position.0
        ));
        if let Some(radius) = call.args.get(1) {
            self.print_expression(radius);
        }
        self.line(")) continue;");

        self.print_loop_body(&stmt.body);
        self.out.outdent();
        self.out.emit("}");
    }

    fn print_range_for(&mut self, stmt: &ForStatement, start: &Expression, end: &Expression) {
        let var_name = stmt.var.name.clone();
        if let Some(id) = stmt.var.id {
            self.names.insert(id, var_name.clone());
        }

        self.out.emit(&format!("for (int {var_name} = "));
        self.print_expression(start);
        self.out.emit(&format!("; {var_name} < "));
        self.print_expression(end);
        self.out.emit(&format!("; {var_name}++) "));
        self.print_statement(&stmt.body);
    }

    fn print_array_for(&mut self, stmt: &ForStatement) {
        let elem = stmt.iterable.ty.element().cloned().unwrap_or_default();
        let elem_ty = c_type(&elem);
        let counter = self.fresh("_i");
        let var_name = stmt.var.name.clone();
        if let Some(id) = stmt.var.id {
            self.names.insert(id, var_name.clone());
        }

        self.out.emit(&format!("for (size_t {counter} = 0; {counter} < ("));
        self.print_expression(&stmt.iterable);
        self.line(&format!(").len; {counter}++) {{"));
        self.out.indent();
        self.out
            .emit(&format!("{elem_ty} {var_name} = *DYN_ARRAY_GET(&("));
        self.print_expression(&stmt.iterable);
        self.line(&format!("), {elem_ty}, {counter});"));
        self.print_loop_body(&stmt.body);
        self.out.outdent();
        self.out.emit("}");
    }
}

/// Statements the FLAME runner leaves to the platform: the simulation loop
/// itself and result saving.
fn skipped_in_runner(stmt: &Statement) -> bool {
    match stmt {
        Statement::Simulate(_) => true,
        Statement::Expression(expr) => {
            matches!(&expr.kind, ExpressionKind::Call(call) if call.name == "save")
        }
        _ => false,
    }
}

impl TargetPrinter for CPrinter<'_> {
    fn out(&mut self) -> &mut Printer {
        &mut self.out
    }

    fn print_type(&mut self, ty: &Type) {
        let text = c_type(ty);
        self.out.emit(&text);
    }

    fn print_var(&mut self, var: &Var) {
        let name = self.var_name(var);
        self.out.emit(&name);
    }

    fn print_member(&mut self, base: &Expression, member: &str) {
        let is_ptr = base
            .as_var()
            .and_then(|var| var.id)
            .map(|id| self.ptr_vars.contains(&id))
            .unwrap_or(false);
        if is_ptr {
            self.print_expression(base);
            self.out.emit("->");
            self.out.emit(member);
        } else {
            self.print_expression(base);
            self.out.emit(".");
            self.out.emit(member);
        }
    }

    fn print_index(&mut self, array: &Expression, index: &Expression) {
        let elem = array.ty.element().cloned().unwrap_or_default();
        self.out.emit("(*DYN_ARRAY_GET(&(");
        self.print_expression(array);
        self.out.emit(&format!("), {}, ", c_type(&elem)));
        self.print_expression(index);
        self.out.emit("))");
    }

    fn print_vector_init(&mut self, expr: &Expression) {
        let ExpressionKind::ArrayInit { exprs } = &expr.kind else {
            return;
        };
        let ctor = if exprs.len() == 3 {
            "float3_create"
        } else {
            "float2_create"
        };
        self.out.emit(ctor);
        self.out.emit("(");
        for (index, component) in exprs.iter().enumerate() {
            if index > 0 {
                self.out.emit(", ");
            }
            self.print_expression(component);
        }
        self.out.emit(")");
    }

    fn print_expression(&mut self, expr: &Expression) {
        // Vector negation has no operator in C; everything else follows the
        // generic forms.
        if let ExpressionKind::Unary {
            op: UnaryOp::Minus,
            expr: inner,
        } = &expr.kind
        {
            if inner.ty.is_vec() {
                let prefix = vec_prefix(&inner.ty);
                self.out.emit(&format!("{prefix}_mul_scalar("));
                self.print_expression(inner);
                self.out.emit(", -1.0)");
                return;
            }
        }
        print_expression_default(self, expr);
    }

    fn is_special_binary(&self, op: BinaryOp, left: &Expression, right: &Expression) -> bool {
        is_vec_binary(op, left, right)
    }

    fn print_special_binary(&mut self, op: BinaryOp, left: &Expression, right: &Expression) {
        print_vec_binary(self, op, left, right);
    }

    fn print_call(&mut self, call: &CallExpression) {
        match call.name.as_str() {
            "add" => {
                let agent = call
                    .args
                    .first()
                    .and_then(|arg| arg.ty.agent_name())
                    .unwrap_or_default()
                    .to_owned();
                let target = if self.in_step {
                    format!("agents_{agent}_new")
                } else {
                    format!("agents_{agent}")
                };
                self.out.emit(&format!("push_{agent}(&{target}, "));
                if let Some(arg) = call.args.first() {
                    self.print_expression(arg);
                }
                self.out.emit(")");
                return;
            }
            "save" => {
                let agents: Vec<_> = self
                    .script
                    .agents()
                    .map(|agent| agent.name.clone())
                    .collect();
                self.out.emit("(");
                for (index, agent) in agents.iter().enumerate() {
                    if index > 0 {
                        self.out.emit(", ");
                    }
                    self.out.emit(&format!("save(&agents_{agent}, "));
                    self.print_args(call);
                    self.out.emit(&format!(", {agent}_info)"));
                }
                self.out.emit(")");
                return;
            }
            _ => {}
        }

        let name = match &call.target {
            CallTarget::Builtin { target } => target.clone(),
            _ => call.name.clone(),
        };
        self.out.emit(&name);
        self.out.emit("(");
        self.print_args(call);
        self.out.emit(")");
    }

    fn print_agent_creation(&mut self, expr: &Expression) {
        let ExpressionKind::AgentCreation { name, members } = &expr.kind else {
            return;
        };
        let Some(agent) = self.script.agent(name) else {
            return;
        };

        self.out.emit(&format!("({name}) {{ "));
        let ordered: Vec<_> = agent.members.iter().map(|m| m.name.clone()).collect();
        let mut first = true;
        for member_name in &ordered {
            let Some(init) = members.iter().find(|member| &member.name == member_name) else {
                continue;
            };
            if !first {
                self.out.emit(", ");
            }
            first = false;
            self.out.emit(&format!(".{member_name} = "));
            self.print_expression(&init.expr);
        }
        self.out.emit(" }");
    }

    fn print_new_array(&mut self, expr: &Expression) {
        let ExpressionKind::NewArray { len, .. } = &expr.kind else {
            return;
        };
        let elem = expr.ty.element().cloned().unwrap_or_default();
        self.out
            .emit(&format!("DYN_ARRAY_CREATE_FIXED({}, ", c_type(&elem)));
        self.print_expression(len);
        self.out.emit(")");
    }

    fn print_for(&mut self, stmt: &ForStatement) {
        match &stmt.iterable.kind {
            ExpressionKind::Binary {
                op: BinaryOp::Range,
                left,
                right,
            } => self.print_range_for(stmt, left, right),
            ExpressionKind::Call(call) if call.name == "near" => self.print_near_for(stmt, call),
            _ => self.print_array_for(stmt),
        }
    }

    fn print_parfor(&mut self, stmt: &ParforStatement) {
        let agent = match &stmt.iterable.ty {
            Type::Array(elem) => c_type(elem),
            _ => return,
        };

        let in_name = stmt.in_var.name.clone();
        let mut out_name = stmt.out_var.name.clone();
        if out_name == in_name {
            out_name = format!("{out_name}_out");
        }
        for (var, name) in [(&stmt.in_var, &in_name), (&stmt.out_var, &out_name)] {
            if let Some(id) = var.id {
                self.names.insert(id, name.clone());
                self.ptr_vars.insert(id);
            }
        }

        let buf = self.fresh("_dbuf");
        let counter = self.fresh("_i");

        self.line("{");
        self.out.indent();
        self.out
            .emit(&format!("dyn_array {buf} = dyn_array_create_fixed(sizeof({agent}), ("));
        self.print_expression(&stmt.iterable);
        self.line(").len);");

        self.out.emit(&format!(
            "for (size_t {counter} = 0; {counter} < ("
        ));
        self.print_expression(&stmt.iterable);
        self.line(&format!(").len; {counter}++) {{"));
        self.out.indent();

        self.out.emit(&format!("{agent} *{in_name} = DYN_ARRAY_GET(&("));
        self.print_expression(&stmt.iterable);
        self.line(&format!("), {agent}, {counter});"));
        let text = format!("{agent} *{out_name} = DYN_ARRAY_GET(&{buf}, {agent}, {counter});");
        self.line(&text);
        let text = format!("*{out_name} = *{in_name};");
        self.line(&text);

        let saved_in = self.in_binding;
        self.in_binding = stmt.in_var.id;
        self.print_loop_body(&stmt.body);
        self.in_binding = saved_in;

        self.out.outdent();
        self.line("}");

        let swap = self.fresh("_swap");
        self.out.emit(&format!("dyn_array {swap} = "));
        self.print_expression(&stmt.iterable);
        self.line(";");
        self.print_expression(&stmt.iterable);
        self.line(&format!(" = {buf};"));
        self.line(&format!("dyn_array_release(&{swap});"));

        self.out.outdent();
        self.out.emit("}");
    }

    fn print_simulate(&mut self, _stmt: &SimulateStatement) {
        self.print_simulate_plan();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{
        analyze, register_builtin_functions, BuiltinFunctions, ErrorStream, Params,
    };
    use crate::backend::Config;
    use crate::lexer::Lexer;
    use crate::parser;

    fn generate(source: &str) -> ProjectFiles {
        let tokens = Lexer::new(source).lex().expect("should lex");
        let mut script = parser::parse(tokens).expect("should parse");

        let mut builtins = BuiltinFunctions::default();
        register_builtin_functions(&mut builtins);
        let mut errors = ErrorStream::default();
        analyze(&mut script, &builtins, &Params::default(), &mut errors);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);

        let ctx = BackendContext::new(Config::default());
        CBackend.generate(&script, &ctx).expect("should generate")
    }

    #[test]
    fn test_minimal_script_emits_zero_iterations() {
        let files = generate(
            "environment { min: [0, 0], max: [10, 10], granularity: 1 }\n\
             agent A { position vec2 p; }\n\
             step f(A a in, A a out) {}\n\
             simulate 0 { f }",
        );
        let main_c = files.file("main.c").expect("main.c");
        assert!(main_c.contains("for (int _t = 0; _t < 0; _t++) {"));
        assert!(main_c.contains("run_step_f();"));
        assert!(main_c.contains("typedef struct {"));
        assert!(main_c.contains("float2 p;"));
        assert!(main_c.contains("{ TYPE_FLOAT2, offsetof(A, p), \"p\" },"));
    }

    #[test]
    fn test_const_folding_reaches_the_loop() {
        let files = generate(
            "environment { max: [10, 10], granularity: 1 }\n\
             agent A { position vec2 p; }\n\
             const N = 2 * 3 + 4;\n\
             step f(A a in, A a out) {}\n\
             simulate N { f }",
        );
        let main_c = files.file("main.c").expect("main.c");
        assert!(main_c.contains("for (int _t = 0; _t < 10; _t++) {"));
        assert!(main_c.contains("static const int N = 10;"));
    }

    #[test]
    fn test_near_is_a_brute_force_scan() {
        let files = generate(
            "environment { max: [10, 10], granularity: 1 }\n\
             agent A { position vec2 p; float heat; }\n\
             step f(A a in, A b out) {\n\
               float sum = 0.0;\n\
               for (A n : near(a, 2.0)) {\n\
                 sum += n.heat;\n\
               }\n\
               b.heat = sum;\n\
             }\n\
             simulate 1 { f }",
        );
        let main_c = files.file("main.c").expect("main.c");
        assert!(main_c.contains("if (n == a) continue;"));
        assert!(main_c.contains("if (!(dist_float2(n->p, a->p) < 2.0)) continue;"));
        assert!(main_c.contains("sum += n->heat;"));
        assert!(main_c.contains("b->heat = sum;"));
    }

    #[test]
    fn test_out_binding_renamed_on_collision() {
        let files = generate(
            "environment { max: [10, 10], granularity: 1 }\n\
             agent A { position vec2 p; }\n\
             step f(A a in, A a out) {}\n\
             simulate 1 { f }",
        );
        let main_c = files.file("main.c").expect("main.c");
        assert!(main_c.contains("static void f(A *a, A *a_out)"));
    }

    #[test]
    fn test_vector_arithmetic_uses_runtime_calls() {
        let files = generate(
            "environment { max: [10, 10], granularity: 1 }\n\
             agent A { position vec2 p; vec2 v; }\n\
             step f(A a in, A b out) {\n\
               b.p = a.p + a.v * 0.5;\n\
             }\n\
             simulate 1 { f }",
        );
        let main_c = files.file("main.c").expect("main.c");
        assert!(main_c.contains("float2_add(a->p, float2_mul_scalar(a->v, 0.5))"));
    }

    #[test]
    fn test_mangled_builtin_names() {
        let files = generate(
            "environment { max: [10, 10], granularity: 1 }\n\
             agent A { position vec2 p; }\n\
             step f(A a in, A b out) {\n\
               float d = dot(a.p, a.p);\n\
               b.p = normalize(a.p) * d;\n\
             }\n\
             simulate 1 { f }",
        );
        let main_c = files.file("main.c").expect("main.c");
        assert!(main_c.contains("dot_float2(a->p, a->p)"));
        assert!(main_c.contains("normalize_float2(a->p)"));
    }

    #[test]
    fn test_main_seeds_population() {
        let files = generate(
            "environment { max: [10, 10], granularity: 1 }\n\
             agent A { position vec2 p; }\n\
             const COUNT = 10;\n\
             step f(A a in, A b out) {}\n\
             function main() {\n\
               for (int i : 0..COUNT) {\n\
                 add(A { p: random([0.0, 0.0], [10.0, 10.0]) });\n\
               }\n\
               simulate 5 { f }\n\
               save(\"out.bin\");\n\
             }",
        );
        let main_c = files.file("main.c").expect("main.c");
        assert!(main_c.contains("for (int i = 0; i < COUNT; i++)"));
        assert!(main_c.contains("push_A(&agents_A, (A) { .p = random_float2(float2_create(0.0, 0.0), float2_create(10.0, 10.0)) })"));
        assert!(main_c.contains("for (int _t = 0; _t < 5; _t++) {"));
        assert!(main_c.contains("save(&agents_A, \"out.bin\", A_info)"));
    }

    #[test]
    fn test_project_layout() {
        let files = generate(
            "environment { max: [10, 10], granularity: 1 }\n\
             agent A { position vec2 p; }\n\
             step f(A a in, A a out) {}\n\
             simulate 0 { f }",
        );
        let file_names: Vec<_> = files.files().map(|(path, _)| path).collect();
        assert_eq!(file_names, vec!["build.sh", "main.c", "run.sh"]);
        let copies: Vec<_> = files.copies().collect();
        assert_eq!(
            copies,
            vec![("libabl.c", "c/libabl.c"), ("libabl.h", "c/libabl.h")]
        );
        assert!(files.dirs().any(|dir| dir == "iterations"));
    }
}
