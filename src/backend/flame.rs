//! FLAME (CPU message-passing) backend.
//!
//! The script is reshaped into a [`FlameModel`] (agent functions with
//! explicit input/output messages, ordered in layers) and emitted as an
//! XMML model file plus the per-function C bodies. Agent memory is accessed
//! through the platform's `get_*`/`set_*` accessors and neighbor state
//! flows exclusively through message lists, which preserves the snapshot
//! semantics of the source `parfor`.
use std::collections::HashMap;

use crate::analysis::{Type, VarId};
use crate::parser::ast::{
    AgentDeclaration, BinaryOp, CallExpression, CallTarget, Expression, ExpressionKind,
    ForStatement, FunctionDeclaration, ParforStatement, Script, SimulateStatement, Statement,
    Var,
};

use super::c::{is_vec_binary, print_vec_binary, CPrinter};
use super::flame_model::{unpack_members, FlameFunc, FlameFuncKind, FlameModel};
use super::{
    print_expression_default, print_statement_default, Backend, BackendContext, BackendError,
    Printer, ProjectFiles, TargetPrinter, XmlElem, XmlWriter,
};

pub struct FlameBackend;

impl Backend for FlameBackend {
    fn generate(
        &self,
        script: &Script,
        ctx: &BackendContext,
    ) -> Result<ProjectFiles, BackendError> {
        let use_float = ctx.config.get_bool("use_float", false);
        let model = FlameModel::from_script(script);

        let mut files = ProjectFiles::default();
        files.create_dir("model");
        files.create_dir("iterations");
        files.write("model/XMLModelFile.xml", create_xml_model(script, &model, use_float));

        let mut printer = FlameFuncPrinter::new(script, &model, FlameDialect::Cpu, use_float);
        printer.print_functions_file();
        files.write("model/functions.c", printer.extract());

        let mut runner = CPrinter::new_runner(script);
        runner.print_script();
        files.write("runner.c", runner.extract());
        files.write("build_runner.sh", build_runner_script(use_float));

        files.copy("flame/Makefile", "Makefile");
        files.copy("flame/build.sh", "build.sh");
        files.copy("flame/run.sh", "run.sh");
        files.copy("c/libabl.h", "libabl.h");
        files.copy("c/libabl.c", "libabl.c");
        files.make_executable("build.sh");
        files.make_executable("build_runner.sh");
        files.make_executable("run.sh");
        Ok(files)
    }
}

pub(super) fn build_runner_script(use_float: bool) -> String {
    if use_float {
        "#!/bin/sh\ngcc -O2 -std=c99 -DLIBABL_USE_FLOAT=1 runner.c libabl.c -lm -o runner\n"
            .to_owned()
    } else {
        "#!/bin/sh\ngcc -O2 -std=c99 runner.c libabl.c -lm -o runner\n".to_owned()
    }
}

fn create_xml_model(script: &Script, model: &FlameModel, use_float: bool) -> String {
    let mut agents = XmlElem::new("agents", vec![]);
    for agent in script.agents() {
        let mut memory = XmlElem::new("memory", vec![]);
        for (name, ty) in agent_memory(agent, use_float) {
            memory.push(XmlElem::new(
                "variable",
                vec![XmlElem::text("type", ty), XmlElem::text("name", name)],
            ));
        }

        let mut functions = XmlElem::new("functions", vec![]);
        for func in &model.funcs {
            if func.agent != agent.name {
                continue;
            }
            let mut elems = vec![
                XmlElem::text("name", func.name.clone()),
                XmlElem::text("currentState", "default"),
                XmlElem::text("nextState", "default"),
            ];
            if let Some(msg) = &func.in_msg {
                elems.push(XmlElem::new(
                    "inputs",
                    vec![XmlElem::new(
                        "input",
                        vec![XmlElem::text("messageName", msg.clone())],
                    )],
                ));
            }
            if let Some(msg) = &func.out_msg {
                elems.push(XmlElem::new(
                    "outputs",
                    vec![XmlElem::new(
                        "output",
                        vec![XmlElem::text("messageName", msg.clone())],
                    )],
                ));
            }
            functions.push(XmlElem::new("function", elems));
        }

        agents.push(XmlElem::new(
            "xagent",
            vec![
                XmlElem::text("name", agent.name.clone()),
                memory,
                functions,
            ],
        ));
    }

    let mut messages = XmlElem::new("messages", vec![]);
    for msg in &model.messages {
        let mut variables = XmlElem::new("variables", vec![]);
        for (name, ty) in unpack_members(&msg.members, use_float) {
            variables.push(XmlElem::new(
                "variable",
                vec![XmlElem::text("type", ty), XmlElem::text("name", name)],
            ));
        }
        messages.push(XmlElem::new(
            "message",
            vec![XmlElem::text("name", msg.name.clone()), variables],
        ));
    }

    let mut root = XmlElem::new(
        "xmodel",
        vec![
            XmlElem::text("name", "model"),
            XmlElem::text("version", "01"),
            XmlElem::new(
                "environment",
                vec![XmlElem::new(
                    "functionFiles",
                    vec![XmlElem::text("file", "functions.c")],
                )],
            ),
            agents,
            messages,
        ],
    );
    root.set_attr("version", "2");
    root.set_attr("xmlns", "http://flame.ac.uk/schema/xmml.xsd");
    XmlWriter::new().serialize(&root)
}

fn agent_memory(agent: &AgentDeclaration, use_float: bool) -> Vec<(String, String)> {
    super::flame_model::unpack_agent_members(agent, use_float)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum FlameDialect {
    Cpu,
    Gpu,
}

/// Prints the per-function C bodies for both FLAME targets. The dialects
/// differ only in how agent memory, messages, and agent creation are
/// spelled.
pub(super) struct FlameFuncPrinter<'a> {
    out: Printer,
    script: &'a Script,
    model: &'a FlameModel,
    dialect: FlameDialect,
    use_float: bool,
    in_binding: Option<VarId>,
    out_binding: Option<VarId>,
    near_var: Option<VarId>,
    current_agent: Option<&'a AgentDeclaration>,
    current_func: Option<&'a FlameFunc>,
    names: HashMap<VarId, String>,
    tmp: usize,
}

impl<'a> FlameFuncPrinter<'a> {
    pub(super) fn new(
        script: &'a Script,
        model: &'a FlameModel,
        dialect: FlameDialect,
        use_float: bool,
    ) -> Self {
        Self {
            out: Printer::new(),
            script,
            model,
            dialect,
            use_float,
            in_binding: None,
            out_binding: None,
            near_var: None,
            current_agent: None,
            current_func: None,
            names: HashMap::default(),
            tmp: 0,
        }
    }

    pub(super) fn extract(self) -> String {
        self.out.extract()
    }

    fn line(&mut self, text: &str) {
        self.out.emit(text);
        self.out.newline();
    }

    fn fresh(&mut self, stem: &str) -> String {
        let name = format!("{stem}{}", self.tmp);
        self.tmp += 1;
        name
    }

    fn float_ty(&self) -> &'static str {
        if self.use_float {
            "float"
        } else {
            "double"
        }
    }

    pub(super) fn print_functions_file(&mut self) {
        match self.dialect {
            FlameDialect::Cpu => {
                self.line("#include \"header.h\"");
                self.line("#include \"libabl.h\"");
            }
            FlameDialect::Gpu => {
                self.line("#ifndef _FLAMEGPU_FUNCTIONS");
                self.line("#define _FLAMEGPU_FUNCTIONS");
                self.out.newline();
                self.line("#include <header.h>");
                self.line("#include \"libabl_flamegpu.h\"");
            }
        }
        self.out.newline();

        let funcs: Vec<_> = self.model.funcs.iter().collect();
        for func in funcs {
            self.print_flame_func(func);
            self.out.newline();
        }

        if self.dialect == FlameDialect::Gpu {
            self.line("#endif");
        }
    }

    fn print_flame_func(&mut self, func: &'a FlameFunc) {
        let source = self.script.function(&func.source_fn);
        let agent = self.script.agent(&func.agent);
        self.current_func = Some(func);
        self.current_agent = agent;

        self.print_signature(func);
        self.line(" {");
        self.out.indent();

        match func.kind {
            FlameFuncKind::Publish => self.print_publish_body(func),
            FlameFuncKind::Update => {
                if let Some(source) = source {
                    self.print_update_body(source);
                }
            }
        }

        self.line("return 0;");
        self.out.outdent();
        self.line("}");

        self.in_binding = None;
        self.out_binding = None;
        self.current_agent = None;
        self.current_func = None;
    }

    fn print_signature(&mut self, func: &FlameFunc) {
        match self.dialect {
            FlameDialect::Cpu => {
                let text = format!("int {}()", func.name);
                self.out.emit(&text);
            }
            FlameDialect::Gpu => {
                let mut params = vec![format!("xmachine_memory_{}* agent", func.agent)];
                if let Some(msg) = func.in_msg.as_deref().or(func.out_msg.as_deref()) {
                    params.push(format!("xmachine_message_{msg}_list* {msg}_messages"));
                }
                if func.in_msg.is_some() {
                    params.push(format!(
                        "xmachine_message_{}_PBM* partition_matrix",
                        func.in_msg.as_deref().unwrap_or_default()
                    ));
                }
                if let Some(added) = &func.added_agent {
                    params.push(format!("xmachine_memory_{added}_list* {added}_agents"));
                }
                if func.uses_rng {
                    params.push("RNG_rand48* rand48".to_owned());
                }
                let text = format!(
                    "__FLAME_GPU_FUNC__ int {}({})",
                    func.name,
                    params.join(", ")
                );
                self.out.emit(&text);
            }
        }
    }

    /// The publish half posts the pre-step values of the message payload.
    fn print_publish_body(&mut self, func: &FlameFunc) {
        let Some(msg_name) = func.out_msg.clone() else {
            return;
        };
        let Some(msg) = self.model.message(&msg_name) else {
            return;
        };

        let mut args = vec![];
        for (name, _) in unpack_members(&msg.members, self.use_float) {
            args.push(self.memory_read_scalar(&name));
        }

        match self.dialect {
            FlameDialect::Cpu => {
                let text = format!("add_{msg_name}({});", args.join(", "));
                self.line(&text);
            }
            FlameDialect::Gpu => {
                let text = format!(
                    "add_{msg_name}_message({msg_name}_messages, {});",
                    args.join(", ")
                );
                self.line(&text);
            }
        }
    }

    fn print_update_body(&mut self, source: &'a FunctionDeclaration) {
        self.in_binding = source.in_param().and_then(|param| param.var.id);
        self.out_binding = source.out_param().and_then(|param| param.var.id);

        for stmt in &source.body.stmts {
            self.print_statement(stmt);
            self.out.newline();
        }
    }

    /// Read of a scalar memory slot (already unpacked names).
    fn memory_read_scalar(&self, name: &str) -> String {
        match self.dialect {
            FlameDialect::Cpu => format!("get_{name}()"),
            FlameDialect::Gpu => format!("agent->{name}"),
        }
    }

    fn memory_write_scalar(&self, name: &str, value: &str) -> String {
        match self.dialect {
            FlameDialect::Cpu => format!("set_{name}({value});"),
            FlameDialect::Gpu => format!("agent->{name} = {value};"),
        }
    }

    fn member_type(&self, member: &str) -> Type {
        self.current_agent
            .and_then(|agent| agent.member(member))
            .map(|member| member.resolved.clone())
            .unwrap_or_default()
    }

    /// Expression text of an agent memory read, packing vectors back
    /// together.
    fn memory_read(&self, member: &str) -> String {
        match self.member_type(member) {
            Type::Vec2 => format!(
                "float2_create({}, {})",
                self.memory_read_scalar(&format!("{member}_x")),
                self.memory_read_scalar(&format!("{member}_y"))
            ),
            Type::Vec3 => format!(
                "float3_create({}, {}, {})",
                self.memory_read_scalar(&format!("{member}_x")),
                self.memory_read_scalar(&format!("{member}_y")),
                self.memory_read_scalar(&format!("{member}_z"))
            ),
            _ => self.memory_read_scalar(member),
        }
    }

    fn is_binding(&self, var: &Var) -> bool {
        var.id.is_some() && (var.id == self.in_binding || var.id == self.out_binding)
    }

    fn is_near_var(&self, var: &Var) -> bool {
        var.id.is_some() && var.id == self.near_var
    }

    fn msg_read(&self, member: &str) -> String {
        match self.member_type(member) {
            Type::Vec2 => format!("float2_create(_msg->{member}_x, _msg->{member}_y)"),
            Type::Vec3 => format!(
                "float3_create(_msg->{member}_x, _msg->{member}_y, _msg->{member}_z)"
            ),
            _ => format!("_msg->{member}"),
        }
    }

    fn print_near_for(&mut self, stmt: &ForStatement, call: &CallExpression) {
        let Some(func) = self.current_func else {
            return;
        };
        let Some(msg_name) = func.in_msg.clone() else {
            return;
        };

        let position = self
            .current_agent
            .and_then(|agent| agent.position_member())
            .map(|member| (member.name.clone(), member.resolved.clone()))
            .unwrap_or(("pos".to_owned(), Type::Vec2));
        let dist = if position.1 == Type::Vec3 {
            "dist_float3"
        } else {
            "dist_float2"
        };
        let own_pos = self.memory_read(&position.0);

        match self.dialect {
            FlameDialect::Cpu => {
                let text = format!("{msg_name} *_msg = get_first_{msg_name}();");
                self.line(&text);
            }
            FlameDialect::Gpu => {
                let z = if position.1 == Type::Vec3 {
                    self.memory_read_scalar(&format!("{}_z", position.0))
                } else {
                    "0".to_owned()
                };
                let text = format!(
                    "xmachine_message_{msg_name}* _msg = get_first_{msg_name}_message({msg_name}_messages, partition_matrix, {}, {}, {z});",
                    self.memory_read_scalar(&format!("{}_x", position.0)),
                    self.memory_read_scalar(&format!("{}_y", position.0)),
                );
                self.line(&text);
            }
        }

        self.line("while (_msg) {");
        self.out.indent();

        // Own messages come back through the list as well; skip them by
        // position before the radius filter.
        let msg_pos = self.msg_read(&position.0);
        self.out
            .emit(&format!("if (!({dist}({msg_pos}, {own_pos}) < "));
        if let Some(radius) = call.args.get(1) {
            self.print_expression(radius);
        }
        self.line(")) {");
        self.out.indent();
        self.print_msg_advance(&msg_name);
        self.line("continue;");
        self.out.outdent();
        self.line("}");

        if let Some(id) = stmt.var.id {
            self.near_var = Some(id);
        }
        match &*stmt.body {
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
        self.near_var = None;

        self.print_msg_advance(&msg_name);
        self.out.outdent();
        self.out.emit("}");
    }

    fn print_msg_advance(&mut self, msg_name: &str) {
        match self.dialect {
            FlameDialect::Cpu => {
                let text = format!("_msg = get_next_{msg_name}(_msg);");
                self.line(&text);
            }
            FlameDialect::Gpu => {
                let text = format!(
                    "_msg = get_next_{msg_name}_message(_msg, {msg_name}_messages, partition_matrix);"
                );
                self.line(&text);
            }
        }
    }

    /// `add(Agent { ... })` in statement position: bind each member to a
    /// temporary, then call the platform's agent output function.
    fn print_add_statement(&mut self, call: &CallExpression) {
        let Some(arg) = call.args.first() else {
            return;
        };
        let ExpressionKind::AgentCreation { name, members } = &arg.kind else {
            return;
        };
        let Some(agent) = self.script.agent(name) else {
            return;
        };
        let agent_members: Vec<_> = agent
            .members
            .iter()
            .map(|member| (member.name.clone(), member.resolved.clone()))
            .collect();

        self.line("{");
        self.out.indent();

        let mut args = vec![];
        for (member_name, ty) in &agent_members {
            let Some(init) = members.iter().find(|member| &member.name == member_name) else {
                continue;
            };
            let tmp = self.fresh("_m");
            let c_ty = match ty {
                Type::Vec2 => "float2".to_owned(),
                Type::Vec3 => "float3".to_owned(),
                Type::Float32 => self.float_ty().to_owned(),
                _ => "int".to_owned(),
            };
            self.out.emit(&format!("{c_ty} {tmp} = "));
            self.print_expression(&init.expr);
            self.line(";");

            match ty {
                Type::Vec2 => {
                    args.push(format!("{tmp}.x"));
                    args.push(format!("{tmp}.y"));
                }
                Type::Vec3 => {
                    args.push(format!("{tmp}.x"));
                    args.push(format!("{tmp}.y"));
                    args.push(format!("{tmp}.z"));
                }
                _ => args.push(tmp),
            }
        }

        let text = match self.dialect {
            FlameDialect::Cpu => format!("add_{name}_agent({});", args.join(", ")),
            FlameDialect::Gpu => {
                format!("add_{name}_agent({name}_agents, {});", args.join(", "))
            }
        };
        self.line(&text);

        self.out.outdent();
        self.out.emit("}");
    }
}

impl TargetPrinter for FlameFuncPrinter<'_> {
    fn out(&mut self) -> &mut Printer {
        &mut self.out
    }

    fn print_type(&mut self, ty: &Type) {
        let text = match ty {
            Type::Void => "void".to_owned(),
            Type::Bool | Type::Int32 => "int".to_owned(),
            Type::Float32 => self.float_ty().to_owned(),
            Type::Vec2 => "float2".to_owned(),
            Type::Vec3 => "float3".to_owned(),
            other => format!("{other}"),
        };
        self.out.emit(&text);
    }

    fn print_var(&mut self, var: &Var) {
        if self.is_binding(var) {
            // A bare binding only shows up through member access; reading
            // the position is the sensible fallback.
            let position = self
                .current_agent
                .and_then(|agent| agent.position_member())
                .map(|member| member.name.clone())
                .unwrap_or_else(|| "pos".to_owned());
            let text = self.memory_read(&position);
            self.out.emit(&text);
            return;
        }
        let name = var
            .id
            .and_then(|id| self.names.get(&id).cloned())
            .unwrap_or_else(|| var.name.clone());
        self.out.emit(&name);
    }

    fn print_member(&mut self, base: &Expression, member: &str) {
        if let Some(var) = base.as_var() {
            if self.is_binding(var) {
                let text = self.memory_read(member);
                self.out.emit(&text);
                return;
            }
            if self.is_near_var(var) {
                let text = self.msg_read(member);
                self.out.emit(&text);
                return;
            }
        }
        self.print_expression(base);
        self.out.emit(".");
        self.out.emit(member);
    }

    fn is_special_binary(&self, op: BinaryOp, left: &Expression, right: &Expression) -> bool {
        is_vec_binary(op, left, right)
    }

    fn print_special_binary(&mut self, op: BinaryOp, left: &Expression, right: &Expression) {
        print_vec_binary(self, op, left, right);
    }

    fn print_expression(&mut self, expr: &Expression) {
        if let ExpressionKind::Unary {
            op: crate::parser::ast::UnaryOp::Minus,
            expr: inner,
        } = &expr.kind
        {
            if inner.ty.is_vec() {
                let prefix = if inner.ty == Type::Vec3 {
                    "float3"
                } else {
                    "float2"
                };
                self.out.emit(&format!("{prefix}_mul_scalar("));
                self.print_expression(inner);
                self.out.emit(", -1.0)");
                return;
            }
        }
        print_expression_default(self, expr);
    }

    fn print_call(&mut self, call: &CallExpression) {
        if call.name == "random" && self.dialect == FlameDialect::Gpu {
            let name = match &call.target {
                CallTarget::Builtin { target } => target.clone(),
                _ => call.name.clone(),
            };
            self.out.emit(&format!("{name}(rand48, "));
            self.print_args(call);
            self.out.emit(")");
            return;
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
        // Only reachable through `add`, which handles creation itself.
        let _ = expr;
    }

    fn print_new_array(&mut self, expr: &Expression) {
        let _ = expr;
    }

    fn print_assign(&mut self, left: &Expression, right: &Expression) {
        // `out.pos.x = e` writes a single unpacked component.
        if let ExpressionKind::Member { expr: base, member: comp } = &left.kind {
            if let ExpressionKind::Member { expr: inner, member } = &base.kind {
                let component_write = inner
                    .as_var()
                    .map(|var| self.is_binding(var))
                    .unwrap_or(false)
                    && matches!(comp.as_str(), "x" | "y" | "z");
                if component_write {
                    match self.dialect {
                        FlameDialect::Cpu => {
                            self.out.emit(&format!("set_{member}_{comp}("));
                            self.print_expression(right);
                            self.out.emit(");");
                        }
                        FlameDialect::Gpu => {
                            self.out.emit(&format!("agent->{member}_{comp} = "));
                            self.print_expression(right);
                            self.out.emit(";");
                        }
                    }
                    return;
                }
            }
        }

        if let ExpressionKind::Member { expr: base, member } = &left.kind {
            if base.as_var().map(|var| self.is_binding(var)).unwrap_or(false) {
                match self.member_type(member) {
                    Type::Vec2 => {
                        let tmp = self.fresh("_v");
                        self.out.emit(&format!("{{ float2 {tmp} = "));
                        self.print_expression(right);
                        self.out.emit("; ");
                        let x = self.memory_write_scalar(&format!("{member}_x"), &format!("{tmp}.x"));
                        let y = self.memory_write_scalar(&format!("{member}_y"), &format!("{tmp}.y"));
                        self.out.emit(&format!("{x} {y} }}"));
                        return;
                    }
                    Type::Vec3 => {
                        let tmp = self.fresh("_v");
                        self.out.emit(&format!("{{ float3 {tmp} = "));
                        self.print_expression(right);
                        self.out.emit("; ");
                        let x = self.memory_write_scalar(&format!("{member}_x"), &format!("{tmp}.x"));
                        let y = self.memory_write_scalar(&format!("{member}_y"), &format!("{tmp}.y"));
                        let z = self.memory_write_scalar(&format!("{member}_z"), &format!("{tmp}.z"));
                        self.out.emit(&format!("{x} {y} {z} }}"));
                        return;
                    }
                    _ => {
                        match self.dialect {
                            FlameDialect::Cpu => {
                                self.out.emit(&format!("set_{member}("));
                                self.print_expression(right);
                                self.out.emit(");");
                            }
                            FlameDialect::Gpu => {
                                self.out.emit(&format!("agent->{member} = "));
                                self.print_expression(right);
                                self.out.emit(";");
                            }
                        }
                        return;
                    }
                }
            }
        }

        self.print_expression(left);
        self.out.emit(" = ");
        self.print_expression(right);
        self.out.emit(";");
    }

    fn print_assign_op(&mut self, op: BinaryOp, left: &Expression, right: &Expression) {
        if let ExpressionKind::Member { expr: base, member } = &left.kind {
            if base.as_var().map(|var| self.is_binding(var)).unwrap_or(false) {
                // Rewrite `out.m op= e` as `out.m = (read op e)`.
                let ty = self.member_type(member);
                if ty.is_vec() {
                    let prefix = if ty == Type::Vec3 { "float3" } else { "float2" };
                    let tmp = self.fresh("_v");
                    let read = self.memory_read(member);
                    let fn_name = match op {
                        BinaryOp::Add => format!("{prefix}_add({read}, "),
                        BinaryOp::Sub => format!("{prefix}_sub({read}, "),
                        BinaryOp::Mul => format!("{prefix}_mul_scalar({read}, "),
                        _ => format!("{prefix}_div_scalar({read}, "),
                    };
                    self.out.emit(&format!("{{ {prefix} {tmp} = {fn_name}"));
                    self.print_expression(right);
                    self.out.emit("); ");
                    let mut writes = vec![
                        self.memory_write_scalar(&format!("{member}_x"), &format!("{tmp}.x")),
                        self.memory_write_scalar(&format!("{member}_y"), &format!("{tmp}.y")),
                    ];
                    if ty == Type::Vec3 {
                        writes.push(
                            self.memory_write_scalar(&format!("{member}_z"), &format!("{tmp}.z")),
                        );
                    }
                    let text = writes.join(" ");
                    self.out.emit(&format!("{text} }}"));
                    return;
                }

                let read = self.memory_read(member);
                match self.dialect {
                    FlameDialect::Cpu => {
                        self.out
                            .emit(&format!("set_{member}(({read} {} ", op.sigil()));
                        self.print_expression(right);
                        self.out.emit("));");
                    }
                    FlameDialect::Gpu => {
                        self.out
                            .emit(&format!("agent->{member} = ({read} {} ", op.sigil()));
                        self.print_expression(right);
                        self.out.emit(");");
                    }
                }
                return;
            }
        }

        if self.is_special_binary(op, left, right) {
            self.print_expression(left);
            self.out.emit(" = ");
            self.print_special_binary(op, left, right);
            self.out.emit(";");
            return;
        }

        self.print_expression(left);
        self.out.emit(" ");
        self.out.emit(op.sigil());
        self.out.emit("= ");
        self.print_expression(right);
        self.out.emit(";");
    }

    fn print_statement(&mut self, stmt: &Statement) {
        if let Statement::Expression(expr) = stmt {
            if let ExpressionKind::Call(call) = &expr.kind {
                match call.name.as_str() {
                    "add" => {
                        self.print_add_statement(call);
                        return;
                    }
                    // Saving is the runner's concern.
                    "save" => return,
                    _ => {}
                }
            }
        }
        print_statement_default(self, stmt);
    }

    fn print_for(&mut self, stmt: &ForStatement) {
        match &stmt.iterable.kind {
            ExpressionKind::Binary {
                op: BinaryOp::Range,
                left,
                right,
            } => {
                let var_name = stmt.var.name.clone();
                if let Some(id) = stmt.var.id {
                    self.names.insert(id, var_name.clone());
                }
                self.out.emit(&format!("for (int {var_name} = "));
                self.print_expression(left);
                self.out.emit(&format!("; {var_name} < "));
                self.print_expression(right);
                self.out.emit(&format!("; {var_name}++) "));
                self.print_statement(&stmt.body);
            }
            ExpressionKind::Call(call) if call.name == "near" => {
                self.print_near_for(stmt, call);
            }
            _ => {
                // Arbitrary array iteration does not exist inside FLAME
                // agent functions.
            }
        }
    }

    fn print_parfor(&mut self, _stmt: &ParforStatement) {
        // Step bodies are already the body of the implicit parfor; an
        // explicit one has no counterpart inside a FLAME agent function.
    }

    fn print_simulate(&mut self, _stmt: &SimulateStatement) {
        // The FLAME runtime drives the iteration loop.
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
        FlameBackend.generate(&script, &ctx).expect("should generate")
    }

    const SOURCE: &str = "environment { max: [10, 10], granularity: 1 }\n\
        agent Bird { position vec2 pos; float heat; }\n\
        step warm(Bird b in, Bird b2 out) {\n\
          float sum = 0.0;\n\
          for (Bird other : near(b, 2.0)) {\n\
            sum += other.heat;\n\
          }\n\
          b2.heat = sum;\n\
        }\n\
        simulate 10 { warm }";

    #[test]
    fn test_model_file_shape() {
        let files = generate(SOURCE);
        let xml = files.file("model/XMLModelFile.xml").expect("model file");
        assert!(xml.contains("xmlns=\"http://flame.ac.uk/schema/xmml.xsd\""));
        assert!(xml.contains("<name>Bird</name>"));
        assert!(xml.contains("<name>pos_x</name>"));
        assert!(xml.contains("<name>warm_publish</name>"));
        assert!(xml.contains("<messageName>warm_message</messageName>"));
        assert!(xml.contains("<name>warm_message</name>"));
    }

    #[test]
    fn test_publish_posts_pre_step_values() {
        let files = generate(SOURCE);
        let functions = files.file("model/functions.c").expect("functions file");
        assert!(functions.contains("int warm_publish() {"));
        assert!(functions
            .contains("add_warm_message(get_pos_x(), get_pos_y(), get_heat());"));
    }

    #[test]
    fn test_update_reads_messages_and_writes_memory() {
        let files = generate(SOURCE);
        let functions = files.file("model/functions.c").expect("functions file");
        assert!(functions.contains("warm_message *_msg = get_first_warm_message();"));
        assert!(functions.contains("sum += _msg->heat;"));
        assert!(functions.contains("set_heat(sum);"));
        assert!(functions.contains("_msg = get_next_warm_message(_msg);"));
    }

    #[test]
    fn test_runner_seeds_initial_state() {
        let files = generate(
            "environment { max: [10, 10], granularity: 1 }\n\
             agent Bird { position vec2 pos; }\n\
             step idle(Bird b in, Bird b2 out) {}\n\
             function main() {\n\
               add(Bird { pos: [1.0, 2.0] });\n\
               simulate 3 { idle }\n\
             }",
        );
        let runner = files.file("runner.c").expect("runner file");
        assert!(runner.contains("write_initial_state();"));
        assert!(runner.contains("iterations/0.xml"));
        assert!(runner.contains("push_Bird(&agents_Bird,"));
        // The platform runs the steps; the runner must not.
        assert!(!runner.contains("run_step_idle"));
    }
}
