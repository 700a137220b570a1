//! Semantic analysis for ABL.
//!
//! A single pass over each function body resolves names to [`VarId`]s,
//! types every expression bottom-up, resolves calls against user functions
//! and the builtin overload table, folds configuration constants, and
//! validates the simulation structure (environment, position members,
//! `parfor` shape, `near`/`add` placement). Diagnostics accumulate in an
//! [`ErrorStream`]; analysis keeps going past recoverable errors.
mod builtins;
mod config;
mod error;
mod scope;
mod types;

pub use self::builtins::*;
pub use self::config::{eval as eval_const, parse_override};
pub use self::error::*;
pub use self::scope::*;
pub use self::types::*;

use std::collections::HashMap;

use log::debug;

use crate::lexer::Span;
use crate::parser::ast::{
    AgentDeclaration, BinaryOp, CallExpression, CallTarget, ConstDeclaration, Declaration,
    EnvironmentBounds, EnvironmentDeclaration, Expression, ExpressionKind, ForStatement,
    FunctionDeclaration, FunctionInfo, FunctionKind, ParamRole, ParforStatement, Script,
    SimulateStatement, SimulationPlan, Statement, TypeName, UnaryOp, VarDeclaration,
};

/// `-P name=value` overrides passed on the command line.
pub type Params = HashMap<String, String>;

/// Analyze a script in place. Returns normally even when errors were
/// reported; the caller must check the [`ErrorStream`].
pub fn analyze(
    script: &mut Script,
    builtins: &BuiltinFunctions,
    params: &Params,
    errors: &mut ErrorStream,
) {
    let mut analyzer = Analyzer {
        builtins,
        params,
        errors,
        consts: HashMap::default(),
        agents: HashMap::default(),
        functions: HashMap::default(),
        scopes: ScopeStack::default(),
        pending_simulates: vec![],
    };
    analyzer.run(script);
}

#[derive(Debug, Clone, Default)]
struct AgentSig {
    members: Vec<(String, Type, bool)>,
}

impl AgentSig {
    fn member(&self, name: &str) -> Option<&(String, Type, bool)> {
        self.members.iter().find(|(member, ..)| member == name)
    }
}

#[derive(Debug, Clone)]
struct FunctionSig {
    kind: FunctionKind,
    params: Vec<Type>,
    ret: Type,
}

/// Per-function walk context.
#[derive(Debug, Clone, Default)]
struct FnContext {
    is_step: bool,
    is_main: bool,
    in_binding: Option<VarId>,
    out_binding: Option<VarId>,
    near_var: Option<VarId>,
    loop_depth: usize,
    return_type: Type,
    info: FunctionInfo,
    simulates: Vec<SimulateStatement>,
}

struct Analyzer<'a> {
    builtins: &'a BuiltinFunctions,
    params: &'a Params,
    errors: &'a mut ErrorStream,
    consts: HashMap<String, Value>,
    agents: HashMap<String, AgentSig>,
    functions: HashMap<String, FunctionSig>,
    scopes: ScopeStack,
    pending_simulates: Vec<SimulateStatement>,
}

impl Analyzer<'_> {
    fn run(&mut self, script: &mut Script) {
        self.collect_agent_names(script);
        self.scopes.push();
        self.resolve_declarations(script);
        self.check_environment_count(script);
        self.check_function_bodies(script);
        self.resolve_simulation(script);
        self.propagate_rng(script);
        self.scopes.pop();

        debug!("analysis finished with {} error(s)", self.errors.len());
    }

    fn collect_agent_names(&mut self, script: &Script) {
        for decl in &script.decls {
            let Declaration::Agent(agent) = decl else {
                continue;
            };
            if self.agents.contains_key(&agent.name) {
                self.errors.report(
                    format!("agent '{}' is already defined", agent.name),
                    agent.span,
                );
                continue;
            }
            self.agents
                .insert(agent.name.clone(), AgentSig::default());
        }
    }

    /// Source-order pass over the top-level declarations: resolve agent
    /// members, fold constants, fold the environment, and collect function
    /// signatures.
    fn resolve_declarations(&mut self, script: &mut Script) {
        for decl in &mut script.decls {
            if let Declaration::Agent(agent) = decl {
                Self::resolve_agent(agent, &self.agents, self.errors);
            }
        }

        // Agent signatures are needed for member lookups and function
        // parameter types, so fill them in before touching anything else.
        for decl in &script.decls {
            let Declaration::Agent(agent) = decl else {
                continue;
            };
            let sig = AgentSig {
                members: agent
                    .members
                    .iter()
                    .map(|member| {
                        (
                            member.name.clone(),
                            member.resolved.clone(),
                            member.is_position,
                        )
                    })
                    .collect(),
            };
            self.agents.insert(agent.name.clone(), sig);
        }

        for decl in &mut script.decls {
            match decl {
                Declaration::Const(decl) => self.resolve_const(decl),
                Declaration::Environment(env) => self.resolve_environment(env),
                _ => {}
            }
        }

        for decl in &script.decls {
            if let Declaration::Function(func) = decl {
                self.collect_function_signature(func);
            }
        }
    }

    fn resolve_agent(
        agent: &mut AgentDeclaration,
        agents: &HashMap<String, AgentSig>,
        errors: &mut ErrorStream,
    ) {
        let mut position_count = 0;

        for index in 0..agent.members.len() {
            let member = &agent.members[index];
            if agent.members[..index]
                .iter()
                .any(|other| other.name == member.name)
            {
                errors.report(
                    format!(
                        "agent '{}' has a duplicate member '{}'",
                        agent.name, member.name
                    ),
                    member.span,
                );
            }

            let resolved = match resolve_type_name(&member.ty, agents) {
                Ok(ty) => ty,
                Err(message) => {
                    errors.report(message, member.ty.span);
                    Type::Invalid
                }
            };

            match &resolved {
                Type::Bool | Type::Int32 | Type::Float32 | Type::String | Type::Vec2
                | Type::Vec3 | Type::Invalid => {}
                other => {
                    errors.report(
                        format!("agent members cannot have type '{other}'"),
                        member.span,
                    );
                }
            }

            if member.is_position {
                position_count += 1;
                if !resolved.is_vec() && resolved != Type::Invalid {
                    errors.report(
                        format!(
                            "position member '{}' must have type vec2 or vec3",
                            member.name
                        ),
                        member.span,
                    );
                }
            }

            agent.members[index].resolved = resolved;
        }

        if position_count != 1 {
            errors.report(
                format!(
                    "agent '{}' must have exactly one position member",
                    agent.name
                ),
                agent.span,
            );
        }
    }

    fn resolve_const(&mut self, decl: &mut ConstDeclaration) {
        if self.consts.contains_key(&decl.var.name) {
            self.errors.report(
                format!("constant '{}' is already defined", decl.var.name),
                decl.span,
            );
            return;
        }

        let mut value = match config::eval(&decl.expr, &self.consts) {
            Ok(value) => value,
            Err(error) => {
                self.errors.push(error);
                return;
            }
        };

        if let Some(raw) = self.params.get(&decl.var.name) {
            match config::parse_override(raw, &value) {
                Some(overridden) => value = overridden,
                None => self.errors.report(
                    format!(
                        "cannot parse '{raw}' as a {} override for '{}'",
                        value.type_of(),
                        decl.var.name
                    ),
                    decl.span,
                ),
            }
        }

        let id = self.scopes.declare(&decl.var.name, value.type_of());
        decl.var.id = Some(id);
        self.consts.insert(decl.var.name.clone(), value.clone());
        decl.value = Some(value);
    }

    fn eval_env_vector(&mut self, expr: &Expression, what: &str) -> Option<Value> {
        match config::eval(expr, &self.consts) {
            Ok(value @ (Value::Vec2(..) | Value::Vec3(..))) => Some(value),
            Ok(other) => {
                self.errors.report(
                    format!(
                        "environment '{what}' must be a vector constant, not {}",
                        other.type_of()
                    ),
                    expr.span,
                );
                None
            }
            Err(error) => {
                self.errors.push(error);
                None
            }
        }
    }

    fn resolve_environment(&mut self, env: &mut EnvironmentDeclaration) {
        let Some(max) = self.eval_env_vector(&env.max, "max") else {
            return;
        };
        let dim = if max.type_of() == Type::Vec3 { 3 } else { 2 };

        let min = match &env.min {
            Some(expr) => {
                let Some(min) = self.eval_env_vector(expr, "min") else {
                    return;
                };
                if min.type_of() != max.type_of() {
                    self.errors.report(
                        "environment 'min' and 'max' must have the same dimension",
                        expr.span,
                    );
                    return;
                }
                min
            }
            None if dim == 3 => Value::Vec3(0.0, 0.0, 0.0),
            None => Value::Vec2(0.0, 0.0),
        };

        let granularity = match &env.granularity {
            Some(expr) => match config::eval(expr, &self.consts) {
                Ok(value) => match value.as_float() {
                    Some(granularity) => granularity,
                    None => {
                        self.errors.report(
                            format!(
                                "environment 'granularity' must be a numeric constant, not {}",
                                value.type_of()
                            ),
                            expr.span,
                        );
                        return;
                    }
                },
                Err(error) => {
                    self.errors.push(error);
                    return;
                }
            },
            None => 1.0,
        };

        if granularity <= 0.0 {
            self.errors.report(
                "environment 'granularity' must be greater than zero",
                env.span,
            );
            return;
        }

        let min = min.extend_to_vec3().unwrap_or_default();
        let max = max.extend_to_vec3().unwrap_or_default();
        let size = [max[0] - min[0], max[1] - min[1], max[2] - min[2]];
        if size.iter().take(dim).any(|extent| *extent <= 0.0) {
            self.errors
                .report("environment extents must be positive", env.span);
            return;
        }

        env.bounds = Some(EnvironmentBounds {
            dim,
            min,
            max,
            size,
            granularity,
        });
    }

    fn collect_function_signature(&mut self, func: &FunctionDeclaration) {
        if self.functions.contains_key(&func.name) {
            self.errors.report(
                format!("function '{}' is already defined", func.name),
                func.span,
            );
            return;
        }

        let mut params = vec![];
        for param in &func.params {
            let ty = match resolve_type_name(&param.ty, &self.agents) {
                Ok(ty) => ty,
                Err(message) => {
                    self.errors.report(message, param.ty.span);
                    Type::Invalid
                }
            };
            params.push(ty);
        }

        let ret = match &func.return_type {
            Some(ty) => match resolve_type_name(ty, &self.agents) {
                Ok(ty) => ty,
                Err(message) => {
                    self.errors.report(message, ty.span);
                    Type::Invalid
                }
            },
            None => Type::Void,
        };

        if func.kind == FunctionKind::Step {
            self.check_step_signature(func, &ret);
        }

        self.functions.insert(
            func.name.clone(),
            FunctionSig {
                kind: func.kind,
                params,
                ret,
            },
        );
    }

    fn check_step_signature(&mut self, func: &FunctionDeclaration, ret: &Type) {
        let in_agent = func
            .in_param()
            .map(|param| param.ty.name.clone())
            .filter(|name| self.agents.contains_key(name));
        let out_agent = func
            .out_param()
            .map(|param| param.ty.name.clone())
            .filter(|name| self.agents.contains_key(name));

        match (in_agent, out_agent) {
            (Some(in_agent), Some(out_agent)) if in_agent == out_agent => {
                if func.params.len() != 2 {
                    self.errors.report(
                        format!(
                            "step function '{}' takes exactly an 'in' and an 'out' agent",
                            func.name
                        ),
                        func.span,
                    );
                }
            }
            (Some(_), Some(_)) => self.errors.report(
                format!(
                    "step function '{}' must update a single agent type",
                    func.name
                ),
                func.span,
            ),
            _ => self.errors.report(
                format!(
                    "step function '{}' needs an 'in' and an 'out' agent parameter",
                    func.name
                ),
                func.span,
            ),
        }

        if *ret != Type::Void {
            self.errors.report(
                format!("step function '{}' cannot return a value", func.name),
                func.span,
            );
        }
    }

    fn check_environment_count(&mut self, script: &Script) {
        let mut seen = false;
        for decl in &script.decls {
            let Declaration::Environment(env) = decl else {
                continue;
            };
            if seen {
                self.errors
                    .report("environment is already declared", env.span);
            }
            seen = true;
        }
        if !seen {
            self.errors.report(
                "script is missing an environment declaration",
                Span::default(),
            );
        }
    }

    fn check_function_bodies(&mut self, script: &mut Script) {
        for decl in &mut script.decls {
            let Declaration::Function(func) = decl else {
                continue;
            };

            let mut ctx = FnContext {
                is_step: func.kind == FunctionKind::Step,
                is_main: func.name == "main",
                return_type: self
                    .functions
                    .get(&func.name)
                    .map(|sig| sig.ret.clone())
                    .unwrap_or_default(),
                ..Default::default()
            };

            func.resolved_return = ctx.return_type.clone();

            self.scopes.push();
            for param in &mut func.params {
                let ty = resolve_type_name(&param.ty, &self.agents).unwrap_or(Type::Invalid);
                param.resolved = ty.clone();
                let id = self.scopes.declare(&param.var.name, ty);
                param.var.id = Some(id);
                match param.role {
                    ParamRole::In => ctx.in_binding = Some(id),
                    ParamRole::Out => ctx.out_binding = Some(id),
                    ParamRole::None => {}
                }
            }

            for stmt in &mut func.body.stmts {
                self.check_statement(stmt, &mut ctx);
            }
            self.scopes.pop();

            if !ctx.simulates.is_empty() && !ctx.is_main {
                for sim in &ctx.simulates {
                    self.errors.report(
                        "simulate is only allowed in 'main' or at the top level",
                        sim.span,
                    );
                }
            } else {
                self.pending_simulates.append(&mut ctx.simulates);
            }

            func.info = ctx.info;
        }
    }

    fn resolve_simulation(&mut self, script: &mut Script) {
        let mut candidates = std::mem::take(&mut self.pending_simulates);
        for decl in &script.decls {
            if let Declaration::Simulate(sim) = decl {
                candidates.push(sim.clone());
            }
        }

        for sim in candidates.iter().skip(1) {
            self.errors
                .report("the simulation is already declared", sim.span);
        }

        let Some(sim) = candidates.first() else {
            return;
        };

        let steps = match config::eval(&sim.steps, &self.consts) {
            Ok(Value::Int(steps)) if steps >= 0 => steps,
            Ok(Value::Int(_)) => {
                self.errors
                    .report("simulate step count cannot be negative", sim.span);
                return;
            }
            Ok(other) => {
                self.errors.report(
                    format!(
                        "simulate step count must be an int constant, not {}",
                        other.type_of()
                    ),
                    sim.span,
                );
                return;
            }
            Err(error) => {
                self.errors.push(error);
                return;
            }
        };

        for name in &sim.step_fns {
            match self.functions.get(name) {
                Some(sig) if sig.kind == FunctionKind::Step => {}
                Some(_) => self
                    .errors
                    .report(format!("'{name}' is not a step function"), sim.span),
                None => self
                    .errors
                    .report(format!("undefined step function '{name}'"), sim.span),
            }
        }

        script.sim = Some(SimulationPlan {
            steps,
            step_fns: sim.step_fns.clone(),
        });
    }

    /// Recursive closure of "uses random numbers" over the call graph.
    fn propagate_rng(&mut self, script: &mut Script) {
        let mut uses_rng: HashMap<String, bool> = script
            .functions()
            .map(|func| (func.name.clone(), func.info.uses_rng))
            .collect();
        let calls: HashMap<String, Vec<String>> = script
            .functions()
            .map(|func| (func.name.clone(), func.info.calls.clone()))
            .collect();

        let mut changed = true;
        while changed {
            changed = false;
            for (name, callees) in &calls {
                if uses_rng[name] {
                    continue;
                }
                if callees
                    .iter()
                    .any(|callee| uses_rng.get(callee).copied().unwrap_or(false))
                {
                    uses_rng.insert(name.clone(), true);
                    changed = true;
                }
            }
        }

        for decl in &mut script.decls {
            if let Declaration::Function(func) = decl {
                func.info.uses_rng = uses_rng[&func.name];
            }
        }
    }

    fn check_statement(&mut self, stmt: &mut Statement, ctx: &mut FnContext) {
        match stmt {
            Statement::Expression(expr) => {
                self.check_expression(expr, ctx);
            }
            Statement::Assign { left, right } => {
                let target = self.check_assign_target(left, ctx);
                let value = self.check_expression(right, ctx);
                if !assign_compatible(&target, &value) {
                    self.errors.report(
                        format!("cannot assign a {value} value to a {target} target"),
                        right.span,
                    );
                }
            }
            Statement::AssignOp { op, left, right } => {
                let target = self.check_assign_target(left, ctx);
                let value = self.check_expression(right, ctx);
                match binary_result(*op, &target, &value) {
                    Some(result) if assign_compatible(&target, &result) => {}
                    _ => self.errors.report(
                        format!("cannot apply '{}=' to {target} and {value}", op.sigil()),
                        right.span,
                    ),
                }
            }
            Statement::Block(block) => {
                self.scopes.push();
                for stmt in &mut block.stmts {
                    self.check_statement(stmt, ctx);
                }
                self.scopes.pop();
            }
            Statement::VarDeclaration(decl) => self.check_var_declaration(decl, ctx),
            Statement::If {
                cond,
                then_stmt,
                else_stmt,
            } => {
                let ty = self.check_expression(cond, ctx);
                if ty != Type::Bool && ty != Type::Invalid {
                    self.errors
                        .report(format!("if condition must be bool, not {ty}"), cond.span);
                }
                self.check_statement(then_stmt, ctx);
                if let Some(else_stmt) = else_stmt {
                    self.check_statement(else_stmt, ctx);
                }
            }
            Statement::While { cond, body } => {
                let ty = self.check_expression(cond, ctx);
                if ty != Type::Bool && ty != Type::Invalid {
                    self.errors
                        .report(format!("while condition must be bool, not {ty}"), cond.span);
                }
                ctx.loop_depth += 1;
                self.check_statement(body, ctx);
                ctx.loop_depth -= 1;
            }
            Statement::For(stmt) => self.check_for(stmt, ctx),
            Statement::Parfor(stmt) => self.check_parfor(stmt, ctx),
            Statement::Simulate(sim) => {
                ctx.simulates.push(sim.clone());
            }
            Statement::Return { expr, span } => {
                let ty = match expr {
                    Some(expr) => self.check_expression(expr, ctx),
                    None => Type::Void,
                };
                if !assign_compatible(&ctx.return_type, &ty) {
                    self.errors.report(
                        format!(
                            "return type mismatch: expected {}, found {ty}",
                            ctx.return_type
                        ),
                        *span,
                    );
                }
            }
            Statement::Break { span } => {
                if ctx.loop_depth == 0 {
                    self.errors.report("break outside of a loop", *span);
                }
            }
            Statement::Continue { span } => {
                if ctx.loop_depth == 0 {
                    self.errors.report("continue outside of a loop", *span);
                }
            }
        }
    }

    fn check_var_declaration(&mut self, decl: &mut VarDeclaration, ctx: &mut FnContext) {
        let ty = match resolve_type_name(&decl.ty, &self.agents) {
            Ok(ty) => ty,
            Err(message) => {
                self.errors.report(message, decl.ty.span);
                Type::Invalid
            }
        };

        if let Some(initializer) = &mut decl.initializer {
            let value = self.check_expression(initializer, ctx);
            if !assign_compatible(&ty, &value) {
                self.errors.report(
                    format!("cannot initialize a {ty} variable with a {value} value"),
                    initializer.span,
                );
            }
        }

        if self.scopes.contains_in_current_scope(&decl.var.name) {
            self.errors.report(
                format!("variable '{}' is already defined", decl.var.name),
                decl.span,
            );
        }

        decl.resolved = ty.clone();
        decl.var.id = Some(self.scopes.declare(&decl.var.name, ty));
    }

    fn check_for(&mut self, stmt: &mut ForStatement, ctx: &mut FnContext) {
        let var_ty = match resolve_type_name(&stmt.ty, &self.agents) {
            Ok(ty) => ty,
            Err(message) => {
                self.errors.report(message, stmt.ty.span);
                Type::Invalid
            }
        };

        let span = stmt.iterable.span;
        let mut is_near = false;
        let elem_ty = match &mut stmt.iterable.kind {
            ExpressionKind::Binary {
                op: BinaryOp::Range,
                left,
                right,
            } => {
                for bound in [left.as_mut(), right.as_mut()] {
                    let ty = self.check_expression(bound, ctx);
                    if ty != Type::Int32 && ty != Type::Invalid {
                        self.errors
                            .report(format!("range bounds must be int, not {ty}"), bound.span);
                    }
                }
                stmt.iterable.ty = Type::array_of(Type::Int32);
                Type::Int32
            }
            ExpressionKind::Call(call) if call.name == "near" => {
                is_near = true;
                let elem = self.check_near_call(call, span, ctx);
                stmt.iterable.ty = Type::array_of(elem.clone());
                elem
            }
            _ => {
                let ty = self.check_expression(&mut stmt.iterable, ctx);
                match ty.element() {
                    Some(elem) => elem.clone(),
                    None => {
                        if ty != Type::Invalid {
                            self.errors
                                .report(format!("cannot iterate over a {ty} value"), span);
                        }
                        Type::Invalid
                    }
                }
            }
        };

        if var_ty != Type::Invalid && elem_ty != Type::Invalid && var_ty != elem_ty {
            self.errors.report(
                format!(
                    "loop variable '{}' has type {var_ty} but the iterable yields {elem_ty}",
                    stmt.var.name
                ),
                stmt.span,
            );
        }

        self.scopes.push();
        let id = self.scopes.declare(&stmt.var.name, var_ty);
        stmt.var.id = Some(id);

        let saved_near = ctx.near_var;
        if is_near {
            ctx.near_var = Some(id);
        }

        ctx.loop_depth += 1;
        self.check_statement(&mut stmt.body, ctx);
        ctx.loop_depth -= 1;

        ctx.near_var = saved_near;
        self.scopes.pop();
    }

    fn check_parfor(&mut self, stmt: &mut ParforStatement, ctx: &mut FnContext) {
        let ty = match resolve_type_name(&stmt.ty, &self.agents) {
            Ok(ty) => ty,
            Err(message) => {
                self.errors.report(message, stmt.ty.span);
                Type::Invalid
            }
        };

        if !ty.is_agent() && ty != Type::Invalid {
            self.errors.report(
                format!("parfor updates agents, not {ty} values"),
                stmt.ty.span,
            );
        }

        let iterable_ty = self.check_expression(&mut stmt.iterable, ctx);
        match iterable_ty.element() {
            Some(elem) if *elem == ty || ty == Type::Invalid => {}
            Some(elem) => self.errors.report(
                format!("parfor bindings have type {ty} but the population holds {elem}"),
                stmt.iterable.span,
            ),
            None => {
                if iterable_ty != Type::Invalid {
                    self.errors.report(
                        format!("parfor expects an agent array, not {iterable_ty}"),
                        stmt.iterable.span,
                    );
                }
            }
        }

        self.scopes.push();
        let in_id = self.scopes.declare(&stmt.in_var.name, ty.clone());
        stmt.in_var.id = Some(in_id);
        let out_id = self.scopes.declare(&stmt.out_var.name, ty);
        stmt.out_var.id = Some(out_id);

        let saved_in = ctx.in_binding;
        let saved_out = ctx.out_binding;
        ctx.in_binding = Some(in_id);
        ctx.out_binding = Some(out_id);

        self.check_statement(&mut stmt.body, ctx);

        ctx.in_binding = saved_in;
        ctx.out_binding = saved_out;
        self.scopes.pop();
    }

    /// Validate an assignment target: it must be an lvalue, and it must not
    /// mutate shared agent state (`in` bindings, neighborhood agents).
    fn check_assign_target(&mut self, left: &mut Expression, ctx: &mut FnContext) -> Type {
        let ty = self.check_expression(left, ctx);

        if !left.is_lvalue() {
            self.errors
                .report("assignment target is not an lvalue", left.span);
            return ty;
        }

        if let Some(root) = left.root_var() {
            if root.id.is_some() && root.id == ctx.in_binding {
                self.errors.report(
                    format!("cannot write to the 'in' binding '{}'", root.name),
                    left.span,
                );
            }
            if root.id.is_some() && root.id == ctx.near_var {
                self.errors.report(
                    format!("cannot write to neighborhood agent '{}'", root.name),
                    left.span,
                );
            }
        }

        ty
    }

    fn check_expression(&mut self, expr: &mut Expression, ctx: &mut FnContext) -> Type {
        let span = expr.span;
        let ty = match &mut expr.kind {
            ExpressionKind::BoolLit(_) => Type::Bool,
            ExpressionKind::IntLit(_) => Type::Int32,
            ExpressionKind::FloatLit(_) => Type::Float32,
            ExpressionKind::StrLit(_) => Type::String,
            ExpressionKind::Var(var) => match self.scopes.lookup(&var.name) {
                Some(entry) => {
                    var.id = Some(entry.id);
                    entry.ty.clone()
                }
                None => {
                    self.errors
                        .report(format!("undefined variable '{}'", var.name), span);
                    Type::Invalid
                }
            },
            ExpressionKind::Unary { op, expr: inner } => {
                let inner_ty = self.check_expression(inner, ctx);
                match unary_result(*op, &inner_ty) {
                    Some(ty) => ty,
                    None => {
                        if inner_ty != Type::Invalid {
                            self.errors.report(
                                format!(
                                    "unary '{}' cannot be applied to a {inner_ty} value",
                                    op.sigil()
                                ),
                                span,
                            );
                        }
                        Type::Invalid
                    }
                }
            }
            ExpressionKind::Binary { op, left, right } => {
                if *op == BinaryOp::Range {
                    self.check_expression(left, ctx);
                    self.check_expression(right, ctx);
                    self.errors.report(
                        "a range is only allowed as the iterable of a for loop",
                        span,
                    );
                    Type::Invalid
                } else {
                    let left_ty = self.check_expression(left, ctx);
                    let right_ty = self.check_expression(right, ctx);
                    match binary_result(*op, &left_ty, &right_ty) {
                        Some(ty) => ty,
                        None => {
                            if left_ty != Type::Invalid && right_ty != Type::Invalid {
                                self.errors.report(
                                    format!(
                                        "binary '{}' cannot be applied to {left_ty} and {right_ty}",
                                        op.sigil()
                                    ),
                                    span,
                                );
                            }
                            Type::Invalid
                        }
                    }
                }
            }
            ExpressionKind::Ternary {
                cond,
                then_expr,
                else_expr,
            } => {
                let cond_ty = self.check_expression(cond, ctx);
                if cond_ty != Type::Bool && cond_ty != Type::Invalid {
                    self.errors.report(
                        format!("ternary condition must be bool, not {cond_ty}"),
                        cond.span,
                    );
                }
                let then_ty = self.check_expression(then_expr, ctx);
                let else_ty = self.check_expression(else_expr, ctx);
                if then_ty == else_ty || else_ty == Type::Invalid {
                    then_ty
                } else if then_ty == Type::Invalid {
                    else_ty
                } else {
                    self.errors.report(
                        format!("ternary branches have mismatched types {then_ty} and {else_ty}"),
                        span,
                    );
                    Type::Invalid
                }
            }
            ExpressionKind::Call(call) => self.check_call(call, span, ctx),
            ExpressionKind::Member { expr: base, member } => {
                let base_ty = self.check_expression(base, ctx);
                let member = member.clone();
                self.check_member(base, &base_ty, &member, span, ctx)
            }
            ExpressionKind::Index { array, index } => {
                let array_ty = self.check_expression(array, ctx);
                let index_ty = self.check_expression(index, ctx);
                if index_ty != Type::Int32 && index_ty != Type::Invalid {
                    self.errors
                        .report(format!("array index must be int, not {index_ty}"), index.span);
                }
                match array_ty.element() {
                    Some(elem) => elem.clone(),
                    None => {
                        if array_ty != Type::Invalid {
                            self.errors
                                .report(format!("cannot index into a {array_ty} value"), span);
                        }
                        Type::Invalid
                    }
                }
            }
            ExpressionKind::ArrayInit { exprs } => {
                let mut ok = true;
                for component in exprs.iter_mut() {
                    let ty = self.check_expression(component, ctx);
                    if !ty.is_numeric() && ty != Type::Invalid {
                        self.errors.report(
                            format!("vector components must be numeric, not {ty}"),
                            component.span,
                        );
                        ok = false;
                    }
                }
                match (exprs.len(), ok) {
                    (2, true) => Type::Vec2,
                    (3, true) => Type::Vec3,
                    (_, true) => {
                        self.errors
                            .report("vector literals have two or three components", span);
                        Type::Invalid
                    }
                    _ => Type::Invalid,
                }
            }
            ExpressionKind::AgentCreation { name, members } => {
                let name = name.clone();
                let sig = self.agents.get(&name).cloned();
                if sig.is_none() {
                    self.errors
                        .report(format!("undefined agent type '{name}'"), span);
                }

                for member in members.iter_mut() {
                    let value = self.check_expression(&mut member.expr, ctx);
                    let Some(sig) = &sig else {
                        continue;
                    };
                    match sig.member(&member.name) {
                        Some((_, ty, _)) => {
                            if !assign_compatible(ty, &value) {
                                self.errors.report(
                                    format!(
                                        "member '{}' of agent '{name}' has type {ty}, not {value}",
                                        member.name
                                    ),
                                    member.span,
                                );
                            }
                        }
                        None => self.errors.report(
                            format!("agent '{name}' has no member '{}'", member.name),
                            member.span,
                        ),
                    }
                }

                match sig {
                    Some(sig) => {
                        for (member_name, ..) in &sig.members {
                            if !members.iter().any(|member| &member.name == member_name) {
                                self.errors.report(
                                    format!(
                                        "member '{member_name}' of agent '{name}' is not initialized"
                                    ),
                                    span,
                                );
                            }
                        }
                        Type::Agent(name)
                    }
                    None => Type::Invalid,
                }
            }
            ExpressionKind::NewArray { elem, len } => {
                let elem_ty = match resolve_type_name(elem, &self.agents) {
                    Ok(ty) => ty,
                    Err(message) => {
                        self.errors.report(message, elem.span);
                        Type::Invalid
                    }
                };
                let len_ty = self.check_expression(len, ctx);
                if len_ty != Type::Int32 && len_ty != Type::Invalid {
                    self.errors
                        .report(format!("array length must be int, not {len_ty}"), len.span);
                }
                Type::array_of(elem_ty)
            }
        };

        expr.ty = ty.clone();
        ty
    }

    fn check_member(
        &mut self,
        base: &Expression,
        base_ty: &Type,
        member: &str,
        span: Span,
        ctx: &mut FnContext,
    ) -> Type {
        match base_ty {
            Type::Vec2 | Type::Vec3 => {
                let valid = match member {
                    "x" | "y" => true,
                    "z" => *base_ty == Type::Vec3,
                    _ => false,
                };
                if !valid {
                    self.errors
                        .report(format!("{base_ty} has no component '{member}'"), span);
                    return Type::Invalid;
                }
                Type::Float32
            }
            Type::Agent(name) => {
                // Reads through the neighborhood variable feed the FLAME
                // message payload.
                if let Some(var) = base.as_var() {
                    if var.id.is_some() && var.id == ctx.near_var {
                        ctx.info.near_members.insert(member.to_owned());
                    }
                }

                let Some(sig) = self.agents.get(name) else {
                    return Type::Invalid;
                };
                match sig.member(member) {
                    Some((_, ty, _)) => ty.clone(),
                    None => {
                        self.errors
                            .report(format!("agent '{name}' has no member '{member}'"), span);
                        Type::Invalid
                    }
                }
            }
            Type::Invalid => Type::Invalid,
            other => {
                self.errors
                    .report(format!("{other} values have no members"), span);
                Type::Invalid
            }
        }
    }

    /// `near` in for-iterable position: the only place it is allowed.
    fn check_near_call(
        &mut self,
        call: &mut CallExpression,
        span: Span,
        ctx: &mut FnContext,
    ) -> Type {
        let mut arg_tys = vec![];
        for arg in call.args.iter_mut() {
            arg_tys.push(self.check_expression(arg, ctx));
        }

        if ctx.in_binding.is_none() {
            self.errors.report(
                "near() may only be used inside a parfor or a step function",
                span,
            );
            return Type::Invalid;
        }

        let receiver_ok = call
            .args
            .first()
            .and_then(|arg| arg.as_var())
            .map(|var| var.id.is_some() && var.id == ctx.in_binding)
            .unwrap_or(false);
        if !receiver_ok {
            self.errors.report(
                "near() takes the 'in' binding of the enclosing parfor",
                span,
            );
            return Type::Invalid;
        }

        let Some(overload) = self.builtins.resolve("near", &arg_tys) else {
            self.errors.report("no matching overload for 'near'", span);
            return Type::Invalid;
        };

        call.target = CallTarget::Builtin {
            target: overload.target.clone(),
        };
        ctx.info.uses_near = true;

        overload
            .return_type(&arg_tys)
            .element()
            .cloned()
            .unwrap_or(Type::Invalid)
    }

    fn check_call(&mut self, call: &mut CallExpression, span: Span, ctx: &mut FnContext) -> Type {
        let mut arg_tys = vec![];
        for arg in call.args.iter_mut() {
            arg_tys.push(self.check_expression(arg, ctx));
        }

        if arg_tys.iter().any(|ty| *ty == Type::Invalid) {
            return Type::Invalid;
        }

        match call.name.as_str() {
            // A `near` reaching the generic expression walk is misplaced;
            // for-iterables go through `check_near_call`.
            "near" => {
                if ctx.in_binding.is_none() {
                    self.errors.report(
                        "near() may only be used inside a parfor or a step function",
                        span,
                    );
                } else {
                    self.errors.report(
                        "near() may only be used as the iterable of a for loop",
                        span,
                    );
                }
                return Type::Invalid;
            }
            "add" => {
                if !ctx.is_step && !ctx.is_main {
                    self.errors.report(
                        "add() may only be used inside a step function or main",
                        span,
                    );
                }
                if let Some(agent) = arg_tys.first().and_then(|ty| ty.agent_name()) {
                    ctx.info.added_agents.push(agent.to_owned());
                }
            }
            _ => {}
        }

        if let Some(sig) = self.functions.get(&call.name).cloned() {
            if sig.kind == FunctionKind::Step {
                self.errors.report(
                    format!("step function '{}' cannot be called directly", call.name),
                    span,
                );
                return Type::Invalid;
            }
            if sig.params.len() != arg_tys.len()
                || sig
                    .params
                    .iter()
                    .zip(&arg_tys)
                    .any(|(param, arg)| !assign_compatible(param, arg))
            {
                self.errors.report(
                    format!("arguments do not match the signature of '{}'", call.name),
                    span,
                );
                return Type::Invalid;
            }
            call.target = CallTarget::UserFunction;
            ctx.info.calls.push(call.name.clone());
            return sig.ret;
        }

        if self.builtins.contains(&call.name) {
            let Some(overload) = self.builtins.resolve(&call.name, &arg_tys) else {
                self.errors
                    .report(format!("no matching overload for '{}'", call.name), span);
                return Type::Invalid;
            };
            if call.name == "random" {
                ctx.info.uses_rng = true;
            }
            call.target = CallTarget::Builtin {
                target: overload.target.clone(),
            };
            return overload.return_type(&arg_tys);
        }

        self.errors
            .report(format!("undefined function '{}'", call.name), span);
        Type::Invalid
    }
}

fn resolve_type_name(ty: &TypeName, agents: &HashMap<String, AgentSig>) -> Result<Type, String> {
    let base = match ty.name.as_str() {
        "bool" => Type::Bool,
        "int" => Type::Int32,
        "float" => Type::Float32,
        "string" => Type::String,
        "vec2" => Type::Vec2,
        "vec3" => Type::Vec3,
        "void" => Type::Void,
        name if agents.contains_key(name) => Type::Agent(name.to_owned()),
        name => return Err(format!("unknown type '{name}'")),
    };

    if ty.is_array {
        Ok(Type::array_of(base))
    } else {
        Ok(base)
    }
}

fn unary_result(op: UnaryOp, ty: &Type) -> Option<Type> {
    match op {
        UnaryOp::Minus | UnaryOp::Plus => {
            if ty.is_numeric() || ty.is_vec() {
                Some(ty.clone())
            } else {
                None
            }
        }
        UnaryOp::LogicalNot => (*ty == Type::Bool).then_some(Type::Bool),
        UnaryOp::BitwiseNot => (*ty == Type::Int32).then_some(Type::Int32),
    }
}

/// Result type of a binary operation, or `None` when the operand types do
/// not fit the operator.
fn binary_result(op: BinaryOp, left: &Type, right: &Type) -> Option<Type> {
    use BinaryOp::*;

    match op {
        Add | Sub | Mul | Div => match (left, right) {
            (Type::Int32, Type::Int32) => Some(Type::Int32),
            (l, r) if l.is_numeric() && r.is_numeric() => Some(Type::Float32),
            // Componentwise vector sums; products only against a scalar
            // (the runtime vector ABI has no componentwise product).
            (l, r) if l.is_vec() && l == r && matches!(op, Add | Sub) => Some(l.clone()),
            // `vec op float` broadcasts the scalar over the components.
            (l, r) if l.is_vec() && r.is_numeric() => Some(l.clone()),
            (l, r) if l.is_numeric() && r.is_vec() && !matches!(op, Div) => Some(r.clone()),
            _ => None,
        },
        Mod | BitwiseAnd | BitwiseXor | BitwiseOr | ShiftLeft | ShiftRight => {
            (*left == Type::Int32 && *right == Type::Int32).then_some(Type::Int32)
        }
        Equals | NotEquals => {
            let comparable = left == right && *left != Type::Void
                || left.is_numeric() && right.is_numeric();
            comparable.then_some(Type::Bool)
        }
        Smaller | SmallerEquals | Greater | GreaterEquals => {
            (left.is_numeric() && right.is_numeric()).then_some(Type::Bool)
        }
        LogicalAnd | LogicalOr => {
            (*left == Type::Bool && *right == Type::Bool).then_some(Type::Bool)
        }
        Range => None,
    }
}

/// Assignment compatibility: equal types, or an int widened to float.
fn assign_compatible(target: &Type, value: &Type) -> bool {
    if *target == Type::Invalid || *value == Type::Invalid {
        // Already reported; avoid cascading errors.
        return true;
    }
    target == value || (*target == Type::Float32 && *value == Type::Int32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::Lexer;
    use crate::parser;

    fn analyze_source(input: &str) -> (Script, ErrorStream) {
        let tokens = Lexer::new(input).lex().expect("should lex");
        let mut script = parser::parse(tokens).expect("should parse");

        let mut builtins = BuiltinFunctions::default();
        register_builtin_functions(&mut builtins);

        let mut errors = ErrorStream::default();
        analyze(&mut script, &builtins, &Params::default(), &mut errors);
        (script, errors)
    }

    const PREAMBLE: &str = "environment { min: [0, 0], max: [10, 10], granularity: 1 }\n\
                            agent Cell { position vec2 pos; float heat; }\n";

    #[test]
    fn test_minimal_script_is_clean() {
        let (script, errors) = analyze_source(
            "environment { min: [0, 0], max: [10, 10], granularity: 1 }\n\
             agent A { position vec2 p; }\n\
             step f(A a in, A a out) {}\n\
             simulate 0 { f }",
        );
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        let sim = script.sim.expect("simulation plan");
        assert_eq!(sim.steps, 0);
        assert_eq!(sim.step_fns, vec!["f".to_owned()]);
    }

    #[test]
    fn test_const_folding_feeds_simulate() {
        let source = format!(
            "{PREAMBLE}const N = 2 * 3 + 4;\n\
             step f(Cell c in, Cell d out) {{}}\n\
             simulate N {{ f }}"
        );
        let (script, errors) = analyze_source(&source);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        assert_eq!(script.sim.expect("simulation plan").steps, 10);
    }

    #[test]
    fn test_every_expression_is_typed() {
        let source = format!(
            "{PREAMBLE}step f(Cell c in, Cell d out) {{\n\
               float t = c.heat * 2.0 + 1.0;\n\
               d.heat = t;\n\
             }}\n\
             simulate 1 {{ f }}"
        );
        let (script, errors) = analyze_source(&source);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);

        let func = script.function("f").expect("step function");
        let Statement::VarDeclaration(decl) = &func.body.stmts[0] else {
            panic!("expected declaration");
        };
        let init = decl.initializer.as_ref().expect("initializer");
        assert_eq!(init.ty, Type::Float32);
        assert!(decl.var.id.is_some());
    }

    #[test]
    fn test_var_ids_point_to_declarations() {
        let source = format!(
            "{PREAMBLE}function helper() : float {{\n\
               float x = 1.0;\n\
               float y = x + x;\n\
               return y;\n\
             }}\n\
             step f(Cell c in, Cell d out) {{}}\n\
             simulate 1 {{ f }}"
        );
        let (script, errors) = analyze_source(&source);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);

        let helper = script.function("helper").expect("helper");
        let Statement::VarDeclaration(x_decl) = &helper.body.stmts[0] else {
            panic!("expected declaration");
        };
        let Statement::VarDeclaration(y_decl) = &helper.body.stmts[1] else {
            panic!("expected declaration");
        };
        let ExpressionKind::Binary { left, right, .. } =
            &y_decl.initializer.as_ref().unwrap().kind
        else {
            panic!("expected binary initializer");
        };
        assert_eq!(left.as_var().unwrap().id, x_decl.var.id);
        assert_eq!(right.as_var().unwrap().id, x_decl.var.id);
    }

    #[test]
    fn test_overload_selection() {
        let source = format!(
            "{PREAMBLE}function helper() : float {{\n\
               vec2 a = [1.0, 2.0];\n\
               vec3 b = [1.0, 2.0, 3.0];\n\
               return dot(a, a) + dot(b, b);\n\
             }}\n\
             step f(Cell c in, Cell d out) {{}}\n\
             simulate 1 {{ f }}"
        );
        let (script, errors) = analyze_source(&source);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);

        let helper = script.function("helper").expect("helper");
        let Statement::Return { expr: Some(expr), .. } = &helper.body.stmts[2] else {
            panic!("expected return");
        };
        let ExpressionKind::Binary { left, right, .. } = &expr.kind else {
            panic!("expected binary");
        };
        let targets: Vec<_> = [left, right]
            .iter()
            .map(|side| {
                let ExpressionKind::Call(call) = &side.kind else {
                    panic!("expected call");
                };
                call.target.clone()
            })
            .collect();
        assert_eq!(
            targets,
            vec![
                CallTarget::Builtin {
                    target: "dot_float2".into()
                },
                CallTarget::Builtin {
                    target: "dot_float3".into()
                }
            ]
        );
    }

    #[test]
    fn test_mixed_overload_is_rejected() {
        let source = format!(
            "{PREAMBLE}function helper() : float {{\n\
               vec2 a = [1.0, 2.0];\n\
               vec3 b = [1.0, 2.0, 3.0];\n\
               return dot(a, b);\n\
             }}\n\
             step f(Cell c in, Cell d out) {{}}\n\
             simulate 1 {{ f }}"
        );
        let (_, errors) = analyze_source(&source);
        assert!(errors
            .iter()
            .any(|error| error.message.contains("no matching overload for 'dot'")));
    }

    #[test]
    fn test_near_outside_parfor_is_rejected() {
        let source = format!(
            "{PREAMBLE}step f(Cell c in, Cell d out) {{}}\n\
             function main() {{\n\
               Cell self = Cell {{ pos: [1.0, 1.0], heat: 0.0 }};\n\
               for (Cell n : near(self, 1.0)) {{}}\n\
               simulate 1 {{ f }}\n\
             }}"
        );
        let (_, errors) = analyze_source(&source);
        let error = errors
            .iter()
            .find(|error| error.message.contains("near()"))
            .expect("near placement error");
        assert_eq!(error.span.line(), 6);
    }

    #[test]
    fn test_near_inside_step_reads_members() {
        let source = format!(
            "{PREAMBLE}step f(Cell c in, Cell d out) {{\n\
               float sum = 0.0;\n\
               for (Cell n : near(c, 2.0)) {{\n\
                 sum += n.heat;\n\
               }}\n\
               d.heat = sum;\n\
             }}\n\
             simulate 1 {{ f }}"
        );
        let (script, errors) = analyze_source(&source);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);

        let func = script.function("f").expect("step function");
        assert!(func.info.uses_near);
        assert!(func.info.near_members.contains("heat"));
    }

    #[test]
    fn test_writing_the_in_binding_is_rejected() {
        let source = format!(
            "{PREAMBLE}step f(Cell c in, Cell d out) {{\n\
               c.heat = 1.0;\n\
             }}\n\
             simulate 1 {{ f }}"
        );
        let (_, errors) = analyze_source(&source);
        assert!(errors
            .iter()
            .any(|error| error.message.contains("'in' binding")));
    }

    #[test]
    fn test_writing_a_neighborhood_agent_is_rejected() {
        let source = format!(
            "{PREAMBLE}step f(Cell c in, Cell d out) {{\n\
               for (Cell n : near(c, 2.0)) {{\n\
                 n.heat = 0.0;\n\
               }}\n\
             }}\n\
             simulate 1 {{ f }}"
        );
        let (_, errors) = analyze_source(&source);
        assert!(errors
            .iter()
            .any(|error| error.message.contains("neighborhood")));
    }

    #[test]
    fn test_add_outside_step_or_main_is_rejected() {
        let source = format!(
            "{PREAMBLE}function helper() {{\n\
               add(Cell {{ pos: [1.0, 1.0], heat: 0.0 }});\n\
             }}\n\
             step f(Cell c in, Cell d out) {{}}\n\
             simulate 1 {{ f }}"
        );
        let (_, errors) = analyze_source(&source);
        assert!(errors.iter().any(|error| error.message.contains("add()")));
    }

    #[test]
    fn test_rng_closure_is_recursive() {
        let source = format!(
            "{PREAMBLE}function jitter() : float {{\n\
               return random(0.0, 1.0);\n\
             }}\n\
             function wobble() : float {{\n\
               return jitter() * 2.0;\n\
             }}\n\
             step f(Cell c in, Cell d out) {{\n\
               d.heat = wobble();\n\
             }}\n\
             simulate 1 {{ f }}"
        );
        let (script, errors) = analyze_source(&source);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        assert!(script.function("jitter").unwrap().info.uses_rng);
        assert!(script.function("wobble").unwrap().info.uses_rng);
        assert!(script.function("f").unwrap().info.uses_rng);
    }

    #[test]
    fn test_missing_environment_is_rejected() {
        let (_, errors) = analyze_source(
            "agent A { position vec2 p; }\n\
             step f(A a in, A a out) {}\n\
             simulate 0 { f }",
        );
        assert!(errors
            .iter()
            .any(|error| error.message.contains("environment")));
    }

    #[test]
    fn test_override_changes_const() {
        let tokens = Lexer::new(
            "environment { min: [0, 0], max: [10, 10], granularity: 1 }\n\
             agent A { position vec2 p; }\n\
             const N = 5;\n\
             step f(A a in, A a out) {}\n\
             simulate N { f }",
        )
        .lex()
        .expect("should lex");
        let mut script = parser::parse(tokens).expect("should parse");

        let mut builtins = BuiltinFunctions::default();
        register_builtin_functions(&mut builtins);

        let mut params = Params::default();
        params.insert("N".into(), "20".into());

        let mut errors = ErrorStream::default();
        analyze(&mut script, &builtins, &params, &mut errors);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        assert_eq!(script.sim.expect("simulation plan").steps, 20);
    }
}
