//! MASON backend.
//!
//! Emits one Java class per agent plus a simulation class (and a UI
//! variant). Agents schedule themselves: inside `step`, the `in` binding
//! aliases a pre-step snapshot of `this` and the `out` binding aliases
//! `this`, committed to the spatial field at the end. `near` queries the
//! continuous field with cell size equal to the environment granularity.
//! The target is double-only; `use_float` is rejected.
use std::collections::HashMap;

use crate::analysis::{Type, Value, VarId};
use crate::parser::ast::{
    AgentDeclaration, BinaryOp, CallExpression, Expression, ExpressionKind, ForStatement,
    FunctionDeclaration, FunctionKind, ParforStatement, Script, SimulateStatement, Statement,
    Var,
};

use super::{
    float_literal, print_expression_default, print_statement_default, string_literal, Backend,
    BackendContext, BackendError, NotSupportedError, Printer, ProjectFiles, TargetPrinter,
};

pub struct MasonBackend;

impl Backend for MasonBackend {
    fn generate(
        &self,
        script: &Script,
        ctx: &BackendContext,
    ) -> Result<ProjectFiles, BackendError> {
        if ctx.config.get_bool("use_float", false) {
            return Err(NotSupportedError(
                "Floats are not supported by the Mason backend".to_owned(),
            )
            .into());
        }

        let mut files = ProjectFiles::default();
        emit_mason_project(script, ctx, MasonFlavor::Mason, &mut files)?;
        Ok(files)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum MasonFlavor {
    Mason,
    /// Distributed MASON; needs a `dmason.rows` x `dmason.cols` topology.
    DMason,
}

pub(super) fn emit_mason_project(
    script: &Script,
    ctx: &BackendContext,
    flavor: MasonFlavor,
    files: &mut ProjectFiles,
) -> Result<(), BackendError> {
    let topology = match flavor {
        MasonFlavor::Mason => None,
        MasonFlavor::DMason => {
            let rows = ctx.config.get_int("dmason.rows", 0);
            let cols = ctx.config.get_int("dmason.cols", 0);
            if rows <= 0 || cols <= 0 {
                return Err(BackendError::new(
                    "DMason requires a distributed topology \
                     (-P dmason.rows=R -P dmason.cols=C)",
                ));
            }
            Some((rows, cols))
        }
    };

    let mut printer = MasonPrinter::new(script, flavor, topology);
    printer.print_sim_class();
    files.write("Sim.java", printer.extract());

    for agent in script.agents() {
        let mut printer = MasonPrinter::new(script, flavor, topology);
        printer.print_agent_class(agent);
        files.write(&format!("{}.java", agent.name), printer.extract());
    }

    let mut printer = MasonPrinter::new(script, flavor, topology);
    printer.print_ui_class();
    files.write("SimWithUI.java", printer.extract());

    files.copy("mason/Util.java", "Util.java");
    files.write("build.sh", build_script(ctx));
    files.write("run.sh", run_script(ctx, flavor));
    files.make_executable("build.sh");
    files.make_executable("run.sh");
    Ok(())
}

fn classpath_prefix(ctx: &BackendContext) -> String {
    let mason_dir = ctx.deps_dir.join("mason");
    if mason_dir.is_dir() {
        format!("CLASSPATH={}:$CLASSPATH ", mason_dir.display())
    } else {
        String::new()
    }
}

fn build_script(ctx: &BackendContext) -> String {
    format!("#!/bin/sh\n{}javac *.java\n", classpath_prefix(ctx))
}

fn run_script(ctx: &BackendContext, flavor: MasonFlavor) -> String {
    let visualize = ctx.config.get_bool("visualize", false);
    let sim_class = if visualize { "SimWithUI" } else { "Sim" };
    match flavor {
        MasonFlavor::Mason => format!("#!/bin/sh\n{}java {sim_class}\n", classpath_prefix(ctx)),
        MasonFlavor::DMason => format!(
            "#!/bin/sh\n{}java {sim_class} --rows $DMASON_ROWS --cols $DMASON_COLS\n",
            classpath_prefix(ctx)
        ),
    }
}

fn java_type(ty: &Type) -> String {
    match ty {
        Type::Void => "void".to_owned(),
        Type::Bool => "boolean".to_owned(),
        Type::Int32 => "int".to_owned(),
        Type::Float32 => "double".to_owned(),
        Type::String => "String".to_owned(),
        Type::Vec2 => "Double2D".to_owned(),
        Type::Vec3 => "Double3D".to_owned(),
        Type::Agent(name) => name.clone(),
        Type::Array(elem) => format!("{}[]", java_type(elem)),
        Type::Invalid => "void".to_owned(),
    }
}

fn value_literal(value: &Value) -> String {
    match value {
        Value::Bool(true) => "true".to_owned(),
        Value::Bool(false) => "false".to_owned(),
        Value::Int(value) => value.to_string(),
        Value::Float(value) => float_literal(*value),
        Value::Str(value) => string_literal(value),
        Value::Vec2(x, y) => format!(
            "new Double2D({}, {})",
            float_literal(*x),
            float_literal(*y)
        ),
        Value::Vec3(x, y, z) => format!(
            "new Double3D({}, {}, {})",
            float_literal(*x),
            float_literal(*y),
            float_literal(*z)
        ),
    }
}

const MATH_BUILTINS: &[&str] = &[
    "sin", "cos", "tan", "sinh", "cosh", "tanh", "asin", "acos", "atan", "exp", "log", "sqrt",
    "round",
];

struct MasonPrinter<'a> {
    out: Printer,
    script: &'a Script,
    flavor: MasonFlavor,
    topology: Option<(i64, i64)>,
    /// In agent code `_sim` holds the simulation; in `Sim` itself it is
    /// `this`.
    in_agent: bool,
    names: HashMap<VarId, String>,
    tmp: usize,
}

impl<'a> MasonPrinter<'a> {
    fn new(script: &'a Script, flavor: MasonFlavor, topology: Option<(i64, i64)>) -> Self {
        Self {
            out: Printer::new(),
            script,
            flavor,
            topology,
            in_agent: false,
            names: HashMap::default(),
            tmp: 0,
        }
    }

    fn extract(self) -> String {
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

    fn sim_var(&self) -> &'static str {
        if self.in_agent {
            "_sim"
        } else {
            "this"
        }
    }

    fn is_3d(&self) -> bool {
        self.script
            .environment()
            .and_then(|env| env.bounds)
            .map(|bounds| bounds.dim == 3)
            .unwrap_or(false)
    }

    fn field_type(&self) -> &'static str {
        match (self.flavor, self.is_3d()) {
            (MasonFlavor::Mason, false) => "Continuous2D",
            (MasonFlavor::Mason, true) => "Continuous3D",
            (MasonFlavor::DMason, false) => "DContinuous2D",
            (MasonFlavor::DMason, true) => "DContinuous3D",
        }
    }

    fn print_sim_class(&mut self) {
        self.line("import sim.engine.*;");
        self.line("import sim.field.continuous.*;");
        self.line("import sim.util.*;");
        if self.flavor == MasonFlavor::DMason {
            self.line("import it.isislab.dmason.sim.engine.*;");
            self.line("import it.isislab.dmason.sim.field.continuous.*;");
        }
        self.out.newline();

        let parent = match self.flavor {
            MasonFlavor::Mason => "SimState",
            MasonFlavor::DMason => "DistributedState",
        };
        self.line(&format!("public class Sim extends {parent} {{"));
        self.out.indent();

        let bounds = self
            .script
            .environment()
            .and_then(|env| env.bounds)
            .unwrap_or_default();
        let steps = self.script.sim.as_ref().map(|sim| sim.steps).unwrap_or(0);

        self.line(&format!("public static final int NUM_TIMESTEPS = {steps};"));
        self.line(&format!(
            "public static final double DISCRETIZATION = {};",
            float_literal(bounds.granularity)
        ));
        if let Some((rows, cols)) = self.topology {
            self.line(&format!("public static final int ROWS = {rows};"));
            self.line(&format!("public static final int COLS = {cols};"));
        }

        for decl in self.script.consts() {
            if let Some(value) = &decl.value {
                let text = format!(
                    "public static final {} {} = {};",
                    java_type(&value.type_of()),
                    decl.var.name,
                    value_literal(value)
                );
                self.line(&text);
            }
        }

        let field = self.field_type();
        let dims = if self.is_3d() {
            format!(
                "DISCRETIZATION, {}, {}, {}",
                float_literal(bounds.size[0]),
                float_literal(bounds.size[1]),
                float_literal(bounds.size[2])
            )
        } else {
            format!(
                "DISCRETIZATION, {}, {}",
                float_literal(bounds.size[0]),
                float_literal(bounds.size[1])
            )
        };
        self.line(&format!("public {field} env = new {field}({dims});"));
        self.out.newline();

        self.line("public Sim(long seed) {");
        self.out.indent();
        self.line("super(seed);");
        self.out.outdent();
        self.line("}");
        self.out.newline();

        self.line("public void start() {");
        self.out.indent();
        self.line("super.start();");
        self.line("env.clear();");
        if let Some(main) = self.script.main_function() {
            for stmt in &main.body.stmts {
                if skipped_in_sim(stmt) {
                    continue;
                }
                self.print_statement(stmt);
                self.out.newline();
            }
        }
        self.out.outdent();
        self.line("}");
        self.out.newline();

        let helpers: Vec<_> = self
            .script
            .functions()
            .filter(|func| func.kind == FunctionKind::Plain && func.name != "main")
            .collect();
        for func in helpers {
            self.print_helper(func);
            self.out.newline();
        }

        self.line("public static void main(String[] args) {");
        self.out.indent();
        self.line("Sim sim = new Sim(System.currentTimeMillis());");
        self.line("sim.start();");
        self.line("for (int i = 0; i < NUM_TIMESTEPS; i++) {");
        self.out.indent();
        self.line("if (!sim.schedule.step(sim)) break;");
        self.out.outdent();
        self.line("}");
        self.line("sim.finish();");
        self.line("System.exit(0);");
        self.out.outdent();
        self.line("}");

        self.out.outdent();
        self.line("}");
    }

    fn print_helper(&mut self, func: &FunctionDeclaration) {
        let ret = java_type(&func.resolved_return);
        self.out.emit(&format!("public {ret} {}(", func.name));
        for (index, param) in func.params.iter().enumerate() {
            if index > 0 {
                self.out.emit(", ");
            }
            if let Some(id) = param.var.id {
                self.names.insert(id, param.var.name.clone());
            }
            self.out
                .emit(&format!("{} {}", java_type(&param.resolved), param.var.name));
        }
        self.out.emit(") ");
        self.print_block(&func.body);
        self.out.newline();
    }

    fn print_agent_class(&mut self, agent: &'a AgentDeclaration) {
        self.in_agent = true;

        self.line("import sim.engine.*;");
        self.line("import sim.util.*;");
        self.out.newline();

        self.line(&format!("public class {} implements Steppable {{", agent.name));
        self.out.indent();

        for member in &agent.members {
            let text = format!("public {} {};", java_type(&member.resolved), member.name);
            self.line(&text);
        }
        self.out.newline();

        // Constructor over all members, declaration order.
        self.out.emit(&format!("public {}(", agent.name));
        for (index, member) in agent.members.iter().enumerate() {
            if index > 0 {
                self.out.emit(", ");
            }
            self.out
                .emit(&format!("{} {}", java_type(&member.resolved), member.name));
        }
        self.line(") {");
        self.out.indent();
        for member in &agent.members {
            let text = format!("this.{m} = {m};", m = member.name);
            self.line(&text);
        }
        self.out.outdent();
        self.line("}");
        self.out.newline();

        self.out.emit(&format!("{} snapshot() {{", agent.name));
        self.out.indent();
        self.out.newline();
        self.out.emit(&format!("return new {}(", agent.name));
        for (index, member) in agent.members.iter().enumerate() {
            if index > 0 {
                self.out.emit(", ");
            }
            self.out.emit(&member.name.clone());
        }
        self.line(");");
        self.out.outdent();
        self.line("}");
        self.out.newline();

        let steps: Vec<_> = self
            .script
            .step_functions()
            .into_iter()
            .filter(|func| func.step_agent() == Some(agent.name.as_str()))
            .collect();
        let position = agent
            .position_member()
            .map(|member| member.name.clone())
            .unwrap_or_else(|| "pos".to_owned());

        self.line("public void step(SimState state) {");
        self.out.indent();
        self.line("Sim _sim = (Sim) state;");
        for func in &steps {
            // Each kernel reads a fresh pre-step snapshot while writing
            // `this`.
            let text = format!("_{}(_sim, this.snapshot());", func.name);
            self.line(&text);
        }
        let text = format!("_sim.env.setObjectLocation(this, this.{position});");
        self.line(&text);
        self.out.outdent();
        self.line("}");
        self.out.newline();

        for func in steps {
            self.print_step_method(agent, func);
            self.out.newline();
        }

        self.out.outdent();
        self.line("}");

        self.in_agent = false;
    }

    fn print_step_method(&mut self, agent: &AgentDeclaration, func: &FunctionDeclaration) {
        let in_name = "_in";
        if let Some(id) = func.in_param().and_then(|param| param.var.id) {
            self.names.insert(id, in_name.to_owned());
        }
        if let Some(id) = func.out_param().and_then(|param| param.var.id) {
            self.names.insert(id, "this".to_owned());
        }

        self.out.emit(&format!(
            "void _{}(Sim _sim, {} {in_name}) ",
            func.name, agent.name
        ));
        self.print_block(&func.body);
        self.out.newline();
    }

    fn print_ui_class(&mut self) {
        let portrayal = if self.is_3d() {
            "ContinuousPortrayal3D"
        } else {
            "ContinuousPortrayal2D"
        };
        let display = if self.is_3d() { "Display3D" } else { "Display2D" };

        self.line("import sim.display.*;");
        self.line("import sim.engine.*;");
        self.line("import sim.portrayal.continuous.*;");
        self.line("import javax.swing.*;");
        self.line("import java.awt.*;");
        self.out.newline();

        self.line("public class SimWithUI extends GUIState {");
        self.out.indent();
        self.line(&format!("public {display} display;"));
        self.line("public JFrame displayFrame;");
        self.line(&format!(
            "public {portrayal} envPortrayal = new {portrayal}();"
        ));
        self.out.newline();

        self.line("public SimWithUI() {");
        self.out.indent();
        self.line("super(new Sim(System.currentTimeMillis()));");
        self.out.outdent();
        self.line("}");
        self.out.newline();

        self.line("public SimWithUI(SimState state) {");
        self.out.indent();
        self.line("super(state);");
        self.out.outdent();
        self.line("}");
        self.out.newline();

        self.line("public static String getName() {");
        self.out.indent();
        self.line("return \"Simulation\";");
        self.out.outdent();
        self.line("}");
        self.out.newline();

        self.line("public void start() {");
        self.out.indent();
        self.line("super.start();");
        self.line("setupPortrayals();");
        self.out.outdent();
        self.line("}");
        self.out.newline();

        self.line("public void load(SimState state) {");
        self.out.indent();
        self.line("super.load(state);");
        self.line("setupPortrayals();");
        self.out.outdent();
        self.line("}");
        self.out.newline();

        self.line("public void setupPortrayals() {");
        self.out.indent();
        self.line("Sim sim = (Sim) state;");
        self.line("envPortrayal.setField(sim.env);");
        self.line("display.reset();");
        self.line("display.setBackdrop(Color.white);");
        self.line("display.repaint();");
        self.out.outdent();
        self.line("}");
        self.out.newline();

        self.line("public void init(Controller c) {");
        self.out.indent();
        self.line("super.init(c);");
        self.line(&format!("display = new {display}(600, 600, this);"));
        self.line("display.setClipping(false);");
        self.line("displayFrame = display.createFrame();");
        self.line("displayFrame.setTitle(\"Simulation\");");
        self.line("c.registerFrame(displayFrame);");
        self.line("displayFrame.setVisible(true);");
        self.line("display.attach(envPortrayal, \"Environment\");");
        self.out.outdent();
        self.line("}");
        self.out.newline();

        self.line("public static void main(String[] args) {");
        self.out.indent();
        self.line("SimWithUI ui = new SimWithUI();");
        self.line("Console c = new Console(ui);");
        self.line("c.setVisible(true);");
        self.out.outdent();
        self.line("}");

        self.out.outdent();
        self.line("}");
    }

    /// `add(Agent { ... })` in statement position: construct, place on the
    /// field, schedule.
    fn print_add_statement(&mut self, call: &CallExpression) {
        let Some(arg) = call.args.first() else {
            return;
        };
        let Some(agent) = arg
            .ty
            .agent_name()
            .and_then(|name| self.script.agent(name))
        else {
            return;
        };
        let agent_name = agent.name.clone();
        let position = agent
            .position_member()
            .map(|member| member.name.clone())
            .unwrap_or_else(|| "pos".to_owned());
        let (env, schedule) = if self.in_agent {
            ("_sim.env", "_sim.schedule")
        } else {
            ("env", "schedule")
        };

        let tmp = self.fresh("_a");
        self.out.emit(&format!("{agent_name} {tmp} = "));
        self.print_expression(arg);
        self.line(";");
        let text = format!("{env}.setObjectLocation({tmp}, {tmp}.{position});");
        self.line(&text);
        self.out
            .emit(&format!("{schedule}.scheduleRepeating({tmp});"));
    }
}

fn skipped_in_sim(stmt: &Statement) -> bool {
    matches!(stmt, Statement::Simulate(_))
}

impl TargetPrinter for MasonPrinter<'_> {
    fn out(&mut self) -> &mut Printer {
        &mut self.out
    }

    fn supports_overloads(&self) -> bool {
        true
    }

    fn print_type(&mut self, ty: &Type) {
        let text = java_type(ty);
        self.out.emit(&text);
    }

    fn print_var(&mut self, var: &Var) {
        let name = var
            .id
            .and_then(|id| self.names.get(&id).cloned())
            .unwrap_or_else(|| var.name.clone());
        self.out.emit(&name);
    }

    fn is_special_binary(&self, op: BinaryOp, left: &Expression, right: &Expression) -> bool {
        matches!(
            op,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div
        ) && (left.ty.is_vec() || right.ty.is_vec())
    }

    fn print_special_binary(&mut self, op: BinaryOp, left: &Expression, right: &Expression) {
        let vec_ty = if left.ty.is_vec() { &left.ty } else { &right.ty };
        let ctor = java_type(vec_ty);

        match (left.ty.is_vec(), right.ty.is_vec(), op) {
            (true, true, BinaryOp::Add) => {
                self.print_expression(left);
                self.out.emit(".add(");
                self.print_expression(right);
                self.out.emit(")");
            }
            (true, true, BinaryOp::Sub) => {
                self.print_expression(left);
                self.out.emit(".subtract(");
                self.print_expression(right);
                self.out.emit(")");
            }
            (true, false, BinaryOp::Mul) => {
                self.print_expression(left);
                self.out.emit(".multiply(");
                self.print_expression(right);
                self.out.emit(")");
            }
            (true, false, BinaryOp::Div) => {
                self.print_expression(left);
                self.out.emit(".multiply(1.0 / (");
                self.print_expression(right);
                self.out.emit("))");
            }
            (false, true, BinaryOp::Mul) => {
                self.print_expression(right);
                self.out.emit(".multiply(");
                self.print_expression(left);
                self.out.emit(")");
            }
            (true, false, BinaryOp::Add) | (true, false, BinaryOp::Sub) => {
                let method = if op == BinaryOp::Add { "add" } else { "subtract" };
                self.print_expression(left);
                self.out.emit(&format!(".{method}(new {ctor}("));
                self.print_expression(right);
                self.out.emit(", ");
                self.print_expression(right);
                self.out.emit("))");
            }
            (false, true, BinaryOp::Add) | (false, true, BinaryOp::Sub) => {
                let method = if op == BinaryOp::Add { "add" } else { "subtract" };
                self.out.emit(&format!("new {ctor}("));
                self.print_expression(left);
                self.out.emit(", ");
                self.print_expression(left);
                self.out.emit(&format!(").{method}("));
                self.print_expression(right);
                self.out.emit(")");
            }
            _ => {}
        }
    }

    fn print_call(&mut self, call: &CallExpression) {
        let name = call.name.as_str();

        if MATH_BUILTINS.contains(&name) {
            self.out.emit(&format!("Math.{name}("));
            self.print_args(call);
            self.out.emit(")");
            return;
        }

        match name {
            "dot" | "length" | "dist" | "normalize" => {
                self.out.emit(&format!("Util.{name}("));
                self.print_args(call);
                self.out.emit(")");
            }
            "random" => {
                let sim = self.sim_var();
                self.out.emit(&format!("Util.random({sim}.random, "));
                self.print_args(call);
                self.out.emit(")");
            }
            "save" => {
                let sim = self.sim_var();
                self.out.emit(&format!("Util.save({sim}.env.getAllObjects(), "));
                self.print_args(call);
                self.out.emit(")");
            }
            "add" => {
                // Handled in statement position.
                self.print_add_statement(call);
            }
            _ => {
                // User helpers live on the Sim class.
                if self.in_agent {
                    self.out.emit("_sim.");
                }
                self.out.emit(name);
                self.out.emit("(");
                self.print_args(call);
                self.out.emit(")");
            }
        }
    }

    fn print_agent_creation(&mut self, expr: &Expression) {
        let ExpressionKind::AgentCreation { name, members } = &expr.kind else {
            return;
        };
        let Some(agent) = self.script.agent(name) else {
            return;
        };
        let order: Vec<_> = agent.members.iter().map(|m| m.name.clone()).collect();

        self.out.emit(&format!("new {name}("));
        let mut first = true;
        for member_name in &order {
            let Some(init) = members.iter().find(|member| &member.name == member_name) else {
                continue;
            };
            if !first {
                self.out.emit(", ");
            }
            first = false;
            self.print_expression(&init.expr);
        }
        self.out.emit(")");
    }

    fn print_vector_init(&mut self, expr: &Expression) {
        let ExpressionKind::ArrayInit { exprs } = &expr.kind else {
            return;
        };
        let ctor = if exprs.len() == 3 {
            "Double3D"
        } else {
            "Double2D"
        };
        self.out.emit(&format!("new {ctor}("));
        for (index, component) in exprs.iter().enumerate() {
            if index > 0 {
                self.out.emit(", ");
            }
            self.print_expression(component);
        }
        self.out.emit(")");
    }

    fn print_new_array(&mut self, expr: &Expression) {
        let ExpressionKind::NewArray { len, .. } = &expr.kind else {
            return;
        };
        let elem = expr.ty.element().cloned().unwrap_or_default();
        self.out.emit(&format!("new {}[", java_type(&elem)));
        self.print_expression(len);
        self.out.emit("]");
    }

    fn print_statement(&mut self, stmt: &Statement) {
        if let Statement::Expression(expr) = stmt {
            if let ExpressionKind::Call(call) = &expr.kind {
                if call.name == "add" {
                    self.print_add_statement(call);
                    return;
                }
            }
        }
        print_statement_default(self, stmt);
    }

    fn print_assign(&mut self, left: &Expression, right: &Expression) {
        // Double2D/Double3D are immutable; a component write rebuilds the
        // vector.
        if let ExpressionKind::Member { expr: base, member: comp } = &left.kind {
            if base.ty.is_vec() && matches!(comp.as_str(), "x" | "y" | "z") {
                let ctor = java_type(&base.ty);
                let components: &[&str] = if base.ty == Type::Vec3 {
                    &["x", "y", "z"]
                } else {
                    &["x", "y"]
                };
                self.print_expression(base);
                self.out.emit(&format!(" = new {ctor}("));
                for (index, component) in components.iter().enumerate() {
                    if index > 0 {
                        self.out.emit(", ");
                    }
                    if component == comp {
                        self.print_expression(right);
                    } else {
                        self.print_expression(base);
                        self.out.emit(&format!(".{component}"));
                    }
                }
                self.out.emit(");");
                return;
            }
        }

        self.print_expression(left);
        self.out.emit(" = ");
        self.print_expression(right);
        self.out.emit(";");
    }

    fn print_expression(&mut self, expr: &Expression) {
        // Vector negation via multiply(-1).
        if let ExpressionKind::Unary {
            op: crate::parser::ast::UnaryOp::Minus,
            expr: inner,
        } = &expr.kind
        {
            if inner.ty.is_vec() {
                self.print_expression(inner);
                self.out.emit(".multiply(-1.0)");
                return;
            }
        }
        print_expression_default(self, expr);
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
                let elem = stmt.iterable.ty.element().cloned().unwrap_or_default();
                let agent_name = elem.agent_name().unwrap_or_default().to_owned();
                let position = self
                    .script
                    .agent(&agent_name)
                    .and_then(|agent| agent.position_member())
                    .map(|member| member.name.clone())
                    .unwrap_or_else(|| "pos".to_owned());

                let bag = self.fresh("_bag");
                let counter = self.fresh("_i");
                let var_name = stmt.var.name.clone();
                if let Some(id) = stmt.var.id {
                    self.names.insert(id, var_name.clone());
                }

                let receiver = call
                    .args
                    .first()
                    .and_then(|arg| arg.as_var())
                    .map(|var| {
                        var.id
                            .and_then(|id| self.names.get(&id).cloned())
                            .unwrap_or_else(|| var.name.clone())
                    })
                    .unwrap_or_default();

                self.out.emit(&format!(
                    "Bag {bag} = _sim.env.getNeighborsExactlyWithinDistance({receiver}.{position}, "
                ));
                if let Some(radius) = call.args.get(1) {
                    self.print_expression(radius);
                }
                self.line(");");

                self.line(&format!(
                    "for (int {counter} = 0; {counter} < {bag}.numObjs; {counter}++) {{"
                ));
                self.out.indent();
                let text =
                    format!("{agent_name} {var_name} = ({agent_name}) {bag}.objs[{counter}];");
                self.line(&text);
                let text = format!("if ({var_name} == this) continue;");
                self.line(&text);

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

                self.out.outdent();
                self.out.emit("}");
            }
            _ => {
                let elem = stmt.iterable.ty.element().cloned().unwrap_or_default();
                let var_name = stmt.var.name.clone();
                if let Some(id) = stmt.var.id {
                    self.names.insert(id, var_name.clone());
                }
                self.out
                    .emit(&format!("for ({} {var_name} : ", java_type(&elem)));
                self.print_expression(&stmt.iterable);
                self.out.emit(") ");
                self.print_statement(&stmt.body);
            }
        }
    }

    fn print_parfor(&mut self, _stmt: &ParforStatement) {
        // Agents schedule themselves; the population sweep belongs to the
        // MASON scheduler, not to generated code.
    }

    fn print_simulate(&mut self, _stmt: &SimulateStatement) {
        // The schedule loop lives in Sim.main.
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
    use std::collections::HashMap;

    fn analyzed(source: &str) -> Script {
        let tokens = Lexer::new(source).lex().expect("should lex");
        let mut script = parser::parse(tokens).expect("should parse");

        let mut builtins = BuiltinFunctions::default();
        register_builtin_functions(&mut builtins);
        let mut errors = ErrorStream::default();
        analyze(&mut script, &builtins, &Params::default(), &mut errors);
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        script
    }

    fn source() -> String {
        "environment { max: [10, 10], granularity: 1 }\n\
         agent Bird { position vec2 pos; float heat; }\n\
         step warm(Bird b in, Bird b2 out) {\n\
           float sum = 0.0;\n\
           for (Bird other : near(b, 2.0)) {\n\
             sum += other.heat;\n\
           }\n\
           b2.heat = sum;\n\
         }\n\
         function main() {\n\
           add(Bird { pos: [1.0, 2.0], heat: 0.0 });\n\
           simulate 10 { warm }\n\
         }"
        .to_owned()
    }

    #[test]
    fn test_rejects_floats() {
        let script = analyzed(&source());
        let mut values = HashMap::new();
        values.insert("use_float".to_owned(), "true".to_owned());
        let ctx = BackendContext::new(Config::new(values));
        let err = MasonBackend.generate(&script, &ctx).unwrap_err();
        assert!(err.message.contains("Floats are not supported"));
    }

    #[test]
    fn test_agent_class_shape() {
        let script = analyzed(&source());
        let ctx = BackendContext::new(Config::default());
        let files = MasonBackend.generate(&script, &ctx).expect("should generate");

        let agent = files.file("Bird.java").expect("agent class");
        assert!(agent.contains("public class Bird implements Steppable {"));
        assert!(agent.contains("public Double2D pos;"));
        assert!(agent.contains("public double heat;"));
        assert!(agent.contains("_warm(_sim, this.snapshot());"));
        assert!(agent.contains("void _warm(Sim _sim, Bird _in) {"));
        // Reads see the snapshot, writes go to `this`.
        assert!(agent.contains("this.heat = sum;"));
        assert!(agent.contains("if (other == this) continue;"));
        assert!(agent.contains("getNeighborsExactlyWithinDistance(_in.pos, 2.0)"));
        assert!(agent.contains("_sim.env.setObjectLocation(this, this.pos);"));
    }

    #[test]
    fn test_sim_class_seeds_and_loops() {
        let script = analyzed(&source());
        let ctx = BackendContext::new(Config::default());
        let files = MasonBackend.generate(&script, &ctx).expect("should generate");

        let sim = files.file("Sim.java").expect("sim class");
        assert!(sim.contains("public class Sim extends SimState {"));
        assert!(sim.contains("public static final int NUM_TIMESTEPS = 10;"));
        assert!(sim.contains("Bird _a0 = new Bird(new Double2D(1.0, 2.0), 0.0);"));
        assert!(sim.contains("env.setObjectLocation(_a0, _a0.pos);"));
        assert!(sim.contains("schedule.scheduleRepeating(_a0);"));
        assert!(sim.contains("if (!sim.schedule.step(sim)) break;"));
    }

    #[test]
    fn test_run_script_visualize() {
        let script = analyzed(&source());

        let ctx = BackendContext::new(Config::default());
        let files = MasonBackend.generate(&script, &ctx).expect("should generate");
        assert!(files.file("run.sh").expect("run script").contains("java Sim"));

        let mut values = HashMap::new();
        values.insert("visualize".to_owned(), "true".to_owned());
        let ctx = BackendContext::new(Config::new(values));
        let files = MasonBackend.generate(&script, &ctx).expect("should generate");
        assert!(files
            .file("run.sh")
            .expect("run script")
            .contains("java SimWithUI"));
    }
}
