use std::collections::BTreeSet;

use super::{Block, Expression, SimulateStatement, TypeName, Var};
use crate::analysis::{Type, Value};
use crate::lexer::Span;

#[derive(Debug, Clone, PartialEq)]
pub enum Declaration {
    Environment(EnvironmentDeclaration),
    Agent(AgentDeclaration),
    Const(ConstDeclaration),
    Function(FunctionDeclaration),
    /// Top-level `simulate N { fs }`, the entry shorthand for scripts
    /// without a `main` function.
    Simulate(SimulateStatement),
}

/// Folded environment extents. `dim` is 2 or 3; for 2D scripts the z
/// components are zero.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnvironmentBounds {
    pub dim: usize,
    pub min: [f64; 3],
    pub max: [f64; 3],
    pub size: [f64; 3],
    pub granularity: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnvironmentDeclaration {
    pub min: Option<Expression>,
    pub max: Expression,
    pub granularity: Option<Expression>,
    /// Filled in by config evaluation.
    pub bounds: Option<EnvironmentBounds>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentMember {
    pub is_position: bool,
    pub ty: TypeName,
    pub name: String,
    /// Resolved member type, filled in by analysis.
    pub resolved: Type,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentDeclaration {
    pub name: String,
    pub members: Vec<AgentMember>,
    pub span: Span,
}

impl AgentDeclaration {
    pub fn position_member(&self) -> Option<&AgentMember> {
        self.members.iter().find(|member| member.is_position)
    }

    pub fn member(&self, name: &str) -> Option<&AgentMember> {
        self.members.iter().find(|member| member.name == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstDeclaration {
    pub var: Var,
    pub expr: Expression,
    /// Folded constant value, filled in by config evaluation (after any
    /// `-P name=value` override).
    pub value: Option<Value>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// A helper function, or `main`.
    Plain,
    /// A step kernel (`step f(A a in, A a out)` or `interact function`),
    /// applied once per tick to every agent of its type.
    Step,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamRole {
    #[default]
    None,
    In,
    Out,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub ty: TypeName,
    pub var: Var,
    pub role: ParamRole,
    /// Resolved parameter type, filled in by analysis.
    pub resolved: Type,
    pub span: Span,
}

/// Per-function facts recorded by analysis and consumed by the backends.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FunctionInfo {
    /// Uses `random` directly or calls a function that does (recursive
    /// closure over the call graph).
    pub uses_rng: bool,
    pub uses_near: bool,
    /// Members of the neighbor agent read inside `near` loops; these make
    /// up the FLAME message payload.
    pub near_members: BTreeSet<String>,
    /// Agent types passed to `add`.
    pub added_agents: Vec<String>,
    /// Names of user functions called directly.
    pub calls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub kind: FunctionKind,
    pub name: String,
    pub params: Vec<Param>,
    pub return_type: Option<TypeName>,
    /// Resolved return type, `Void` when no annotation is present.
    pub resolved_return: Type,
    pub body: Block,
    pub info: FunctionInfo,
    pub span: Span,
}

impl FunctionDeclaration {
    pub fn in_param(&self) -> Option<&Param> {
        self.params.iter().find(|param| param.role == ParamRole::In)
    }

    pub fn out_param(&self) -> Option<&Param> {
        self.params.iter().find(|param| param.role == ParamRole::Out)
    }

    /// For step kernels, the agent type name they update.
    pub fn step_agent(&self) -> Option<&str> {
        if self.kind != FunctionKind::Step {
            return None;
        }
        self.in_param().map(|param| param.ty.name.as_str())
    }
}
