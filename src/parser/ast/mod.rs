//! AST definitions for ABL.
//!
//! Nodes are tagged enums owning their children; traversal is always an
//! exhaustive `match`. Expressions carry a [`Type`] slot and every node a
//! [`Span`]; both are filled in by semantic analysis.
mod declaration;
mod expression;
mod statement;

pub use self::declaration::*;
pub use self::expression::*;
pub use self::statement::*;

use crate::lexer::Span;

/// Root node of a parsed script.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Script {
    pub decls: Vec<Declaration>,
    /// Folded simulation entry (step count and ordered step functions),
    /// filled in by analysis from either the top-level `simulate`
    /// declaration or the `simulate` statement inside `main`.
    pub sim: Option<SimulationPlan>,
}

/// The evaluated simulation entry of a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationPlan {
    pub steps: i64,
    pub step_fns: Vec<String>,
}

impl Script {
    pub fn environment(&self) -> Option<&EnvironmentDeclaration> {
        self.decls.iter().find_map(|decl| match decl {
            Declaration::Environment(env) => Some(env),
            _ => None,
        })
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentDeclaration> {
        self.decls.iter().filter_map(|decl| match decl {
            Declaration::Agent(agent) => Some(agent),
            _ => None,
        })
    }

    pub fn agent(&self, name: &str) -> Option<&AgentDeclaration> {
        self.agents().find(|agent| agent.name == name)
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionDeclaration> {
        self.decls.iter().filter_map(|decl| match decl {
            Declaration::Function(func) => Some(func),
            _ => None,
        })
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDeclaration> {
        self.functions().find(|func| func.name == name)
    }

    pub fn consts(&self) -> impl Iterator<Item = &ConstDeclaration> {
        self.decls.iter().filter_map(|decl| match decl {
            Declaration::Const(decl) => Some(decl),
            _ => None,
        })
    }

    pub fn main_function(&self) -> Option<&FunctionDeclaration> {
        self.function("main")
    }

    /// Step functions in the order they run within a tick, following the
    /// simulation plan.
    pub fn step_functions(&self) -> Vec<&FunctionDeclaration> {
        let Some(sim) = &self.sim else {
            return vec![];
        };
        sim.step_fns
            .iter()
            .filter_map(|name| self.function(name))
            .collect()
    }

    pub fn span(&self) -> Span {
        Span::default()
    }
}
