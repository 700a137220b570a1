use std::collections::HashMap;

use super::Type;

/// Parameter pattern of a builtin overload. `Agent` unifies with any agent
/// type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltinParam {
    Exact(Type),
    Agent,
}

impl BuiltinParam {
    fn matches(&self, arg: &Type) -> bool {
        match self {
            BuiltinParam::Exact(ty) => ty == arg,
            BuiltinParam::Agent => arg.is_agent(),
        }
    }
}

/// Return pattern of a builtin overload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuiltinReturn {
    Exact(Type),
    /// An array of the agent type passed as the first argument (`near`).
    AgentArray,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltinOverload {
    pub params: Vec<BuiltinParam>,
    pub ret: BuiltinReturn,
    /// Name emitted by backends whose target language has no overloading.
    pub target: String,
}

impl BuiltinOverload {
    /// Return type for a matching argument list.
    pub fn return_type(&self, args: &[Type]) -> Type {
        match &self.ret {
            BuiltinReturn::Exact(ty) => ty.clone(),
            BuiltinReturn::AgentArray => args
                .first()
                .filter(|arg| arg.is_agent())
                .map(|arg| Type::array_of(arg.clone()))
                .unwrap_or(Type::Invalid),
        }
    }
}

/// Registry of builtin functions, seeded by the driver before analysis.
#[derive(Debug, Clone, Default)]
pub struct BuiltinFunctions {
    map: HashMap<String, Vec<BuiltinOverload>>,
}

impl BuiltinFunctions {
    /// Register a single-overload builtin printed under its own name.
    pub fn add(&mut self, name: &str, params: Vec<BuiltinParam>, ret: BuiltinReturn) {
        self.add_named(name, name, params, ret);
    }

    /// Register an overload carrying a mangled target name.
    pub fn add_named(
        &mut self,
        name: &str,
        target: &str,
        params: Vec<BuiltinParam>,
        ret: BuiltinReturn,
    ) {
        self.map
            .entry(name.to_owned())
            .or_default()
            .push(BuiltinOverload {
                params,
                ret,
                target: target.to_owned(),
            });
    }

    pub fn contains(&self, name: &str) -> bool {
        self.map.contains_key(name)
    }

    /// Pick the unique overload whose parameters match the argument types
    /// exactly.
    pub fn resolve(&self, name: &str, args: &[Type]) -> Option<&BuiltinOverload> {
        let overloads = self.map.get(name)?;
        overloads.iter().find(|overload| {
            overload.params.len() == args.len()
                && overload
                    .params
                    .iter()
                    .zip(args)
                    .all(|(param, arg)| param.matches(arg))
        })
    }
}

fn param(ty: Type) -> BuiltinParam {
    BuiltinParam::Exact(ty)
}

fn ret(ty: Type) -> BuiltinReturn {
    BuiltinReturn::Exact(ty)
}

/// The builtin table of the language: vector math, scalar math, random
/// numbers, and the agent operations `add`, `near` and `save`.
pub fn register_builtin_functions(funcs: &mut BuiltinFunctions) {
    funcs.add_named(
        "dot",
        "dot_float2",
        vec![param(Type::Vec2), param(Type::Vec2)],
        ret(Type::Float32),
    );
    funcs.add_named(
        "dot",
        "dot_float3",
        vec![param(Type::Vec3), param(Type::Vec3)],
        ret(Type::Float32),
    );
    funcs.add_named(
        "length",
        "length_float2",
        vec![param(Type::Vec2)],
        ret(Type::Float32),
    );
    funcs.add_named(
        "length",
        "length_float3",
        vec![param(Type::Vec3)],
        ret(Type::Float32),
    );
    funcs.add_named(
        "dist",
        "dist_float2",
        vec![param(Type::Vec2), param(Type::Vec2)],
        ret(Type::Float32),
    );
    funcs.add_named(
        "dist",
        "dist_float3",
        vec![param(Type::Vec3), param(Type::Vec3)],
        ret(Type::Float32),
    );
    funcs.add_named(
        "normalize",
        "normalize_float2",
        vec![param(Type::Vec2)],
        ret(Type::Vec2),
    );
    funcs.add_named(
        "normalize",
        "normalize_float3",
        vec![param(Type::Vec3)],
        ret(Type::Vec3),
    );
    funcs.add_named(
        "random",
        "random_float",
        vec![param(Type::Float32), param(Type::Float32)],
        ret(Type::Float32),
    );
    funcs.add_named(
        "random",
        "random_float2",
        vec![param(Type::Vec2), param(Type::Vec2)],
        ret(Type::Vec2),
    );
    funcs.add_named(
        "random",
        "random_float3",
        vec![param(Type::Vec3), param(Type::Vec3)],
        ret(Type::Vec3),
    );

    for name in [
        "sin", "cos", "tan", "sinh", "cosh", "tanh", "asin", "acos", "atan", "exp", "log",
        "sqrt", "round",
    ] {
        funcs.add(name, vec![param(Type::Float32)], ret(Type::Float32));
    }

    // Agent specific functions
    funcs.add("add", vec![BuiltinParam::Agent], ret(Type::Void));
    funcs.add(
        "near",
        vec![BuiltinParam::Agent, param(Type::Float32)],
        BuiltinReturn::AgentArray,
    );
    funcs.add("save", vec![param(Type::String)], ret(Type::Void));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> BuiltinFunctions {
        let mut funcs = BuiltinFunctions::default();
        register_builtin_functions(&mut funcs);
        funcs
    }

    #[test]
    fn test_resolve_picks_vec2_overload() {
        let funcs = table();
        let overload = funcs
            .resolve("dot", &[Type::Vec2, Type::Vec2])
            .expect("should resolve");
        assert_eq!(overload.target, "dot_float2");
    }

    #[test]
    fn test_resolve_picks_vec3_overload() {
        let funcs = table();
        let overload = funcs
            .resolve("dot", &[Type::Vec3, Type::Vec3])
            .expect("should resolve");
        assert_eq!(overload.target, "dot_float3");
    }

    #[test]
    fn test_resolve_rejects_mixed_vectors() {
        let funcs = table();
        assert!(funcs.resolve("dot", &[Type::Vec2, Type::Vec3]).is_none());
    }

    #[test]
    fn test_near_returns_agent_array() {
        let funcs = table();
        let ant = Type::Agent("Ant".into());
        let overload = funcs
            .resolve("near", &[ant.clone(), Type::Float32])
            .expect("should resolve");
        assert_eq!(
            overload.return_type(&[ant.clone(), Type::Float32]),
            Type::array_of(ant)
        );
    }
}
