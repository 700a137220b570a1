use std::fmt::Display;

/// Semantic type of an expression or declaration. Types are value-equal;
/// two agent types are equal iff their names match.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Type {
    #[default]
    Invalid,
    Void,
    Bool,
    Int32,
    Float32,
    String,
    Vec2,
    Vec3,
    Agent(String),
    Array(Box<Type>),
}

impl Type {
    pub fn array_of(elem: Type) -> Type {
        Type::Array(Box::new(elem))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Type::Int32 | Type::Float32)
    }

    pub fn is_vec(&self) -> bool {
        matches!(self, Type::Vec2 | Type::Vec3)
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, Type::Agent(_))
    }

    pub fn agent_name(&self) -> Option<&str> {
        match self {
            Type::Agent(name) => Some(name),
            _ => None,
        }
    }

    pub fn element(&self) -> Option<&Type> {
        match self {
            Type::Array(elem) => Some(elem),
            _ => None,
        }
    }

    /// Number of scalar components of a vector type.
    pub fn vec_len(&self) -> Option<usize> {
        match self {
            Type::Vec2 => Some(2),
            Type::Vec3 => Some(3),
            _ => None,
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Invalid => f.write_str("<invalid>"),
            Type::Void => f.write_str("void"),
            Type::Bool => f.write_str("bool"),
            Type::Int32 => f.write_str("int"),
            Type::Float32 => f.write_str("float"),
            Type::String => f.write_str("string"),
            Type::Vec2 => f.write_str("vec2"),
            Type::Vec3 => f.write_str("vec3"),
            Type::Agent(name) => f.write_str(name),
            Type::Array(elem) => write!(f, "{elem}[]"),
        }
    }
}

/// A compile-time constant produced by config evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Vec2(f64, f64),
    Vec3(f64, f64, f64),
}

impl Value {
    pub fn type_of(&self) -> Type {
        match self {
            Value::Bool(_) => Type::Bool,
            Value::Int(_) => Type::Int32,
            Value::Float(_) => Type::Float32,
            Value::Str(_) => Type::String,
            Value::Vec2(..) => Type::Vec2,
            Value::Vec3(..) => Type::Vec3,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    /// Numeric value widened to float.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Vector components padded with zero to three dimensions.
    pub fn extend_to_vec3(&self) -> Option<[f64; 3]> {
        match self {
            Value::Vec2(x, y) => Some([*x, *y, 0.0]),
            Value::Vec3(x, y, z) => Some([*x, *y, *z]),
            _ => None,
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(value) => write!(f, "{value}"),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Str(value) => write!(f, "\"{value}\""),
            Value::Vec2(x, y) => write!(f, "[{x}, {y}]"),
            Value::Vec3(x, y, z) => write!(f, "[{x}, {y}, {z}]"),
        }
    }
}
