//! Static type descriptions for expression trees.

use std::fmt;
use std::sync::Arc;

/// Scalar data types that can appear as element or field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Boolean,
    Int32,
    Int64,
    Varchar,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Boolean => write!(f, "Boolean"),
            DataType::Int32 => write!(f, "Int32"),
            DataType::Int64 => write!(f, "Int64"),
            DataType::Varchar => write!(f, "Varchar"),
        }
    }
}

/// A named record type with a fixed field list.
///
/// Entity types are shared via `Arc` so that records, sequence sources and
/// expression nodes can refer to the same description without copying it.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityType {
    pub name: String,
    pub fields: Vec<(String, Type)>,
}

impl EntityType {
    pub fn new(name: impl Into<String>, fields: Vec<(String, Type)>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fields,
        })
    }

    /// Index of a field by name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(n, _)| n == name)
    }

    /// Type of a field by name.
    pub fn field_type(&self, name: &str) -> Option<&Type> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ty)| ty)
    }
}

/// Parameter and return types of a lambda.
#[derive(Debug, Clone, PartialEq)]
pub struct Signature {
    pub params: Vec<Type>,
    pub ret: Type,
}

impl Signature {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self { params, ret }
    }

    /// Signature of a unary predicate over `elem`.
    pub fn predicate(elem: Type) -> Self {
        Self::new(vec![elem], Type::boolean())
    }
}

/// Static result type of an expression node.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    /// Scalar value
    Scalar(DataType),

    /// Entity record
    Entity(Arc<EntityType>),

    /// Sequence of elements
    Sequence(Box<Type>),

    /// Quoted expression value carrying a lambda of the given signature
    Expr(Box<Signature>),

    /// Directly-callable lambda of the given signature
    Func(Box<Signature>),
}

impl Type {
    pub fn boolean() -> Self {
        Type::Scalar(DataType::Boolean)
    }

    pub fn int32() -> Self {
        Type::Scalar(DataType::Int32)
    }

    pub fn int64() -> Self {
        Type::Scalar(DataType::Int64)
    }

    pub fn varchar() -> Self {
        Type::Scalar(DataType::Varchar)
    }

    pub fn sequence(elem: Type) -> Self {
        Type::Sequence(Box::new(elem))
    }

    pub fn expr(sig: Signature) -> Self {
        Type::Expr(Box::new(sig))
    }

    pub fn func(sig: Signature) -> Self {
        Type::Func(Box::new(sig))
    }

    /// Element type when this is a sequence type.
    pub fn element_type(&self) -> Option<&Type> {
        match self {
            Type::Sequence(elem) => Some(elem),
            _ => None,
        }
    }

    /// Signature when this is an expression- or function-valued type.
    pub fn signature(&self) -> Option<&Signature> {
        match self {
            Type::Expr(sig) | Type::Func(sig) => Some(sig),
            _ => None,
        }
    }

    /// Whether this is a scalar (primitive) type.
    pub fn is_scalar(&self) -> bool {
        matches!(self, Type::Scalar(_))
    }

    pub fn is_boolean(&self) -> bool {
        matches!(self, Type::Scalar(DataType::Boolean))
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Scalar(dt) => write!(f, "{}", dt),
            Type::Entity(et) => write!(f, "{}", et.name),
            Type::Sequence(elem) => write!(f, "Sequence<{}>", elem),
            Type::Expr(sig) => {
                write!(f, "Expr<(")?;
                for (i, p) in sig.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") -> {}>", sig.ret)
            }
            Type::Func(sig) => {
                write!(f, "(")?;
                for (i, p) in sig.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") -> {}", sig.ret)
            }
        }
    }
}
