//! Runtime values carried by constant nodes and produced by execution.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::expression::expr::Expression;
use crate::expression::types::{DataType, EntityType, Type};
use crate::query::source::SequenceSource;

/// Name prefix reserved for synthesized capture environment types.
///
/// Only member accesses into a type carrying this prefix are collapsed by the
/// expander; ordinary entity members are never touched.
pub const CAPTURE_TYPE_PREFIX: &str = "__capture#";

static NEXT_CAPTURE_ID: AtomicU64 = AtomicU64::new(0);

/// An entity instance. Field order matches the entity type's field list.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub ty: Arc<EntityType>,
    pub fields: Vec<Value>,
}

impl Record {
    pub fn new(ty: Arc<EntityType>, fields: Vec<Value>) -> Arc<Self> {
        Arc::new(Self { ty, fields })
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.ty.field_index(name).map(|i| &self.fields[i])
    }
}

/// A materialized, finite collection with a known element type.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceValue {
    pub elem: Type,
    pub items: Vec<Value>,
}

impl SequenceValue {
    pub fn new(elem: Type, items: Vec<Value>) -> Self {
        Self { elem, items }
    }
}

/// A sequence source embedded into a tree as a sub-query constant.
#[derive(Clone)]
pub struct QueryValue {
    pub source: Box<SequenceSource>,
}

impl QueryValue {
    pub fn new(source: SequenceSource) -> Self {
        Self {
            source: Box::new(source),
        }
    }
}

impl PartialEq for QueryValue {
    fn eq(&self, other: &Self) -> bool {
        self.source.tree() == other.source.tree()
            && self.source.element_type() == other.source.element_type()
            && Arc::ptr_eq(self.source.provider(), other.source.provider())
    }
}

impl fmt::Debug for QueryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryValue")
            .field("tree", self.source.tree())
            .field("elem", self.source.element_type())
            .finish_non_exhaustive()
    }
}

/// A synthesized environment holding values captured from the caller.
///
/// The environment's entity type is generated with the reserved
/// [`CAPTURE_TYPE_PREFIX`] so the expander can tell capture storage apart
/// from domain data.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureEnv {
    pub ty: Arc<EntityType>,
    pub values: Vec<Value>,
}

impl CaptureEnv {
    /// Build a fresh environment from named captured values.
    pub fn synthesized(fields: Vec<(String, Value)>) -> Arc<Self> {
        let id = NEXT_CAPTURE_ID.fetch_add(1, Ordering::Relaxed);
        let mut typed = Vec::with_capacity(fields.len());
        let mut values = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            let ty = value.value_type().unwrap_or(Type::boolean());
            typed.push((name, ty));
            values.push(value);
        }
        Arc::new(Self {
            ty: EntityType::new(format!("{}{}", CAPTURE_TYPE_PREFIX, id), typed),
            values,
        })
    }

    pub fn get(&self, member: &str) -> Option<&Value> {
        self.ty.field_index(member).map(|i| &self.values[i])
    }

    /// Whether this environment's type carries the reserved capture prefix.
    pub fn is_capture_type(&self) -> bool {
        self.ty.name.starts_with(CAPTURE_TYPE_PREFIX)
    }
}

/// Values that can be held by constants and produced by execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int32(i32),
    Int64(i64),
    String(String),

    /// Entity instance
    Record(Arc<Record>),

    /// Materialized collection
    Sequence(SequenceValue),

    /// Quoted expression value (storage form of a composed predicate)
    Expr(Arc<Expression>),

    /// Embedded sequence source
    Query(QueryValue),

    /// Synthesized capture environment
    Env(Arc<CaptureEnv>),
}

impl Value {
    /// Static type of this value. `Null` carries no type of its own.
    pub fn value_type(&self) -> Option<Type> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(Type::Scalar(DataType::Boolean)),
            Value::Int32(_) => Some(Type::Scalar(DataType::Int32)),
            Value::Int64(_) => Some(Type::Scalar(DataType::Int64)),
            Value::String(_) => Some(Type::Scalar(DataType::Varchar)),
            Value::Record(r) => Some(Type::Entity(r.ty.clone())),
            Value::Sequence(s) => Some(Type::sequence(s.elem.clone())),
            Value::Expr(e) => match e.as_ref() {
                Expression::Lambda(l) => Some(Type::expr(l.signature())),
                _ => None,
            },
            Value::Query(q) => Some(Type::sequence(q.source.element_type().clone())),
            Value::Env(env) => Some(Type::Entity(env.ty.clone())),
        }
    }

    /// Check if this value is compatible with the given type.
    pub fn is_compatible_with(&self, ty: &Type) -> bool {
        match self {
            Value::Null => true,
            _ => self.value_type().as_ref() == Some(ty),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int32(i) => write!(f, "{}", i),
            Value::Int64(i) => write!(f, "{}", i),
            Value::String(s) => write!(f, "'{}'", s),
            Value::Record(r) => write!(f, "{}{{..}}", r.ty.name),
            Value::Sequence(s) => write!(f, "[{} x {}]", s.items.len(), s.elem),
            Value::Expr(e) => write!(f, "expr({})", e),
            Value::Query(q) => write!(f, "query<{}>", q.source.element_type()),
            Value::Env(env) => write!(f, "{}", env.ty.name),
        }
    }
}
