//! Expression trees for composable queries.
//!
//! This module provides:
//! - Typed, immutable expression AST nodes
//! - Runtime values, including quoted expressions and embedded sub-queries
//! - Operators and static result typing
//! - The composed-predicate builder

pub mod error;
pub mod expr;
pub mod operator;
pub mod predicate;
pub mod types;
pub mod value;

pub use error::{ExpressionError, ExpressionResult};
pub use expr::{
    call_names, BinaryExpr, Constant, Expression, Invocation, Lambda, Member, MethodCall, ParamId,
    Parameter, UnaryExpr,
};
pub use operator::{BinaryOperator, UnaryOperator};
pub use predicate::{predicate, PredicateBuilder};
pub use types::{DataType, EntityType, Signature, Type};
pub use value::{CaptureEnv, QueryValue, Record, SequenceValue, Value, CAPTURE_TYPE_PREFIX};
