//! Error types for expression construction and composition.

use thiserror::Error;

/// Errors raised while building or composing expression trees.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("unknown member `{member}` on type {ty}")]
    UnknownMember { member: String, ty: String },

    #[error("member access target is not an entity type: {ty}")]
    NotAnEntity { ty: String },

    #[error("expected a lambda literal, found a value of type {ty}")]
    NotALambda { ty: String },

    #[error("invocation target is not expression- or function-valued: {ty}")]
    InvalidInvocationTarget { ty: String },

    #[error("invocation expects {expected} arguments, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("constant value carries no static type; use an explicitly typed constant")]
    UntypedConstant,

    #[error("invalid predicate: {reason}")]
    InvalidPredicate { reason: String },
}

/// Result type for expression construction
pub type ExpressionResult<T> = Result<T, ExpressionError>;
