//! Error types for the expander.

use thiserror::Error;

use crate::expression::ExpressionError;

/// Errors raised while expanding an expression tree.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpandError {
    /// A parameter identifier was bound twice in an overlapping scope chain.
    #[error(
        "Invoke cannot be applied recursively (parameter `{parameter}`) - \
         bind the inner expression to a temporary first"
    )]
    RecursiveInvocation { parameter: String },

    /// An invocation target did not reduce to a lambda literal.
    #[error("invocation target does not reduce to a lambda literal: {found}")]
    InvocationTarget { found: String },

    /// A capture environment member could not be resolved to a value.
    #[error("cannot resolve captured member `{member}` on {ty}")]
    CaptureResolution { member: String, ty: String },

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Result type for expansion
pub type ExpandResult<T> = Result<T, ExpandError>;
