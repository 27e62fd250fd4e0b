//! Backend provider traits and query-layer errors.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::expand::ExpandError;
use crate::expression::{Expression, ExpressionError, Value};
use crate::query::source::SequenceSource;

/// Errors surfaced by query construction and execution.
#[derive(Error, Debug)]
pub enum QueryError {
    /// The backend cannot translate (part of) a tree.
    ///
    /// Execution-time signals carry the subtree the backend choked on;
    /// translation-time signals (raised while building a query) carry none.
    #[error("unsupported translation: {message}")]
    UnsupportedTranslation {
        message: String,
        subtree: Option<Box<Expression>>,
    },

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Expand(#[from] ExpandError),

    #[error("backend error: {0}")]
    Backend(String),
}

impl QueryError {
    /// Translation-time unsupported-operation signal.
    pub fn unsupported(message: impl Into<String>) -> Self {
        QueryError::UnsupportedTranslation {
            message: message.into(),
            subtree: None,
        }
    }

    /// Execution-time unsupported-operation signal carrying the subtree the
    /// backend could not translate.
    pub fn unsupported_node(message: impl Into<String>, subtree: Expression) -> Self {
        QueryError::UnsupportedTranslation {
            message: message.into(),
            subtree: Some(Box::new(subtree)),
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, QueryError::UnsupportedTranslation { .. })
    }
}

impl From<ExpressionError> for QueryError {
    fn from(err: ExpressionError) -> Self {
        QueryError::Expand(ExpandError::Expression(err))
    }
}

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;

/// A sequence-query backend.
///
/// Implementations may raise [`QueryError::UnsupportedTranslation`] either
/// inside `create_query` (translation time) or inside `execute`/`iterate`
/// (first-evaluation time); only the latter form is ever recovered from.
pub trait QueryProvider: Send + Sync {
    /// Build a new sequence source from a tree.
    fn create_query(self: Arc<Self>, tree: Expression) -> QueryResult<SequenceSource>;

    /// Execute a tree to a scalar value.
    fn execute(&self, tree: &Expression) -> QueryResult<Value>;

    /// Execute a sequence tree, materializing its rows.
    fn iterate(&self, tree: &Expression) -> QueryResult<Vec<Value>>;

    /// Probe for the asynchronous execution capability.
    fn as_async(&self) -> Option<&dyn AsyncQueryProvider> {
        None
    }

    /// Whether this provider rewrites trees before delegating them.
    fn is_rewritable(&self) -> bool {
        false
    }
}

/// Optional asynchronous execution capability of a provider.
#[async_trait]
pub trait AsyncQueryProvider: Send + Sync {
    /// Execute a tree to a scalar value, suspending only at the backend
    /// boundary. The cancellation token is forwarded to the backend and
    /// never inspected by intermediate layers.
    async fn execute_async(
        &self,
        tree: &Expression,
        cancel: CancellationToken,
    ) -> QueryResult<Value>;
}
