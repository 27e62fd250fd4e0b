//! The rewritable query wrapper.
//!
//! Wrapping a source decorates its provider so that every query built from
//! it and every execution request is expanded (and passed through the
//! caller-supplied optimizer) just before the inner provider sees the tree.
//! Wrapping is idempotent and transitive: derived queries stay wrapped.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::expand::expand;
use crate::expression::{Expression, Value};
use crate::query::fallback;
use crate::query::provider::{AsyncQueryProvider, QueryError, QueryProvider, QueryResult};
use crate::query::source::SequenceSource;

/// Caller-supplied optimizer pass applied once, after expansion.
pub type QueryOptimizer = Arc<dyn Fn(Expression) -> Expression + Send + Sync>;

/// The optimizer used when none is supplied.
pub fn identity_optimizer() -> QueryOptimizer {
    Arc::new(|tree| tree)
}

/// Make a source rewritable.
///
/// Wrapping an already-wrapped source yields an equivalent single layer,
/// never nested layers.
pub fn as_expandable(source: &SequenceSource) -> SequenceSource {
    as_expandable_with(source, identity_optimizer())
}

/// As [`as_expandable`], with a caller-supplied optimizer pass.
pub fn as_expandable_with(source: &SequenceSource, optimizer: QueryOptimizer) -> SequenceSource {
    if source.is_rewritable() {
        return source.clone();
    }
    SequenceSource::new(
        source.tree().clone(),
        Arc::new(ExpandableProvider {
            inner: source.provider().clone(),
            optimizer,
        }),
        source.element_type().clone(),
    )
}

/// Provider decorator applying `optimize(expand(tree))` before delegation.
///
/// Holds no mutable state: just the inner provider and the optimizer
/// reference, so it is as safe for concurrent use as the inner provider.
pub struct ExpandableProvider {
    inner: Arc<dyn QueryProvider>,
    optimizer: QueryOptimizer,
}

impl ExpandableProvider {
    fn rewrite(&self, tree: &Expression) -> QueryResult<Expression> {
        let expanded = expand(tree)?;
        let optimized = (self.optimizer)(expanded);
        debug!("rewrote query tree: {}", optimized);
        Ok(optimized)
    }
}

impl QueryProvider for ExpandableProvider {
    fn create_query(self: Arc<Self>, tree: Expression) -> QueryResult<SequenceSource> {
        let rewritten = self.rewrite(&tree)?;
        let derived = self.inner.clone().create_query(rewritten)?;
        Ok(SequenceSource::new(
            derived.tree().clone(),
            Arc::new(ExpandableProvider {
                inner: derived.provider().clone(),
                optimizer: self.optimizer.clone(),
            }),
            derived.element_type().clone(),
        ))
    }

    fn execute(&self, tree: &Expression) -> QueryResult<Value> {
        let rewritten = self.rewrite(tree)?;
        match self.inner.execute(&rewritten) {
            Err(err @ QueryError::UnsupportedTranslation { .. }) => {
                fallback::recover_scalar(self.inner.as_ref(), &rewritten, err)
            }
            other => other,
        }
    }

    fn iterate(&self, tree: &Expression) -> QueryResult<Vec<Value>> {
        let rewritten = self.rewrite(tree)?;
        match self.inner.iterate(&rewritten) {
            Err(err @ QueryError::UnsupportedTranslation { .. }) => {
                fallback::recover_sequence(self.inner.as_ref(), &rewritten, err)
            }
            other => other,
        }
    }

    fn as_async(&self) -> Option<&dyn AsyncQueryProvider> {
        Some(self)
    }

    fn is_rewritable(&self) -> bool {
        true
    }
}

#[async_trait]
impl AsyncQueryProvider for ExpandableProvider {
    async fn execute_async(
        &self,
        tree: &Expression,
        cancel: CancellationToken,
    ) -> QueryResult<Value> {
        // Rewriting always runs to completion before any I/O is issued.
        let rewritten = self.rewrite(tree)?;
        let attempt = match self.inner.as_async() {
            Some(inner) => inner.execute_async(&rewritten, cancel).await,
            None => self.inner.execute(&rewritten),
        };
        match attempt {
            Err(err @ QueryError::UnsupportedTranslation { .. }) => {
                fallback::recover_scalar(self.inner.as_ref(), &rewritten, err)
            }
            other => other,
        }
    }
}
