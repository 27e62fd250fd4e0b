//! Sequence sources: an expression tree plus the provider that can run it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::expression::{call_names, Expression, Type, Value};
use crate::query::fallback::SafeIter;
use crate::query::provider::{QueryError, QueryProvider, QueryResult};

/// A not-yet-executed query: the pair of an expression tree and the
/// provider that can build further queries from it or execute it.
///
/// Sources own no backend resources; connection and session lifetime belong
/// to the provider behind them.
#[derive(Clone)]
pub struct SequenceSource {
    tree: Expression,
    provider: Arc<dyn QueryProvider>,
    elem: Type,
}

impl std::fmt::Debug for SequenceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceSource")
            .field("tree", &self.tree)
            .field("provider", &"<dyn QueryProvider>")
            .field("elem", &self.elem)
            .finish()
    }
}

impl SequenceSource {
    pub fn new(tree: Expression, provider: Arc<dyn QueryProvider>, elem: Type) -> Self {
        Self {
            tree,
            provider,
            elem,
        }
    }

    /// The expression tree this source will execute.
    pub fn tree(&self) -> &Expression {
        &self.tree
    }

    /// The provider backing this source.
    pub fn provider(&self) -> &Arc<dyn QueryProvider> {
        &self.provider
    }

    /// Element type of the sequence.
    pub fn element_type(&self) -> &Type {
        &self.elem
    }

    /// Whether this source rewrites trees before delegating them.
    pub fn is_rewritable(&self) -> bool {
        self.provider.is_rewritable()
    }

    /// Tree form used when this source appears inside another tree.
    ///
    /// A rewritable source carries a single marker layer tagging the
    /// branch; the expander collapses redundant nesting.
    pub(crate) fn embedded_tree(&self) -> Expression {
        if self.is_rewritable() {
            Expression::marker(self.tree.clone())
        } else {
            self.tree.clone()
        }
    }

    /// Derive a filtered query from a unary boolean predicate.
    pub fn filter(&self, predicate: Expression) -> QueryResult<SequenceSource> {
        validate_lambda(&predicate, &self.elem, Some(&Type::boolean()))?;
        let ty = Type::sequence(self.elem.clone());
        let tree = Expression::call(
            call_names::FILTER,
            vec![self.embedded_tree(), predicate],
            ty,
        );
        self.provider.clone().create_query(tree)
    }

    /// Derive a projected query from a unary selector.
    pub fn map(&self, selector: Expression) -> QueryResult<SequenceSource> {
        let ret = validate_lambda(&selector, &self.elem, None)?;
        let tree = Expression::call(
            call_names::MAP,
            vec![self.embedded_tree(), selector],
            Type::sequence(ret),
        );
        self.provider.clone().create_query(tree)
    }

    /// Derive a query ordered by a unary key selector.
    pub fn order_by(&self, key: Expression) -> QueryResult<SequenceSource> {
        validate_lambda(&key, &self.elem, None)?;
        let ty = Type::sequence(self.elem.clone());
        let tree = Expression::call(call_names::ORDER_BY, vec![self.embedded_tree(), key], ty);
        self.provider.clone().create_query(tree)
    }

    /// Derive a query truncated to the first `count` elements.
    pub fn take(&self, count: i64) -> QueryResult<SequenceSource> {
        let ty = Type::sequence(self.elem.clone());
        let tree = Expression::call(
            call_names::TAKE,
            vec![self.embedded_tree(), Expression::int64(count)],
            ty,
        );
        self.provider.clone().create_query(tree)
    }

    /// Count the elements of this query.
    pub fn count(&self) -> QueryResult<i64> {
        match self.provider.execute(&self.count_tree())? {
            Value::Int64(n) => Ok(n),
            other => Err(QueryError::Backend(format!(
                "count returned a non-integer value: {}",
                other
            ))),
        }
    }

    /// Count the elements of this query, suspending at the backend
    /// boundary when the provider exposes an asynchronous capability, and
    /// completing synchronously otherwise.
    pub async fn count_async(&self, cancel: CancellationToken) -> QueryResult<i64> {
        let tree = self.count_tree();
        let value = match self.provider.as_async() {
            Some(async_provider) => async_provider.execute_async(&tree, cancel).await?,
            None => self.provider.execute(&tree)?,
        };
        match value {
            Value::Int64(n) => Ok(n),
            other => Err(QueryError::Backend(format!(
                "count returned a non-integer value: {}",
                other
            ))),
        }
    }

    fn count_tree(&self) -> Expression {
        Expression::call(call_names::COUNT, vec![self.embedded_tree()], Type::int64())
    }

    /// Test whether this query's result contains `item`.
    pub fn contains(&self, item: Value) -> QueryResult<bool> {
        let item = Expression::constant(item)?;
        let tree = Expression::call(
            call_names::CONTAINS,
            vec![self.embedded_tree(), item],
            Type::boolean(),
        );
        match self.provider.execute(&tree)? {
            Value::Boolean(b) => Ok(b),
            other => Err(QueryError::Backend(format!(
                "contains returned a non-boolean value: {}",
                other
            ))),
        }
    }

    /// Materialize the query's rows.
    pub fn to_vec(&self) -> QueryResult<Vec<Value>> {
        self.provider.iterate(&self.tree)
    }

    /// Iterate lazily; the backend is contacted on the first `next()`.
    pub fn iter(&self) -> SafeIter {
        SafeIter::new(self.clone())
    }

    /// Embed this query into another tree as a sub-query constant.
    pub fn to_expression(&self) -> Expression {
        Expression::sub_query(self.clone())
    }
}

/// Validate a unary lambda over `elem`, returning its result type.
pub(crate) fn validate_lambda(
    expr: &Expression,
    elem: &Type,
    expected_ret: Option<&Type>,
) -> QueryResult<Type> {
    let sig = match expr {
        Expression::Lambda(l) => l.signature(),
        other => {
            return Err(QueryError::InvalidQuery(format!(
                "expected a lambda literal, found a value of type {}",
                other.ty()
            )))
        }
    };
    if sig.params.len() != 1 || sig.params[0] != *elem {
        return Err(QueryError::InvalidQuery(format!(
            "lambda must take a single {} parameter",
            elem
        )));
    }
    if let Some(expected) = expected_ret {
        if sig.ret != *expected {
            return Err(QueryError::InvalidQuery(format!(
                "lambda must return {}, found {}",
                expected, sig.ret
            )));
        }
    }
    Ok(sig.ret)
}
