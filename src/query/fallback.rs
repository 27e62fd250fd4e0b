//! Execution fallback: recover from one class of translation failure by
//! splitting a query into two backend round trips.
//!
//! When the backend raises an unsupported-translation signal at first
//! evaluation, the failing tree is searched for an embedded wrapped derived
//! query. If one is found on the first-argument chain, that sub-query is
//! materialized eagerly and substituted as an ordinary collection constant,
//! and the rebuilt tree is delegated to the backend exactly once more. The
//! retry's outcome is final: there is never a second recovery attempt.

use log::{debug, warn};

use crate::expression::{
    BinaryExpr, Expression, Invocation, Member, SequenceValue, Type, UnaryExpr, Value,
};
use crate::query::provider::{QueryError, QueryProvider, QueryResult};
use crate::query::source::SequenceSource;

/// Lazy iterator over a sequence source.
///
/// The backend is not contacted until the first `next()` call, so an
/// unsupported-translation signal (and its recovery) surfaces on the first
/// element fetch rather than at iterator construction.
pub struct SafeIter {
    state: IterState,
}

enum IterState {
    NotStarted(Box<SequenceSource>),
    Active(std::vec::IntoIter<Value>),
    Finished,
}

impl SafeIter {
    pub(crate) fn new(source: SequenceSource) -> Self {
        Self {
            state: IterState::NotStarted(Box::new(source)),
        }
    }
}

impl Iterator for SafeIter {
    type Item = QueryResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        match std::mem::replace(&mut self.state, IterState::Finished) {
            IterState::NotStarted(source) => match source.to_vec() {
                Ok(items) => {
                    let mut iter = items.into_iter();
                    let first = iter.next().map(Ok);
                    self.state = IterState::Active(iter);
                    first
                }
                Err(err) => Some(Err(err)),
            },
            IterState::Active(mut iter) => {
                let item = iter.next().map(Ok);
                self.state = IterState::Active(iter);
                item
            }
            IterState::Finished => None,
        }
    }
}

/// Recover a failed scalar execution, or re-raise the original signal.
pub(crate) fn recover_scalar(
    inner: &dyn QueryProvider,
    tree: &Expression,
    original: QueryError,
) -> QueryResult<Value> {
    match rebuild_with_split(tree, &original)? {
        Some(rebuilt) => inner.execute(&rebuilt),
        None => Err(original),
    }
}

/// Recover a failed enumeration, or re-raise the original signal.
pub(crate) fn recover_sequence(
    inner: &dyn QueryProvider,
    tree: &Expression,
    original: QueryError,
) -> QueryResult<Vec<Value>> {
    match rebuild_with_split(tree, &original)? {
        Some(rebuilt) => inner.iterate(&rebuilt),
        None => Err(original),
    }
}

/// Find the split point and rebuild the executed tree around its
/// materialized value. Returns `None` when no split point exists, in which
/// case the original signal must be re-raised unchanged.
fn rebuild_with_split(
    tree: &Expression,
    original: &QueryError,
) -> QueryResult<Option<Expression>> {
    let QueryError::UnsupportedTranslation { subtree, message } = original else {
        return Ok(None);
    };
    let failing: &Expression = subtree.as_deref().unwrap_or(tree);

    // The failing tree's outermost node must be a method call.
    let Expression::Call(call) = failing else {
        return Ok(None);
    };

    // Walk the first-argument chain inward. Sub-queries sitting in other
    // argument positions are not searched.
    let mut node = match call.args.first() {
        Some(first) => first,
        None => return Ok(None),
    };
    let split = loop {
        if let Some(source) = wrapped_query_source(node) {
            break Some((node, source));
        }
        match node {
            Expression::Call(c) => match c.args.first() {
                Some(first) => node = first,
                None => break None,
            },
            _ => break None,
        }
    };

    let Some((split_node, split_source)) = split else {
        debug!("no split point for: {}", message);
        return Ok(None);
    };

    let elem = split_source.element_type().clone();
    warn!(
        "unsupported translation ({}); materializing embedded sub-query of {}",
        message, elem
    );
    let items = split_source.to_vec()?;
    let constant = Expression::constant_typed(
        Value::Sequence(SequenceValue::new(elem.clone(), items)),
        Type::sequence(elem),
    );
    Ok(Some(replace_subtree(tree, split_node, &constant)))
}

/// The split-point test: a constant holding an embedded query whose
/// provider rewrites trees (a wrapped derived query). Such a node always
/// has a sequence element type.
fn wrapped_query_source(node: &Expression) -> Option<&SequenceSource> {
    match node {
        Expression::Constant(c) => match &c.value {
            Value::Query(q) if q.source.is_rewritable() => Some(&q.source),
            _ => None,
        },
        _ => None,
    }
}

/// Rebuild `tree` with every occurrence of `target` replaced.
fn replace_subtree(
    tree: &Expression,
    target: &Expression,
    replacement: &Expression,
) -> Expression {
    if tree == target {
        return replacement.clone();
    }
    match tree {
        Expression::Parameter(_) | Expression::Constant(_) => tree.clone(),
        Expression::Member(m) => Expression::Member(Member {
            target: Box::new(replace_subtree(&m.target, target, replacement)),
            member: m.member.clone(),
            ty: m.ty.clone(),
        }),
        Expression::Call(c) => Expression::call(
            c.name.clone(),
            c.args
                .iter()
                .map(|a| replace_subtree(a, target, replacement))
                .collect(),
            c.ty.clone(),
        ),
        Expression::Lambda(l) => Expression::lambda(
            l.params.clone(),
            replace_subtree(&l.body, target, replacement),
        ),
        Expression::Invoke(i) => Expression::Invoke(Invocation {
            target: Box::new(replace_subtree(&i.target, target, replacement)),
            args: i
                .args
                .iter()
                .map(|a| replace_subtree(a, target, replacement))
                .collect(),
            ty: i.ty.clone(),
        }),
        Expression::Unary(u) => Expression::Unary(UnaryExpr {
            op: u.op,
            operand: Box::new(replace_subtree(&u.operand, target, replacement)),
            ty: u.ty.clone(),
        }),
        Expression::Binary(b) => Expression::Binary(BinaryExpr {
            op: b.op,
            left: Box::new(replace_subtree(&b.left, target, replacement)),
            right: Box::new(replace_subtree(&b.right, target, replacement)),
            ty: b.ty.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::call_names;
    use std::sync::Arc;

    struct StubProvider;

    impl QueryProvider for StubProvider {
        fn create_query(self: Arc<Self>, tree: Expression) -> QueryResult<SequenceSource> {
            let elem = tree
                .ty()
                .element_type()
                .cloned()
                .ok_or_else(|| QueryError::InvalidQuery("not a sequence".to_string()))?;
            Ok(SequenceSource::new(tree, self, elem))
        }

        fn execute(&self, _tree: &Expression) -> QueryResult<Value> {
            Ok(Value::Int64(0))
        }

        fn iterate(&self, _tree: &Expression) -> QueryResult<Vec<Value>> {
            Ok(vec![Value::Int32(1), Value::Int32(2)])
        }
    }

    fn int_sequence_call() -> Expression {
        Expression::call(
            call_names::SCAN,
            vec![Expression::string("numbers")],
            Type::sequence(Type::int32()),
        )
    }

    #[test]
    fn test_replace_subtree_replaces_all_occurrences() {
        let needle = Expression::int32(7);
        let tree = Expression::and(
            Expression::eq(needle.clone(), Expression::int32(1)),
            Expression::eq(needle.clone(), needle.clone()),
        );

        let replaced = replace_subtree(&tree, &needle, &Expression::int32(9));
        assert!(!replaced.any_node(&|e| *e == needle));
        assert!(replaced.any_node(&|e| *e == Expression::int32(9)));
    }

    #[test]
    fn test_split_requires_method_call_root() {
        let err = QueryError::unsupported_node("boom", Expression::int32(1));
        let rebuilt = rebuild_with_split(&int_sequence_call(), &err).unwrap();
        assert!(rebuilt.is_none());
    }

    #[test]
    fn test_split_skips_raw_sub_queries() {
        let raw = SequenceSource::new(
            int_sequence_call(),
            Arc::new(StubProvider),
            Type::int32(),
        );
        let failing = Expression::call(
            call_names::CONTAINS,
            vec![raw.to_expression(), Expression::int32(1)],
            Type::boolean(),
        );
        let err = QueryError::unsupported_node("boom", failing.clone());

        let rebuilt = rebuild_with_split(&failing, &err).unwrap();
        assert!(rebuilt.is_none());
    }

    #[test]
    fn test_split_materializes_wrapped_sub_query() {
        let raw = SequenceSource::new(
            int_sequence_call(),
            Arc::new(StubProvider),
            Type::int32(),
        );
        let wrapped = crate::query::expandable::as_expandable(&raw);
        let embedded = wrapped.to_expression();
        let failing = Expression::call(
            call_names::CONTAINS,
            vec![embedded.clone(), Expression::int32(1)],
            Type::boolean(),
        );
        let err = QueryError::unsupported_node("boom", failing.clone());

        let rebuilt = rebuild_with_split(&failing, &err)
            .unwrap()
            .expect("expected a split point");
        // The embedded query became a materialized collection constant.
        assert!(!rebuilt.any_node(&|e| *e == embedded));
        assert!(rebuilt.any_node(&|e| matches!(
            e,
            Expression::Constant(c) if matches!(&c.value, Value::Sequence(s) if s.items.len() == 2)
        )));
    }
}
