use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use requery::backend::MemoryProvider;
use requery::expand::{expand, ExpandError};
use requery::expression::{
    call_names, predicate, CaptureEnv, EntityType, Expression, Parameter, PredicateBuilder,
    Record, Type, Value,
};
use requery::query::{
    as_expandable, as_expandable_with, QueryError, QueryProvider, QueryResult, SequenceSource,
};

fn record_type() -> Arc<EntityType> {
    EntityType::new("record", vec![("id".to_string(), Type::int32())])
}

/// Backend with five records, ids 1..=5.
fn seeded_provider() -> Arc<MemoryProvider> {
    let provider = MemoryProvider::new();
    let records = record_type();
    provider.create_table("records", records.clone());
    let rows = (1..=5)
        .map(|id| Value::Record(Record::new(records.clone(), vec![Value::Int32(id)])))
        .collect();
    provider.insert("records", rows).unwrap();
    provider
}

fn id_predicate(
    records: &Arc<EntityType>,
    build: impl Fn(Expression) -> Expression,
) -> Expression {
    let p = Parameter::fresh("r", Type::Entity(records.clone()));
    let id = Expression::member(Expression::parameter(p.clone()), "id").unwrap();
    predicate(p, build(id)).unwrap()
}

fn id_selector(records: &Arc<EntityType>) -> Expression {
    let p = Parameter::fresh("r", Type::Entity(records.clone()));
    let body = Expression::member(Expression::parameter(p.clone()), "id").unwrap();
    Expression::lambda(vec![p], body)
}

/// Predicate testing membership of a record's id in `ids`.
fn contained_in(records: &Arc<EntityType>, ids: &SequenceSource) -> Expression {
    let p = Parameter::fresh("r", Type::Entity(records.clone()));
    let id = Expression::member(Expression::parameter(p.clone()), "id").unwrap();
    let body = Expression::call(
        call_names::CONTAINS,
        vec![ids.to_expression(), id],
        Type::boolean(),
    );
    predicate(p, body).unwrap()
}

fn row_ids(rows: &[Value]) -> Vec<i32> {
    rows.iter()
        .map(|row| match row {
            Value::Record(r) => match r.field("id") {
                Some(Value::Int32(id)) => *id,
                other => panic!("unexpected id: {:?}", other),
            },
            other => panic!("unexpected row: {}", other),
        })
        .collect()
}

#[test]
fn combined_predicate_matches_direct_conjunction() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    let p = id_predicate(&records, |id| {
        Expression::gt(id, Expression::int32(1))
    });
    let q = id_predicate(&records, |id| {
        Expression::lt(id, Expression::int32(4))
    });

    // Composed predicate through the rewritable wrapper.
    let combined = PredicateBuilder::and(&p, &q).unwrap();
    let composed_rows = as_expandable(&provider.scan("records")?)
        .filter(combined)?
        .to_vec()?;

    // Hand-merged conjunction straight against the backend.
    let p2 = Parameter::fresh("r", Type::Entity(records.clone()));
    let id = Expression::member(Expression::parameter(p2.clone()), "id").unwrap();
    let direct = predicate(
        p2,
        Expression::and(
            Expression::gt(id.clone(), Expression::int32(1)),
            Expression::lt(id, Expression::int32(4)),
        ),
    )
    .unwrap();
    let direct_rows = provider.scan("records")?.filter(direct)?.to_vec()?;

    assert_eq!(row_ids(&composed_rows), vec![2, 3]);
    assert_eq!(composed_rows, direct_rows);
    Ok(())
}

#[test]
fn or_composition_matches_direct_disjunction() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    let p = id_predicate(&records, |id| {
        Expression::lt(id, Expression::int32(2))
    });
    let q = id_predicate(&records, |id| {
        Expression::gt(id, Expression::int32(4))
    });
    let combined = PredicateBuilder::or(&p, &q).unwrap();

    let rows = as_expandable(&provider.scan("records")?)
        .filter(combined)?
        .to_vec()?;
    assert_eq!(row_ids(&rows), vec![1, 5]);
    Ok(())
}

#[test]
fn captured_predicate_expands_through_wrapper() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    let inner = id_predicate(&records, |id| {
        Expression::le(id, Expression::int32(2))
    });
    let env = CaptureEnv::synthesized(vec![(
        "pred".to_string(),
        Value::Expr(Arc::new(inner)),
    )]);

    let p = Parameter::fresh("r", Type::Entity(records.clone()));
    let access = PredicateBuilder::captured(&env, "pred").unwrap();
    let body = Expression::invoke(access, vec![Expression::parameter(p.clone())]).unwrap();
    let by_capture = predicate(p, body).unwrap();

    let rows = as_expandable(&provider.scan("records")?)
        .filter(by_capture)?
        .to_vec()?;
    assert_eq!(row_ids(&rows), vec![1, 2]);
    Ok(())
}

#[test]
fn unexpanded_composition_fails_against_raw_source() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    let p = id_predicate(&records, |id| {
        Expression::gt(id, Expression::int32(1))
    });
    let q = id_predicate(&records, |id| {
        Expression::lt(id, Expression::int32(4))
    });
    let combined = PredicateBuilder::and(&p, &q).unwrap();

    let err = provider.scan("records")?.filter(combined).unwrap_err();
    assert!(err.is_unsupported());
    Ok(())
}

#[test]
fn wrapping_is_idempotent_and_transitive() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    let raw = provider.scan("records")?;
    let wrapped = as_expandable(&raw);
    let rewrapped = as_expandable(&wrapped);

    // Idempotent: re-wrapping yields the same single layer.
    assert!(Arc::ptr_eq(wrapped.provider(), rewrapped.provider()));

    // Transitive: derived queries stay wrapped and behave identically.
    let pred = id_predicate(&records, |id| {
        Expression::lt(id, Expression::int32(3))
    });
    let derived = rewrapped.filter(pred)?;
    assert!(derived.is_rewritable());
    assert_eq!(row_ids(&derived.to_vec()?), vec![1, 2]);
    Ok(())
}

#[test]
fn embedded_tree_carries_a_single_marker_layer() -> QueryResult<()> {
    let provider = seeded_provider();
    let wrapped = as_expandable(&as_expandable(&provider.scan("records")?));

    // Chaining embeds the source once; count marker layers in the built
    // tree before expansion.
    let pred = id_predicate(&record_type(), |id| {
        Expression::lt(id, Expression::int32(3))
    });
    let seq_ty = Type::sequence(Type::Entity(record_type()));
    let embedded = Expression::call(
        call_names::FILTER,
        vec![
            Expression::marker(wrapped.tree().clone()),
            pred,
        ],
        seq_ty,
    );

    let mut marker_layers = 0;
    let mut node = &embedded;
    while let Expression::Call(c) = node {
        if c.name == call_names::AS_EXPANDABLE {
            marker_layers += 1;
        }
        match c.args.first() {
            Some(first) => node = first,
            None => break,
        }
    }
    assert_eq!(marker_layers, 1);

    // And expansion strips it entirely.
    let expanded = expand(&embedded).unwrap();
    assert!(!expanded.any_node(&|e| matches!(
        e,
        Expression::Call(c) if c.name == call_names::AS_EXPANDABLE
    )));
    Ok(())
}

#[test]
fn no_op_tree_executes_identically() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    let pred = id_predicate(&records, |id| {
        Expression::ge(id, Expression::int32(4))
    });
    let raw_rows = provider.scan("records")?.filter(pred.clone())?.to_vec()?;
    let wrapped_rows = as_expandable(&provider.scan("records")?)
        .filter(pred)?
        .to_vec()?;

    assert_eq!(raw_rows, wrapped_rows);
    assert_eq!(row_ids(&raw_rows), vec![4, 5]);
    Ok(())
}

#[test]
fn split_recovery_costs_exactly_two_round_trips() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    // Inner wrapped derived query: ids below 4.
    let inner_pred = id_predicate(&records, |id| {
        Expression::lt(id, Expression::int32(4))
    });
    let wrapped_ids = as_expandable(&provider.scan("records")?)
        .filter(inner_pred)?
        .map(id_selector(&records))?;

    provider.reset_counters();
    let outer = as_expandable(&provider.scan("records")?)
        .filter(contained_in(&records, &wrapped_ids))?;
    let rows = outer.to_vec()?;

    assert_eq!(row_ids(&rows), vec![1, 2, 3]);
    assert_eq!(provider.round_trips(), 2);
    Ok(())
}

#[test]
fn raw_sub_query_costs_one_round_trip() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    let inner_pred = id_predicate(&records, |id| {
        Expression::lt(id, Expression::int32(4))
    });
    let raw_ids = provider
        .scan("records")?
        .filter(inner_pred)?
        .map(id_selector(&records))?;

    provider.reset_counters();
    let rows = provider
        .scan("records")?
        .filter(contained_in(&records, &raw_ids))?
        .to_vec()?;

    assert_eq!(row_ids(&rows), vec![1, 2, 3]);
    assert_eq!(provider.round_trips(), 1);
    Ok(())
}

#[test]
fn entity_containment_fails_deterministically() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    let inner_pred = id_predicate(&records, |id| {
        Expression::lt(id, Expression::int32(4))
    });
    let wrapped_entities = as_expandable(&provider.scan("records")?).filter(inner_pred)?;

    let p = Parameter::fresh("r", Type::Entity(records.clone()));
    let body = Expression::call(
        call_names::CONTAINS,
        vec![
            wrapped_entities.to_expression(),
            Expression::parameter(p.clone()),
        ],
        Type::boolean(),
    );
    let entity_pred = predicate(p, body).unwrap();

    let outer = as_expandable(&provider.scan("records")?).filter(entity_pred)?;
    let err = outer.to_vec().unwrap_err();
    assert!(err.is_unsupported());
    assert!(err
        .to_string()
        .contains("cannot construct a constant of type record"));
    Ok(())
}

#[test]
fn recovery_happens_on_first_element_fetch() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    let inner_pred = id_predicate(&records, |id| {
        Expression::lt(id, Expression::int32(4))
    });
    let wrapped_ids = as_expandable(&provider.scan("records")?)
        .filter(inner_pred)?
        .map(id_selector(&records))?;

    provider.reset_counters();
    let outer = as_expandable(&provider.scan("records")?)
        .filter(contained_in(&records, &wrapped_ids))?;

    // Building the iterator contacts no backend.
    let mut iter = outer.iter();
    assert_eq!(provider.round_trips(), 0);

    let first = iter.next().expect("expected a first row")?;
    assert_eq!(provider.round_trips(), 2);
    match first {
        Value::Record(r) => assert_eq!(r.field("id"), Some(&Value::Int32(1))),
        other => panic!("unexpected row: {}", other),
    }

    let rest: Vec<Value> = iter.collect::<QueryResult<_>>()?;
    assert_eq!(rest.len(), 2);
    // Draining the iterator issues no further round trips.
    assert_eq!(provider.round_trips(), 2);
    Ok(())
}

#[test]
fn recursive_invocation_fails_without_overflow() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    let p = Parameter::fresh("r", Type::Entity(records.clone()));
    let inner = Expression::lambda(vec![p.clone()], Expression::boolean(true));
    let body = Expression::invoke(
        Expression::quote(inner).unwrap(),
        vec![Expression::parameter(p.clone())],
    )
    .unwrap();
    let recursive = Expression::lambda(vec![p], body);

    let err = as_expandable(&provider.scan("records")?)
        .filter(recursive)
        .unwrap_err();
    assert!(matches!(
        err,
        QueryError::Expand(ExpandError::RecursiveInvocation { .. })
    ));
    Ok(())
}

#[test]
fn optimizer_runs_once_per_operation() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    let calls = Arc::new(AtomicU64::new(0));
    let seen = calls.clone();
    let optimizer: requery::query::QueryOptimizer = Arc::new(move |tree| {
        seen.fetch_add(1, Ordering::Relaxed);
        tree
    });

    let wrapped = as_expandable_with(&provider.scan("records")?, optimizer);
    let pred = id_predicate(&records, |id| {
        Expression::lt(id, Expression::int32(3))
    });
    let derived = wrapped.filter(pred)?;
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    derived.to_vec()?;
    assert_eq!(calls.load(Ordering::Relaxed), 2);
    Ok(())
}

#[test]
fn other_backend_errors_pass_through_unaltered() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    // Division by zero inside a predicate is not a translation failure.
    let pred = id_predicate(&records, |id| {
        Expression::eq(
            Expression::binary(
                requery::expression::BinaryOperator::Div,
                id,
                Expression::int32(0),
            ),
            Expression::int32(1),
        )
    });
    let err = as_expandable(&provider.scan("records")?)
        .filter(pred)?
        .to_vec()
        .unwrap_err();
    assert!(!err.is_unsupported());
    assert!(matches!(err, QueryError::InvalidQuery(_)));
    Ok(())
}

/// Provider without the asynchronous capability, for probing the
/// already-completed-future path.
struct SyncOnlyProvider {
    inner: Arc<MemoryProvider>,
}

impl QueryProvider for SyncOnlyProvider {
    fn create_query(
        self: Arc<Self>,
        tree: Expression,
    ) -> QueryResult<SequenceSource> {
        let derived = self.inner.clone().create_query(tree)?;
        Ok(SequenceSource::new(
            derived.tree().clone(),
            self,
            derived.element_type().clone(),
        ))
    }

    fn execute(&self, tree: &Expression) -> QueryResult<Value> {
        self.inner.execute(tree)
    }

    fn iterate(&self, tree: &Expression) -> QueryResult<Vec<Value>> {
        self.inner.iterate(tree)
    }
}

#[tokio::test]
async fn async_execution_uses_backend_capability() -> QueryResult<()> {
    let provider = seeded_provider();
    let records = record_type();

    let pred = id_predicate(&records, |id| {
        Expression::lt(id, Expression::int32(4))
    });
    let wrapped = as_expandable(&provider.scan("records")?).filter(pred)?;

    let count = wrapped.count_async(CancellationToken::new()).await?;
    assert_eq!(count, 3);
    Ok(())
}

#[tokio::test]
async fn async_execution_falls_back_to_synchronous_backend() -> QueryResult<()> {
    let inner = seeded_provider();
    let records = record_type();

    let scan_tree = inner.scan("records")?.tree().clone();
    let sync_only: Arc<dyn QueryProvider> = Arc::new(SyncOnlyProvider { inner });
    let source = SequenceSource::new(scan_tree, sync_only, Type::Entity(records));

    let wrapped = as_expandable(&source);
    let count = wrapped.count_async(CancellationToken::new()).await?;
    assert_eq!(count, 5);
    Ok(())
}
