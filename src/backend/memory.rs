//! In-memory reference backend.
//!
//! Translates and evaluates the supported subset of query trees against
//! tables held in memory. Like a remote query translator, it refuses trees
//! containing references it cannot resolve: invocations of external
//! expressions, captured closure members, wrapper markers, and embedded
//! queries belonging to a rewriting wrapper. Containment tests accept
//! inline collections of scalar elements only; a collection constant with
//! an entity element type is rejected outright.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use log::debug;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::expression::{
    call_names, BinaryOperator, EntityType, Expression, Lambda, ParamId, Type, UnaryOperator,
    Value,
};
use crate::query::{
    AsyncQueryProvider, QueryError, QueryProvider, QueryResult, SequenceSource,
};

/// A named table: an entity type and its rows.
#[derive(Clone)]
pub struct Table {
    pub elem: Arc<EntityType>,
    pub rows: Vec<Value>,
}

/// Query provider over in-memory tables.
///
/// Tracks every successful execution so callers can observe how many
/// round trips a query pattern costs.
pub struct MemoryProvider {
    tables: DashMap<String, Table>,
    executed: Mutex<Vec<String>>,
    round_trips: AtomicU64,
}

impl MemoryProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: DashMap::new(),
            executed: Mutex::new(Vec::new()),
            round_trips: AtomicU64::new(0),
        })
    }

    /// Register an empty table.
    pub fn create_table(&self, name: impl Into<String>, elem: Arc<EntityType>) {
        self.tables.insert(
            name.into(),
            Table {
                elem,
                rows: Vec::new(),
            },
        );
    }

    /// Append rows to a table, validating them against its entity type.
    pub fn insert(&self, name: &str, rows: Vec<Value>) -> QueryResult<()> {
        let mut table = self
            .tables
            .get_mut(name)
            .ok_or_else(|| QueryError::InvalidQuery(format!("unknown table `{}`", name)))?;
        for row in &rows {
            match row {
                Value::Record(r) if r.ty == table.elem => {}
                other => {
                    return Err(QueryError::InvalidQuery(format!(
                        "row {} does not match table `{}`",
                        other, name
                    )))
                }
            }
        }
        table.rows.extend(rows);
        Ok(())
    }

    /// Root query over a table.
    pub fn scan(self: &Arc<Self>, name: &str) -> QueryResult<SequenceSource> {
        let table = self
            .tables
            .get(name)
            .ok_or_else(|| QueryError::InvalidQuery(format!("unknown table `{}`", name)))?;
        let elem = Type::Entity(table.elem.clone());
        let tree = Expression::call(
            call_names::SCAN,
            vec![Expression::string(name)],
            Type::sequence(elem.clone()),
        );
        Ok(SequenceSource::new(tree, self.clone(), elem))
    }

    /// Number of successfully executed backend round trips.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(AtomicOrdering::Relaxed)
    }

    /// Rendered trees of every successful execution, in order.
    pub fn execution_log(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn reset_counters(&self) {
        self.round_trips.store(0, AtomicOrdering::Relaxed);
        self.executed.lock().clear();
    }

    fn record(&self, tree: &Expression) {
        self.round_trips.fetch_add(1, AtomicOrdering::Relaxed);
        let rendered = tree.to_string();
        debug!("executed: {}", rendered);
        self.executed.lock().push(rendered);
    }

    // ---- translation ----

    /// Refuse trees containing references a remote translator cannot
    /// resolve. Embedded query constants are accepted here; they are only
    /// rejected when an execution actually reaches them.
    fn ensure_translatable(&self, tree: &Expression) -> QueryResult<()> {
        match tree {
            Expression::Invoke(_) => Err(QueryError::unsupported(
                "cannot translate an invocation of an external expression",
            )),
            Expression::Call(c) if c.name == call_names::APPLY => Err(QueryError::unsupported(
                "cannot translate an applied predicate reference",
            )),
            Expression::Call(c) if c.name == call_names::COMPILE => Err(QueryError::unsupported(
                "cannot translate a compiled expression access",
            )),
            Expression::Call(c) if c.name == call_names::AS_EXPANDABLE => {
                Err(QueryError::unsupported(
                    "cannot translate a rewritable marker",
                ))
            }
            Expression::Call(c) => {
                for arg in &c.args {
                    self.ensure_translatable(arg)?;
                }
                Ok(())
            }
            Expression::Member(m) => {
                if is_capture_access(m) {
                    return Err(QueryError::unsupported(
                        "cannot translate a captured closure member",
                    ));
                }
                self.ensure_translatable(&m.target)
            }
            Expression::Lambda(l) => self.ensure_translatable(&l.body),
            Expression::Unary(u) => self.ensure_translatable(&u.operand),
            Expression::Binary(b) => {
                self.ensure_translatable(&b.left)?;
                self.ensure_translatable(&b.right)
            }
            Expression::Parameter(_) | Expression::Constant(_) => Ok(()),
        }
    }

    // ---- evaluation ----

    fn eval_sequence(&self, tree: &Expression) -> QueryResult<Vec<Value>> {
        match tree {
            Expression::Call(c) if c.name == call_names::SCAN => {
                let name = match c.args.first() {
                    Some(Expression::Constant(k)) => match &k.value {
                        Value::String(s) => s.clone(),
                        other => {
                            return Err(QueryError::InvalidQuery(format!(
                                "scan expects a table name, found {}",
                                other
                            )))
                        }
                    },
                    _ => {
                        return Err(QueryError::InvalidQuery(
                            "scan expects a table name".to_string(),
                        ))
                    }
                };
                let table = self.tables.get(&name).ok_or_else(|| {
                    QueryError::InvalidQuery(format!("unknown table `{}`", name))
                })?;
                Ok(table.rows.clone())
            }

            Expression::Call(c) if c.name == call_names::FILTER => {
                let rows = self.eval_sequence(first_arg(&c.args, "filter")?)?;
                let lambda = self.direct_lambda(c.args.get(1), "filter")?;
                let mut out = Vec::new();
                for row in rows {
                    // NULL predicates drop the row, as in a WHERE clause.
                    match self.eval_lambda(lambda, &row)? {
                        Value::Boolean(true) => out.push(row),
                        Value::Boolean(false) | Value::Null => {}
                        other => {
                            return Err(QueryError::InvalidQuery(format!(
                                "filter predicate evaluated to {}",
                                other
                            )))
                        }
                    }
                }
                Ok(out)
            }

            Expression::Call(c) if c.name == call_names::MAP => {
                let rows = self.eval_sequence(first_arg(&c.args, "map")?)?;
                let lambda = self.direct_lambda(c.args.get(1), "map")?;
                rows.into_iter()
                    .map(|row| self.eval_lambda(lambda, &row))
                    .collect()
            }

            Expression::Call(c) if c.name == call_names::ORDER_BY => {
                let rows = self.eval_sequence(first_arg(&c.args, "order_by")?)?;
                let lambda = self.direct_lambda(c.args.get(1), "order_by")?;
                let mut keyed = rows
                    .into_iter()
                    .map(|row| {
                        let key = self.eval_lambda(lambda, &row)?;
                        Ok((key, row))
                    })
                    .collect::<QueryResult<Vec<_>>>()?;
                keyed.sort_by(|(a, _), (b, _)| value_order(a, b));
                Ok(keyed.into_iter().map(|(_, row)| row).collect())
            }

            Expression::Call(c) if c.name == call_names::TAKE => {
                let mut rows = self.eval_sequence(first_arg(&c.args, "take")?)?;
                let count = match c.args.get(1).map(|a| self.eval_expr(a, &HashMap::new())) {
                    Some(Ok(Value::Int32(n))) => n.max(0) as usize,
                    Some(Ok(Value::Int64(n))) => n.max(0) as usize,
                    _ => {
                        return Err(QueryError::InvalidQuery(
                            "take expects an integer count".to_string(),
                        ))
                    }
                };
                rows.truncate(count);
                Ok(rows)
            }

            Expression::Constant(k) => match &k.value {
                Value::Sequence(s) => Ok(s.items.clone()),
                Value::Query(q) => {
                    if q.source.is_rewritable() {
                        Err(QueryError::unsupported(
                            "cannot translate a reference to an externally wrapped query",
                        ))
                    } else {
                        self.eval_sequence(q.source.tree())
                    }
                }
                other => Err(QueryError::InvalidQuery(format!(
                    "{} is not a sequence",
                    other
                ))),
            },

            other => Err(QueryError::unsupported(format!(
                "cannot translate sequence expression: {}",
                other
            ))),
        }
    }

    fn eval_scalar(&self, tree: &Expression) -> QueryResult<Value> {
        match tree {
            Expression::Call(c) if c.name == call_names::COUNT => {
                let rows = self.eval_sequence(first_arg(&c.args, "count")?)?;
                Ok(Value::Int64(rows.len() as i64))
            }
            Expression::Call(c) if c.name == call_names::CONTAINS => {
                self.eval_contains(tree, &c.args, &HashMap::new())
            }
            other => self.eval_expr(other, &HashMap::new()),
        }
    }

    /// Source of a containment test. Collection constants must hold scalar
    /// elements; an entity element type cannot be turned into a constant.
    /// A reference to a wrapped query is reported with the enclosing
    /// containment call as the untranslatable fragment.
    fn eval_containment_source(
        &self,
        node: &Expression,
        context: &Expression,
    ) -> QueryResult<Vec<Value>> {
        match node {
            Expression::Constant(k) => match &k.value {
                Value::Sequence(s) => {
                    if !s.elem.is_scalar() {
                        return Err(QueryError::unsupported(format!(
                            "cannot construct a constant of type {}",
                            s.elem
                        )));
                    }
                    Ok(s.items.clone())
                }
                Value::Query(q) if q.source.is_rewritable() => {
                    Err(QueryError::unsupported_node(
                        "cannot translate a containment test over an externally wrapped query",
                        context.clone(),
                    ))
                }
                _ => self.eval_sequence(node),
            },
            _ => self.eval_sequence(node),
        }
    }

    fn eval_contains(
        &self,
        call_expr: &Expression,
        args: &[Expression],
        env: &HashMap<ParamId, Value>,
    ) -> QueryResult<Value> {
        let (source, needle) = match (args.first(), args.get(1)) {
            (Some(s), Some(n)) => (s, n),
            _ => {
                return Err(QueryError::InvalidQuery(
                    "contains expects a source and an item".to_string(),
                ))
            }
        };
        let needle = self.eval_expr(needle, env)?;
        let items = self.eval_containment_source(source, call_expr)?;
        Ok(Value::Boolean(items.iter().any(|item| *item == needle)))
    }

    fn direct_lambda<'a>(
        &self,
        arg: Option<&'a Expression>,
        operation: &str,
    ) -> QueryResult<&'a Lambda> {
        match arg {
            Some(Expression::Lambda(l)) => Ok(l),
            Some(other) => Err(QueryError::unsupported(format!(
                "{} expects a lambda literal, found {}",
                operation,
                other.ty()
            ))),
            None => Err(QueryError::InvalidQuery(format!(
                "{} is missing its lambda argument",
                operation
            ))),
        }
    }

    fn eval_lambda(&self, lambda: &Lambda, row: &Value) -> QueryResult<Value> {
        let param = lambda.params.first().ok_or_else(|| {
            QueryError::InvalidQuery("lambda must take one parameter".to_string())
        })?;
        let mut env = HashMap::new();
        env.insert(param.id, row.clone());
        self.eval_expr(&lambda.body, &env)
    }

    fn eval_expr(
        &self,
        expr: &Expression,
        env: &HashMap<ParamId, Value>,
    ) -> QueryResult<Value> {
        match expr {
            Expression::Parameter(p) => env.get(&p.id).cloned().ok_or_else(|| {
                QueryError::InvalidQuery(format!("unbound parameter `{}`", p.name))
            }),

            Expression::Constant(c) => Ok(c.value.clone()),

            Expression::Member(m) => {
                if is_capture_access(m) {
                    return Err(QueryError::unsupported(
                        "cannot translate a captured closure member",
                    ));
                }
                match self.eval_expr(&m.target, env)? {
                    Value::Record(r) => r.field(&m.member).cloned().ok_or_else(|| {
                        QueryError::InvalidQuery(format!(
                            "unknown member `{}` on {}",
                            m.member, r.ty.name
                        ))
                    }),
                    Value::Null => Ok(Value::Null),
                    other => Err(QueryError::InvalidQuery(format!(
                        "member access on non-record value {}",
                        other
                    ))),
                }
            }

            Expression::Call(c) if c.name == call_names::CONTAINS => {
                self.eval_contains(expr, &c.args, env)
            }

            Expression::Call(c) if c.name == call_names::COUNT => {
                let rows = self.eval_sequence(first_arg(&c.args, "count")?)?;
                Ok(Value::Int64(rows.len() as i64))
            }

            Expression::Invoke(_) => Err(QueryError::unsupported(
                "cannot translate an invocation of an external expression",
            )),

            Expression::Call(c) if c.name == call_names::APPLY => Err(QueryError::unsupported(
                "cannot translate an applied predicate reference",
            )),

            Expression::Call(c) if c.name == call_names::COMPILE => {
                Err(QueryError::unsupported(
                    "cannot translate a compiled expression access",
                ))
            }

            Expression::Call(c) if c.name == call_names::AS_EXPANDABLE => {
                Err(QueryError::unsupported(
                    "cannot translate a rewritable marker",
                ))
            }

            Expression::Call(c) => Err(QueryError::unsupported(format!(
                "unknown method `{}`",
                c.name
            ))),

            Expression::Lambda(_) => Err(QueryError::InvalidQuery(
                "lambda literal in value position".to_string(),
            )),

            Expression::Unary(u) => {
                let operand = self.eval_expr(&u.operand, env)?;
                eval_unary(u.op, operand)
            }

            Expression::Binary(b) => {
                let left = self.eval_expr(&b.left, env)?;
                let right = self.eval_expr(&b.right, env)?;
                eval_binary(b.op, left, right)
            }
        }
    }
}

impl QueryProvider for MemoryProvider {
    fn create_query(self: Arc<Self>, tree: Expression) -> QueryResult<SequenceSource> {
        self.ensure_translatable(&tree)?;
        let elem = tree
            .ty()
            .element_type()
            .cloned()
            .ok_or_else(|| QueryError::InvalidQuery("query tree is not a sequence".to_string()))?;
        Ok(SequenceSource::new(tree, self, elem))
    }

    fn execute(&self, tree: &Expression) -> QueryResult<Value> {
        let value = self.eval_scalar(tree)?;
        self.record(tree);
        Ok(value)
    }

    fn iterate(&self, tree: &Expression) -> QueryResult<Vec<Value>> {
        let rows = self.eval_sequence(tree)?;
        self.record(tree);
        Ok(rows)
    }

    fn as_async(&self) -> Option<&dyn AsyncQueryProvider> {
        Some(self)
    }
}

#[async_trait]
impl AsyncQueryProvider for MemoryProvider {
    async fn execute_async(
        &self,
        tree: &Expression,
        _cancel: CancellationToken,
    ) -> QueryResult<Value> {
        // An in-memory evaluation completes without suspension; the token
        // is accepted for interface parity and has nothing to cancel.
        self.execute(tree)
    }
}

fn first_arg<'a>(args: &'a [Expression], operation: &str) -> QueryResult<&'a Expression> {
    args.first().ok_or_else(|| {
        QueryError::InvalidQuery(format!("{} is missing its source argument", operation))
    })
}

fn is_capture_access(m: &crate::expression::Member) -> bool {
    matches!(
        m.target.as_ref(),
        Expression::Constant(c) if matches!(&c.value, Value::Env(_))
    )
}

fn eval_unary(op: UnaryOperator, operand: Value) -> QueryResult<Value> {
    match op {
        UnaryOperator::Not => match operand {
            Value::Null => Ok(Value::Null),
            Value::Boolean(b) => Ok(Value::Boolean(!b)),
            other => Err(QueryError::InvalidQuery(format!("NOT applied to {}", other))),
        },
        UnaryOperator::Minus => match operand {
            Value::Null => Ok(Value::Null),
            Value::Int32(n) => Ok(Value::Int32(n.wrapping_neg())),
            Value::Int64(n) => Ok(Value::Int64(n.wrapping_neg())),
            other => Err(QueryError::InvalidQuery(format!(
                "unary minus applied to {}",
                other
            ))),
        },
        UnaryOperator::IsNull => Ok(Value::Boolean(matches!(operand, Value::Null))),
        UnaryOperator::IsNotNull => Ok(Value::Boolean(!matches!(operand, Value::Null))),
    }
}

fn eval_binary(op: BinaryOperator, left: Value, right: Value) -> QueryResult<Value> {
    // NULL propagation: comparisons with NULL are NULL, AND/OR follow
    // three-valued logic, arithmetic propagates NULL.
    if matches!(left, Value::Null) || matches!(right, Value::Null) {
        return Ok(match op {
            BinaryOperator::And => match (&left, &right) {
                (Value::Boolean(false), _) | (_, Value::Boolean(false)) => Value::Boolean(false),
                _ => Value::Null,
            },
            BinaryOperator::Or => match (&left, &right) {
                (Value::Boolean(true), _) | (_, Value::Boolean(true)) => Value::Boolean(true),
                _ => Value::Null,
            },
            _ => Value::Null,
        });
    }

    match op {
        BinaryOperator::Add => arithmetic(op, left, right, i32::wrapping_add, i64::wrapping_add),
        BinaryOperator::Sub => arithmetic(op, left, right, i32::wrapping_sub, i64::wrapping_sub),
        BinaryOperator::Mul => arithmetic(op, left, right, i32::wrapping_mul, i64::wrapping_mul),
        BinaryOperator::Div => match (&left, &right) {
            (_, Value::Int32(0)) | (_, Value::Int64(0)) => {
                Err(QueryError::InvalidQuery("division by zero".to_string()))
            }
            (Value::Int32(a), Value::Int32(b)) => Ok(Value::Int32(a.wrapping_div(*b))),
            (Value::Int64(a), Value::Int64(b)) => Ok(Value::Int64(a.wrapping_div(*b))),
            _ => Err(invalid_operands(op, &left, &right)),
        },

        BinaryOperator::Eq => Ok(Value::Boolean(left == right)),
        BinaryOperator::Ne => Ok(Value::Boolean(left != right)),
        BinaryOperator::Lt | BinaryOperator::Le | BinaryOperator::Gt | BinaryOperator::Ge => {
            let ordering = comparable_order(&left, &right)
                .ok_or_else(|| invalid_operands(op, &left, &right))?;
            let result = match op {
                BinaryOperator::Lt => ordering == Ordering::Less,
                BinaryOperator::Le => ordering != Ordering::Greater,
                BinaryOperator::Gt => ordering == Ordering::Greater,
                BinaryOperator::Ge => ordering != Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Boolean(result))
        }

        BinaryOperator::And => match (&left, &right) {
            (Value::Boolean(a), Value::Boolean(b)) => Ok(Value::Boolean(*a && *b)),
            _ => Err(invalid_operands(op, &left, &right)),
        },
        BinaryOperator::Or => match (&left, &right) {
            (Value::Boolean(a), Value::Boolean(b)) => Ok(Value::Boolean(*a || *b)),
            _ => Err(invalid_operands(op, &left, &right)),
        },
    }
}

fn arithmetic(
    op: BinaryOperator,
    left: Value,
    right: Value,
    f32op: fn(i32, i32) -> i32,
    f64op: fn(i64, i64) -> i64,
) -> QueryResult<Value> {
    match (&left, &right) {
        (Value::Int32(a), Value::Int32(b)) => Ok(Value::Int32(f32op(*a, *b))),
        (Value::Int64(a), Value::Int64(b)) => Ok(Value::Int64(f64op(*a, *b))),
        _ => Err(invalid_operands(op, &left, &right)),
    }
}

fn invalid_operands(op: BinaryOperator, left: &Value, right: &Value) -> QueryError {
    QueryError::InvalidQuery(format!(
        "invalid operands for `{}`: {} and {}",
        op.as_str(),
        left,
        right
    ))
}

/// Ordering of two same-type comparable values.
fn comparable_order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Int32(a), Value::Int32(b)) => Some(a.cmp(b)),
        (Value::Int64(a), Value::Int64(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Total, deterministic ordering used by `order_by`: NULL sorts first,
/// values of different kinds sort by kind.
fn value_order(left: &Value, right: &Value) -> Ordering {
    if let Some(ordering) = comparable_order(left, right) {
        return ordering;
    }
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Int32(_) => 2,
            Value::Int64(_) => 3,
            Value::String(_) => 4,
            _ => 5,
        }
    }
    rank(left).cmp(&rank(right))
}
