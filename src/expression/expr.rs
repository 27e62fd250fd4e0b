//! Expression AST definitions.
//!
//! Trees are immutable and value-like: every node carries its static result
//! type, fixed when the node is constructed, and rewriting always rebuilds
//! nodes rather than mutating them in place.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::expression::error::ExpressionError;
use crate::expression::operator::{BinaryOperator, UnaryOperator};
use crate::expression::types::{Signature, Type};
use crate::expression::value::{QueryValue, Value};
use crate::query::source::SequenceSource;

/// Call names with reserved meaning for the expander and the backends.
pub mod call_names {
    /// Root table scan
    pub const SCAN: &str = "scan";
    pub const FILTER: &str = "filter";
    pub const MAP: &str = "map";
    pub const ORDER_BY: &str = "order_by";
    pub const TAKE: &str = "take";
    pub const CONTAINS: &str = "contains";
    pub const COUNT: &str = "count";

    /// Wrapper-invocation call applying a composed predicate to arguments
    pub const APPLY: &str = "apply";

    /// Reduces an expression value into a directly-callable form
    pub const COMPILE: &str = "compile";

    /// Wrapper marker tagging a branch as rewritable
    pub const AS_EXPANDABLE: &str = "as_expandable";
}

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(0);

/// Identity of a bound parameter.
///
/// Parameters are compared by id, never by display name, so two independent
/// lambdas may both name their parameter `x` without colliding during
/// inlining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(pub u64);

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Lambda parameter declaration / reference
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub id: ParamId,
    pub name: String,
    pub ty: Type,
}

impl Parameter {
    /// Declare a parameter with a fresh identity.
    pub fn fresh(name: impl Into<String>, ty: Type) -> Self {
        Self {
            id: ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            ty,
        }
    }
}

/// Constant value node
#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    pub value: Value,
    pub ty: Type,
}

/// Member access node
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub target: Box<Expression>,
    pub member: String,
    pub ty: Type,
}

/// Named method call over an argument list (receiver-first convention)
#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub name: String,
    pub args: Vec<Expression>,
    pub ty: Type,
}

/// Lambda literal
#[derive(Debug, Clone, PartialEq)]
pub struct Lambda {
    pub params: Vec<Parameter>,
    pub body: Box<Expression>,
}

impl Lambda {
    pub fn signature(&self) -> Signature {
        Signature::new(
            self.params.iter().map(|p| p.ty.clone()).collect(),
            self.body.ty(),
        )
    }
}

/// Application of an expression-valued target to arguments
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub target: Box<Expression>,
    pub args: Vec<Expression>,
    pub ty: Type,
}

/// Unary operation
#[derive(Debug, Clone, PartialEq)]
pub struct UnaryExpr {
    pub op: UnaryOperator,
    pub operand: Box<Expression>,
    pub ty: Type,
}

/// Binary operation
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: BinaryOperator,
    pub left: Box<Expression>,
    pub right: Box<Expression>,
    pub ty: Type,
}

/// Expression tree node
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Reference to a lambda parameter
    Parameter(Parameter),

    /// Constant value
    Constant(Constant),

    /// Member access
    Member(Member),

    /// Named method call
    Call(MethodCall),

    /// Lambda literal
    Lambda(Lambda),

    /// Invocation of an expression-valued target
    Invoke(Invocation),

    /// Unary operation
    Unary(UnaryExpr),

    /// Binary operation
    Binary(BinaryExpr),
}

impl Expression {
    /// Static result type of this node.
    pub fn ty(&self) -> Type {
        match self {
            Expression::Parameter(p) => p.ty.clone(),
            Expression::Constant(c) => c.ty.clone(),
            Expression::Member(m) => m.ty.clone(),
            Expression::Call(c) => c.ty.clone(),
            Expression::Lambda(l) => Type::func(l.signature()),
            Expression::Invoke(i) => i.ty.clone(),
            Expression::Unary(u) => u.ty.clone(),
            Expression::Binary(b) => b.ty.clone(),
        }
    }

    /// Create a parameter reference expression
    pub fn parameter(param: Parameter) -> Self {
        Expression::Parameter(param)
    }

    /// Create a constant expression, deriving its type from the value
    pub fn constant(value: Value) -> Result<Self, ExpressionError> {
        let ty = value
            .value_type()
            .ok_or(ExpressionError::UntypedConstant)?;
        Ok(Expression::Constant(Constant { value, ty }))
    }

    /// Create a constant expression with an explicit type (required for NULL)
    pub fn constant_typed(value: Value, ty: Type) -> Self {
        Expression::Constant(Constant { value, ty })
    }

    /// Create a boolean literal
    pub fn boolean(val: bool) -> Self {
        Expression::constant_typed(Value::Boolean(val), Type::boolean())
    }

    /// Create an Int32 literal
    pub fn int32(val: i32) -> Self {
        Expression::constant_typed(Value::Int32(val), Type::int32())
    }

    /// Create an Int64 literal
    pub fn int64(val: i64) -> Self {
        Expression::constant_typed(Value::Int64(val), Type::int64())
    }

    /// Create a string literal
    pub fn string(val: impl Into<String>) -> Self {
        Expression::constant_typed(Value::String(val.into()), Type::varchar())
    }

    /// Quote a lambda into a constant holding an expression value.
    ///
    /// This is the storage form of a composed predicate: the surrounding
    /// tree refers to the lambda instead of inlining it.
    pub fn quote(lambda: Expression) -> Result<Self, ExpressionError> {
        let sig = match &lambda {
            Expression::Lambda(l) => l.signature(),
            other => {
                return Err(ExpressionError::NotALambda {
                    ty: other.ty().to_string(),
                })
            }
        };
        Ok(Expression::constant_typed(
            Value::Expr(Arc::new(lambda)),
            Type::expr(sig),
        ))
    }

    /// Embed a sequence source into a tree as a sub-query constant.
    pub fn sub_query(source: SequenceSource) -> Self {
        let ty = Type::sequence(source.element_type().clone());
        Expression::constant_typed(Value::Query(QueryValue::new(source)), ty)
    }

    /// Create a member access expression
    pub fn member(target: Expression, name: impl Into<String>) -> Result<Self, ExpressionError> {
        let name = name.into();
        let ty = match target.ty() {
            Type::Entity(entity) => entity.field_type(&name).cloned().ok_or_else(|| {
                ExpressionError::UnknownMember {
                    member: name.clone(),
                    ty: entity.name.clone(),
                }
            })?,
            other => {
                return Err(ExpressionError::NotAnEntity {
                    ty: other.to_string(),
                })
            }
        };
        Ok(Expression::Member(Member {
            target: Box::new(target),
            member: name,
            ty,
        }))
    }

    /// Create a method call expression with an explicit result type
    pub fn call(name: impl Into<String>, args: Vec<Expression>, ty: Type) -> Self {
        Expression::Call(MethodCall {
            name: name.into(),
            args,
            ty,
        })
    }

    /// Create a lambda literal
    pub fn lambda(params: Vec<Parameter>, body: Expression) -> Self {
        Expression::Lambda(Lambda {
            params,
            body: Box::new(body),
        })
    }

    /// Create an invocation of an expression- or function-valued target
    pub fn invoke(target: Expression, args: Vec<Expression>) -> Result<Self, ExpressionError> {
        let sig = target
            .ty()
            .signature()
            .cloned()
            .ok_or_else(|| ExpressionError::InvalidInvocationTarget {
                ty: target.ty().to_string(),
            })?;
        if sig.params.len() != args.len() {
            return Err(ExpressionError::ArityMismatch {
                expected: sig.params.len(),
                actual: args.len(),
            });
        }
        Ok(Expression::Invoke(Invocation {
            target: Box::new(target),
            args,
            ty: sig.ret,
        }))
    }

    /// Create the wrapper-invocation call form of applying a composed
    /// predicate (`apply(target, args...)`).
    pub fn apply(target: Expression, args: Vec<Expression>) -> Result<Self, ExpressionError> {
        let sig = target
            .ty()
            .signature()
            .cloned()
            .ok_or_else(|| ExpressionError::InvalidInvocationTarget {
                ty: target.ty().to_string(),
            })?;
        if sig.params.len() != args.len() {
            return Err(ExpressionError::ArityMismatch {
                expected: sig.params.len(),
                actual: args.len(),
            });
        }
        let mut call_args = Vec::with_capacity(args.len() + 1);
        call_args.push(target);
        call_args.extend(args);
        Ok(Expression::call(call_names::APPLY, call_args, sig.ret))
    }

    /// Create a call reducing an expression value into callable form
    pub fn compile(target: Expression) -> Result<Self, ExpressionError> {
        let sig = match target.ty() {
            Type::Expr(sig) => *sig,
            other => {
                return Err(ExpressionError::InvalidInvocationTarget {
                    ty: other.to_string(),
                })
            }
        };
        Ok(Expression::call(
            call_names::COMPILE,
            vec![target],
            Type::func(sig),
        ))
    }

    /// Wrap a sequence-typed branch in the rewritable marker
    pub fn marker(sequence: Expression) -> Self {
        let ty = sequence.ty();
        Expression::call(call_names::AS_EXPANDABLE, vec![sequence], ty)
    }

    /// Create a unary operation expression
    pub fn unary(op: UnaryOperator, operand: Expression) -> Self {
        let ty = op.result_type(&operand.ty());
        Expression::Unary(UnaryExpr {
            op,
            operand: Box::new(operand),
            ty,
        })
    }

    /// Create a binary operation expression
    pub fn binary(op: BinaryOperator, left: Expression, right: Expression) -> Self {
        let ty = op.result_type(&left.ty(), &right.ty());
        Expression::Binary(BinaryExpr {
            op,
            left: Box::new(left),
            right: Box::new(right),
            ty,
        })
    }

    /// Create an AND expression
    pub fn and(left: Expression, right: Expression) -> Self {
        Self::binary(BinaryOperator::And, left, right)
    }

    /// Create an OR expression
    pub fn or(left: Expression, right: Expression) -> Self {
        Self::binary(BinaryOperator::Or, left, right)
    }

    /// Create a NOT expression
    pub fn not_expr(operand: Expression) -> Self {
        Self::unary(UnaryOperator::Not, operand)
    }

    /// Create an equality expression
    pub fn eq(left: Expression, right: Expression) -> Self {
        Self::binary(BinaryOperator::Eq, left, right)
    }

    /// Create a not-equal expression
    pub fn ne(left: Expression, right: Expression) -> Self {
        Self::binary(BinaryOperator::Ne, left, right)
    }

    /// Create a less-than expression
    pub fn lt(left: Expression, right: Expression) -> Self {
        Self::binary(BinaryOperator::Lt, left, right)
    }

    /// Create a less-than-or-equal expression
    pub fn le(left: Expression, right: Expression) -> Self {
        Self::binary(BinaryOperator::Le, left, right)
    }

    /// Create a greater-than expression
    pub fn gt(left: Expression, right: Expression) -> Self {
        Self::binary(BinaryOperator::Gt, left, right)
    }

    /// Create a greater-than-or-equal expression
    pub fn ge(left: Expression, right: Expression) -> Self {
        Self::binary(BinaryOperator::Ge, left, right)
    }

    /// Whether any node in this tree satisfies `pred`.
    pub fn any_node(&self, pred: &dyn Fn(&Expression) -> bool) -> bool {
        if pred(self) {
            return true;
        }
        match self {
            Expression::Parameter(_) | Expression::Constant(_) => false,
            Expression::Member(m) => m.target.any_node(pred),
            Expression::Call(c) => c.args.iter().any(|a| a.any_node(pred)),
            Expression::Lambda(l) => l.body.any_node(pred),
            Expression::Invoke(i) => {
                i.target.any_node(pred) || i.args.iter().any(|a| a.any_node(pred))
            }
            Expression::Unary(u) => u.operand.any_node(pred),
            Expression::Binary(b) => b.left.any_node(pred) || b.right.any_node(pred),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::Parameter(p) => write!(f, "{}", p.name),
            Expression::Constant(c) => write!(f, "{}", c.value),
            Expression::Member(m) => write!(f, "{}.{}", m.target, m.member),
            Expression::Call(c) => {
                write!(f, "{}(", c.name)?;
                for (i, arg) in c.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expression::Lambda(l) => {
                write!(f, "|")?;
                for (i, p) in l.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p.name)?;
                }
                write!(f, "| {}", l.body)
            }
            Expression::Invoke(i) => {
                write!(f, "({})(", i.target)?;
                for (idx, arg) in i.args.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Expression::Unary(u) => match u.op {
                UnaryOperator::IsNull | UnaryOperator::IsNotNull => {
                    write!(f, "({} {})", u.operand, u.op.as_str())
                }
                _ => write!(f, "({} {})", u.op.as_str(), u.operand),
            },
            Expression::Binary(b) => {
                write!(f, "({} {} {})", b.left, b.op.as_str(), b.right)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::types::EntityType;

    fn user_type() -> std::sync::Arc<EntityType> {
        EntityType::new(
            "user",
            vec![
                ("id".to_string(), Type::int32()),
                ("name".to_string(), Type::varchar()),
            ],
        )
    }

    #[test]
    fn test_parameter_identity_is_unique() {
        let p1 = Parameter::fresh("x", Type::int32());
        let p2 = Parameter::fresh("x", Type::int32());
        assert_ne!(p1.id, p2.id);
    }

    #[test]
    fn test_literal_builders() {
        assert_eq!(Expression::int32(42).ty(), Type::int32());
        assert_eq!(Expression::boolean(true).ty(), Type::boolean());
        assert_eq!(Expression::string("hello").ty(), Type::varchar());
    }

    #[test]
    fn test_member_access_typing() -> Result<(), ExpressionError> {
        let p = Parameter::fresh("u", Type::Entity(user_type()));
        let id = Expression::member(Expression::parameter(p.clone()), "id")?;
        assert_eq!(id.ty(), Type::int32());

        let err = Expression::member(Expression::parameter(p), "missing");
        assert!(matches!(err, Err(ExpressionError::UnknownMember { .. })));

        let err = Expression::member(Expression::int32(1), "id");
        assert!(matches!(err, Err(ExpressionError::NotAnEntity { .. })));
        Ok(())
    }

    #[test]
    fn test_lambda_signature() -> Result<(), ExpressionError> {
        let p = Parameter::fresh("u", Type::Entity(user_type()));
        let body = Expression::gt(
            Expression::member(Expression::parameter(p.clone()), "id")?,
            Expression::int32(3),
        );
        let lambda = Expression::lambda(vec![p], body);

        let sig = match &lambda {
            Expression::Lambda(l) => l.signature(),
            _ => unreachable!(),
        };
        assert_eq!(sig.params.len(), 1);
        assert_eq!(sig.ret, Type::boolean());
        Ok(())
    }

    #[test]
    fn test_invoke_typing_and_arity() -> Result<(), ExpressionError> {
        let p = Parameter::fresh("n", Type::int32());
        let lambda = Expression::lambda(
            vec![p.clone()],
            Expression::gt(Expression::parameter(p), Expression::int32(0)),
        );
        let quoted = Expression::quote(lambda)?;

        let ok = Expression::invoke(quoted.clone(), vec![Expression::int32(5)])?;
        assert_eq!(ok.ty(), Type::boolean());

        let err = Expression::invoke(quoted, vec![]);
        assert!(matches!(err, Err(ExpressionError::ArityMismatch { .. })));

        let err = Expression::invoke(Expression::int32(1), vec![]);
        assert!(matches!(
            err,
            Err(ExpressionError::InvalidInvocationTarget { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_quote_rejects_non_lambda() {
        let err = Expression::quote(Expression::int32(1));
        assert!(matches!(err, Err(ExpressionError::NotALambda { .. })));
    }

    #[test]
    fn test_marker_preserves_type() {
        let seq = Expression::call(
            call_names::SCAN,
            vec![Expression::string("users")],
            Type::sequence(Type::Entity(user_type())),
        );
        let marked = Expression::marker(seq.clone());
        assert_eq!(marked.ty(), seq.ty());
    }

    #[test]
    fn test_display() -> Result<(), ExpressionError> {
        let p = Parameter::fresh("u", Type::Entity(user_type()));
        let body = Expression::gt(
            Expression::member(Expression::parameter(p.clone()), "id")?,
            Expression::int32(3),
        );
        let lambda = Expression::lambda(vec![p], body);
        assert_eq!(lambda.to_string(), "|u| (u.id > 3)");
        Ok(())
    }

    #[test]
    fn test_any_node() {
        let tree = Expression::and(
            Expression::boolean(true),
            Expression::eq(Expression::int32(1), Expression::int32(1)),
        );
        assert!(tree.any_node(&|e| matches!(e, Expression::Constant(c) if c.value == Value::Int32(1))));
        assert!(!tree.any_node(&|e| matches!(e, Expression::Lambda(_))));
    }
}
