//! Builder for composed predicates.
//!
//! A composed predicate refers to another predicate instead of inlining its
//! body: either through an invocation of a quoted expression value, or
//! through a member access into a synthesized capture environment. Both
//! forms are resolved by the expander before a tree reaches a backend.

use std::sync::Arc;

use crate::expression::error::{ExpressionError, ExpressionResult};
use crate::expression::expr::{Expression, Lambda, Parameter};
use crate::expression::operator::BinaryOperator;
use crate::expression::value::CaptureEnv;

/// Builder for combining unary boolean predicates
pub struct PredicateBuilder;

impl PredicateBuilder {
    /// Combine two predicates with a boolean AND.
    ///
    /// The right predicate is embedded behind an invocation bound to the
    /// left predicate's parameters, so the result stays composable and is
    /// only flattened when expanded.
    pub fn and(left: &Expression, right: &Expression) -> ExpressionResult<Expression> {
        Self::combine(BinaryOperator::And, left, right)
    }

    /// Combine two predicates with a boolean OR.
    pub fn or(left: &Expression, right: &Expression) -> ExpressionResult<Expression> {
        Self::combine(BinaryOperator::Or, left, right)
    }

    fn combine(
        op: BinaryOperator,
        left: &Expression,
        right: &Expression,
    ) -> ExpressionResult<Expression> {
        let left_lambda = Self::as_lambda(left)?;
        Self::as_lambda(right)?;

        let params = left_lambda.params.clone();
        let args = params
            .iter()
            .map(|p| Expression::parameter(p.clone()))
            .collect();
        let invoked = Expression::invoke(Expression::quote(right.clone())?, args)?;
        let body = Expression::binary(op, (*left_lambda.body).clone(), invoked);
        Ok(Expression::lambda(params, body))
    }

    /// Reference a predicate held in a capture environment.
    ///
    /// Builds the member-access form of a composed predicate: a member
    /// access whose target is a constant holding a synthesized environment.
    pub fn captured(env: &Arc<CaptureEnv>, member: &str) -> ExpressionResult<Expression> {
        let target = Expression::constant(crate::expression::value::Value::Env(env.clone()))?;
        Expression::member(target, member)
    }

    /// Apply a predicate reference as a boolean combinator over `args`
    /// using the wrapper-invocation call form.
    pub fn apply(target: Expression, args: Vec<Expression>) -> ExpressionResult<Expression> {
        Expression::apply(target, args)
    }

    fn as_lambda(expr: &Expression) -> ExpressionResult<&Lambda> {
        match expr {
            Expression::Lambda(l) => Ok(l),
            other => Err(ExpressionError::NotALambda {
                ty: other.ty().to_string(),
            }),
        }
    }
}

/// Build a unary predicate lambda over `param` from a body expression.
pub fn predicate(param: Parameter, body: Expression) -> ExpressionResult<Expression> {
    if !body.ty().is_boolean() {
        return Err(ExpressionError::InvalidPredicate {
            reason: format!("predicate body has type {}, expected Boolean", body.ty()),
        });
    }
    Ok(Expression::lambda(vec![param], body))
}
