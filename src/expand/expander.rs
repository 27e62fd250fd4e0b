//! Tree rewriting that inlines composed-predicate references.
//!
//! The expander turns a tree containing invocations of quoted expressions,
//! member accesses into capture environments, and rewritable markers into an
//! equivalent tree a sequence backend can translate directly. It is a pure
//! function of its input: every call allocates a fresh root scope and no
//! state is shared between calls, so independent trees may be expanded
//! concurrently.

use crate::expand::capture::{CaptureResolver, EnvCaptureResolver};
use crate::expand::error::{ExpandError, ExpandResult};
use crate::expand::scope::RewriteScope;
use crate::expression::{
    call_names, Expression, ExpressionError, Lambda, Member, MethodCall, Type, UnaryExpr, Value,
};

/// Expand `expr`, inlining invocations, closure captures and markers.
pub fn expand(expr: &Expression) -> ExpandResult<Expression> {
    Expander::new().expand(expr)
}

/// Rewriting visitor. See [`expand`] for the common entry point; an explicit
/// expander is only needed to supply a custom [`CaptureResolver`].
pub struct Expander {
    resolver: Box<dyn CaptureResolver>,
}

impl Default for Expander {
    fn default() -> Self {
        Self {
            resolver: Box::new(EnvCaptureResolver),
        }
    }
}

impl Expander {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_resolver(resolver: Box<dyn CaptureResolver>) -> Self {
        Self { resolver }
    }

    pub fn expand(&self, expr: &Expression) -> ExpandResult<Expression> {
        self.visit(expr, &RewriteScope::root())
    }

    fn visit(&self, expr: &Expression, scope: &RewriteScope) -> ExpandResult<Expression> {
        match expr {
            // Bound parameter references substitute to their replacement;
            // unbound ones pass through unchanged.
            Expression::Parameter(p) => Ok(scope
                .lookup(p.id)
                .cloned()
                .unwrap_or_else(|| expr.clone())),

            Expression::Constant(_) => Ok(expr.clone()),

            Expression::Invoke(inv) => self.inline(&inv.target, &inv.args, scope),

            Expression::Call(call) if call.name == call_names::APPLY => {
                let (target, args) =
                    call.args
                        .split_first()
                        .ok_or_else(|| ExpandError::InvocationTarget {
                            found: "apply call without a target".to_string(),
                        })?;
                self.inline(target, args, scope)
            }

            // The rewritable marker strips to its single argument.
            Expression::Call(call)
                if call.name == call_names::AS_EXPANDABLE && call.args.len() == 1 =>
            {
                self.visit(&call.args[0], scope)
            }

            // A compiled capture member surfaces as the expression it holds
            // instead of a call to the compiled form.
            Expression::Call(call) if call.name == call_names::COMPILE => {
                if let Some(Expression::Member(m)) = call.args.first() {
                    if let Some(expanded) = self.collapse_capture(m, scope)? {
                        return Ok(expanded);
                    }
                }
                self.rebuild_call(call, scope)
            }

            Expression::Call(call) => self.rebuild_call(call, scope),

            Expression::Member(m) => match self.collapse_capture(m, scope)? {
                Some(expanded) => Ok(expanded),
                None => {
                    let target = self.visit(&m.target, scope)?;
                    Ok(Expression::Member(Member {
                        target: Box::new(target),
                        member: m.member.clone(),
                        ty: m.ty.clone(),
                    }))
                }
            },

            Expression::Lambda(l) => {
                let body = self.visit(&l.body, scope)?;
                Ok(Expression::lambda(l.params.clone(), body))
            }

            Expression::Unary(u) => {
                let operand = self.visit(&u.operand, scope)?;
                Ok(Expression::Unary(UnaryExpr {
                    op: u.op,
                    operand: Box::new(operand),
                    ty: u.ty.clone(),
                }))
            }

            Expression::Binary(b) => {
                let left = self.visit(&b.left, scope)?;
                let right = self.visit(&b.right, scope)?;
                Ok(Expression::Binary(crate::expression::BinaryExpr {
                    op: b.op,
                    left: Box::new(left),
                    right: Box::new(right),
                    ty: b.ty.clone(),
                }))
            }
        }
    }

    fn rebuild_call(&self, call: &MethodCall, scope: &RewriteScope) -> ExpandResult<Expression> {
        let args = call
            .args
            .iter()
            .map(|a| self.visit(a, scope))
            .collect::<ExpandResult<Vec<_>>>()?;
        Ok(Expression::call(call.name.clone(), args, call.ty.clone()))
    }

    /// Inline an invocation: resolve the target to a lambda literal, bind
    /// each parameter to its expanded argument in a child scope, and expand
    /// the body under that scope.
    fn inline(
        &self,
        target: &Expression,
        args: &[Expression],
        scope: &RewriteScope,
    ) -> ExpandResult<Expression> {
        let lambda = self.resolve_target(target, scope)?;
        if lambda.params.len() != args.len() {
            return Err(ExpandError::Expression(ExpressionError::ArityMismatch {
                expected: lambda.params.len(),
                actual: args.len(),
            }));
        }

        let mut bindings = Vec::with_capacity(args.len());
        for (param, arg) in lambda.params.iter().zip(args) {
            bindings.push((param.clone(), self.visit(arg, scope)?));
        }
        let inner = scope.layered(bindings)?;
        self.visit(&lambda.body, &inner)
    }

    /// Resolve an invocation target to the lambda literal it denotes.
    fn resolve_target(
        &self,
        target: &Expression,
        scope: &RewriteScope,
    ) -> ExpandResult<Lambda> {
        match target {
            Expression::Lambda(l) => Ok(l.clone()),

            Expression::Constant(c) => match &c.value {
                Value::Expr(e) => self.resolve_target(e, scope),
                _ => Err(ExpandError::InvocationTarget {
                    found: c.ty.to_string(),
                }),
            },

            Expression::Member(m) => match self.collapse_capture(m, scope)? {
                Some(Expression::Lambda(l)) => Ok(l),
                Some(other) => Err(ExpandError::InvocationTarget {
                    found: other.ty().to_string(),
                }),
                None => Err(ExpandError::InvocationTarget {
                    found: m.ty.to_string(),
                }),
            },

            Expression::Call(c) if c.name == call_names::COMPILE => match c.args.first() {
                Some(inner) => self.resolve_target(inner, scope),
                None => Err(ExpandError::InvocationTarget {
                    found: "compile call without a target".to_string(),
                }),
            },

            Expression::Unary(u) => self.resolve_target(&u.operand, scope),

            other => Err(ExpandError::InvocationTarget {
                found: other.ty().to_string(),
            }),
        }
    }

    /// Collapse a member access into capture storage to the expression it
    /// holds. Returns `None` for ordinary member accesses, which are left
    /// untouched: only synthesized capture storage is ever collapsed, never
    /// domain data.
    fn collapse_capture(
        &self,
        m: &Member,
        scope: &RewriteScope,
    ) -> ExpandResult<Option<Expression>> {
        // A bound parameter target substitutes first; the access is then
        // revisited over the replacement rather than being evaluated
        // through a live parameter as if it were a constant.
        if let Expression::Parameter(p) = m.target.as_ref() {
            if scope.contains(p.id) {
                let target = self.visit(&m.target, scope)?;
                let rebuilt = Expression::Member(Member {
                    target: Box::new(target),
                    member: m.member.clone(),
                    ty: m.ty.clone(),
                });
                return Ok(Some(self.visit(&rebuilt, scope)?));
            }
        }

        if let Expression::Constant(c) = m.target.as_ref() {
            if let Value::Env(env) = &c.value {
                if env.is_capture_type()
                    && matches!(env.ty.field_type(&m.member), Some(Type::Expr(_)))
                {
                    return match self.resolver.resolve(env, &m.member)? {
                        Value::Expr(e) => Ok(Some(self.visit(&e, scope)?)),
                        _ => Err(ExpandError::CaptureResolution {
                            member: m.member.clone(),
                            ty: env.ty.name.clone(),
                        }),
                    };
                }
            }
        }

        Ok(None)
    }
}
