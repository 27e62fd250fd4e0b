//! Scoped parameter bindings used during invocation inlining.

use std::collections::HashMap;

use crate::expand::error::{ExpandError, ExpandResult};
use crate::expression::{Expression, ParamId, Parameter};

/// Mapping from bound parameter identities to replacement subtrees.
///
/// One layer is created per inlined invocation: the child map copies all
/// enclosing bindings and adds the new ones, so outer bindings stay visible
/// in nested inlining. Layers live only for the duration of the recursive
/// calls they are passed to and are never shared between top-level expand
/// calls.
#[derive(Debug, Clone, Default)]
pub struct RewriteScope {
    bindings: HashMap<ParamId, Expression>,
}

impl RewriteScope {
    /// The empty scope active at the root of an expansion.
    pub fn root() -> Self {
        Self::default()
    }

    /// Replacement bound to `id`, if any.
    pub fn lookup(&self, id: ParamId) -> Option<&Expression> {
        self.bindings.get(&id)
    }

    pub fn contains(&self, id: ParamId) -> bool {
        self.bindings.contains_key(&id)
    }

    /// Create a child scope holding all enclosing bindings plus `new_bindings`.
    ///
    /// Binding an identifier already bound in the enclosing chain is a
    /// self-referential invocation and fails immediately.
    pub fn layered(
        &self,
        new_bindings: Vec<(Parameter, Expression)>,
    ) -> ExpandResult<Self> {
        let mut bindings = self.bindings.clone();
        for (param, replacement) in new_bindings {
            if bindings.contains_key(&param.id) {
                return Err(ExpandError::RecursiveInvocation {
                    parameter: param.name,
                });
            }
            bindings.insert(param.id, replacement);
        }
        Ok(Self { bindings })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::Type;

    #[test]
    fn test_layering_keeps_outer_bindings_visible() -> ExpandResult<()> {
        let outer_param = Parameter::fresh("x", Type::int32());
        let inner_param = Parameter::fresh("y", Type::int32());

        let root = RewriteScope::root();
        let outer = root.layered(vec![(outer_param.clone(), Expression::int32(1))])?;
        let inner = outer.layered(vec![(inner_param.clone(), Expression::int32(2))])?;

        assert_eq!(inner.lookup(outer_param.id), Some(&Expression::int32(1)));
        assert_eq!(inner.lookup(inner_param.id), Some(&Expression::int32(2)));
        assert!(root.lookup(outer_param.id).is_none());
        Ok(())
    }

    #[test]
    fn test_rebinding_fails() {
        let param = Parameter::fresh("x", Type::int32());
        let scope = RewriteScope::root()
            .layered(vec![(param.clone(), Expression::int32(1))])
            .unwrap();

        let err = scope.layered(vec![(param, Expression::int32(2))]);
        assert!(matches!(err, Err(ExpandError::RecursiveInvocation { .. })));
    }

    #[test]
    fn test_same_name_different_identity_is_fine() -> ExpandResult<()> {
        let a = Parameter::fresh("x", Type::int32());
        let b = Parameter::fresh("x", Type::int32());

        let scope = RewriteScope::root()
            .layered(vec![(a, Expression::int32(1))])?
            .layered(vec![(b, Expression::int32(2))])?;
        assert_eq!(scope.bindings.len(), 2);
        Ok(())
    }
}
