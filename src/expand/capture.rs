//! The capture resolution seam.

use crate::expand::error::{ExpandError, ExpandResult};
use crate::expression::{CaptureEnv, Value};

/// Resolves a single member access into a capture environment.
///
/// This is the only point at which the expander evaluates anything: a pure,
/// side-effect-free accessor over the host's representation of captured
/// state. A failure here propagates to the caller unmodified; it is never
/// retried.
pub trait CaptureResolver {
    fn resolve(&self, env: &CaptureEnv, member: &str) -> ExpandResult<Value>;
}

/// Default resolver reading directly from the environment record.
#[derive(Debug, Default)]
pub struct EnvCaptureResolver;

impl CaptureResolver for EnvCaptureResolver {
    fn resolve(&self, env: &CaptureEnv, member: &str) -> ExpandResult<Value> {
        env.get(member)
            .cloned()
            .ok_or_else(|| ExpandError::CaptureResolution {
                member: member.to_string(),
                ty: env.ty.name.clone(),
            })
    }
}
