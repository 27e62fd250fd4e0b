//! Expression expansion.
//!
//! Rewrites composed predicates into directly-translatable trees: inlines
//! invocations of quoted expressions, collapses member accesses into capture
//! environments, and strips redundant rewritable markers.

pub mod capture;
pub mod error;
pub mod expander;
pub mod scope;

pub use capture::{CaptureResolver, EnvCaptureResolver};
pub use error::{ExpandError, ExpandResult};
pub use expander::{expand, Expander};
pub use scope::RewriteScope;
