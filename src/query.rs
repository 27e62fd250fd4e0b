//! Query wrapping and execution.
//!
//! This module provides:
//! - The backend provider traits (sync and optional async capability)
//! - Sequence sources with chainable query operators
//! - The rewritable wrapper applying expansion to every query operation
//! - The execution fallback that splits untranslatable queries

pub mod expandable;
pub mod fallback;
pub mod provider;
pub mod source;

pub use expandable::{as_expandable, as_expandable_with, identity_optimizer, QueryOptimizer};
pub use fallback::SafeIter;
pub use provider::{AsyncQueryProvider, QueryError, QueryProvider, QueryResult};
pub use source::SequenceSource;
