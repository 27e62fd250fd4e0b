//! Backend implementations.

pub mod memory;

pub use memory::{MemoryProvider, Table};
