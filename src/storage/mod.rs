//! Storage Adapters
//!
//! Implementations of the [`Storage`](crate::domain::Storage) contract.

mod memory;

pub use memory::{MemoryStore, StoreSnapshot};
