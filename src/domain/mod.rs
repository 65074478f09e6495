//! Domain layer - Records, lifecycle rules and port definitions
//!
//! This module defines the core traits (ports) that adapters implement,
//! following hexagonal architecture principles.

pub mod lifecycle;
pub mod models;
pub mod ports;

pub use lifecycle::*;
pub use models::*;
pub use ports::*;
