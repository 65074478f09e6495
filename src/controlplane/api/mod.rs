//! API Module
//!
//! REST API for operators: pools, nodes, lifecycle tasks and task errors.

pub mod server;
pub mod rest;

pub use server::*;
pub use rest::*;
