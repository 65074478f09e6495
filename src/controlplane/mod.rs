//! Pool Control Plane Module
//!
//! Task orchestration for node pools: the executor running lifecycle tasks
//! against cloud backends, status aggregation, error records and the
//! [`PoolManager`] facade composing them.

pub mod api;
pub mod backends;
pub mod errors;
pub mod events;
pub mod executor;
pub mod manager;
pub mod status;

pub use api::*;
pub use backends::*;
pub use errors::*;
pub use events::*;
pub use executor::*;
pub use manager::*;
pub use status::*;
