//! Node Pool Manager - Task Orchestration for Cloud Node Pools
//!
//! Manages pools of compute nodes obtained from cloud providers (EC2,
//! SoftLayer, HP Cloud), tracking every node through its lifecycle and
//! running the minutes-long provisioning operations asynchronously.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                           Pool Manager Facade                               │
//! │      status · nodes · create/delete/bootstrap · occupy · errors · tasks     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Task Executor  │  │ Status Manager  │  │       Error Recorder        │  │
//! │  │ (tokio + limits)│  │  (pure reads)   │  │   (written before resolve)  │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                  │
//! │           │        ┌───────────┴─────────────────────────┘                  │
//! │           │        │                                                        │
//! ├───────────┼────────┼────────────────────────────────────────────────────────┤
//! │  ┌────────┴────────┴───────┐            ┌──────────────────────────────┐    │
//! │  │     Storage Contract    │            │    Cloud Backend Contract    │    │
//! │  │ (CAS update, atomic     │            │  EC2 · SoftLayer · HP Cloud  │    │
//! │  │  claim, task index)     │            │  (per pool, cached)          │    │
//! │  └─────────────────────────┘            └──────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Executor, status, error recorder, facade, backends and REST API
//! - [`domain`]: Records, node lifecycle and port traits
//! - [`storage`]: In-memory implementation of the storage contract
//! - [`config`]: YAML configuration
//! - [`metrics`]: Task counters and Prometheus export
//! - [`error`]: Error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod storage;

// Re-export commonly used types
pub use controlplane::{
    ApiServer, ApiServerConfig, BackendFactory, BackendResolver, ErrorRecorder, ExecutorConfig,
    FaultPlan, PoolEvent, PoolManager, SimulatedBackend, StatusManager, TaskExecutor,
    TaskFailure, TaskHandle, TaskOutcome,
};

pub use config::ManagerConfig;

pub use domain::{
    CloudBackend, ErrorModel, MachineOptions, NodeModel, NodeSelector, NodeStatus, PoolSettings,
    PoolStatus, ProviderKind, ProviderSettings, Storage, TaskModel, TaskName, TaskStatus,
};

pub use error::{Error, ErrorKind, Result};

pub use metrics::{TaskMetrics, TaskMetricsSnapshot};

pub use storage::{MemoryStore, StoreSnapshot};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
