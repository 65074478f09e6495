//! Domain Ports - Boundaries to the cloud provider and to durable storage
//!
//! The orchestration core depends only on these traits. Adapters implement
//! them: the simulated provider in `controlplane::backends` and the
//! in-memory store in `storage`.

use super::lifecycle::NodeStatus;
use super::models::{
    ConnectDetails, ErrorModel, MachineCredentials, MachineOptions, NewError, NewNode, NewTask,
    NodeModel, NodeUpdate, ProviderKind, TaskModel, TaskStatus,
};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Cloud Backend Types
// =============================================================================

/// Provider side machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    Pending,
    Running,
    Suspended,
    Terminated,
    Error,
    Unrecognized,
}

/// A machine as reported by the provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHandle {
    /// Provider machine id
    pub id: String,
    pub name: String,
    pub state: MachineState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub credentials: Option<MachineCredentials>,
    pub tags: Vec<String>,
}

/// How a provider lists the machines of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSelector {
    /// Running machines carrying this tag
    Tag(String),
    /// Machines whose name starts with this prefix
    NameMask(String),
    All,
}

/// SSH login used to run a script on a machine
#[derive(Clone, PartialEq, Eq)]
pub struct SshDetails {
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
}

impl SshDetails {
    pub fn from_credentials(credentials: &MachineCredentials, port: u16) -> Self {
        Self {
            port,
            user: credentials.user.clone(),
            password: credentials.password.clone(),
            private_key: credentials.private_key.clone(),
        }
    }
}

impl std::fmt::Debug for SshDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshDetails")
            .field("port", &self.port)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

/// Result of a remote script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecOutput {
    pub exit_status: i32,
    pub output: String,
    pub error: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_status == 0
    }
}

// =============================================================================
// Cloud Backend Port
// =============================================================================

/// Provisioning and execution capability of one provider account
#[async_trait]
pub trait CloudBackend: Send + Sync {
    /// Provider family
    fn provider(&self) -> ProviderKind;

    /// Open the provider session
    async fn connect(&self, details: &ConnectDetails) -> Result<()>;

    /// List machines matching a selector
    async fn list_nodes(&self, selector: &NodeSelector) -> Result<Vec<NodeHandle>>;

    /// Look up one machine
    async fn get_node(&self, machine_id: &str) -> Result<Option<NodeHandle>>;

    /// Create `count` machines in a group.
    ///
    /// When only some machines come up the error is
    /// [`Error::PartialCreation`](crate::error::Error::PartialCreation) carrying
    /// the handles that do exist.
    async fn create_nodes(
        &self,
        group: &str,
        count: u32,
        options: &MachineOptions,
    ) -> Result<Vec<NodeHandle>>;

    /// Destroy a machine
    async fn delete_node(&self, machine_id: &str) -> Result<()>;

    /// Reboot a machine
    async fn reboot_node(&self, machine_id: &str) -> Result<()>;

    /// Run a script over SSH
    async fn run_script(&self, script: &str, ip: &str, ssh: &SshDetails) -> Result<ExecOutput>;
}

// =============================================================================
// Storage Port
// =============================================================================

/// Durable node, task and error tables.
///
/// Besides plain CRUD, two primitives must be atomic at the storage level:
/// [`compare_and_set_node`](Storage::compare_and_set_node) and
/// [`claim_idle_node`](Storage::claim_idle_node). Several manager processes
/// may share one store, so no in-process lock can stand in for them.
#[async_trait]
pub trait Storage: Send + Sync {
    // -- nodes --------------------------------------------------------------

    /// Insert a node row and assign its id
    async fn insert_node(&self, node: NewNode) -> Result<NodeModel>;

    async fn get_node(&self, node_id: u64) -> Result<Option<NodeModel>>;

    async fn list_nodes(&self, pool_id: &str) -> Result<Vec<NodeModel>>;

    /// Apply `update` only if the row is currently in `expected`.
    ///
    /// Fails with `Conflict` when the status differs and `NodeNotFound` when
    /// the row does not exist.
    async fn compare_and_set_node(
        &self,
        node_id: u64,
        expected: NodeStatus,
        update: NodeUpdate,
    ) -> Result<NodeModel>;

    /// Atomically pick one claimable node of the pool and mark it occupied
    async fn claim_idle_node(&self, pool_id: &str) -> Result<Option<NodeModel>>;

    /// Remove a row only if it is still in `expected`
    async fn remove_node_if(&self, node_id: u64, expected: NodeStatus) -> Result<()>;

    /// Pools that own at least one node row
    async fn pool_ids(&self) -> Result<Vec<String>>;

    // -- tasks --------------------------------------------------------------

    /// Insert a RUNNING task.
    ///
    /// Fails with `TaskAlreadyRunning` if a node-targeted task with the same
    /// pool, name and node is already running.
    async fn insert_task(&self, task: NewTask) -> Result<TaskModel>;

    /// Move a RUNNING task to a final status
    async fn finish_task(&self, task_id: u64, status: TaskStatus) -> Result<TaskModel>;

    async fn get_task(&self, task_id: u64) -> Result<Option<TaskModel>>;

    async fn list_tasks(&self, pool_id: &str) -> Result<Vec<TaskModel>>;

    // -- errors -------------------------------------------------------------

    async fn insert_error(&self, error: NewError) -> Result<ErrorModel>;

    async fn get_error(&self, error_id: u64) -> Result<Option<ErrorModel>>;

    async fn list_errors(&self, pool_id: &str) -> Result<Vec<ErrorModel>>;

    /// Overwrite an existing error record
    async fn update_error(&self, error: ErrorModel) -> Result<()>;

    /// Returns whether a row was removed
    async fn delete_error(&self, error_id: u64) -> Result<bool>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type CloudBackendRef = Arc<dyn CloudBackend>;
pub type StorageRef = Arc<dyn Storage>;
