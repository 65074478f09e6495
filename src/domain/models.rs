//! Pool, node, task and error records
//!
//! Rows are owned by the storage contract; the core reads them, computes
//! transitions and writes them back through conditional updates.

use super::lifecycle::NodeStatus;
use crate::error::ErrorKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Pool Settings
// =============================================================================

/// Cloud provider family backing a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Ec2,
    Softlayer,
    HpCloud,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::Ec2 => write!(f, "ec2"),
            ProviderKind::Softlayer => write!(f, "softlayer"),
            ProviderKind::HpCloud => write!(f, "hpcloud"),
        }
    }
}

/// Provider account details, passed through to the backend untouched
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectDetails {
    /// Access id / username
    pub identity: String,
    /// Secret key / API key
    pub credential: String,
    /// Provider endpoint override
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Provider specific extras (region, project, ...)
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl std::fmt::Debug for ConnectDetails {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectDetails")
            .field("identity", &self.identity)
            .field("credential", &"***")
            .field("endpoint", &self.endpoint)
            .field("properties", &self.properties)
            .finish()
    }
}

/// Machine creation options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineOptions {
    /// Number of machines a single create task asks for
    #[serde(default = "default_machines_count")]
    pub machines_count: u32,
    #[serde(default)]
    pub hardware_id: Option<String>,
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub image_id: Option<String>,
    #[serde(default)]
    pub os_family: Option<String>,
    /// Tags applied to created machines
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_machines_count() -> u32 {
    1
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            machines_count: default_machines_count(),
            hardware_id: None,
            location_id: None,
            image_id: None,
            os_family: None,
            tags: Vec::new(),
        }
    }
}

/// Provider selection plus its connection and machine options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    pub kind: ProviderKind,
    #[serde(default)]
    pub connect: ConnectDetails,
    #[serde(default)]
    pub machine: MachineOptions,
}

/// Identity and provider configuration of a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSettings {
    /// Pool id; node, task and error rows reference it
    pub uuid: String,
    /// Human readable name, also used as the machine group name
    #[serde(default)]
    pub name: String,
    pub provider: ProviderSettings,
}

impl PoolSettings {
    pub fn new(uuid: impl Into<String>, name: impl Into<String>, provider: ProviderSettings) -> Self {
        Self {
            uuid: uuid.into(),
            name: name.into(),
            provider,
        }
    }

    /// Machine group name at the provider
    pub fn group_name(&self) -> &str {
        if self.name.is_empty() {
            &self.uuid
        } else {
            &self.name
        }
    }
}

// =============================================================================
// Node Model
// =============================================================================

/// Login credentials of a provisioned machine
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineCredentials {
    pub user: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key: Option<String>,
}

impl std::fmt::Debug for MachineCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineCredentials")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .finish()
    }
}

/// A node tracked by the pool manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeModel {
    /// Storage assigned id, immutable
    pub id: u64,
    pub pool_id: String,
    pub status: NodeStatus,
    /// Provider side machine id
    pub machine_id: Option<String>,
    pub ip: Option<String>,
    pub credentials: Option<MachineCredentials>,
    pub occupied: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Values for a row the storage has not assigned an id to yet
#[derive(Debug, Clone, PartialEq)]
pub struct NewNode {
    pub pool_id: String,
    pub status: NodeStatus,
    pub machine_id: Option<String>,
    pub ip: Option<String>,
    pub credentials: Option<MachineCredentials>,
}

impl NewNode {
    /// Placeholder row for a machine about to be created
    pub fn creating(pool_id: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            status: NodeStatus::Creating,
            machine_id: None,
            ip: None,
            credentials: None,
        }
    }
}

/// Field changes written together with a status change
#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdate {
    pub status: NodeStatus,
    pub machine_id: Option<String>,
    pub ip: Option<String>,
    pub credentials: Option<MachineCredentials>,
    pub occupied: Option<bool>,
}

impl NodeUpdate {
    /// Status change only
    pub fn status(status: NodeStatus) -> Self {
        Self {
            status,
            machine_id: None,
            ip: None,
            credentials: None,
            occupied: None,
        }
    }

    pub fn with_machine(
        mut self,
        machine_id: impl Into<String>,
        ip: Option<String>,
        credentials: Option<MachineCredentials>,
    ) -> Self {
        self.machine_id = Some(machine_id.into());
        self.ip = ip;
        self.credentials = credentials;
        self
    }

    pub fn with_occupied(mut self, occupied: bool) -> Self {
        self.occupied = Some(occupied);
        self
    }

    /// Apply to a row; `None` fields are left untouched
    pub fn apply(&self, node: &mut NodeModel) {
        node.status = self.status;
        if let Some(machine_id) = &self.machine_id {
            node.machine_id = Some(machine_id.clone());
        }
        if let Some(ip) = &self.ip {
            node.ip = Some(ip.clone());
        }
        if let Some(credentials) = &self.credentials {
            node.credentials = Some(credentials.clone());
        }
        if let Some(occupied) = self.occupied {
            node.occupied = occupied;
        }
        node.updated_at = Utc::now();
    }
}

// =============================================================================
// Task Model
// =============================================================================

/// Asynchronous lifecycle operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TaskName {
    CreateMachine,
    DeleteMachine,
    BootstrapMachine,
}

impl TaskName {
    pub const ALL: [TaskName; 3] = [
        TaskName::CreateMachine,
        TaskName::DeleteMachine,
        TaskName::BootstrapMachine,
    ];

    /// Whether the task operates on one existing node
    pub fn targets_node(self) -> bool {
        !matches!(self, TaskName::CreateMachine)
    }
}

impl std::fmt::Display for TaskName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskName::CreateMachine => write!(f, "CreateMachine"),
            TaskName::DeleteMachine => write!(f, "DeleteMachine"),
            TaskName::BootstrapMachine => write!(f, "BootstrapMachine"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
}

/// One asynchronous operation, in flight or finished
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskModel {
    pub id: u64,
    pub pool_id: String,
    pub task_name: TaskName,
    /// Target node for node-targeted tasks
    pub node_id: Option<u64>,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub pool_id: String,
    pub task_name: TaskName,
    pub node_id: Option<u64>,
}

// =============================================================================
// Error Model
// =============================================================================

/// Recorded failure of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorModel {
    pub id: u64,
    pub task_name: TaskName,
    pub pool_id: String,
    pub kind: ErrorKind,
    /// Short message
    pub message: String,
    /// Diagnostic detail
    pub info: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewError {
    pub task_name: TaskName,
    pub pool_id: String,
    pub kind: ErrorKind,
    pub message: String,
    pub info: String,
}

// =============================================================================
// Pool Status
// =============================================================================

/// Node counts of one pool, computed on demand
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub pool_id: String,
    pub total_nodes: u64,
    /// Nodes a caller could occupy right now
    pub available_nodes: u64,
    pub occupied_nodes: u64,
    pub counts: BTreeMap<NodeStatus, u64>,
}

impl PoolStatus {
    /// Count of nodes in `status`
    pub fn count(&self, status: NodeStatus) -> u64 {
        self.counts.get(&status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(status: NodeStatus) -> NodeModel {
        let now = Utc::now();
        NodeModel {
            id: 1,
            pool_id: "pool-a".into(),
            status,
            machine_id: None,
            ip: None,
            credentials: None,
            occupied: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_node_update_keeps_unset_fields() {
        let mut n = node(NodeStatus::Creating);
        NodeUpdate::status(NodeStatus::Created)
            .with_machine("i-123", Some("10.0.0.4".into()), None)
            .apply(&mut n);
        assert_eq!(n.status, NodeStatus::Created);
        assert_eq!(n.machine_id.as_deref(), Some("i-123"));

        NodeUpdate::status(NodeStatus::Bootstrapping).apply(&mut n);
        assert_eq!(n.machine_id.as_deref(), Some("i-123"));
        assert_eq!(n.ip.as_deref(), Some("10.0.0.4"));
    }

    #[test]
    fn test_credentials_debug_redacted() {
        let creds = MachineCredentials {
            user: "root".into(),
            password: Some("hunter2".into()),
            private_key: None,
        };
        let rendered = format!("{:?}", creds);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("root"));
    }

    #[test]
    fn test_pool_settings_yaml() {
        let yaml = r#"
uuid: pool-1
name: web
provider:
  kind: ec2
  connect:
    identity: AKIA
    credential: secret
  machine:
    machinesCount: 3
    tags: [widget]
"#;
        let settings: PoolSettings = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(settings.provider.kind, ProviderKind::Ec2);
        assert_eq!(settings.provider.machine.machines_count, 3);
        assert_eq!(settings.group_name(), "web");
    }

    #[test]
    fn test_task_targets_node() {
        assert!(!TaskName::CreateMachine.targets_node());
        assert!(TaskName::DeleteMachine.targets_node());
        assert!(TaskName::BootstrapMachine.targets_node());
    }
}
