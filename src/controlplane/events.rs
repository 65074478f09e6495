//! Pool Events
//!
//! Events emitted by the executor and the facade for external consumers to
//! react to node and task lifecycle changes.

use crate::domain::{NodeStatus, TaskName, TaskStatus};
use serde::{Deserialize, Serialize};

/// Events emitted while managing pools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PoolEvent {
    /// A create task recorded a new machine
    NodeCreated {
        pool_id: String,
        node_id: u64,
        machine_id: String,
    },

    /// A node moved along its lifecycle
    NodeTransitioned {
        pool_id: String,
        node_id: u64,
        from: NodeStatus,
        to: NodeStatus,
    },

    /// A caller claimed a node
    NodeOccupied { pool_id: String, node_id: u64 },

    /// An occupant gave a node back
    NodeReleased { pool_id: String, node_id: u64 },

    /// A task was scheduled
    TaskStarted {
        pool_id: String,
        task_id: u64,
        task: TaskName,
        node_id: Option<u64>,
    },

    /// A task reached a final status
    TaskFinished {
        pool_id: String,
        task_id: u64,
        task: TaskName,
        status: TaskStatus,
    },

    /// A failure record was written
    ErrorRecorded {
        pool_id: String,
        error_id: u64,
        task: TaskName,
    },
}

impl PoolEvent {
    /// Get the pool ID associated with this event
    pub fn pool_id(&self) -> &str {
        match self {
            PoolEvent::NodeCreated { pool_id, .. } => pool_id,
            PoolEvent::NodeTransitioned { pool_id, .. } => pool_id,
            PoolEvent::NodeOccupied { pool_id, .. } => pool_id,
            PoolEvent::NodeReleased { pool_id, .. } => pool_id,
            PoolEvent::TaskStarted { pool_id, .. } => pool_id,
            PoolEvent::TaskFinished { pool_id, .. } => pool_id,
            PoolEvent::ErrorRecorded { pool_id, .. } => pool_id,
        }
    }

    /// Get the node ID if this event concerns a single node
    pub fn node_id(&self) -> Option<u64> {
        match self {
            PoolEvent::NodeCreated { node_id, .. }
            | PoolEvent::NodeTransitioned { node_id, .. }
            | PoolEvent::NodeOccupied { node_id, .. }
            | PoolEvent::NodeReleased { node_id, .. } => Some(*node_id),
            PoolEvent::TaskStarted { node_id, .. } => *node_id,
            _ => None,
        }
    }

    /// Check if this is a task-level event
    pub fn is_task_event(&self) -> bool {
        matches!(
            self,
            PoolEvent::TaskStarted { .. }
                | PoolEvent::TaskFinished { .. }
                | PoolEvent::ErrorRecorded { .. }
        )
    }
}
