//! Node lifecycle states and the legal transitions between them.
//!
//! ```text
//! CREATING -> CREATED -> BOOTSTRAPPING -> RUNNING -> (OCCUPIED <-> IDLE) -> DELETING -> DELETED
//!                 \____________________________________________________/
//!                      any non-terminal state -> ERROR -> BOOTSTRAPPING | DELETING
//! ```

use serde::{Deserialize, Serialize};

/// Lifecycle status of a pool node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Row reserved while a create task is in flight
    Creating,
    /// Machine exists at the provider, not yet bootstrapped
    Created,
    /// Bootstrap script is running on the machine
    Bootstrapping,
    /// Bootstrapped and never handed out
    Running,
    /// Claimed by a caller
    Occupied,
    /// Released by its occupant and available again
    Idle,
    /// Delete task in flight
    Deleting,
    /// Machine deleted at the provider
    Deleted,
    /// A backend operation failed; operator retry is possible
    Error,
}

impl NodeStatus {
    /// All states, in lifecycle order
    pub const ALL: [NodeStatus; 9] = [
        NodeStatus::Creating,
        NodeStatus::Created,
        NodeStatus::Bootstrapping,
        NodeStatus::Running,
        NodeStatus::Occupied,
        NodeStatus::Idle,
        NodeStatus::Deleting,
        NodeStatus::Deleted,
        NodeStatus::Error,
    ];

    /// Whether `self -> next` is an edge of the lifecycle graph
    pub fn can_transition_to(self, next: NodeStatus) -> bool {
        use NodeStatus::*;

        match (self, next) {
            (Creating, Created) => true,
            (Created, Bootstrapping) => true,
            (Bootstrapping, Running) => true,
            (Running, Occupied) | (Running, Idle) => true,
            (Idle, Occupied) | (Occupied, Idle) => true,
            (Created | Running | Idle | Occupied | Error, Deleting) => true,
            (Deleting, Deleted) => true,
            // operator retry
            (Error, Bootstrapping) => true,
            (Error, Error) | (Deleted, _) => false,
            (_, Error) => true,
            _ => false,
        }
    }

    /// Markers held only while a create or delete task runs
    pub fn is_transient(self) -> bool {
        matches!(self, NodeStatus::Creating | NodeStatus::Deleting)
    }

    /// A task currently owns the node
    pub fn is_in_flight(self) -> bool {
        self.is_transient() || self == NodeStatus::Bootstrapping
    }

    pub fn is_terminal(self) -> bool {
        self == NodeStatus::Deleted
    }

    /// Bootstrapped and not held by anyone
    pub fn is_claimable(self) -> bool {
        matches!(self, NodeStatus::Running | NodeStatus::Idle)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Creating => write!(f, "CREATING"),
            NodeStatus::Created => write!(f, "CREATED"),
            NodeStatus::Bootstrapping => write!(f, "BOOTSTRAPPING"),
            NodeStatus::Running => write!(f, "RUNNING"),
            NodeStatus::Occupied => write!(f, "OCCUPIED"),
            NodeStatus::Idle => write!(f, "IDLE"),
            NodeStatus::Deleting => write!(f, "DELETING"),
            NodeStatus::Deleted => write!(f, "DELETED"),
            NodeStatus::Error => write!(f, "ERROR"),
        }
    }
}
