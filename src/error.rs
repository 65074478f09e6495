//! Error types for the Node Pool Manager
//!
//! One error enum for every component (storage, backends, executor, facade),
//! with [`ErrorKind`] mapping each variant onto the failure taxonomy that the
//! task executor records and reports.

use crate::domain::{NodeHandle, NodeStatus, TaskName};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the pool manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    #[error("Pool not found: {pool_id}")]
    PoolNotFound { pool_id: String },

    #[error("Node not found: {node_id}")]
    NodeNotFound { node_id: u64 },

    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: u64 },

    #[error("Error record not found: {error_id}")]
    ErrorRecordNotFound { error_id: u64 },

    #[error("Invalid pool settings: {0}")]
    InvalidPoolSettings(String),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend operation failed: {provider} - {operation}: {reason}")]
    BackendOperationFailed {
        provider: String,
        operation: String,
        reason: String,
    },

    #[error("Partial creation: {} node(s) created before failure: {reason}", created.len())]
    PartialCreation {
        created: Vec<NodeHandle>,
        reason: String,
    },

    #[error("Operation {operation} is not supported by provider {provider}")]
    Unsupported { provider: String, operation: String },

    // =========================================================================
    // Concurrency Errors
    // =========================================================================
    #[error("Conflict on node {node_id}: expected status {expected}, found {actual}")]
    Conflict {
        node_id: u64,
        expected: NodeStatus,
        actual: NodeStatus,
    },

    #[error("Illegal transition for node {node_id}: {from} -> {to}")]
    IllegalTransition {
        node_id: u64,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("Task {task} already running for node {node_id} in pool {pool_id}")]
    TaskAlreadyRunning {
        pool_id: String,
        task: TaskName,
        node_id: u64,
    },

    #[error("{task} timeout after {}s", after.as_secs())]
    Timeout { task: TaskName, after: Duration },

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure taxonomy used for error records and task outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Node, pool or record could not be resolved
    NotFound,
    /// The cloud backend call failed
    BackendOperationFailure,
    /// A conditional storage update lost a race
    Conflict,
    /// The backend call exceeded its allotted time
    Timeout,
    /// The provider does not implement the operation
    Unsupported,
    /// Request or configuration was rejected before any work ran
    Invalid,
    /// Anything else
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "not_found"),
            ErrorKind::BackendOperationFailure => write!(f, "backend_operation_failure"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Unsupported => write!(f, "unsupported"),
            ErrorKind::Invalid => write!(f, "invalid"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PoolNotFound { .. }
            | Error::NodeNotFound { .. }
            | Error::TaskNotFound { .. }
            | Error::ErrorRecordNotFound { .. } => ErrorKind::NotFound,

            Error::BackendOperationFailed { .. } | Error::PartialCreation { .. } => {
                ErrorKind::BackendOperationFailure
            }

            Error::Conflict { .. }
            | Error::IllegalTransition { .. }
            | Error::TaskAlreadyRunning { .. } => ErrorKind::Conflict,

            Error::Timeout { .. } => ErrorKind::Timeout,

            Error::Unsupported { .. } => ErrorKind::Unsupported,

            Error::InvalidPoolSettings(_)
            | Error::Configuration(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorKind::Invalid,

            Error::Internal(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether re-issuing the same operation may succeed.
    ///
    /// Advisory only: the manager never retries a backend call on its own.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::BackendOperationFailure | ErrorKind::Conflict | ErrorKind::Timeout
        )
    }

    pub(crate) fn backend(
        provider: impl std::fmt::Display,
        operation: &str,
        reason: impl Into<String>,
    ) -> Self {
        Error::BackendOperationFailed {
            provider: provider.to_string(),
            operation: operation.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the pool manager
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::NodeNotFound { node_id: 7 };
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::Conflict {
            node_id: 7,
            expected: NodeStatus::Created,
            actual: NodeStatus::Deleting,
        };
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = Error::Timeout {
            task: TaskName::BootstrapMachine,
            after: Duration::from_secs(30),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.to_string().contains("timeout"));

        let err = Error::PartialCreation {
            created: vec![],
            reason: "quota".into(),
        };
        assert_eq!(err.kind(), ErrorKind::BackendOperationFailure);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::backend("ec2", "create_nodes", "throttled");
        assert!(transient.is_retryable());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());

        let missing = Error::NodeNotFound { node_id: 1 };
        assert!(!missing.is_retryable());
    }
}
