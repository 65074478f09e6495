//! Error Recorder
//!
//! Append/query facade over the storage contract's error table. The task
//! executor records a failure before it resolves the task handle, so a caller
//! that observes a failed task can always find the matching record.

use super::events::PoolEvent;
use crate::domain::{ErrorModel, NewError, StorageRef, TaskName};
use crate::error::{Error, Result};
use tokio::sync::broadcast;
use tracing::warn;

/// Longest message kept in an error record; the full text goes to `info`
pub const MAX_MESSAGE_LEN: usize = 256;

/// Writes and reads task failure records
pub struct ErrorRecorder {
    store: StorageRef,
    events: broadcast::Sender<PoolEvent>,
}

impl ErrorRecorder {
    pub fn new(store: StorageRef, events: broadcast::Sender<PoolEvent>) -> Self {
        Self { store, events }
    }

    /// Persist a failure record
    pub async fn record(&self, error: NewError) -> Result<ErrorModel> {
        let model = self.store.insert_error(error).await?;

        warn!(
            pool_id = %model.pool_id,
            error_id = model.id,
            task = %model.task_name,
            kind = %model.kind,
            "Recorded task error: {}",
            model.message
        );

        let _ = self.events.send(PoolEvent::ErrorRecorded {
            pool_id: model.pool_id.clone(),
            error_id: model.id,
            task: model.task_name,
        });

        Ok(model)
    }

    /// Build and persist the record for a failed task
    pub async fn record_failure(
        &self,
        task: TaskName,
        pool_id: &str,
        error: &Error,
    ) -> Result<ErrorModel> {
        self.record(NewError {
            task_name: task,
            pool_id: pool_id.to_string(),
            kind: error.kind(),
            message: truncate(&error.to_string(), MAX_MESSAGE_LEN),
            info: format!("{:#?}", error),
        })
        .await
    }

    pub async fn list_for_pool(&self, pool_id: &str) -> Result<Vec<ErrorModel>> {
        self.store.list_errors(pool_id).await
    }

    pub async fn get(&self, error_id: u64) -> Result<Option<ErrorModel>> {
        self.store.get_error(error_id).await
    }

    /// Operator edit of an existing record
    pub async fn update(&self, error: ErrorModel) -> Result<()> {
        self.store.update_error(error).await
    }

    pub async fn delete(&self, error_id: u64) -> Result<bool> {
        self.store.delete_error(error_id).await
    }
}

fn truncate(message: &str, max_len: usize) -> String {
    if message.len() <= max_len {
        return message.to_string();
    }
    let mut end = max_len;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NodeStatus;
    use crate::error::ErrorKind;
    use crate::storage::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn recorder() -> (ErrorRecorder, broadcast::Receiver<PoolEvent>) {
        let (tx, rx) = broadcast::channel(16);
        (ErrorRecorder::new(Arc::new(MemoryStore::new()), tx), rx)
    }

    #[tokio::test]
    async fn test_record_failure_is_queryable() {
        let (recorder, mut events) = recorder();
        let err = Error::Timeout {
            task: TaskName::BootstrapMachine,
            after: Duration::from_secs(5),
        };

        let model = recorder
            .record_failure(TaskName::BootstrapMachine, "pool-1", &err)
            .await
            .unwrap();
        assert_eq!(model.kind, ErrorKind::Timeout);
        assert!(model.message.contains("timeout"));
        assert!(model.info.contains("Timeout"));

        let listed = recorder.list_for_pool("pool-1").await.unwrap();
        assert_eq!(listed, vec![model.clone()]);
        assert!(recorder.list_for_pool("pool-2").await.unwrap().is_empty());

        let event = events.try_recv().unwrap();
        assert_eq!(
            event,
            PoolEvent::ErrorRecorded {
                pool_id: "pool-1".into(),
                error_id: model.id,
                task: TaskName::BootstrapMachine,
            }
        );
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let (recorder, _events) = recorder();
        let err = Error::Conflict {
            node_id: 3,
            expected: NodeStatus::Created,
            actual: NodeStatus::Deleting,
        };
        let mut model = recorder
            .record_failure(TaskName::DeleteMachine, "pool-1", &err)
            .await
            .unwrap();

        model.info = "seen by operator".into();
        recorder.update(model.clone()).await.unwrap();
        assert_eq!(recorder.get(model.id).await.unwrap(), Some(model.clone()));

        assert!(recorder.delete(model.id).await.unwrap());
        assert_eq!(recorder.get(model.id).await.unwrap(), None);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        let long = "é".repeat(200);
        let cut = truncate(&long, 5);
        assert!(cut.ends_with("..."));
        assert!(cut.len() <= 8);
    }
}
