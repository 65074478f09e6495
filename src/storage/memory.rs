//! In-Memory Store
//!
//! DashMap-backed implementation of the storage contract. Every conditional
//! write runs while holding the row's shard lock, which gives the same
//! guarantees as a single-row `UPDATE ... WHERE status = ?` in a database.

use crate::domain::{
    ErrorModel, NewError, NewNode, NewTask, NodeModel, NodeStatus, NodeUpdate, Storage,
    TaskModel, TaskName, TaskStatus,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Key of the RUNNING-task index
type RunningKey = (String, TaskName, u64);

// =============================================================================
// Snapshot
// =============================================================================

/// Serialized content of all tables
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub nodes: Vec<NodeModel>,
    pub tasks: Vec<TaskModel>,
    pub errors: Vec<ErrorModel>,
}

// =============================================================================
// Memory Store
// =============================================================================

/// Node, task and error tables held in memory
pub struct MemoryStore {
    nodes: DashMap<u64, NodeModel>,
    tasks: DashMap<u64, TaskModel>,
    errors: DashMap<u64, ErrorModel>,
    /// Running node-targeted tasks -> task id
    running: DashMap<RunningKey, u64>,
    node_seq: AtomicU64,
    task_seq: AtomicU64,
    error_seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            tasks: DashMap::new(),
            errors: DashMap::new(),
            running: DashMap::new(),
            node_seq: AtomicU64::new(0),
            task_seq: AtomicU64::new(0),
            error_seq: AtomicU64::new(0),
        }
    }

    /// Rebuild a store from a snapshot, continuing id sequences after the
    /// highest restored id
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let store = Self::new();

        for node in snapshot.nodes {
            store.node_seq.fetch_max(node.id, Ordering::SeqCst);
            store.nodes.insert(node.id, node);
        }
        for task in snapshot.tasks {
            store.task_seq.fetch_max(task.id, Ordering::SeqCst);
            if task.status == TaskStatus::Running {
                if let Some(node_id) = task.node_id {
                    store
                        .running
                        .insert((task.pool_id.clone(), task.task_name, node_id), task.id);
                }
            }
            store.tasks.insert(task.id, task);
        }
        for error in snapshot.errors {
            store.error_seq.fetch_max(error.id, Ordering::SeqCst);
            store.errors.insert(error.id, error);
        }

        store
    }

    /// Copy all tables, ordered by id
    pub fn snapshot(&self) -> StoreSnapshot {
        let mut nodes: Vec<_> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by_key(|n| n.id);
        let mut tasks: Vec<_> = self.tasks.iter().map(|e| e.value().clone()).collect();
        tasks.sort_by_key(|t| t.id);
        let mut errors: Vec<_> = self.errors.iter().map(|e| e.value().clone()).collect();
        errors.sort_by_key(|e| e.id);

        StoreSnapshot { nodes, tasks, errors }
    }

    /// Write all tables to a JSON file
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let snapshot = self.snapshot();
        let data = serde_json::to_vec_pretty(&snapshot)?;

        // write-then-rename so a crash never leaves a torn file
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;

        info!(
            path = %path.display(),
            nodes = snapshot.nodes.len(),
            tasks = snapshot.tasks.len(),
            errors = snapshot.errors.len(),
            "Saved store snapshot"
        );
        Ok(())
    }

    /// Load a store from a JSON file written by [`save_snapshot`](Self::save_snapshot)
    pub async fn load_snapshot(path: impl AsRef<Path>) -> Result<Self> {
        let data = tokio::fs::read(path.as_ref()).await?;
        let snapshot: StoreSnapshot = serde_json::from_slice(&data)?;
        info!(
            path = %path.as_ref().display(),
            nodes = snapshot.nodes.len(),
            "Loaded store snapshot"
        );
        Ok(Self::from_snapshot(snapshot))
    }

    fn next_id(seq: &AtomicU64) -> u64 {
        seq.fetch_add(1, Ordering::SeqCst) + 1
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn insert_node(&self, node: NewNode) -> Result<NodeModel> {
        let now = Utc::now();
        let model = NodeModel {
            id: Self::next_id(&self.node_seq),
            pool_id: node.pool_id,
            status: node.status,
            machine_id: node.machine_id,
            ip: node.ip,
            credentials: node.credentials,
            occupied: false,
            created_at: now,
            updated_at: now,
        };
        self.nodes.insert(model.id, model.clone());
        Ok(model)
    }

    async fn get_node(&self, node_id: u64) -> Result<Option<NodeModel>> {
        Ok(self.nodes.get(&node_id).map(|e| e.value().clone()))
    }

    async fn list_nodes(&self, pool_id: &str) -> Result<Vec<NodeModel>> {
        let mut nodes: Vec<_> = self
            .nodes
            .iter()
            .filter(|e| e.pool_id == pool_id)
            .map(|e| e.value().clone())
            .collect();
        nodes.sort_by_key(|n| n.id);
        Ok(nodes)
    }

    async fn compare_and_set_node(
        &self,
        node_id: u64,
        expected: NodeStatus,
        update: NodeUpdate,
    ) -> Result<NodeModel> {
        let mut entry = self
            .nodes
            .get_mut(&node_id)
            .ok_or(Error::NodeNotFound { node_id })?;

        if entry.status != expected {
            debug!(node_id, %expected, actual = %entry.status, "Conditional node update rejected");
            return Err(Error::Conflict {
                node_id,
                expected,
                actual: entry.status,
            });
        }

        update.apply(entry.value_mut());
        Ok(entry.value().clone())
    }

    async fn claim_idle_node(&self, pool_id: &str) -> Result<Option<NodeModel>> {
        let mut candidates: Vec<u64> = self
            .nodes
            .iter()
            .filter(|e| e.pool_id == pool_id && e.status.is_claimable() && !e.occupied)
            .map(|e| *e.key())
            .collect();
        candidates.sort_unstable();

        // The scan above is only a hint; the claim itself re-checks under the row lock.
        for node_id in candidates {
            if let Some(mut entry) = self.nodes.get_mut(&node_id) {
                if entry.status.is_claimable() && !entry.occupied {
                    NodeUpdate::status(NodeStatus::Occupied)
                        .with_occupied(true)
                        .apply(entry.value_mut());
                    return Ok(Some(entry.value().clone()));
                }
            }
        }

        Ok(None)
    }

    async fn remove_node_if(&self, node_id: u64, expected: NodeStatus) -> Result<()> {
        match self.nodes.remove_if(&node_id, |_, n| n.status == expected) {
            Some(_) => Ok(()),
            None => match self.nodes.get(&node_id) {
                Some(n) => Err(Error::Conflict {
                    node_id,
                    expected,
                    actual: n.status,
                }),
                None => Err(Error::NodeNotFound { node_id }),
            },
        }
    }

    async fn pool_ids(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.nodes.iter().map(|e| e.pool_id.clone()).collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn insert_task(&self, task: NewTask) -> Result<TaskModel> {
        let build = |id: u64, task: NewTask| TaskModel {
            id,
            pool_id: task.pool_id,
            task_name: task.task_name,
            node_id: task.node_id,
            status: TaskStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        };

        let model = match task.node_id {
            Some(node_id) if task.task_name.targets_node() => {
                match self.running.entry((task.pool_id.clone(), task.task_name, node_id)) {
                    Entry::Occupied(_) => {
                        return Err(Error::TaskAlreadyRunning {
                            pool_id: task.pool_id,
                            task: task.task_name,
                            node_id,
                        })
                    }
                    Entry::Vacant(slot) => {
                        let model = build(Self::next_id(&self.task_seq), task);
                        self.tasks.insert(model.id, model.clone());
                        slot.insert(model.id);
                        model
                    }
                }
            }
            _ => {
                let model = build(Self::next_id(&self.task_seq), task);
                self.tasks.insert(model.id, model.clone());
                model
            }
        };

        Ok(model)
    }

    async fn finish_task(&self, task_id: u64, status: TaskStatus) -> Result<TaskModel> {
        let finished = {
            let mut entry = self
                .tasks
                .get_mut(&task_id)
                .ok_or(Error::TaskNotFound { task_id })?;
            if entry.status != TaskStatus::Running {
                return Err(Error::Internal(format!("task {} already finished", task_id)));
            }
            entry.status = status;
            entry.finished_at = Some(Utc::now());
            entry.value().clone()
        };

        if let Some(node_id) = finished.node_id {
            self.running
                .remove_if(&(finished.pool_id.clone(), finished.task_name, node_id), |_, id| {
                    *id == task_id
                });
        }

        Ok(finished)
    }

    async fn get_task(&self, task_id: u64) -> Result<Option<TaskModel>> {
        Ok(self.tasks.get(&task_id).map(|e| e.value().clone()))
    }

    async fn list_tasks(&self, pool_id: &str) -> Result<Vec<TaskModel>> {
        let mut tasks: Vec<_> = self
            .tasks
            .iter()
            .filter(|e| e.pool_id == pool_id)
            .map(|e| e.value().clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn insert_error(&self, error: NewError) -> Result<ErrorModel> {
        let model = ErrorModel {
            id: Self::next_id(&self.error_seq),
            task_name: error.task_name,
            pool_id: error.pool_id,
            kind: error.kind,
            message: error.message,
            info: error.info,
            created_at: Utc::now(),
        };
        self.errors.insert(model.id, model.clone());
        Ok(model)
    }

    async fn get_error(&self, error_id: u64) -> Result<Option<ErrorModel>> {
        Ok(self.errors.get(&error_id).map(|e| e.value().clone()))
    }

    async fn list_errors(&self, pool_id: &str) -> Result<Vec<ErrorModel>> {
        let mut errors: Vec<_> = self
            .errors
            .iter()
            .filter(|e| e.pool_id == pool_id)
            .map(|e| e.value().clone())
            .collect();
        errors.sort_by_key(|e| e.id);
        Ok(errors)
    }

    async fn update_error(&self, error: ErrorModel) -> Result<()> {
        match self.errors.get_mut(&error.id) {
            Some(mut entry) => {
                *entry.value_mut() = error;
                Ok(())
            }
            None => Err(Error::ErrorRecordNotFound { error_id: error.id }),
        }
    }

    async fn delete_error(&self, error_id: u64) -> Result<bool> {
        Ok(self.errors.remove(&error_id).is_some())
    }
}
