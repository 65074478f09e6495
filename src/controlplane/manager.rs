//! Pool Manager - The single entry point for callers
//!
//! Composes the storage contract, the task executor, the status manager and
//! the error recorder. Reads go straight to storage; lifecycle operations are
//! handed to the executor and return a [`TaskHandle`] without waiting on the
//! backend.

use super::backends::{BackendFactory, BackendResolver};
use super::errors::ErrorRecorder;
use super::events::PoolEvent;
use super::executor::{ExecutorConfig, TaskExecutor, TaskHandle};
use super::status::StatusManager;
use crate::domain::{
    ErrorModel, NodeHandle, NodeModel, NodeStatus, NodeUpdate, PoolSettings, PoolStatus, StorageRef,
    TaskModel, TaskStatus,
};
use crate::error::{Error, Result};
use crate::metrics::TaskMetrics;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the pool event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

// =============================================================================
// Pool Manager
// =============================================================================

pub struct PoolManager {
    store: StorageRef,
    executor: Arc<TaskExecutor>,
    backends: Arc<dyn BackendResolver>,
    status: StatusManager,
    errors: Arc<ErrorRecorder>,
    events: broadcast::Sender<PoolEvent>,
    /// Registered pools by uuid
    pools: RwLock<BTreeMap<String, PoolSettings>>,
}

impl PoolManager {
    /// Create a new pool manager
    pub fn new(
        config: ExecutorConfig,
        store: StorageRef,
        backends: Arc<dyn BackendResolver>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let errors = Arc::new(ErrorRecorder::new(store.clone(), events.clone()));
        let executor = TaskExecutor::new(
            config,
            store.clone(),
            backends.clone(),
            errors.clone(),
            events.clone(),
            Arc::new(TaskMetrics::new()),
        );

        Arc::new(Self {
            status: StatusManager::new(store.clone()),
            store,
            executor,
            backends,
            errors,
            events,
            pools: RwLock::new(BTreeMap::new()),
        })
    }

    /// Receive pool events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn metrics(&self) -> Arc<TaskMetrics> {
        self.executor.metrics().clone()
    }

    // -------------------------------------------------------------------------
    // Pool registry
    // -------------------------------------------------------------------------

    /// Register or replace a pool
    pub fn register_pool(&self, pool: PoolSettings) -> Result<()> {
        validate(&pool)?;
        info!(pool_id = %pool.uuid, name = %pool.name, provider = %pool.provider.kind, "Registering pool");
        self.pools.write().insert(pool.uuid.clone(), pool);
        Ok(())
    }

    pub fn get_pool(&self, pool_id: &str) -> Option<PoolSettings> {
        self.pools.read().get(pool_id).cloned()
    }

    /// Registered pool or `PoolNotFound`
    pub fn require_pool(&self, pool_id: &str) -> Result<PoolSettings> {
        self.get_pool(pool_id).ok_or_else(|| Error::PoolNotFound {
            pool_id: pool_id.to_string(),
        })
    }

    pub fn list_pools(&self) -> Vec<PoolSettings> {
        self.pools.read().values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Status
    // -------------------------------------------------------------------------

    pub async fn get_status(&self, pool: &PoolSettings) -> Result<PoolStatus> {
        validate(pool)?;
        self.status.pool_status(&pool.uuid).await
    }

    /// Status of every registered pool and every pool with rows in storage
    pub async fn list_statuses(&self) -> Result<Vec<PoolStatus>> {
        let mut statuses: BTreeMap<String, PoolStatus> = self
            .status
            .list_all_pool_statuses()
            .await?
            .into_iter()
            .map(|s| (s.pool_id.clone(), s))
            .collect();

        for pool_id in self.pools.read().keys() {
            statuses
                .entry(pool_id.clone())
                .or_insert_with(|| PoolStatus {
                    pool_id: pool_id.clone(),
                    ..Default::default()
                });
        }

        Ok(statuses.into_values().collect())
    }

    // -------------------------------------------------------------------------
    // Nodes
    // -------------------------------------------------------------------------

    pub async fn list_nodes(&self, pool: &PoolSettings) -> Result<Vec<NodeModel>> {
        validate(pool)?;
        self.store.list_nodes(&pool.uuid).await
    }

    /// `None` for an unknown id
    pub async fn get_node(&self, node_id: u64) -> Result<Option<NodeModel>> {
        self.store.get_node(node_id).await
    }

    pub async fn create_node(&self, pool: &PoolSettings) -> Result<TaskHandle<Vec<NodeModel>>> {
        self.executor.create_machines(pool).await
    }

    pub async fn delete_node(
        &self,
        pool: &PoolSettings,
        node_id: u64,
    ) -> Result<TaskHandle<NodeModel>> {
        self.executor.delete_machine(pool, node_id).await
    }

    pub async fn bootstrap_node(
        &self,
        pool: &PoolSettings,
        node_id: u64,
    ) -> Result<TaskHandle<NodeModel>> {
        self.executor.bootstrap_machine(pool, node_id).await
    }

    /// Claim one idle node of the pool, or `None` if none is available.
    ///
    /// The claim is a single atomic storage primitive; concurrent callers
    /// never receive the same node.
    pub async fn occupy(&self, pool: &PoolSettings) -> Result<Option<NodeModel>> {
        validate(pool)?;
        let claimed = self.store.claim_idle_node(&pool.uuid).await?;

        match &claimed {
            Some(node) => {
                info!(pool_id = %pool.uuid, node_id = node.id, "Node occupied");
                let _ = self.events.send(PoolEvent::NodeOccupied {
                    pool_id: pool.uuid.clone(),
                    node_id: node.id,
                });
            }
            None => debug!(pool_id = %pool.uuid, "No idle node to occupy"),
        }

        Ok(claimed)
    }

    /// Return an occupied node to the idle set
    pub async fn release(&self, pool: &PoolSettings, node_id: u64) -> Result<NodeModel> {
        validate(pool)?;
        let node = match self.store.get_node(node_id).await? {
            Some(node) if node.pool_id == pool.uuid => node,
            _ => return Err(Error::NodeNotFound { node_id }),
        };

        if node.status != NodeStatus::Occupied {
            return Err(Error::IllegalTransition {
                node_id,
                from: node.status,
                to: NodeStatus::Idle,
            });
        }

        let released = self
            .store
            .compare_and_set_node(
                node_id,
                NodeStatus::Occupied,
                NodeUpdate::status(NodeStatus::Idle).with_occupied(false),
            )
            .await?;

        info!(pool_id = %pool.uuid, node_id, "Node released");
        let _ = self.events.send(PoolEvent::NodeReleased {
            pool_id: pool.uuid.clone(),
            node_id,
        });
        Ok(released)
    }

    // -------------------------------------------------------------------------
    // Task errors
    // -------------------------------------------------------------------------

    pub async fn list_task_errors(&self, pool: &PoolSettings) -> Result<Vec<ErrorModel>> {
        validate(pool)?;
        self.errors.list_for_pool(&pool.uuid).await
    }

    pub async fn get_task_error(&self, error_id: u64) -> Result<Option<ErrorModel>> {
        self.errors.get(error_id).await
    }

    /// Returns whether a record was removed
    pub async fn remove_task_error(&self, error_id: u64) -> Result<bool> {
        self.errors.delete(error_id).await
    }

    pub async fn update_task_error(&self, error: ErrorModel) -> Result<()> {
        self.errors.update(error).await
    }

    // -------------------------------------------------------------------------
    // Tasks
    // -------------------------------------------------------------------------

    pub async fn list_running_tasks(&self, pool: &PoolSettings) -> Result<Vec<TaskModel>> {
        validate(pool)?;
        let tasks = self.store.list_tasks(&pool.uuid).await?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.status == TaskStatus::Running)
            .collect())
    }

    pub async fn get_task(&self, task_id: u64) -> Result<Option<TaskModel>> {
        self.store.get_task(task_id).await
    }

    /// Machines the provider lists for the pool that no node row refers to
    pub async fn list_untracked_machines(&self, pool: &PoolSettings) -> Result<Vec<NodeHandle>> {
        validate(pool)?;
        let backend = self.backends.backend_for(pool).await?;
        let listed = backend
            .list_nodes(&BackendFactory::selector_for(pool))
            .await?;

        let tracked: BTreeSet<String> = self
            .store
            .list_nodes(&pool.uuid)
            .await?
            .into_iter()
            .filter_map(|n| n.machine_id)
            .collect();

        Ok(listed
            .into_iter()
            .filter(|m| !tracked.contains(&m.id))
            .collect())
    }

    /// Fail whatever a previous process left in flight
    pub async fn recover_interrupted_tasks(&self) -> Result<usize> {
        let mut pool_ids: BTreeSet<String> = self.store.pool_ids().await?.into_iter().collect();
        pool_ids.extend(self.pools.read().keys().cloned());

        let pool_ids: Vec<String> = pool_ids.into_iter().collect();
        self.executor.recover_interrupted(&pool_ids).await
    }
}

fn validate(pool: &PoolSettings) -> Result<()> {
    if pool.uuid.trim().is_empty() {
        return Err(Error::InvalidPoolSettings("pool uuid is empty".into()));
    }
    Ok(())
}
