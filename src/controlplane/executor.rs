//! Task Executor
//!
//! Runs create, delete and bootstrap operations on their own tokio tasks.
//!
//! Scheduling is split in two halves:
//!
//! - Synchronous: validate the pool, resolve the target node, insert the
//!   RUNNING task row. Anything that fails here is returned to the caller and
//!   nothing is scheduled.
//! - Asynchronous: call the backend under a per-kind time limit, write the
//!   resulting node state through conditional updates, record an
//!   [`ErrorModel`](crate::domain::ErrorModel) on failure, finish the task row,
//!   then resolve the [`TaskHandle`] exactly once.
//!
//! Backend calls are never cancelled. A call that exceeds its limit keeps
//! running detached and the task fails with a timeout. Machines a timed out
//! create still produces are written into its ERROR rows when they arrive;
//! other late results are only logged.

use super::backends::BackendResolver;
use super::errors::ErrorRecorder;
use super::events::PoolEvent;
use crate::domain::{
    NewNode, NewTask, NodeHandle, NodeModel, NodeStatus, NodeUpdate, PoolSettings, SshDetails,
    StorageRef, TaskModel, TaskName, TaskStatus,
};
use crate::error::{Error, ErrorKind, Result};
use crate::metrics::TaskMetrics;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

// =============================================================================
// Executor Configuration
// =============================================================================

/// Time limits and bootstrap settings
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub create_timeout: Duration,
    pub delete_timeout: Duration,
    pub bootstrap_timeout: Duration,
    /// SSH port used to run the bootstrap script
    pub ssh_port: u16,
    /// Script run by bootstrap tasks; bootstrap is rejected without one
    pub bootstrap_script: Option<Arc<str>>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            create_timeout: Duration::from_secs(1200),
            delete_timeout: Duration::from_secs(300),
            bootstrap_timeout: Duration::from_secs(900),
            ssh_port: 22,
            bootstrap_script: None,
        }
    }
}

impl ExecutorConfig {
    /// Maximum wait for the backend call of a task kind
    pub fn timeout_for(&self, task: TaskName) -> Duration {
        match task {
            TaskName::CreateMachine => self.create_timeout,
            TaskName::DeleteMachine => self.delete_timeout,
            TaskName::BootstrapMachine => self.bootstrap_timeout,
        }
    }
}

// =============================================================================
// Task Handle
// =============================================================================

/// Failure delivered to the task's caller
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
#[error("{task} task {task_id} failed ({kind}): {message}")]
#[serde(rename_all = "camelCase")]
pub struct TaskFailure {
    pub task_id: u64,
    pub task: TaskName,
    pub kind: ErrorKind,
    pub message: String,
    /// Id of the error record written for this failure
    pub error_id: Option<u64>,
}

/// Final result of a task
pub type TaskOutcome<T> = std::result::Result<T, TaskFailure>;

/// Completion of one scheduled task; resolves exactly once
#[derive(Debug)]
pub struct TaskHandle<T> {
    task_id: u64,
    task: TaskName,
    rx: oneshot::Receiver<TaskOutcome<T>>,
}

impl<T> TaskHandle<T> {
    pub fn task_id(&self) -> u64 {
        self.task_id
    }

    pub fn task(&self) -> TaskName {
        self.task
    }

    /// Wait for the task to finish
    pub async fn wait(self) -> TaskOutcome<T> {
        let (task_id, task) = (self.task_id, self.task);
        self.rx.await.unwrap_or_else(|_| {
            Err(TaskFailure {
                task_id,
                task,
                kind: ErrorKind::Internal,
                message: "task dropped before completion".into(),
                error_id: None,
            })
        })
    }
}

/// Outcome of one detached backend call
struct BackendCall<T> {
    result: Result<T>,
    /// Present after a timeout; resolves if the call finishes later
    late: Option<oneshot::Receiver<Result<T>>>,
}

// =============================================================================
// Task Executor
// =============================================================================

pub struct TaskExecutor {
    store: StorageRef,
    backends: Arc<dyn BackendResolver>,
    recorder: Arc<ErrorRecorder>,
    events: broadcast::Sender<PoolEvent>,
    metrics: Arc<TaskMetrics>,
    config: ExecutorConfig,
}

impl TaskExecutor {
    pub fn new(
        config: ExecutorConfig,
        store: StorageRef,
        backends: Arc<dyn BackendResolver>,
        recorder: Arc<ErrorRecorder>,
        events: broadcast::Sender<PoolEvent>,
        metrics: Arc<TaskMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            backends,
            recorder,
            events,
            metrics,
            config,
        })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<TaskMetrics> {
        &self.metrics
    }

    // -------------------------------------------------------------------------
    // Entry points
    // -------------------------------------------------------------------------

    /// Create `machines_count` machines for a pool.
    ///
    /// Resolves to the new rows, all in CREATED.
    pub async fn create_machines(
        self: &Arc<Self>,
        pool: &PoolSettings,
    ) -> Result<TaskHandle<Vec<NodeModel>>> {
        validate_pool(pool)?;
        let count = pool.provider.machine.machines_count;
        if count == 0 {
            return Err(Error::InvalidPoolSettings(format!(
                "pool {} asks for zero machines",
                pool.uuid
            )));
        }

        let task = self.start_task(pool, TaskName::CreateMachine, None).await?;
        let this = self.clone();
        let pool = pool.clone();
        Ok(self.spawn(task, async move { this.run_create(pool, count).await }))
    }

    /// Destroy a node's machine. Resolves to the DELETED row.
    pub async fn delete_machine(
        self: &Arc<Self>,
        pool: &PoolSettings,
        node_id: u64,
    ) -> Result<TaskHandle<NodeModel>> {
        validate_pool(pool)?;
        let node = self.resolve_node(pool, node_id).await?;

        let task = self
            .start_task(pool, TaskName::DeleteMachine, Some(node_id))
            .await?;
        let this = self.clone();
        let pool = pool.clone();
        Ok(self.spawn(task, async move { this.run_delete(pool, node).await }))
    }

    /// Run the bootstrap script on a node. Resolves to the RUNNING row.
    pub async fn bootstrap_machine(
        self: &Arc<Self>,
        pool: &PoolSettings,
        node_id: u64,
    ) -> Result<TaskHandle<NodeModel>> {
        validate_pool(pool)?;
        let script = self
            .config
            .bootstrap_script
            .clone()
            .ok_or_else(|| Error::Configuration("no bootstrap script configured".into()))?;
        let node = self.resolve_node(pool, node_id).await?;

        let task = self
            .start_task(pool, TaskName::BootstrapMachine, Some(node_id))
            .await?;
        let this = self.clone();
        let pool = pool.clone();
        Ok(self.spawn(task, async move {
            this.run_bootstrap(pool, node, script).await
        }))
    }

    /// Fail tasks and nodes left in flight by a previous process.
    ///
    /// RUNNING tasks are finished as FAILED with an error record and nodes in
    /// CREATING, DELETING or BOOTSTRAPPING move to ERROR. Returns the number
    /// of tasks failed.
    pub async fn recover_interrupted(&self, pool_ids: &[String]) -> Result<usize> {
        let mut failed = 0;

        for pool_id in pool_ids {
            for task in self.store.list_tasks(pool_id).await? {
                if task.status != TaskStatus::Running {
                    continue;
                }
                let err = Error::Internal(format!(
                    "task {} interrupted by manager restart",
                    task.id
                ));
                self.recorder
                    .record_failure(task.task_name, pool_id, &err)
                    .await?;
                self.store.finish_task(task.id, TaskStatus::Failed).await?;
                failed += 1;
            }

            for node in self.store.list_nodes(pool_id).await? {
                if node.status.is_in_flight() {
                    self.mark_error(&node.pool_id, node.id, node.status).await;
                }
            }
        }

        if failed > 0 {
            warn!(failed, "Failed tasks interrupted by restart");
        }
        Ok(failed)
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    async fn resolve_node(&self, pool: &PoolSettings, node_id: u64) -> Result<NodeModel> {
        match self.store.get_node(node_id).await? {
            Some(node) if node.pool_id == pool.uuid => Ok(node),
            _ => Err(Error::NodeNotFound { node_id }),
        }
    }

    async fn start_task(
        &self,
        pool: &PoolSettings,
        task_name: TaskName,
        node_id: Option<u64>,
    ) -> Result<TaskModel> {
        let task = self
            .store
            .insert_task(NewTask {
                pool_id: pool.uuid.clone(),
                task_name,
                node_id,
            })
            .await?;

        self.metrics.record_started(task_name);
        info!(pool_id = %task.pool_id, task_id = task.id, task = %task_name, ?node_id, "Task scheduled");
        let _ = self.events.send(PoolEvent::TaskStarted {
            pool_id: task.pool_id.clone(),
            task_id: task.id,
            task: task_name,
            node_id,
        });

        Ok(task)
    }

    fn spawn<T, F>(self: &Arc<Self>, task: TaskModel, work: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = TaskHandle {
            task_id: task.id,
            task: task.task_name,
            rx,
        };

        let this = self.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(Error::Internal(format!("task {} panicked", task.id))),
            };

            let outcome = match result {
                Ok(value) => {
                    this.finish(&task, TaskStatus::Completed).await;
                    Ok(value)
                }
                Err(err) => Err(this.fail(&task, err).await),
            };

            if tx.send(outcome).is_err() {
                debug!(task_id = task.id, "Task handle dropped before completion");
            }
        });

        handle
    }

    /// Record the failure, then finish the task row
    async fn fail(&self, task: &TaskModel, err: Error) -> TaskFailure {
        error!(
            pool_id = %task.pool_id,
            task_id = task.id,
            task = %task.task_name,
            kind = %err.kind(),
            "Task failed: {}",
            err
        );

        let error_id = match self
            .recorder
            .record_failure(task.task_name, &task.pool_id, &err)
            .await
        {
            Ok(model) => Some(model.id),
            Err(e) => {
                error!(task_id = task.id, "Failed to record task error: {}", e);
                None
            }
        };

        self.finish(task, TaskStatus::Failed).await;

        TaskFailure {
            task_id: task.id,
            task: task.task_name,
            kind: err.kind(),
            message: err.to_string(),
            error_id,
        }
    }

    async fn finish(&self, task: &TaskModel, status: TaskStatus) {
        if let Err(e) = self.store.finish_task(task.id, status).await {
            error!(task_id = task.id, "Failed to finish task row: {}", e);
        }

        match status {
            TaskStatus::Completed => self.metrics.record_completed(task.task_name),
            _ => self.metrics.record_failed(task.task_name),
        }

        info!(pool_id = %task.pool_id, task_id = task.id, task = %task.task_name, ?status, "Task finished");
        let _ = self.events.send(PoolEvent::TaskFinished {
            pool_id: task.pool_id.clone(),
            task_id: task.id,
            task: task.task_name,
            status,
        });
    }

    /// Run a backend call on its own tokio task under the kind's time limit
    async fn call_backend<T, F>(&self, task: TaskName, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        self.call_backend_tracked(task, call).await.result
    }

    /// Like [`call_backend`](Self::call_backend), but hands back a receiver for
    /// the result of a call that outlived its limit.
    async fn call_backend_tracked<T, F>(&self, task: TaskName, call: F) -> BackendCall<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let limit = self.config.timeout_for(task);
        let (tx, mut rx) = oneshot::channel();
        let (late_tx, late_rx) = oneshot::channel();

        tokio::spawn(async move {
            let result = call.await;
            if let Err(result) = tx.send(result) {
                warn!(
                    task = %task,
                    succeeded = result.is_ok(),
                    "Backend call finished after its task timed out"
                );
                let _ = late_tx.send(result);
            }
        });

        match tokio::time::timeout(limit, &mut rx).await {
            Ok(received) => BackendCall {
                result: received
                    .unwrap_or_else(|_| Err(Error::Internal("backend call aborted".into()))),
                late: None,
            },
            Err(_) => {
                // Closing first means a result is either taken here or sent to `late_tx`
                rx.close();
                match rx.try_recv() {
                    Ok(result) => BackendCall { result, late: None },
                    Err(_) => {
                        self.metrics.record_timeout(task);
                        BackendCall {
                            result: Err(Error::Timeout { task, after: limit }),
                            late: Some(late_rx),
                        }
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Node transitions
    // -------------------------------------------------------------------------

    /// Conditional status change along a legal lifecycle edge
    async fn transition(
        &self,
        node_id: u64,
        from: NodeStatus,
        update: NodeUpdate,
    ) -> Result<NodeModel> {
        let to = update.status;
        if !from.can_transition_to(to) {
            return Err(Error::IllegalTransition { node_id, from, to });
        }

        let node = self.store.compare_and_set_node(node_id, from, update).await?;

        debug!(pool_id = %node.pool_id, node_id, %from, %to, "Node transitioned");
        let _ = self.events.send(PoolEvent::NodeTransitioned {
            pool_id: node.pool_id.clone(),
            node_id,
            from,
            to,
        });
        Ok(node)
    }

    /// Best effort move to ERROR after a failed operation
    async fn mark_error(&self, pool_id: &str, node_id: u64, from: NodeStatus) {
        if let Err(e) = self
            .transition(node_id, from, NodeUpdate::status(NodeStatus::Error))
            .await
        {
            warn!(pool_id, node_id, %from, "Could not mark node as ERROR: {}", e);
        }
    }

    // -------------------------------------------------------------------------
    // Task bodies
    // -------------------------------------------------------------------------

    async fn run_create(&self, pool: PoolSettings, count: u32) -> Result<Vec<NodeModel>> {
        let backend = self.backends.backend_for(&pool).await?;

        // Placeholder rows make in-flight machines visible as CREATING
        let mut placeholders = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let node = self.store.insert_node(NewNode::creating(&pool.uuid)).await?;
            placeholders.push(node.id);
        }

        let group = pool.group_name().to_string();
        let options = pool.provider.machine.clone();
        let call_backend = backend.clone();
        let call = self
            .call_backend_tracked(TaskName::CreateMachine, async move {
                call_backend.create_nodes(&group, count, &options).await
            })
            .await;

        match call.result {
            Ok(handles) => self.record_created(&pool, &placeholders, handles).await,
            Err(Error::PartialCreation { created, reason }) => {
                // Machines that exist at the provider are recorded even though the task fails
                self.record_created(&pool, &placeholders, created.clone())
                    .await?;
                Err(Error::PartialCreation { created, reason })
            }
            Err(err @ Error::Timeout { .. }) => {
                for node_id in &placeholders {
                    self.mark_error(&pool.uuid, *node_id, NodeStatus::Creating).await;
                }
                if let Some(late) = call.late {
                    tokio::spawn(record_late_machines(
                        self.store.clone(),
                        self.events.clone(),
                        pool.uuid.clone(),
                        placeholders,
                        late,
                    ));
                }
                Err(err)
            }
            Err(err) => {
                for node_id in placeholders {
                    if let Err(e) = self.store.remove_node_if(node_id, NodeStatus::Creating).await {
                        warn!(pool_id = %pool.uuid, node_id, "Could not remove placeholder: {}", e);
                    }
                }
                Err(err)
            }
        }
    }

    /// Fill placeholders with created machines; drop the unused ones
    async fn record_created(
        &self,
        pool: &PoolSettings,
        placeholders: &[u64],
        handles: Vec<NodeHandle>,
    ) -> Result<Vec<NodeModel>> {
        let mut nodes = Vec::with_capacity(handles.len());
        let mut slots = placeholders.iter().copied();

        for handle in handles {
            let update = NodeUpdate::status(NodeStatus::Created).with_machine(
                handle.id.clone(),
                handle.public_ip.clone(),
                handle.credentials.clone(),
            );

            let node = match slots.next() {
                Some(node_id) => self.transition(node_id, NodeStatus::Creating, update).await?,
                None => {
                    let extra = self.store.insert_node(NewNode::creating(&pool.uuid)).await?;
                    self.transition(extra.id, NodeStatus::Creating, update).await?
                }
            };

            info!(pool_id = %pool.uuid, node_id = node.id, machine_id = %handle.id, "Machine recorded");
            let _ = self.events.send(PoolEvent::NodeCreated {
                pool_id: pool.uuid.clone(),
                node_id: node.id,
                machine_id: handle.id,
            });
            nodes.push(node);
        }

        for node_id in slots {
            self.store.remove_node_if(node_id, NodeStatus::Creating).await?;
        }

        Ok(nodes)
    }

    async fn run_delete(&self, pool: PoolSettings, node: NodeModel) -> Result<NodeModel> {
        let node_id = node.id;
        self.transition(node_id, node.status, NodeUpdate::status(NodeStatus::Deleting))
            .await?;

        // Placeholders left by a timed out create never got a machine
        let Some(machine_id) = node.machine_id.clone() else {
            return self
                .transition(node_id, NodeStatus::Deleting, NodeUpdate::status(NodeStatus::Deleted))
                .await;
        };

        let result = match self.backends.backend_for(&pool).await {
            Ok(backend) => {
                self.call_backend(TaskName::DeleteMachine, async move {
                    // Gone already, e.g. a previous attempt finished after its timeout
                    if backend.get_node(&machine_id).await?.is_none() {
                        info!(machine_id = %machine_id, "Machine no longer exists at provider");
                        return Ok(());
                    }
                    backend.delete_node(&machine_id).await
                })
                .await
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                self.transition(node_id, NodeStatus::Deleting, NodeUpdate::status(NodeStatus::Deleted))
                    .await
            }
            Err(err) => {
                self.mark_error(&pool.uuid, node_id, NodeStatus::Deleting).await;
                Err(err)
            }
        }
    }

    async fn run_bootstrap(
        &self,
        pool: PoolSettings,
        node: NodeModel,
        script: Arc<str>,
    ) -> Result<NodeModel> {
        let node_id = node.id;
        self.transition(node_id, node.status, NodeUpdate::status(NodeStatus::Bootstrapping))
            .await?;

        match self.bootstrap_call(&pool, &node, script).await {
            Ok(()) => {
                self.transition(
                    node_id,
                    NodeStatus::Bootstrapping,
                    NodeUpdate::status(NodeStatus::Running),
                )
                .await
            }
            Err(err) => {
                self.mark_error(&pool.uuid, node_id, NodeStatus::Bootstrapping).await;
                Err(err)
            }
        }
    }

    async fn bootstrap_call(
        &self,
        pool: &PoolSettings,
        node: &NodeModel,
        script: Arc<str>,
    ) -> Result<()> {
        let backend = self.backends.backend_for(pool).await?;
        let ip = node.ip.clone().ok_or_else(|| {
            Error::backend(backend.provider(), "run_script", format!("node {} has no ip", node.id))
        })?;
        let ssh = SshDetails::from_credentials(
            &node.credentials.clone().unwrap_or_default(),
            self.config.ssh_port,
        );

        let provider = backend.provider();
        let output = self
            .call_backend(TaskName::BootstrapMachine, async move {
                backend.run_script(&script, &ip, &ssh).await
            })
            .await?;

        if !output.success() {
            return Err(Error::backend(
                provider,
                "run_script",
                format!("script exited with status {}: {}", output.exit_status, output.error),
            ));
        }
        Ok(())
    }
}

/// Write machines from a create that finished after its timeout into the
/// task's ERROR rows, so they can be found and deleted.
async fn record_late_machines(
    store: StorageRef,
    events: broadcast::Sender<PoolEvent>,
    pool_id: String,
    placeholders: Vec<u64>,
    late: oneshot::Receiver<Result<Vec<NodeHandle>>>,
) {
    let handles = match late.await {
        Ok(Ok(handles)) => handles,
        Ok(Err(Error::PartialCreation { created, .. })) => created,
        Ok(Err(e)) => {
            debug!(pool_id = %pool_id, "Late create failed: {}", e);
            return;
        }
        Err(_) => return,
    };

    let mut slots = placeholders.into_iter();
    for handle in handles {
        let update = NodeUpdate::status(NodeStatus::Error).with_machine(
            handle.id.clone(),
            handle.public_ip.clone(),
            handle.credentials.clone(),
        );

        // A placeholder may have been deleted by an operator in the meantime
        let mut recorded = None;
        for node_id in slots.by_ref() {
            match store
                .compare_and_set_node(node_id, NodeStatus::Error, update.clone())
                .await
            {
                Ok(node) => {
                    recorded = Some(node);
                    break;
                }
                Err(e) => debug!(pool_id = %pool_id, node_id, "Placeholder not reusable: {}", e),
            }
        }

        let node = match recorded {
            Some(node) => node,
            None => {
                let row = NewNode {
                    status: NodeStatus::Error,
                    machine_id: Some(handle.id.clone()),
                    ip: handle.public_ip.clone(),
                    credentials: handle.credentials.clone(),
                    ..NewNode::creating(&pool_id)
                };
                match store.insert_node(row).await {
                    Ok(node) => node,
                    Err(e) => {
                        error!(pool_id = %pool_id, machine_id = %handle.id, "Could not record late machine: {}", e);
                        continue;
                    }
                }
            }
        };

        warn!(pool_id = %pool_id, node_id = node.id, machine_id = %handle.id, "Late machine recorded in ERROR");
        let _ = events.send(PoolEvent::NodeCreated {
            pool_id: pool_id.clone(),
            node_id: node.id,
            machine_id: handle.id,
        });
    }

    // Rows the provider never produced a machine for
    for node_id in slots {
        if let Err(e) = store.remove_node_if(node_id, NodeStatus::Error).await {
            debug!(pool_id = %pool_id, node_id, "Placeholder left in place: {}", e);
        }
    }
}

fn validate_pool(pool: &PoolSettings) -> Result<()> {
    if pool.uuid.trim().is_empty() {
        return Err(Error::InvalidPoolSettings("pool uuid is empty".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::{BackendFactory, FaultPlan, SimulatedBackend};
    use crate::domain::{
        CloudBackend, ConnectDetails, MachineOptions, ProviderKind, ProviderSettings, Storage,
    };
    use crate::storage::MemoryStore;
    use assert_matches::assert_matches;

    struct Harness {
        executor: Arc<TaskExecutor>,
        store: Arc<MemoryStore>,
        backend: Arc<SimulatedBackend>,
        pool: PoolSettings,
        events: broadcast::Receiver<PoolEvent>,
    }

    async fn harness(config: ExecutorConfig, machines_count: u32) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let (tx, events) = broadcast::channel(256);
        let recorder = Arc::new(ErrorRecorder::new(store.clone(), tx.clone()));

        let pool = PoolSettings::new(
            "pool-1",
            "web",
            ProviderSettings {
                kind: ProviderKind::Ec2,
                connect: ConnectDetails {
                    identity: "id".into(),
                    credential: "secret".into(),
                    ..Default::default()
                },
                machine: MachineOptions {
                    machines_count,
                    ..Default::default()
                },
            },
        );

        let backend = Arc::new(SimulatedBackend::new(ProviderKind::Ec2));
        backend.connect(&pool.provider.connect).await.unwrap();
        let factory = Arc::new(BackendFactory::new());
        factory.register("pool-1", backend.clone());

        let executor = TaskExecutor::new(
            config,
            store.clone(),
            factory,
            recorder,
            tx,
            Arc::new(TaskMetrics::new()),
        );

        Harness {
            executor,
            store,
            backend,
            pool,
            events,
        }
    }

    fn with_script() -> ExecutorConfig {
        ExecutorConfig {
            bootstrap_script: Some(Arc::from("#!/bin/sh\necho ready")),
            ..Default::default()
        }
    }

    async fn created_node(h: &Harness) -> NodeModel {
        let handle = h.executor.create_machines(&h.pool).await.unwrap();
        let mut nodes = handle.wait().await.unwrap();
        nodes.remove(0)
    }

    #[tokio::test]
    async fn test_create_three_machines() {
        let h = harness(ExecutorConfig::default(), 3).await;

        let handle = h.executor.create_machines(&h.pool).await.unwrap();
        let task_id = handle.task_id();
        let nodes = handle.wait().await.unwrap();

        assert_eq!(nodes.len(), 3);
        let listed = h.store.list_nodes("pool-1").await.unwrap();
        assert_eq!(listed, nodes);
        assert!(listed.iter().all(|n| n.status == NodeStatus::Created));
        assert!(listed.iter().all(|n| n.machine_id.is_some() && n.ip.is_some()));

        let mut ids: Vec<_> = listed.iter().map(|n| n.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3);

        let task = h.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.finished_at.is_some());
        assert!(h.store.list_errors("pool-1").await.unwrap().is_empty());
        assert_eq!(h.executor.metrics().snapshot(TaskName::CreateMachine).completed, 1);
    }

    #[tokio::test]
    async fn test_create_failure_records_one_error() {
        let h = harness(ExecutorConfig::default(), 2).await;
        h.backend.set_faults(FaultPlan {
            fail_create: Some("quota exceeded".into()),
            ..Default::default()
        });

        let handle = h.executor.create_machines(&h.pool).await.unwrap();
        let task_id = handle.task_id();
        let failure = handle.wait().await.unwrap_err();

        assert_eq!(failure.kind, ErrorKind::BackendOperationFailure);
        let errors = h.store.list_errors("pool-1").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(failure.error_id, Some(errors[0].id));
        assert!(errors[0].message.contains("quota exceeded"));

        assert!(h.store.list_nodes("pool-1").await.unwrap().is_empty());
        let task = h.store.get_task(task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_partial_creation_persists_created_machines() {
        let h = harness(ExecutorConfig::default(), 3).await;
        h.backend.set_faults(FaultPlan {
            partial_create_after: Some(2),
            ..Default::default()
        });

        let handle = h.executor.create_machines(&h.pool).await.unwrap();
        let failure = handle.wait().await.unwrap_err();
        assert_eq!(failure.kind, ErrorKind::BackendOperationFailure);

        let nodes = h.store.list_nodes("pool-1").await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Created));
        assert_eq!(h.backend.machine_count().await, 2);
        assert_eq!(h.store.list_errors("pool-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_timeout_marks_placeholders_error() {
        let config = ExecutorConfig {
            create_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness(config, 2).await;
        h.backend.set_faults(FaultPlan {
            create_delay: Duration::from_secs(10),
            ..Default::default()
        });

        let failure = h
            .executor
            .create_machines(&h.pool)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Timeout);

        let nodes = h.store.list_nodes("pool-1").await.unwrap();
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Error));
        assert_eq!(h.executor.metrics().snapshot(TaskName::CreateMachine).timed_out, 1);
    }

    #[tokio::test]
    async fn test_late_machines_fill_error_rows() {
        let config = ExecutorConfig {
            create_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness(config, 2).await;
        h.backend.set_faults(FaultPlan {
            create_delay: Duration::from_millis(200),
            ..Default::default()
        });

        let failure = h
            .executor
            .create_machines(&h.pool)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Timeout);

        let mut nodes = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            nodes = h.store.list_nodes("pool-1").await.unwrap();
            if nodes.iter().all(|n| n.machine_id.is_some()) {
                break;
            }
        }

        assert_eq!(h.backend.machine_count().await, 2);
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Error));
        assert!(nodes.iter().all(|n| n.ip.is_some()));
        assert_ne!(nodes[0].machine_id, nodes[1].machine_id);

        // The recorded machines can now be cleaned up
        let deleted = h
            .executor
            .delete_machine(&h.pool, nodes[0].id)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(deleted.status, NodeStatus::Deleted);
        assert_eq!(h.backend.machine_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_retry_after_late_delete() {
        let config = ExecutorConfig {
            delete_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let h = harness(config, 1).await;
        let node = created_node(&h).await;
        h.backend.set_faults(FaultPlan {
            delete_delay: Duration::from_millis(200),
            ..Default::default()
        });

        let failure = h
            .executor
            .delete_machine(&h.pool, node.id)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Timeout);
        assert_eq!(
            h.store.get_node(node.id).await.unwrap().unwrap().status,
            NodeStatus::Error
        );

        // The detached call removes the machine after the task gave up
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(h.backend.machine_count().await, 0);

        let deleted = h
            .executor
            .delete_machine(&h.pool, node.id)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(deleted.status, NodeStatus::Deleted);
        assert_eq!(h.store.list_errors("pool-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_bootstrap_runs_script() {
        let h = harness(with_script(), 1).await;
        let node = created_node(&h).await;

        let bootstrapped = h
            .executor
            .bootstrap_machine(&h.pool, node.id)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(bootstrapped.status, NodeStatus::Running);
        let executions = h.backend.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(Some(executions[0].0.clone()), node.ip);
        assert!(executions[0].1.contains("echo ready"));
    }

    #[tokio::test]
    async fn test_bootstrap_timeout_marks_node_error() {
        let config = ExecutorConfig {
            bootstrap_timeout: Duration::from_millis(50),
            ..with_script()
        };
        let h = harness(config, 1).await;
        let node = created_node(&h).await;
        h.backend.set_faults(FaultPlan {
            script_delay: Duration::from_secs(10),
            ..Default::default()
        });

        let failure = h
            .executor
            .bootstrap_machine(&h.pool, node.id)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Timeout);

        let node = h.store.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Error);

        let errors = h.store.list_errors("pool-1").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("timeout"));
        assert_eq!(errors[0].task_name, TaskName::BootstrapMachine);
    }

    #[tokio::test]
    async fn test_bootstrap_non_zero_exit_fails() {
        let h = harness(with_script(), 1).await;
        let node = created_node(&h).await;
        h.backend.set_faults(FaultPlan {
            script_exit_status: 2,
            ..Default::default()
        });

        let failure = h
            .executor
            .bootstrap_machine(&h.pool, node.id)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::BackendOperationFailure);
        assert!(failure.message.contains("status 2"));

        // ERROR is not terminal: a retried bootstrap brings the node back
        h.backend.set_faults(FaultPlan::default());
        let node = h
            .executor
            .bootstrap_machine(&h.pool, node.id)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(node.status, NodeStatus::Running);
    }

    #[tokio::test]
    async fn test_bootstrap_requires_script() {
        let h = harness(ExecutorConfig::default(), 1).await;
        let node = created_node(&h).await;

        assert_matches!(
            h.executor.bootstrap_machine(&h.pool, node.id).await,
            Err(Error::Configuration(_))
        );
    }

    #[tokio::test]
    async fn test_unknown_node_is_rejected_synchronously() {
        let h = harness(with_script(), 1).await;

        assert_matches!(
            h.executor.delete_machine(&h.pool, 404).await,
            Err(Error::NodeNotFound { node_id: 404 })
        );
        assert_matches!(
            h.executor.bootstrap_machine(&h.pool, 404).await,
            Err(Error::NodeNotFound { .. })
        );
        assert!(h.store.list_tasks("pool-1").await.unwrap().is_empty());
        assert!(h.store.list_errors("pool-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_node_of_other_pool_is_not_found() {
        let h = harness(ExecutorConfig::default(), 1).await;
        let node = created_node(&h).await;
        let mut other = h.pool.clone();
        other.uuid = "pool-2".into();

        assert_matches!(
            h.executor.delete_machine(&other, node.id).await,
            Err(Error::NodeNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_invalid_pool_is_rejected() {
        let h = harness(ExecutorConfig::default(), 1).await;
        let mut pool = h.pool.clone();
        pool.uuid = String::new();
        assert_matches!(
            h.executor.create_machines(&pool).await,
            Err(Error::InvalidPoolSettings(_))
        );

        let mut pool = h.pool.clone();
        pool.provider.machine.machines_count = 0;
        assert_matches!(
            h.executor.create_machines(&pool).await,
            Err(Error::InvalidPoolSettings(_))
        );
    }

    #[tokio::test]
    async fn test_delete_then_delete_again() {
        let h = harness(ExecutorConfig::default(), 1).await;
        let node = created_node(&h).await;

        let deleted = h
            .executor
            .delete_machine(&h.pool, node.id)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(deleted.status, NodeStatus::Deleted);
        assert_eq!(h.backend.machine_count().await, 0);

        let failure = h
            .executor
            .delete_machine(&h.pool, node.id)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::Conflict);

        let node = h.store.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Deleted);
        assert_eq!(h.store.list_errors("pool-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_failure_marks_node_error() {
        let h = harness(ExecutorConfig::default(), 1).await;
        let node = created_node(&h).await;
        h.backend.set_faults(FaultPlan {
            fail_delete: Some("api unavailable".into()),
            ..Default::default()
        });

        let failure = h
            .executor
            .delete_machine(&h.pool, node.id)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_eq!(failure.kind, ErrorKind::BackendOperationFailure);

        let node = h.store.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Error);
        assert!(node.machine_id.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_running_task_rejected() {
        let h = harness(ExecutorConfig::default(), 1).await;
        let node = created_node(&h).await;
        h.backend.set_faults(FaultPlan {
            delete_delay: Duration::from_millis(200),
            ..Default::default()
        });

        let first = h.executor.delete_machine(&h.pool, node.id).await.unwrap();
        assert_matches!(
            h.executor.delete_machine(&h.pool, node.id).await,
            Err(Error::TaskAlreadyRunning { .. })
        );

        first.wait().await.unwrap();
        assert!(h.store.list_errors("pool-1").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_delete_and_bootstrap_conflict() {
        let h = harness(with_script(), 1).await;
        let node = created_node(&h).await;
        h.backend.set_faults(FaultPlan {
            delete_delay: Duration::from_millis(20),
            script_delay: Duration::from_millis(20),
            ..Default::default()
        });

        let delete = h.executor.delete_machine(&h.pool, node.id).await.unwrap();
        let bootstrap = h.executor.bootstrap_machine(&h.pool, node.id).await.unwrap();
        let (deleted, bootstrapped) = tokio::join!(delete.wait(), bootstrap.wait());

        let failures: Vec<_> = [deleted.err(), bootstrapped.err()]
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, ErrorKind::Conflict);
        assert_eq!(h.store.list_errors("pool-1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_task_events_bracket_the_task() {
        let mut h = harness(ExecutorConfig::default(), 1).await;
        let handle = h.executor.create_machines(&h.pool).await.unwrap();
        let task_id = handle.task_id();
        handle.wait().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            seen.push(event);
        }

        assert_matches!(seen.first(), Some(PoolEvent::TaskStarted { task_id: id, .. }) if *id == task_id);
        assert_matches!(
            seen.last(),
            Some(PoolEvent::TaskFinished { status: TaskStatus::Completed, .. })
        );
        assert!(seen.iter().any(|e| matches!(e, PoolEvent::NodeCreated { .. })));
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let h = harness(ExecutorConfig::default(), 1).await;
        let node = h
            .store
            .insert_node(NewNode {
                status: NodeStatus::Bootstrapping,
                ..NewNode::creating("pool-1")
            })
            .await
            .unwrap();
        h.store
            .insert_task(NewTask {
                pool_id: "pool-1".into(),
                task_name: TaskName::BootstrapMachine,
                node_id: Some(node.id),
            })
            .await
            .unwrap();

        let failed = h
            .executor
            .recover_interrupted(&["pool-1".to_string()])
            .await
            .unwrap();
        assert_eq!(failed, 1);

        let node = h.store.get_node(node.id).await.unwrap().unwrap();
        assert_eq!(node.status, NodeStatus::Error);
        let tasks = h.store.list_tasks("pool-1").await.unwrap();
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Failed));
        let errors = h.store.list_errors("pool-1").await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("interrupted"));
    }
}
