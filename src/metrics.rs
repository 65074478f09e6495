//! Task Metrics
//!
//! Per task kind atomic counters updated by the executor, plus a Prometheus
//! collector that publishes them on scrape.

use crate::domain::TaskName;
use crate::error::{Error, Result};
use prometheus::core::{Collector, Desc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// Per-Kind Counters (Cache-Line Aligned)
// =============================================================================

/// Counters of one task kind, aligned to prevent false sharing
#[repr(C, align(64))]
#[derive(Debug, Default)]
struct TaskKindCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// Task counters for every task kind
#[derive(Debug, Default)]
pub struct TaskMetrics {
    kinds: [TaskKindCounters; 3],
}

impl TaskMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn slot(&self, task: TaskName) -> &TaskKindCounters {
        match task {
            TaskName::CreateMachine => &self.kinds[0],
            TaskName::DeleteMachine => &self.kinds[1],
            TaskName::BootstrapMachine => &self.kinds[2],
        }
    }

    #[inline]
    pub fn record_started(&self, task: TaskName) {
        self.slot(task).started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_completed(&self, task: TaskName) {
        self.slot(task).completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failed(&self, task: TaskName) {
        self.slot(task).failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A timed out task is also counted as failed when it finishes
    #[inline]
    pub fn record_timeout(&self, task: TaskName) {
        self.slot(task).timed_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time counters of one task kind
    pub fn snapshot(&self, task: TaskName) -> TaskMetricsSnapshot {
        let slot = self.slot(task);
        TaskMetricsSnapshot {
            task,
            started: slot.started.load(Ordering::Relaxed),
            completed: slot.completed.load(Ordering::Relaxed),
            failed: slot.failed.load(Ordering::Relaxed),
            timed_out: slot.timed_out.load(Ordering::Relaxed),
        }
    }

    pub fn snapshot_all(&self) -> Vec<TaskMetricsSnapshot> {
        TaskName::ALL.iter().map(|t| self.snapshot(*t)).collect()
    }
}

// =============================================================================
// Snapshot
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetricsSnapshot {
    pub task: TaskName,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

impl TaskMetricsSnapshot {
    /// Tasks started but not finished yet
    pub fn running(&self) -> u64 {
        self.started.saturating_sub(self.completed + self.failed)
    }
}

// =============================================================================
// Prometheus Export
// =============================================================================

/// Publishes [`TaskMetrics`] as Prometheus series labelled by task kind
pub struct TaskMetricsCollector {
    metrics: Arc<TaskMetrics>,
    started: IntCounterVec,
    completed: IntCounterVec,
    failed: IntCounterVec,
    timed_out: IntCounterVec,
    running: IntGaugeVec,
}

impl TaskMetricsCollector {
    pub fn new(metrics: Arc<TaskMetrics>) -> Result<Self> {
        let counter = |name: &str, help: &str| {
            IntCounterVec::new(Opts::new(name, help), &["task"]).map_err(prometheus_error)
        };

        Ok(Self {
            metrics,
            started: counter("node_pool_tasks_started_total", "Tasks scheduled")?,
            completed: counter("node_pool_tasks_completed_total", "Tasks completed")?,
            failed: counter("node_pool_tasks_failed_total", "Tasks failed")?,
            timed_out: counter(
                "node_pool_tasks_timed_out_total",
                "Tasks whose backend call exceeded its limit",
            )?,
            running: IntGaugeVec::new(
                Opts::new("node_pool_tasks_running", "Tasks currently in flight"),
                &["task"],
            )
            .map_err(prometheus_error)?,
        })
    }

    fn sync(&self) {
        for snapshot in self.metrics.snapshot_all() {
            let label = snapshot.task.to_string();
            let labels = [label.as_str()];
            advance(&self.started, &labels, snapshot.started);
            advance(&self.completed, &labels, snapshot.completed);
            advance(&self.failed, &labels, snapshot.failed);
            advance(&self.timed_out, &labels, snapshot.timed_out);
            self.running
                .with_label_values(&labels)
                .set(snapshot.running() as i64);
        }
    }
}

/// Move a counter forward to an absolute value
fn advance(vec: &IntCounterVec, labels: &[&str], value: u64) {
    let counter = vec.with_label_values(labels);
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

impl Collector for TaskMetricsCollector {
    fn desc(&self) -> Vec<&Desc> {
        let mut descs = Vec::new();
        descs.extend(self.started.desc());
        descs.extend(self.completed.desc());
        descs.extend(self.failed.desc());
        descs.extend(self.timed_out.desc());
        descs.extend(self.running.desc());
        descs
    }

    fn collect(&self) -> Vec<MetricFamily> {
        self.sync();
        let mut families = Vec::new();
        families.extend(self.started.collect());
        families.extend(self.completed.collect());
        families.extend(self.failed.collect());
        families.extend(self.timed_out.collect());
        families.extend(self.running.collect());
        families
    }
}

/// Registry holding the task collector
pub fn registry(metrics: Arc<TaskMetrics>) -> Result<Registry> {
    let registry = Registry::new();
    registry
        .register(Box::new(TaskMetricsCollector::new(metrics)?))
        .map_err(prometheus_error)?;
    Ok(registry)
}

/// Encode a registry in the text exposition format.
///
/// Returns the body and its content type.
pub fn render(registry: &Registry) -> Result<(Vec<u8>, String)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(prometheus_error)?;
    Ok((buffer, encoder.format_type().to_string()))
}

fn prometheus_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("metrics error: {}", e))
}
