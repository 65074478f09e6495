//! Cloud Backend Adapters
//!
//! Provides the provider adapters and the per-pool backend factory:
//! - EC2: machines grouped by tag
//! - SoftLayer: machines grouped by hostname prefix
//! - HP Cloud: machines grouped by name prefix
//!
//! Every provider is currently served by [`SimulatedBackend`]; real SDK
//! adapters plug in behind the same [`CloudBackend`] trait.

pub mod simulated;

pub use simulated::*;

use crate::domain::{CloudBackendRef, NodeSelector, PoolSettings, ProviderKind};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Resolves the connected backend serving a pool
#[async_trait]
pub trait BackendResolver: Send + Sync {
    async fn backend_for(&self, pool: &PoolSettings) -> Result<CloudBackendRef>;
}

/// Builds and caches one connected backend per pool
#[derive(Default)]
pub struct BackendFactory {
    backends: DashMap<String, CloudBackendRef>,
    faults: FaultPlan,
}

impl BackendFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory whose simulated backends start with a fault plan
    pub fn with_faults(faults: FaultPlan) -> Self {
        Self {
            backends: DashMap::new(),
            faults,
        }
    }

    /// Create an unconnected backend adapter for a provider
    pub fn create(&self, kind: ProviderKind) -> CloudBackendRef {
        match kind {
            ProviderKind::Ec2 | ProviderKind::Softlayer | ProviderKind::HpCloud => {
                Arc::new(SimulatedBackend::with_faults(kind, self.faults.clone()))
            }
        }
    }

    /// Install an already connected backend for a pool
    pub fn register(&self, pool_id: impl Into<String>, backend: CloudBackendRef) {
        self.backends.insert(pool_id.into(), backend);
    }

    /// Drop the cached backend of a pool
    pub fn evict(&self, pool_id: &str) -> bool {
        self.backends.remove(pool_id).is_some()
    }

    /// Selector listing the machines of a pool at its provider
    pub fn selector_for(pool: &PoolSettings) -> NodeSelector {
        match pool.provider.kind {
            ProviderKind::Ec2 => NodeSelector::Tag(pool.group_name().to_string()),
            ProviderKind::Softlayer | ProviderKind::HpCloud => {
                NodeSelector::NameMask(pool.group_name().to_string())
            }
        }
    }
}

#[async_trait]
impl BackendResolver for BackendFactory {
    async fn backend_for(&self, pool: &PoolSettings) -> Result<CloudBackendRef> {
        if pool.uuid.is_empty() {
            return Err(Error::InvalidPoolSettings("pool uuid is empty".into()));
        }

        if let Some(backend) = self.backends.get(&pool.uuid) {
            return Ok(backend.value().clone());
        }

        let backend = self.create(pool.provider.kind);
        backend.connect(&pool.provider.connect).await?;
        info!(pool_id = %pool.uuid, provider = %pool.provider.kind, "Backend connected");

        // A concurrent resolve may have won; keep whichever landed first.
        let backend = self
            .backends
            .entry(pool.uuid.clone())
            .or_insert(backend)
            .value()
            .clone();
        Ok(backend)
    }
}
