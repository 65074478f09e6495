//! API Server
//!
//! Runs the REST server for the pool manager API.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use super::rest::RestRouter;
use crate::controlplane::PoolManager;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

pub struct ApiServer {
    config: ApiServerConfig,
    manager: Arc<PoolManager>,
    shutdown_tx: watch::Sender<bool>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(config: ApiServerConfig, manager: Arc<PoolManager>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config,
            manager,
            shutdown_tx,
        }
    }

    /// Serve until [`shutdown`](Self::shutdown) is called
    pub async fn run(&self) -> Result<()> {
        let addr = self.config.rest_addr;
        let app = RestRouter::new(self.manager.clone()).build();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;
        info!("REST API listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|stop| *stop).await;
                info!("REST server shutting down");
            })
            .await
            .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

        Ok(())
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }
}
