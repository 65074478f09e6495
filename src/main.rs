//! Node Pool Manager
//!
//! Standalone service managing pools of cloud compute nodes: lifecycle
//! tasks, occupy/release, status aggregation and task error tracking.
//!
//! Startup sequence:
//!
//! 1. Load the YAML configuration and the bootstrap script.
//! 2. Restore the store from `--state-file` if one exists.
//! 3. Register configured pools, fail tasks a previous run left in flight and
//!    report provider machines no node tracks.
//! 4. Serve health, metrics and the REST API until Ctrl-C.
//! 5. Write the store back to `--state-file`.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use node_pool_manager::{
    ApiServer, ApiServerConfig, BackendFactory, Error, ManagerConfig, MemoryStore, PoolManager,
    Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Node Pool Manager - lifecycle orchestration for cloud node pools
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "NODE_POOL_CONFIG")]
    config: Option<PathBuf>,

    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// JSON snapshot restored at startup and written at shutdown
    #[arg(long, env = "STATE_FILE")]
    state_file: Option<PathBuf>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Node Pool Manager");
    info!("  Version: {}", node_pool_manager::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  State file: {:?}", args.state_file);

    let config = match &args.config {
        Some(path) => ManagerConfig::load(path).await?,
        None => {
            warn!("No configuration file given, starting without pools");
            ManagerConfig::default()
        }
    };
    let executor_config = config.executor_config().await?;
    if executor_config.bootstrap_script.is_none() {
        warn!("No bootstrap script configured, bootstrap requests will be rejected");
    }

    // Restore or create the store
    let store = match &args.state_file {
        Some(path) if path.exists() => Arc::new(MemoryStore::load_snapshot(path).await?),
        _ => Arc::new(MemoryStore::new()),
    };

    let manager = PoolManager::new(executor_config, store.clone(), Arc::new(BackendFactory::new()));
    for pool in config.pools {
        manager.register_pool(pool)?;
    }

    let interrupted = manager.recover_interrupted_tasks().await?;
    info!("Pool manager initialized ({} interrupted task(s) failed)", interrupted);

    for pool in manager.list_pools() {
        match manager.list_untracked_machines(&pool).await {
            Ok(machines) if !machines.is_empty() => {
                let ids: Vec<&str> = machines.iter().map(|m| m.id.as_str()).collect();
                warn!(pool_id = %pool.uuid, machines = ?ids, "Provider lists machines no node tracks");
            }
            Ok(_) => {}
            Err(e) => warn!(pool_id = %pool.uuid, "Could not list provider machines: {}", e),
        }
    }

    let ready = Arc::new(AtomicBool::new(false));

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_ready = ready.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_ready).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let registry = node_pool_manager::metrics::registry(manager.metrics())?;
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    // Create and run API server
    let api_config = ApiServerConfig {
        rest_addr: args.api_addr.parse().map_err(|e| {
            Error::Configuration(format!("Invalid REST API address: {}", e))
        })?,
    };
    let api_server = Arc::new(ApiServer::new(api_config, manager.clone()));

    let server = api_server.clone();
    let mut api_handle = tokio::spawn(async move { server.run().await });
    ready.store(true, Ordering::Release);

    tokio::select! {
        result = &mut api_handle => {
            match result {
                Ok(Err(e)) => error!("API server error: {}", e),
                Err(e) => error!("API server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            ready.store(false, Ordering::Release);
            api_server.shutdown();
            if let Err(e) = api_handle.await {
                error!("API server task failed: {}", e);
            }
        }
    }

    if let Some(path) = &args.state_file {
        store.save_snapshot(path).await?;
    }

    info!("Node Pool Manager shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{},hyper=warn,tower=warn,tower_http=info,axum=info", level))
    });

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn text_response(status: hyper::StatusCode, body: &'static str) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(hyper::Body::from(body));
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str, ready: Arc<AtomicBool>) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::Acquire);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if ready => text_response(StatusCode::OK, "ok"),
                        "/readyz" => text_response(StatusCode::SERVICE_UNAVAILABLE, "starting"),
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, registry: prometheus::Registry) -> Result<()> {
    use hyper::header::CONTENT_TYPE;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match node_pool_manager::metrics::render(&registry) {
                            Ok((buffer, content_type)) => {
                                let mut response = Response::new(Body::from(buffer));
                                if let Ok(value) = content_type.parse() {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => {
                                error!("Failed to encode metrics: {}", e);
                                text_response(StatusCode::INTERNAL_SERVER_ERROR, "encode error")
                            }
                        },
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
