//! Provisioning core of the Managed Web Service.
//!
//! Network configuration pool, site and service lifecycle, the durable task
//! queue with its runners, periodic reconciliation sweeps and the HTTP
//! surface the hypervisor calls back on.

mod api;
mod config;
mod database;
mod error;
mod external;
mod guard;
mod jobs;
mod lifecycle;
mod models;
mod platform;
mod pool;
mod runner;
mod scheduler;
mod sites;
mod sshfp;
mod store;
mod tasks;
mod telemetry;

#[cfg(test)]
mod jobs_tests;
#[cfg(test)]
mod testing;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use api::{AppState, routes};
pub use config::Config;
pub use database::{Database, DatabaseError};
pub use error::{Error, Result};
pub use external::CommandPlatform;
pub use guard::{Dispatch, PowerState};
pub use jobs::{
    BackupAuditReport, DomainRequestReport, ExpiryReport, PreallocationReport, UpgradeReport,
    ValidationReport,
};
pub use lifecycle::{CallbackOutcome, Orchestrator};
pub use models::{
    Cluster, DomainName, DomainStatus, Host, NetworkConfig, NetworkRole, NewNetworkConfig,
    ServerType, Service, ServiceRole, ServiceStatus, Site, TaskStatus, VirtualMachine, VmStatus,
};
pub use platform::Platform;
pub use pool::PoolStats;
pub use runner::{TaskOutcome, TaskRunner, spawn_runners};
pub use scheduler::{Job, spawn_scheduler};
pub use sites::Preallocated;
pub use sshfp::{KeyType, SshfpRecord};
pub use store::Store;
pub use tasks::{Task, TaskPayload};
pub use telemetry::init as init_telemetry;

/// Run the service: task runners, scheduled sweeps and the HTTP API, until
/// Ctrl-C.
pub async fn serve(config: Config) -> Result<()> {
    let _log_guard = telemetry::init(config.log_dir.as_deref());

    info!(
        database = config.database_url.as_str(),
        bind_address = config.bind_address.as_str(),
        main_domain = config.main_domain.as_str(),
        "Starting MWS orchestrator"
    );

    let database = Database::new(&config.database_url).await?;
    let platform = CommandPlatform::from_config(&config)?;
    let workers = config.worker_concurrency;
    let bind_address = config.bind_address.clone();
    let orchestrator = Arc::new(Orchestrator::new(database, platform, config));

    let shutdown = CancellationToken::new();
    let mut handles = spawn_runners(orchestrator.clone(), workers, shutdown.clone());
    handles.extend(spawn_scheduler(orchestrator.clone(), shutdown.clone()));
    info!(workers, "Task runners and scheduler spawned");

    let app = routes(AppState::new(orchestrator));
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .map_err(|e| Error::Configuration(format!("Cannot bind {}: {}", bind_address, e)))?;
    info!(bind_address = bind_address.as_str(), "Starting HTTP server");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(signal(shutdown.clone()))
        .await;

    shutdown.cancel();
    for joined in futures::future::join_all(handles).await {
        if let Err(e) = joined {
            error!(error = %e, "Background task panicked");
        }
    }

    served.map_err(|e| Error::external("http", e))
}

async fn signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
        }
        _ = shutdown.cancelled() => {}
    }
    info!("Shutdown signal received, terminating...");
}
