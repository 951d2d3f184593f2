//! Process wiring for `infraflowd serve`

use crate::api::{self, AppState};
use anyhow::{Context, Result};
use chrono::Utc;
use infraflow_config::{DaemonConfig, StoreBackend};
use infraflow_controlplane::{Controller, EntityService, HttpTaskRunner, TaskManager, WorkerPool};
use infraflow_core::{EntityStore, FileEntityStore, MemoryEntityStore, parse_manifest_file};
use infraflow_deployer::{DeployContext, DeployerRouter, TaskRunner};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

const ENTITY_FILE: &str = "entities.json";
const TASK_FILE: &str = "tasks.json";

/// Entity store and task queue for the configured backend
pub async fn open_state(config: &DaemonConfig) -> Result<(Arc<dyn EntityStore>, Arc<TaskManager>)> {
    match config.store.backend {
        StoreBackend::Memory => {
            info!("Using in-memory state; nothing survives a restart");
            let store: Arc<dyn EntityStore> = Arc::new(MemoryEntityStore::new());
            let tasks = TaskManager::new(store.clone(), config.tasks.clone());
            Ok((store, Arc::new(tasks)))
        }
        StoreBackend::File => {
            let dir = &config.store.path;
            let store: Arc<dyn EntityStore> = Arc::new(
                FileEntityStore::open(dir.join(ENTITY_FILE))
                    .await
                    .with_context(|| format!("Failed to open entity store in {}", dir.display()))?,
            );
            let tasks = TaskManager::open(store.clone(), config.tasks.clone(), dir.join(TASK_FILE))
                .await
                .with_context(|| format!("Failed to open task queue in {}", dir.display()))?;
            Ok((store, Arc::new(tasks)))
        }
    }
}

/// In-process deployers unless a remote endpoint is configured
pub fn task_runner(config: &DaemonConfig) -> Result<Arc<dyn TaskRunner>> {
    match &config.deployer.endpoint {
        Some(endpoint) => {
            let runner = HttpTaskRunner::new(endpoint)
                .with_context(|| format!("Invalid deployer endpoint {}", endpoint))?;
            info!("Dispatching tasks to {}", runner.url());
            Ok(Arc::new(runner))
        }
        None => {
            info!("Running deployers in-process");
            Ok(Arc::new(DeployerRouter::new(DeployContext::from_config(config))))
        }
    }
}

pub async fn serve(config: DaemonConfig, manifest: Option<&Path>) -> Result<()> {
    let (store, tasks) = open_state(&config).await?;
    let service = EntityService::new(store.clone(), tasks.clone());

    if let Some(path) = manifest {
        let decls = parse_manifest_file(path)
            .with_context(|| format!("Failed to read manifest {}", path.display()))?;
        let report = service
            .apply_manifest(decls)
            .await
            .with_context(|| format!("Failed to apply manifest {}", path.display()))?;
        info!(
            "Manifest applied: {} created, {} updated, {} unchanged",
            report.created.len(),
            report.updated.len(),
            report.unchanged.len()
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let controller = Controller::new(store.clone(), tasks.clone(), config.controller.clone());
    let controller_rx = shutdown_rx.clone();
    let controller_handle = tokio::spawn(async move { controller.run(controller_rx).await });

    let runner = task_runner(&config)?;
    let workers = WorkerPool::spawn(
        tasks.clone(),
        store.clone(),
        runner,
        config.worker.clone(),
        shutdown_rx,
    );
    info!("Started {} worker(s)", workers.len());

    let state = Arc::new(AppState {
        service,
        started_at: Utc::now(),
    });
    let app = api::router(state);
    let listener = TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.listen))?;
    info!("Entity API listening on {}", config.server.listen);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed");

    info!("Shutting down; waiting for in-flight tasks");
    let _ = shutdown_tx.send(true);
    if let Err(e) = controller_handle.await {
        tracing::error!("Controller panicked: {}", e);
    }
    workers.join().await;
    info!("Daemon stopped");

    served
}

/// `infraflowd deployer`: run deployers behind the task RPC endpoint
pub async fn serve_deployer(config: DaemonConfig, listen: &str) -> Result<()> {
    let runner: Arc<dyn TaskRunner> =
        Arc::new(DeployerRouter::new(DeployContext::from_config(&config)));
    let app = crate::deployer::router(runner);
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind to {}", listen))?;
    info!("Deployer listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("Deployer stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infraflow_controlplane::testing::{account, network};
    use infraflow_core::Operation;

    #[tokio::test]
    async fn test_file_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.store.path = dir.path().to_path_buf();

        {
            let (store, tasks) = open_state(&config).await.unwrap();
            store.insert(account("acct")).await.unwrap();
            store.insert(network("net", "acct")).await.unwrap();
            let net = store.require("net").await.unwrap();
            tasks
                .enqueue(&net, Operation::CreateOrUpdate, Utc::now())
                .await
                .unwrap();
        }

        let (store, tasks) = open_state(&config).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 2);
        let task = tasks.active_for("net").await.unwrap();
        assert_eq!(task.operation, Operation::CreateOrUpdate);
        assert!(dir.path().join(ENTITY_FILE).exists());
        assert!(dir.path().join(TASK_FILE).exists());
    }
}
