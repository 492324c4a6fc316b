//! mserve control plane: the endpoint API plus the background status sync.

use std::sync::Arc;

use anyhow::{Context, Result};
use mserve_control_plane::{
    api,
    config::{ClusterBackend, Config, StoreBackend},
    db::Database,
    serving::{
        audit::{AuditSink, LogAuditSink},
        catalog::{HttpModelCatalog, InMemoryCatalog, ModelCatalog},
        cluster::{ClusterClient, InMemoryCluster, KubeClusterClient},
        store::{EndpointStore, InMemoryEndpointStore},
        worker::StatusSyncWorker,
        Orchestrator, OrchestratorDeps,
    },
    state::AppState,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct Storage {
    db: Option<Database>,
    store: Arc<dyn EndpointStore>,
    audit: Arc<dyn AuditSink>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // RUST_LOG wins over MSERVE_LOG_LEVEL.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        listen_addr = %config.listen_addr,
        store = ?config.store,
        cluster = ?config.cluster,
        namespace = %config.reconciler.default_namespace,
        "Starting mserve control plane"
    );

    let storage = open_storage(&config).await?;
    let orchestrator = Arc::new(Orchestrator::new(
        OrchestratorDeps {
            store: storage.store,
            cluster: cluster_client(&config).await?,
            catalog: model_catalog(&config)?,
            audit: storage.audit,
        },
        config.reconciler.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = StatusSyncWorker::new(orchestrator.clone(), config.sync_worker.clone());
    let worker_handle = tokio::spawn({
        let shutdown = shutdown_rx.clone();
        async move { worker.run(shutdown).await }
    });

    let state = AppState::new(orchestrator, storage.db);
    let operations = state.operations().clone();
    let app = api::create_router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening");

    let mut server_shutdown = shutdown_rx;
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        // A dropped sender also means shut down.
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    });
    let mut server_handle = tokio::spawn(async move { server.await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
        result = &mut server_handle => match result {
            Ok(Ok(())) => info!("Server exited"),
            Ok(Err(e)) => error!(error = %e, "Server failed"),
            Err(e) => error!(error = %e, "Server task panicked"),
        },
    }

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(config.shutdown_timeout, worker_handle)
        .await
        .is_err()
    {
        warn!(timeout = ?config.shutdown_timeout, "Status sync worker did not stop in time");
    }
    if !server_handle.is_finished() {
        let _ = tokio::time::timeout(config.shutdown_timeout, server_handle).await;
    }

    // Mutations outlive their connections; let them reach commit or rollback.
    operations.close();
    if !operations.is_empty() {
        info!(in_flight = operations.len(), "Waiting for endpoint operations to finish");
    }
    if tokio::time::timeout(config.drain_timeout, operations.wait())
        .await
        .is_err()
    {
        warn!(
            in_flight = operations.len(),
            "Endpoint operations still running at exit; stale locks need an unlock"
        );
    }

    info!("Shutdown complete");
    Ok(())
}

async fn open_storage(config: &Config) -> Result<Storage> {
    match config.store {
        StoreBackend::Postgres => {
            let db = Database::connect(&config.database)
                .await
                .context("failed to connect to database")?;
            if config.dev_mode {
                db.run_migrations().await.context("failed to run migrations")?;
            }
            Ok(Storage {
                store: Arc::new(db.endpoint_store()),
                audit: Arc::new(db.audit_sink()),
                db: Some(db),
            })
        }
        StoreBackend::Memory => {
            warn!("Endpoints are kept in memory and lost on restart");
            Ok(Storage {
                db: None,
                store: Arc::new(InMemoryEndpointStore::new()),
                audit: Arc::new(LogAuditSink),
            })
        }
    }
}

async fn cluster_client(config: &Config) -> Result<Arc<dyn ClusterClient>> {
    Ok(match config.cluster {
        ClusterBackend::Kubernetes => Arc::new(
            KubeClusterClient::try_default()
                .await
                .context("failed to build Kubernetes client")?,
        ),
        ClusterBackend::Memory => {
            warn!("Using the in-memory cluster; nothing is actually deployed");
            Arc::new(InMemoryCluster::new().with_auto_pods())
        }
    })
}

fn model_catalog(config: &Config) -> Result<Arc<dyn ModelCatalog>> {
    Ok(match &config.catalog_url {
        Some(url) => Arc::new(HttpModelCatalog::new(url.clone())?),
        None => {
            warn!("MSERVE_CATALOG_URL is not set; model lookups will fail");
            Arc::new(InMemoryCatalog::new())
        }
    })
}
