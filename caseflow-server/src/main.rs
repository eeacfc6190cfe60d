//! caseflow-server - REST + SSE server for the clinic case workflow.
//!
//! Reads config from `CASEFLOW_*` env vars (a `.env` file is honoured):
//!   CASEFLOW_BIND_ADDR      - listen address (default: 0.0.0.0:4000)
//!   CASEFLOW_DATABASE_URL   - Postgres connection string; unset runs in memory
//!   CASEFLOW_ARTIFACT_ROOT  - directory for uploaded radiographs

use std::sync::Arc;

use anyhow::Context;
use caseflow_core::{
    ArtifactStore, CaseStore, CaseflowConfig, LocalArtifactStore, MemoryCaseStore,
    NotificationFanout, SessionOptions, TransitionCoordinator,
};
use caseflow_server::{build_router, AppState};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,caseflow_core=debug,caseflow_server=debug".into()),
        )
        .init();

    let config = CaseflowConfig::from_env();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let fanout = Arc::new(NotificationFanout::new(config.fanout_capacity));

    let store = open_store(&config, &fanout, shutdown_rx.clone()).await?;
    let relay = fanout.spawn_relay(store.subscribe(), shutdown_rx);

    let mut coordinator = TransitionCoordinator::new(store);
    if let Some(root) = &config.artifact_root {
        tracing::info!(root = %root.display(), "Using local artifact store");
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(root.clone()));
        coordinator = coordinator.with_artifacts(artifacts);
    }

    let state = AppState::new(
        Arc::new(coordinator),
        fanout,
        SessionOptions::from(&config),
    );
    let app = build_router(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;
    tracing::info!("caseflow-server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested");
        })
        .await
        .context("server error")?;

    shutdown_tx.send(true).ok();
    relay.await.ok();
    Ok(())
}

#[cfg(feature = "postgres")]
async fn open_store(
    config: &CaseflowConfig,
    fanout: &Arc<NotificationFanout>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Arc<dyn CaseStore>> {
    use caseflow_core::PgCaseStore;
    use sqlx::postgres::PgPoolOptions;

    let Some(url) = &config.database_url else {
        tracing::info!("No database configured, using in-memory store");
        return Ok(Arc::new(MemoryCaseStore::with_capacity(config.fanout_capacity)));
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections)
        .connect(url)
        .await
        .context("failed to connect to database")?;
    tracing::info!("Connected to database");

    let store = PgCaseStore::with_capacity(pool, config.fanout_capacity);
    store.listener().with_fanout(Arc::clone(fanout)).spawn(shutdown);
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn open_store(
    config: &CaseflowConfig,
    _fanout: &Arc<NotificationFanout>,
    _shutdown: watch::Receiver<bool>,
) -> anyhow::Result<Arc<dyn CaseStore>> {
    if config.database_url.is_some() {
        tracing::warn!(
            "CASEFLOW_DATABASE_URL set but built without `postgres`; using in-memory store"
        );
    }
    Ok(Arc::new(MemoryCaseStore::with_capacity(config.fanout_capacity)))
}
