use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::middleware;
use axum::{Json, Router, routing::get};
use serde::Serialize;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use wsman_control::builds::PrebuiltImages;
use wsman_control::catalog::StaticCatalog;
use wsman_control::cluster::{ClusterApi, KubeCluster, MemoryCluster};
use wsman_control::config::{ClusterMode, Config};
use wsman_control::git::{GitTasks, LocalStore};
use wsman_control::manager::Manager;
use wsman_control::reconciler::Reconciler;
use wsman_control::state::AppState;
use wsman_control::template::DeploymentTemplate;
use wsman_control::{admin, proxy, security};

const CATALOG_RELOAD_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_IMAGE: &str = "modelix/workspace-instance:latest";

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    namespace: String,
    workspace_versions: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    let manager = &state.manager;
    Json(HealthzResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        namespace: manager.namespace.clone(),
        workspace_versions: manager.registry.tables().len(),
    })
}

/// Stdout logging, plus a daily rolling file when `WSMAN_LOG_DIR` is set.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let (file_layer, guard) = match std::env::var("WSMAN_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir.trim(), "wsman-control.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    guard
}

async fn build_cluster(config: &Config) -> anyhow::Result<Arc<dyn ClusterApi>> {
    let cluster: Arc<dyn ClusterApi> = match config.cluster {
        ClusterMode::Kube => Arc::new(
            KubeCluster::in_cluster(config.namespace.clone(), config.cluster_timeout)
                .await
                .context("in-cluster kubernetes configuration")?,
        ),
        ClusterMode::Memory => {
            tracing::warn!("using the in-memory cluster; no containers will be started");
            Arc::new(MemoryCluster::new())
        }
    };
    Ok(cluster)
}

fn spawn_catalog_reload(catalog: Arc<StaticCatalog>, path: std::path::PathBuf, wake: impl Fn() + Send + 'static) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CATALOG_RELOAD_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match catalog.reload(&path).await {
                Ok(()) => wake(),
                Err(e) => {
                    let error = format!("{e:#}");
                    tracing::warn!(path = %path.display(), %error, "catalog reload failed");
                }
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config = Config::from_env().context("configuration")?;

    let template = match &config.template_path {
        Some(path) => DeploymentTemplate::load(path).await?,
        None => DeploymentTemplate::default(),
    };
    let catalog = Arc::new(match &config.catalog_path {
        Some(path) => StaticCatalog::load(path).await?,
        None => StaticCatalog::new(),
    });
    let cluster = build_cluster(&config).await?;

    let manager = Arc::new(Manager::new(
        &config,
        cluster,
        catalog.clone(),
        Arc::new(PrebuiltImages::new(DEFAULT_IMAGE)),
        template,
    ));
    if let Some(path) = config.catalog_path.clone() {
        let wake = manager.wake.clone();
        spawn_catalog_reload(catalog, path, move || {
            wake.fire(());
        });
    }

    let reconciler = Arc::new(Reconciler::new(manager.clone(), config.reconcile_interval));
    let stop_reconciler = reconciler.shutdown_handle();
    let reconciler_task = reconciler.spawn();

    let git = Arc::new(GitTasks::new(
        Arc::new(LocalStore::new(config.data_dir.join("store"))),
        config.data_dir.join("git"),
    ));
    let state = AppState::new(manager, git)?;

    let admin_router = admin::router().layer(middleware::from_fn(security::admin_guard));
    let app = Router::new()
        .route("/healthz", get(healthz))
        .nest("/admin", admin_router)
        .fallback(proxy::proxy)
        .layer(middleware::from_fn_with_state(state.clone(), security::authenticate))
        .layer(middleware::from_fn(security::request_id))
        .with_state(state);

    tracing::info!(
        addr = %config.listen_addr,
        namespace = %config.namespace,
        public_url = ?config.public_url,
        "wsman-control HTTP listening"
    );
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    stop_reconciler.notify_one();
    if let Err(e) = reconciler_task.await {
        tracing::warn!(error = %e, "reconciler task ended abnormally");
    }
    Ok(())
}
