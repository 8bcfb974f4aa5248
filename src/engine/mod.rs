pub mod api;
pub mod config;
pub mod error;
pub mod job;
pub mod limits;
pub mod metrics;
pub mod models;
pub mod pool;
pub mod runtime;
pub mod sandbox;
pub mod tracker;
pub mod validation;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;

use crate::engine::{
    api::{AppState, routes},
    config::{EngineConfig, LogFormat},
    job::JobContext,
    metrics::MetricsRegistry,
    pool::SandboxPool,
    runtime::RuntimeRegistry,
    sandbox::{box_uid_base, executor_from_config},
    tracker::ActiveJobs,
};

pub async fn run() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    init_tracing(&config);

    let registry = match &config.runtimes_path {
        Some(path) => RuntimeRegistry::from_path(path).context("runtime registry init failed")?,
        None => RuntimeRegistry::builtin(),
    };
    tracing::info!(runtimes = registry.len(), "runtime registry loaded");

    let uid_base = box_uid_base(&config, nix::unistd::geteuid().is_root())?;
    let metrics = Arc::new(MetricsRegistry::new());
    let pool = SandboxPool::with_uid_base(
        &config.workspace_root,
        config.pool_size,
        uid_base,
        config.acquire_timeout,
        metrics.clone(),
    )
    .await
    .context("sandbox pool init failed")?;
    let executor = executor_from_config(&config);
    tracing::info!(executor = executor.name(), "sandbox executor selected");

    let jobs = JobContext {
        pool,
        executor,
        metrics,
        tracker: ActiveJobs::new(),
    };
    let app: Router = routes(AppState::new(Arc::new(registry), jobs), &config);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;
    let local = listener
        .local_addr()
        .unwrap_or(SocketAddr::from(([0, 0, 0, 0], 0)));
    tracing::info!(bind = %local, "job execution engine ready");
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(config: &EngineConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
        LogFormat::Compact => builder.with_target(false).compact().init(),
    }
}
