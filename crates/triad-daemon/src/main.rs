//! triad daemon: binds the job subscription endpoint and wires the
//! orchestration engine behind it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use triad_agents::JobController;
use triad_core::config::{Config, EnvOverrides, JobEnv};

mod server;

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("failed to load config, using defaults: {e}");
        Config::default()
    });
    config.apply_env_overrides(&EnvOverrides::capture());

    triad_telemetry::logging::init_logging("triad-daemon", &config.general.log_level);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "triad daemon starting"
    );

    // Credentials and model overrides are snapshotted here and reused for
    // every job this process creates.
    let job_env = JobEnv::capture();

    let workspace_root = config.workspace_root();
    std::fs::create_dir_all(&workspace_root)
        .with_context(|| format!("failed to create workspace root {}", workspace_root.display()))?;
    info!(
        workspace_root = %workspace_root.display(),
        max_parallel = config.agents.max_parallel,
        "workspace root ready"
    );

    let bind_addr = format!("{}:{}", config.bridge.host, config.bridge.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind subscription endpoint on {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, "subscription endpoint listening");

    let state = Arc::new(server::AppState::new(
        JobController::new(config.clone(), job_env),
        config.bridge.subscriber_backlog,
    ));
    let app = server::router(state);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("subscription endpoint failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
        }
    }

    Ok(())
}
