mod config;
mod error;
mod routes;
mod services;
mod state;
#[cfg(test)]
mod testutil;

use crate::config::DaemonConfig;
use crate::services::scheduler::BackupScheduler;
use crate::state::AppState;
use backup_engine::daemon::shutdown::ShutdownCoordinator;
use backup_engine::{Engine, EngineConfig};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = DaemonConfig::from_env();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .init();

    tracing::info!("Starting backup daemon on port {}", config.port);

    let engine_config = match &config.engine_config {
        Some(path) => EngineConfig::from_file(path)?,
        None => {
            tracing::warn!("BACKUP_ENGINE_CONFIG not set, using built-in defaults");
            EngineConfig::default()
        }
    };
    let engine = Engine::from_config(engine_config)?;
    let state = Arc::new(AppState::new(engine, config.clone()));

    // Initialize cron scheduler
    let scheduler = match BackupScheduler::new(state.engine.clone()).await {
        Ok(s) => {
            if let Err(e) = s.init_schedules(&config.schedules).await {
                tracing::warn!("Failed to initialize schedules: {}", e);
            }
            if let Err(e) = s.start().await {
                tracing::warn!("Failed to start scheduler: {}", e);
            }
            Some(s)
        }
        Err(e) => {
            tracing::warn!("Failed to create scheduler: {}", e);
            None
        }
    };

    // Build router
    let app = routes::create_router(state.clone());

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.clone();
    tokio::spawn(async move { signals.wait_for_signal().await });

    // Graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.token().cancelled_owned())
        .await?;

    tracing::info!("Shutting down...");

    // Stop scheduler
    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    tracing::info!("Daemon stopped");
    Ok(())
}
