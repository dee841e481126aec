//! Control of the live application during capture and restore.

use crate::config::LiveConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait LiveSystem: Send + Sync {
    /// Called before the store is exported.
    async fn quiesce(&self) -> Result<()> {
        Ok(())
    }

    /// Called after capture, whether or not it succeeded.
    async fn resume(&self) -> Result<()> {
        Ok(())
    }

    /// Stops the application before restored files are moved into place.
    async fn stop(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    /// Fails if the restored application does not come up healthy.
    async fn health_check(&self) -> Result<()>;
}

/// For deployments where nothing needs stopping.
pub struct NoopLiveSystem;

#[async_trait]
impl LiveSystem for NoopLiveSystem {
    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Runs configured commands, e.g. `["systemctl", "stop", "marketplace"]`.
/// An unset command is a no-op.
pub struct CommandLiveSystem {
    config: LiveConfig,
}

impl CommandLiveSystem {
    pub fn new(config: LiveConfig) -> Self {
        Self { config }
    }

    async fn run(&self, step: &str, argv: Option<&Vec<String>>) -> Result<()> {
        let Some((program, args)) = argv.and_then(|argv| argv.split_first()) else {
            debug!(step, "No command configured");
            return Ok(());
        };

        info!(step, command = %program, "Running live-system command");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| EngineError::Live(format!("{}: failed to run {}: {}", step, program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EngineError::Live(format!(
                "{}: {} exited with {}: {}",
                step,
                program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl LiveSystem for CommandLiveSystem {
    async fn quiesce(&self) -> Result<()> {
        self.run("quiesce", self.config.quiesce_command.as_ref()).await
    }

    async fn resume(&self) -> Result<()> {
        self.run("resume", self.config.resume_command.as_ref()).await
    }

    async fn stop(&self) -> Result<()> {
        self.run("stop", self.config.stop_command.as_ref()).await
    }

    async fn start(&self) -> Result<()> {
        self.run("start", self.config.start_command.as_ref()).await
    }

    async fn health_check(&self) -> Result<()> {
        self.run("health_check", self.config.health_command.as_ref()).await
    }
}

pub fn from_config(config: &LiveConfig) -> Arc<dyn LiveSystem> {
    let configured = [
        &config.quiesce_command,
        &config.resume_command,
        &config.stop_command,
        &config.start_command,
        &config.health_command,
    ]
    .iter()
    .any(|c| c.is_some());

    if configured {
        Arc::new(CommandLiveSystem::new(config.clone()))
    } else {
        Arc::new(NoopLiveSystem)
    }
}
