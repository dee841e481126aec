//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the coordinator's token. A running capture observes the
//! token between files and aborts without committing anything.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shutdown coordinator
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once a shutdown signal arrives.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGTERM or SIGINT, then cancel the token.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to install Ctrl+C handler: {}", e);
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
                    error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.token.cancelled() => {}
        }

        self.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_releases_waiters() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        coordinator.trigger();
        handle.await.unwrap();
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn test_wait_returns_after_trigger() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger();
        coordinator.wait_for_signal().await;
        assert!(coordinator.token().is_cancelled());
    }
}
