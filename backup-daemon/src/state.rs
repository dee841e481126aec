use crate::config::DaemonConfig;
use backup_engine::Engine;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: DaemonConfig,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(engine: Engine, config: DaemonConfig) -> Self {
        Self {
            engine: Arc::new(engine),
            config,
            started_at: Utc::now(),
        }
    }
}
