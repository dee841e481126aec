//! Test fixture: an engine over a small live application in a temp dir.

use crate::config::DaemonConfig;
use crate::state::AppState;
use backup_engine::{Engine, EngineConfig};
use rusqlite::Connection;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestApp {
    _dir: TempDir,
    config: EngineConfig,
    pub state: Arc<AppState>,
}

impl TestApp {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::with_root(&dir.path().join("app"), &dir.path().join("backups"));
        config.archive.compression_level = 1;
        config.storage.disk_warning_gb = 0;

        let db = &config.protected.database;
        fs::create_dir_all(db.parent().unwrap()).unwrap();
        let conn = Connection::open(db).unwrap();
        conn.execute_batch(
            "CREATE TABLE offers (id INTEGER PRIMARY KEY, title TEXT NOT NULL);
             INSERT INTO offers (title) VALUES ('road bike');",
        )
        .unwrap();
        drop(conn);

        let engine = Engine::from_config(config.clone()).unwrap();
        let state = Arc::new(AppState::new(engine, DaemonConfig::from_lookup(|_| None)));
        let app = Self {
            _dir: dir,
            config,
            state,
        };
        app.write_asset("logo.png", b"logo bytes");
        fs::write(app.config.protected.config_root.join("config.toml"), b"port = 8080\n").unwrap();
        app
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.config.storage.local_dir.clone()
    }

    pub fn write_asset(&self, rel: &str, bytes: &[u8]) {
        let path = self.config.protected.assets_dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    pub fn read_asset(&self, rel: &str) -> Vec<u8> {
        fs::read(self.config.protected.assets_dir.join(rel)).unwrap()
    }
}
