//! Shared fixtures for the engine's unit tests.

use crate::archiver::Archiver;
use crate::catalog::Catalog;
use crate::config::{DestinationKind, EngineConfig};
use crate::integrity::digest;
use crate::live::{LiveSystem, NoopLiveSystem};
use crate::manifest::{ArchiveInfo, BackupKind, Category, Component, FileEntry, Manifest, Status, FORMAT_VERSION};
use crate::orchestrator::Engine;
use crate::storage::retry::RetryPolicy;
use crate::storage::{ArtifactPair, Destination, RemoteRef, StorageRegistry};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use walkdir::WalkDir;

/// A small live application (store, uploads, config files) and an empty
/// backup directory, both inside a temp dir.
pub struct Fixture {
    dir: TempDir,
    pub config: EngineConfig,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::with_root(&dir.path().join("app"), &dir.path().join("backups"));
        config.archive.compression_level = 1;
        config.sync.max_attempts = 2;
        config.sync.initial_backoff_ms = 1;
        config.sync.max_backoff_ms = 2;
        config.sync.timeout_secs = 30;
        config.protected.config_files = vec!["config.toml".into(), "nginx/site.conf".into()];
        // Status must not depend on the free space of the test machine.
        config.storage.disk_warning_gb = 0;

        let fx = Self { dir, config };
        let db = &fx.config.protected.database;
        fs::create_dir_all(db.parent().unwrap()).unwrap();
        let conn = Connection::open(db).unwrap();
        conn.execute_batch(
            "CREATE TABLE offers (id INTEGER PRIMARY KEY, title TEXT NOT NULL);
             INSERT INTO offers (title) VALUES ('road bike'), ('desk lamp');",
        )
        .unwrap();

        fx.write_asset("logo.png", b"\x89PNG logo");
        fx.write_asset("offers/1/photo.jpg", b"bike photo");
        fx.write_asset("offers/2/photo.jpg", b"lamp photo");
        fx.write_config("config.toml", b"port = 8080\n");
        fx.write_config("nginx/site.conf", b"server_name shop.local;\n");
        // Present on disk but never a configured file.
        fx.write_config(".env", b"SECRET_KEY=s3cr3t\n");
        fx
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write_asset(&self, rel: &str, bytes: &[u8]) {
        let path = self.config.protected.assets_dir.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    pub fn remove_asset(&self, rel: &str) {
        fs::remove_file(self.config.protected.assets_dir.join(rel)).unwrap();
    }

    pub fn write_config(&self, rel: &str, bytes: &[u8]) {
        let path = self.config.protected.config_root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    pub fn insert_row(&self, title: &str) {
        let conn = Connection::open(&self.config.protected.database).unwrap();
        conn.execute("INSERT INTO offers (title) VALUES (?1)", [title]).unwrap();
    }

    pub fn titles(&self) -> Vec<String> {
        let conn = Connection::open(&self.config.protected.database).unwrap();
        let mut stmt = conn.prepare("SELECT title FROM offers ORDER BY id").unwrap();
        let rows = stmt.query_map([], |row| row.get(0)).unwrap();
        rows.map(|r| r.unwrap()).collect()
    }

    /// Asset and config files of the live system, keyed like archive paths.
    pub fn live_tree(&self) -> BTreeMap<String, Vec<u8>> {
        let protected = &self.config.protected;
        let mut tree = BTreeMap::new();
        if protected.assets_dir.exists() {
            for entry in WalkDir::new(&protected.assets_dir).sort_by_file_name() {
                let entry = entry.unwrap();
                if entry.file_type().is_file() {
                    let rel = entry.path().strip_prefix(&protected.assets_dir).unwrap();
                    tree.insert(
                        format!("assets/{}", rel.to_string_lossy()),
                        fs::read(entry.path()).unwrap(),
                    );
                }
            }
        }
        for rel in &protected.config_files {
            if let Ok(bytes) = fs::read(protected.config_root.join(rel)) {
                tree.insert(format!("config/{}", rel.to_string_lossy()), bytes);
            }
        }
        tree
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        Arc::new(Catalog::open(&self.config.storage.local_dir).unwrap())
    }

    pub fn archiver(&self, catalog: Arc<Catalog>) -> Archiver {
        Archiver::new(&self.config, catalog)
    }

    pub fn registry(&self, destinations: Vec<Arc<dyn Destination>>) -> StorageRegistry {
        StorageRegistry::new(
            destinations,
            RetryPolicy::from_config(&self.config.sync),
            self.config.storage.local_is_ephemeral,
            self.config.sync.max_parallel,
        )
    }

    pub fn engine(&self) -> Engine {
        self.engine_with(self.registry(Vec::new()), Arc::new(NoopLiveSystem))
    }

    pub fn engine_with(&self, registry: StorageRegistry, live: Arc<dyn LiveSystem>) -> Engine {
        Engine::with_parts(self.config.clone(), registry, live).unwrap()
    }

    pub fn folder(&self, id: &str) -> Arc<dyn Destination> {
        Arc::new(crate::storage::local::FolderDestination::new(
            id,
            self.path().join("remote").join(id),
            DestinationKind::Local,
        ))
    }
}

/// A succeeded full manifest whose archive digest is that of `archive_bytes`.
pub fn sample_manifest(category: Category, archive_bytes: &[u8]) -> Manifest {
    let id = Manifest::new_id(category, Utc::now());
    Manifest {
        format_version: FORMAT_VERSION,
        archive: Some(ArchiveInfo {
            file_name: Manifest::archive_file_name(&id),
            size: archive_bytes.len() as u64,
            digest: digest(archive_bytes),
            compression: "zstd".to_string(),
        }),
        id,
        category,
        kind: BackupKind::Full,
        created_at: Utc::now(),
        baseline: None,
        source_host: "test-host".to_string(),
        store: None,
        files: vec![FileEntry {
            path: "assets/logo.png".to_string(),
            component: Component::Assets,
            size: 4,
            digest: digest(b"logo"),
        }],
        tombstones: Vec::new(),
        missing: Vec::new(),
        status: Status::Succeeded,
        errors: Vec::new(),
    }
}

/// A destination that is never reachable.
pub struct FailingDestination {
    id: String,
}

impl FailingDestination {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }

    fn unreachable(&self) -> EngineError {
        EngineError::Network(format!("{} is unreachable", self.id))
    }
}

#[async_trait]
impl Destination for FailingDestination {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::HttpObject
    }

    async fn put(&self, _pair: &ArtifactPair) -> Result<RemoteRef> {
        Err(self.unreachable())
    }

    async fn list(&self) -> Result<Vec<RemoteRef>> {
        Err(self.unreachable())
    }

    async fn get(&self, _remote: &RemoteRef, _local_dir: &Path) -> Result<ArtifactPair> {
        Err(self.unreachable())
    }

    async fn get_manifest(&self, _remote: &RemoteRef) -> Result<Manifest> {
        Err(self.unreachable())
    }

    async fn delete(&self, _remote: &RemoteRef) -> Result<()> {
        Err(self.unreachable())
    }
}
