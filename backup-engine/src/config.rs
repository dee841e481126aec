//! Configuration management for the backup engine.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`BACKUP_ENGINE__SECTION__KEY`).

use crate::manifest::Category;
use crate::utils::errors::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Component as PathComponent, Path, PathBuf};

pub const ENV_PREFIX: &str = "BACKUP_ENGINE";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub protected: ProtectedConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default = "default_retention")]
    pub retention: BTreeMap<String, RetentionRule>,
    #[serde(default)]
    pub live: LiveConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// The live system's durable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedConfig {
    /// SQLite database file
    pub database: PathBuf,

    /// Root of the user-uploaded asset tree
    pub assets_dir: PathBuf,

    /// Directory the configuration files are relative to
    pub config_root: PathBuf,

    /// Configuration files, relative to `config_root`
    #[serde(default)]
    pub config_files: Vec<PathBuf>,

    /// File or directory names skipped in the asset tree
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Compression level (1-22 for zstd)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Files digested concurrently
    #[serde(default = "default_digest_parallelism")]
    pub digest_parallelism: usize,

    /// Auto mode takes a full backup when the last one is this old
    #[serde(default = "default_full_interval_days")]
    pub full_interval_days: u32,

    /// Auto mode takes a full backup once the chain holds this many incrementals
    #[serde(default = "default_max_chain_length")]
    pub max_chain_length: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local catalog of manifest/archive pairs
    pub local_dir: PathBuf,

    /// Local disk does not survive restarts; it is only a staging area
    #[serde(default)]
    pub local_is_ephemeral: bool,

    #[serde(default)]
    pub destinations: Vec<DestinationConfig>,

    /// Free space on the local volume below which status warns
    #[serde(default = "default_disk_warning_gb")]
    pub disk_warning_gb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationKind {
    Local,
    SyncFolder,
    Sftp,
    HttpObject,
}

/// One remote target. Which fields are required depends on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub id: String,
    pub kind: DestinationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<CredentialRef>,
}

impl DestinationConfig {
    pub fn require<'a, T>(&self, field: &'a Option<T>, name: &str) -> Result<&'a T> {
        field.as_ref().ok_or_else(|| {
            EngineError::Config(format!(
                "destination '{}' ({:?}) requires '{}'",
                self.id, self.kind, name
            ))
        })
    }
}

/// Where a secret comes from. The secret itself never enters config files,
/// manifests or archives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialRef {
    Env(String),
    File(PathBuf),
}

impl CredentialRef {
    pub fn resolve(&self) -> Result<String> {
        match self {
            CredentialRef::Env(var) => std::env::var(var)
                .map_err(|_| EngineError::Config(format!("credential variable {} is not set", var))),
            CredentialRef::File(path) => std::fs::read_to_string(path)
                .map(|s| s.trim().to_string())
                .map_err(|e| {
                    EngineError::Config(format!("credential file {}: {}", path.display(), e))
                }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Deadline for a single put/get/list/delete attempt
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Destinations synced concurrently
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionRule {
    pub max_age_days: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_count: Option<usize>,
}

/// Commands (argv) used to control the live application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quiesce_command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_command: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_exclude_patterns() -> Vec<String> {
    vec![".git".to_string(), ".DS_Store".to_string(), "Thumbs.db".to_string()]
}

fn default_disk_warning_gb() -> u64 {
    5
}

fn default_compression_level() -> i32 {
    6
}

fn default_digest_parallelism() -> usize {
    4
}

fn default_full_interval_days() -> u32 {
    7
}

fn default_max_chain_length() -> u32 {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_max_parallel() -> usize {
    4
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_retention() -> BTreeMap<String, RetentionRule> {
    Category::ALL
        .into_iter()
        .map(|c| {
            let max_age_days = if c == Category::PreRestore { 14 } else { 30 };
            (
                c.as_str().to_string(),
                RetentionRule {
                    max_age_days,
                    max_count: None,
                },
            )
        })
        .collect()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            digest_parallelism: default_digest_parallelism(),
            full_interval_days: default_full_interval_days(),
            max_chain_length: default_max_chain_length(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            timeout_secs: default_timeout_secs(),
            max_parallel: default_max_parallel(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::with_root(Path::new("/var/lib/marketplace"), Path::new("/var/backups/marketplace"))
    }
}

impl EngineConfig {
    /// Load a TOML file, apply environment overrides and validate.
    pub fn from_file(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let config: EngineConfig = settings
            .try_deserialize()
            .map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layout for an application rooted at `app_root`, backed up into `backup_root`.
    pub fn with_root(app_root: &Path, backup_root: &Path) -> Self {
        EngineConfig {
            protected: ProtectedConfig {
                database: app_root.join("data/marketplace.db"),
                assets_dir: app_root.join("uploads"),
                config_root: app_root.to_path_buf(),
                config_files: vec![PathBuf::from("config.toml")],
                exclude_patterns: default_exclude_patterns(),
            },
            storage: StorageConfig {
                local_dir: backup_root.to_path_buf(),
                local_is_ephemeral: false,
                destinations: Vec::new(),
                disk_warning_gb: default_disk_warning_gb(),
            },
            archive: ArchiveConfig::default(),
            sync: SyncConfig::default(),
            retention: default_retention(),
            live: LiveConfig::default(),
            log: LogConfig::default(),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| EngineError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        for file in &self.protected.config_files {
            let escapes = file
                .components()
                .any(|c| !matches!(c, PathComponent::Normal(_)));
            if escapes || file.as_os_str().is_empty() {
                return Err(EngineError::Config(format!(
                    "config file '{}' must be a plain relative path",
                    file.display()
                )));
            }
            if holds_secrets(file) {
                return Err(EngineError::Config(format!(
                    "config file '{}' holds credentials and is never archived",
                    file.display()
                )));
            }
        }

        let mut ids = HashSet::new();
        for dest in &self.storage.destinations {
            if !ids.insert(dest.id.as_str()) {
                return Err(EngineError::Config(format!("duplicate destination id '{}'", dest.id)));
            }
        }

        for name in self.retention.keys() {
            name.parse::<Category>()
                .map_err(|_| EngineError::Config(format!("retention for unknown category '{}'", name)))?;
        }

        if self.archive.digest_parallelism == 0 || self.sync.max_parallel == 0 {
            return Err(EngineError::Config("parallelism must be at least 1".into()));
        }
        if self.sync.max_attempts == 0 {
            return Err(EngineError::Config("sync.max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Dotenv files (`.env`, `.env.production`, `prod.env`).
fn holds_secrets(file: &Path) -> bool {
    file.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|name| name == ".env" || name.starts_with(".env.") || name.ends_with(".env"))
}
