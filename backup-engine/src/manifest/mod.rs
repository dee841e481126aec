//! Manifest types.
//!
//! A manifest is the self-describing record of one backup run. It is written
//! once, next to its archive, as `<id>.manifest.json` and never modified.
//! Everything needed to verify or restore the archive is in the manifest
//! itself: entry digests, the store capture, the archive digest and the
//! baseline link for incrementals.

pub mod chain;

use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Current manifest schema version.
pub const FORMAT_VERSION: u32 = 1;

/// Fixed archive path of the data-store export.
pub const STORE_ENTRY: &str = "store/database.sqlite3";

pub const MANIFEST_SUFFIX: &str = ".manifest.json";
pub const ARCHIVE_SUFFIX: &str = ".tar.zst";

/// Backup category. `PreRestore` is reserved for safety snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Manual,
    Daily,
    Weekly,
    Monthly,
    PreRestore,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Manual,
        Category::Daily,
        Category::Weekly,
        Category::Monthly,
        Category::PreRestore,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Manual => "manual",
            Category::Daily => "daily",
            Category::Weekly => "weekly",
            Category::Monthly => "monthly",
            Category::PreRestore => "pre_restore",
        }
    }

    /// Reserved categories cannot be requested by callers.
    pub fn is_reserved(&self) -> bool {
        matches!(self, Category::PreRestore)
    }

    /// Category encoded in a manifest id (`<category>-<timestamp>-<suffix>`).
    pub fn from_manifest_id(id: &str) -> Option<Category> {
        Category::ALL.into_iter().find(|c| {
            id.strip_prefix(c.as_str())
                .is_some_and(|rest| rest.starts_with('-'))
        })
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| EngineError::Validation(format!("unknown backup category '{}'", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Succeeded,
    Partial,
    Failed,
}

/// Restorable component of the protected system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Database,
    Assets,
    Config,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Database, Component::Assets, Component::Config];

    /// Archive path prefix holding this component.
    pub fn prefix(&self) -> &'static str {
        match self {
            Component::Database => "store/",
            Component::Assets => "assets/",
            Component::Config => "config/",
        }
    }

    /// Component an archive path belongs to.
    pub fn of_path(path: &str) -> Option<Component> {
        Component::ALL.into_iter().find(|c| path.starts_with(c.prefix()))
    }
}

impl FromStr for Component {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "database" | "db" => Ok(Component::Database),
            "assets" | "uploads" => Ok(Component::Assets),
            "config" => Ok(Component::Config),
            other => Err(EngineError::Validation(format!("unknown component '{}'", other))),
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Component::Database => "database",
            Component::Assets => "assets",
            Component::Config => "config",
        };
        f.write_str(name)
    }
}

/// Data-store export captured by a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreCapture {
    pub path: String,
    pub size: u64,
    pub digest: String,
    pub integrity_ok: bool,
    pub integrity_detail: String,
    /// False when an incremental found the store unchanged since its baseline.
    pub included: bool,
}

/// One captured file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub component: Component,
    pub size: u64,
    pub digest: String,
}

/// A file that could not be read during capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingFile {
    pub path: String,
    pub reason: String,
}

impl MissingFile {
    /// Whether `path` is this entry or lies beneath it. An unreadable
    /// directory is recorded once and covers everything under it.
    pub fn covers(&self, path: &str) -> bool {
        let own = self.path.trim_end_matches('/');
        path == own
            || path
                .strip_prefix(own)
                .is_some_and(|rest| rest.starts_with('/'))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveInfo {
    pub file_name: String,
    pub size: u64,
    pub digest: String,
    pub compression: String,
}

/// Backup manifest, serialized as `<id>.manifest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub id: String,
    pub category: Category,
    pub kind: BackupKind,
    pub created_at: DateTime<Utc>,
    pub baseline: Option<String>,
    pub source_host: String,
    pub store: Option<StoreCapture>,
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub tombstones: Vec<String>,
    #[serde(default)]
    pub missing: Vec<MissingFile>,
    pub archive: Option<ArchiveInfo>,
    pub status: Status,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl Manifest {
    /// New manifest id, sortable by time within a category.
    pub fn new_id(category: Category, at: DateTime<Utc>) -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!(
            "{}-{}-{}",
            category.as_str(),
            at.format("%Y%m%dT%H%M%SZ"),
            &suffix[..8]
        )
    }

    pub fn manifest_file_name(id: &str) -> String {
        format!("{}{}", id, MANIFEST_SUFFIX)
    }

    pub fn archive_file_name(id: &str) -> String {
        format!("{}{}", id, ARCHIVE_SUFFIX)
    }

    /// Rejects ids that could escape a catalog directory.
    pub fn validate_id(id: &str) -> Result<Category> {
        let well_formed = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !well_formed {
            return Err(EngineError::Validation(format!("malformed manifest id '{}'", id)));
        }
        Category::from_manifest_id(id)
            .ok_or_else(|| EngineError::Validation(format!("manifest id '{}' has no category", id)))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        if manifest.format_version > FORMAT_VERSION {
            return Err(EngineError::Validation(format!(
                "manifest {} has unsupported format version {}",
                manifest.id, manifest.format_version
            )));
        }
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Succeeded or partial runs with an archive.
    pub fn is_restorable(&self) -> bool {
        self.status != Status::Failed && self.archive.is_some()
    }

    pub fn total_bytes(&self) -> u64 {
        let store = self
            .store
            .as_ref()
            .filter(|s| s.included)
            .map(|s| s.size)
            .unwrap_or(0);
        store + self.files.iter().map(|f| f.size).sum::<u64>()
    }

    pub fn age_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_days()
    }
}
