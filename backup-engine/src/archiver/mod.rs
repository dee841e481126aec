//! Backup archiver - captures the protected system into an archive plus
//! manifest.
//!
//! A capture runs in four steps:
//! - export the data store through the online backup API and check it
//! - enumerate the asset tree and the configuration files
//! - digest every file in parallel, bounded by `digest_parallelism`
//! - write the selected entries sequentially into `<id>.tar.zst.partial`,
//!   verify it from disk and commit it to the catalog
//!
//! Incremental captures select only entries whose digest differs from the
//! state replayed from the baseline chain and record deletions as tombstones.

pub mod container;

use crate::catalog::Catalog;
use crate::config::{ArchiveConfig, EngineConfig, ProtectedConfig};
use crate::fs::walker::{portable, walk_directory, WalkOptions};
use crate::integrity::{digest_file, verify_archive, verify_store};
use crate::manifest::chain::{self, ChainState};
use crate::manifest::{
    ArchiveInfo, BackupKind, Category, Component, FileEntry, Manifest, MissingFile, Status,
    StoreCapture, FORMAT_VERSION, STORE_ENTRY,
};
use crate::store;
use crate::utils::errors::{EngineError, Result};
use chrono::{DateTime, Utc};
use container::ArchiveWriter;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How the archiver picks between full and incremental capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    /// Full when no baseline exists, the last full is too old or the chain
    /// is at its maximum length; incremental otherwise.
    #[default]
    Auto,
    Full,
    /// Incremental whenever a usable baseline exists.
    Incremental,
}

/// The chain a new incremental extends, oldest first.
#[derive(Debug, Clone)]
pub struct Baseline {
    pub chain: Vec<Manifest>,
    pub state: ChainState,
}

impl Baseline {
    pub fn head(&self) -> Option<&Manifest> {
        self.chain.last()
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    archive_path: String,
    component: Component,
    source: PathBuf,
}

#[derive(Debug)]
struct Digested {
    candidate: Candidate,
    digest: String,
}

struct Written {
    size: u64,
    digest: String,
    files: Vec<FileEntry>,
    missing: Vec<MissingFile>,
}

pub struct Archiver {
    protected: ProtectedConfig,
    settings: ArchiveConfig,
    catalog: Arc<Catalog>,
    source_host: String,
}

impl Archiver {
    pub fn new(config: &EngineConfig, catalog: Arc<Catalog>) -> Self {
        let source_host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());

        Self {
            protected: config.protected.clone(),
            settings: config.archive.clone(),
            catalog,
            source_host,
        }
    }

    pub async fn create_full(&self, category: Category, cancel: &CancellationToken) -> Result<Manifest> {
        self.create(category, BackupMode::Full, cancel).await
    }

    /// Falls back to a full capture when there is no baseline or its chain
    /// is broken.
    pub async fn create_incremental(&self, category: Category, cancel: &CancellationToken) -> Result<Manifest> {
        self.create(category, BackupMode::Incremental, cancel).await
    }

    pub async fn create(&self, category: Category, mode: BackupMode, cancel: &CancellationToken) -> Result<Manifest> {
        if mode == BackupMode::Full {
            return self.capture(category, None, cancel).await;
        }

        let baseline = match self.resolve_baseline() {
            Ok(Some(baseline)) => baseline,
            Ok(None) => {
                info!(category = %category, "No baseline found, taking a full backup");
                return self.capture(category, None, cancel).await;
            }
            Err(e) => {
                warn!(category = %category, error = %e, "Baseline chain unusable, falling back to a full backup");
                return self.capture(category, None, cancel).await;
            }
        };

        if mode == BackupMode::Auto && self.full_due(&baseline, Utc::now()) {
            info!(category = %category, chain_length = baseline.chain.len(), "Full backup due");
            return self.capture(category, None, cancel).await;
        }

        self.capture(category, Some(baseline), cancel).await
    }

    /// Latest usable chain, excluding safety snapshots.
    pub fn resolve_baseline(&self) -> Result<Option<Baseline>> {
        let head = self
            .catalog
            .list(None)?
            .into_iter()
            .find(|m| !m.category.is_reserved() && m.is_restorable());
        let Some(head) = head else {
            return Ok(None);
        };

        let chain = chain::resolve_chain(&head.id, |id| self.catalog.load(id))?;
        if let Some(link) = chain.iter().find(|m| !self.catalog.has_archive(m)) {
            return Err(EngineError::ChainBroken {
                manifest_id: head.id.clone(),
                missing_link: link.id.clone(),
                reason: "archive is missing from the local catalog".into(),
            });
        }

        let state = chain::replay(&chain);
        Ok(Some(Baseline { chain, state }))
    }

    pub fn full_due(&self, baseline: &Baseline, now: DateTime<Utc>) -> bool {
        let Some(full) = baseline.chain.first() else {
            return true;
        };
        let incrementals = baseline.chain.len().saturating_sub(1);
        let interval = chrono::Duration::days(i64::from(self.settings.full_interval_days));
        now - full.created_at >= interval || incrementals >= self.settings.max_chain_length as usize
    }

    async fn capture(&self, category: Category, baseline: Option<Baseline>, cancel: &CancellationToken) -> Result<Manifest> {
        let created_at = Utc::now();
        let id = Manifest::new_id(category, created_at);
        let kind = if baseline.is_some() {
            BackupKind::Incremental
        } else {
            BackupKind::Full
        };
        info!(manifest_id = %id, category = %category, kind = ?kind, "Starting capture");

        let staging = self.catalog.staging_dir(&id)?;
        let manifest = Manifest {
            format_version: FORMAT_VERSION,
            id: id.clone(),
            category,
            kind,
            created_at,
            baseline: baseline.as_ref().and_then(|b| b.head()).map(|m| m.id.clone()),
            source_host: self.source_host.clone(),
            store: None,
            files: Vec::new(),
            tombstones: Vec::new(),
            missing: Vec::new(),
            archive: None,
            status: Status::Succeeded,
            errors: Vec::new(),
        };

        let result = self.capture_into(manifest, baseline.as_ref(), &staging, cancel).await;
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            debug!(path = %staging.display(), error = %e, "Failed to clean capture staging");
        }
        result
    }

    async fn capture_into(
        &self,
        mut manifest: Manifest,
        baseline: Option<&Baseline>,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<Manifest> {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // Store first, then assets: cross-consistency is best effort.
        let export_path = staging.join("database.sqlite3");
        let database = self.protected.database.clone();
        let store = if !database.exists() && manifest.category == Category::PreRestore {
            debug!(manifest_id = %manifest.id, "No live store to protect");
            None
        } else {
            let out = export_path.clone();
            let exported = tokio::task::spawn_blocking(move || store::export(&database, &out))
                .await
                .map_err(EngineError::join)?;
            if let Err(e) = exported {
                return self.fail(manifest, format!("store export failed: {}", e));
            }

            let out = export_path.clone();
            let ((size, digest), check) = tokio::task::spawn_blocking(move || {
                digest_file(&out).map(|d| (d, verify_store(&out)))
            })
            .await
            .map_err(EngineError::join)??;

            let included = baseline
                .and_then(|b| b.state.store())
                .map_or(true, |previous| previous.digest != digest);
            let capture = StoreCapture {
                path: STORE_ENTRY.to_string(),
                size,
                digest,
                integrity_ok: check.ok,
                integrity_detail: check.detail.clone(),
                included,
            };
            if !check.ok {
                manifest.store = Some(capture);
                return self.fail(manifest, format!("store integrity check failed: {}", check.detail));
            }
            Some(capture)
        };

        let protected = self.protected.clone();
        let (candidates, mut missing) = tokio::task::spawn_blocking(move || enumerate(&protected))
            .await
            .map_err(EngineError::join)?;

        let (digested, unreadable) =
            digest_candidates(candidates, self.settings.digest_parallelism, cancel).await?;
        missing.extend(unreadable);

        let (selected, tombstones) = match baseline {
            Some(b) => diff_against(&b.state, digested, &missing),
            None => (digested, Vec::new()),
        };
        debug!(
            manifest_id = %manifest.id,
            selected = selected.len(),
            tombstones = tombstones.len(),
            missing = missing.len(),
            "Entries selected"
        );

        let partial = self.catalog.partial_path(manifest.category, &manifest.id);
        let level = self.settings.compression_level;
        let store_export = store.as_ref().filter(|s| s.included).map(|_| export_path);
        let task_partial = partial.clone();
        let task_cancel = cancel.clone();
        let written = tokio::task::spawn_blocking(move || {
            write_archive(&task_partial, level, store_export.as_deref(), &selected, &task_cancel)
        })
        .await
        .map_err(EngineError::join)??;

        let check_partial = partial.clone();
        let expected = written.digest.clone();
        let verified = tokio::task::spawn_blocking(move || verify_archive(&check_partial, &expected))
            .await
            .map_err(EngineError::join)?;
        if !verified {
            let _ = std::fs::remove_file(&partial);
            return Err(EngineError::Integrity(format!(
                "archive of {} does not match the digest computed while writing",
                manifest.id
            )));
        }

        missing.extend(written.missing);
        missing.sort_by(|a, b| a.path.cmp(&b.path));

        manifest.store = store;
        manifest.files = written.files;
        manifest.tombstones = tombstones;
        manifest.archive = Some(ArchiveInfo {
            file_name: Manifest::archive_file_name(&manifest.id),
            size: written.size,
            digest: written.digest,
            compression: "zstd".to_string(),
        });
        if !missing.is_empty() {
            manifest.status = Status::Partial;
            manifest.errors.push(format!("{} file(s) could not be read", missing.len()));
        }
        manifest.missing = missing;

        self.catalog.commit(&manifest, Some(&partial))?;
        info!(
            manifest_id = %manifest.id,
            status = ?manifest.status,
            files = manifest.files.len(),
            tombstones = manifest.tombstones.len(),
            bytes = manifest.archive.as_ref().map(|a| a.size).unwrap_or(0),
            "Capture complete"
        );
        Ok(manifest)
    }

    /// Records a failed run: manifest without archive.
    fn fail(&self, mut manifest: Manifest, reason: String) -> Result<Manifest> {
        error!(manifest_id = %manifest.id, reason = %reason, "Capture failed");
        manifest.status = Status::Failed;
        manifest.errors.push(reason);
        self.catalog.commit(&manifest, None)?;
        Ok(manifest)
    }
}

/// Asset tree plus configured config files. Absent config files are simply
/// not part of the capture.
fn enumerate(protected: &ProtectedConfig) -> (Vec<Candidate>, Vec<MissingFile>) {
    let mut candidates = Vec::new();
    let mut missing = Vec::new();

    let walk = walk_directory(
        &protected.assets_dir,
        &WalkOptions::excluding(&protected.exclude_patterns),
    );
    for file in walk.files {
        candidates.push(Candidate {
            archive_path: format!("{}{}", Component::Assets.prefix(), file.portable_path()),
            component: Component::Assets,
            source: file.path,
        });
    }
    for (path, reason) in walk.unreadable {
        missing.push(MissingFile {
            path: format!("{}{}", Component::Assets.prefix(), path),
            reason,
        });
    }

    for rel in &protected.config_files {
        let source = protected.config_root.join(rel);
        if source.is_file() {
            candidates.push(Candidate {
                archive_path: format!("{}{}", Component::Config.prefix(), portable(rel)),
                component: Component::Config,
                source,
            });
        }
    }

    (candidates, missing)
}

async fn digest_candidates(
    candidates: Vec<Candidate>,
    parallelism: usize,
    cancel: &CancellationToken,
) -> Result<(Vec<Digested>, Vec<MissingFile>)> {
    let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut handles = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => {
                permit.map_err(|e| EngineError::Io(std::io::Error::other(e)))?
            }
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
        };
        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let outcome = digest_file(&candidate.source);
            (candidate, outcome)
        }));
    }

    let mut digested = Vec::with_capacity(handles.len());
    let mut missing = Vec::new();
    for handle in handles {
        let (candidate, outcome) = handle.await.map_err(EngineError::join)?;
        match outcome {
            Ok((_, digest)) => digested.push(Digested { candidate, digest }),
            Err(e) => {
                warn!(path = %candidate.archive_path, error = %e, "Unreadable file recorded as missing");
                missing.push(MissingFile {
                    path: candidate.archive_path,
                    reason: e.to_string(),
                });
            }
        }
    }

    digested.sort_by(|a, b| a.candidate.archive_path.cmp(&b.candidate.archive_path));
    Ok((digested, missing))
}

/// Entries new or changed since `state`, and tombstones for deleted paths.
/// Unreadable files are neither selected nor tombstoned.
fn diff_against(
    state: &ChainState,
    digested: Vec<Digested>,
    missing: &[MissingFile],
) -> (Vec<Digested>, Vec<String>) {
    let present: HashSet<&str> = digested
        .iter()
        .map(|d| d.candidate.archive_path.as_str())
        .collect();

    // Unreadable paths were not observed, so they are not deletions.
    let tombstones: BTreeSet<String> = state
        .files
        .keys()
        .filter(|path| path.as_str() != STORE_ENTRY && !present.contains(path.as_str()))
        .filter(|path| !missing.iter().any(|m| m.covers(path)))
        .cloned()
        .collect();

    let selected = digested
        .into_iter()
        .filter(|d| {
            state
                .files
                .get(&d.candidate.archive_path)
                .map_or(true, |previous| previous.digest != d.digest)
        })
        .collect();

    (selected, tombstones.into_iter().collect())
}

fn write_archive(
    partial: &Path,
    level: i32,
    store_export: Option<&Path>,
    selected: &[Digested],
    cancel: &CancellationToken,
) -> Result<Written> {
    let outcome = write_entries(partial, level, store_export, selected, cancel);
    if outcome.is_err() {
        let _ = std::fs::remove_file(partial);
    }
    outcome
}

fn write_entries(
    partial: &Path,
    level: i32,
    store_export: Option<&Path>,
    selected: &[Digested],
    cancel: &CancellationToken,
) -> Result<Written> {
    let mut writer = ArchiveWriter::create(partial, level)?;

    if let Some(export) = store_export {
        writer.append_file(STORE_ENTRY, std::fs::File::open(export)?)?;
    }

    let mut files = Vec::with_capacity(selected.len());
    let mut missing = Vec::new();
    for item in selected {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let candidate = &item.candidate;
        let source = match std::fs::File::open(&candidate.source) {
            Ok(source) => source,
            Err(e) => {
                warn!(path = %candidate.archive_path, error = %e, "File vanished during capture");
                missing.push(MissingFile {
                    path: candidate.archive_path.clone(),
                    reason: e.to_string(),
                });
                continue;
            }
        };
        // The digest of the bytes actually archived is the one recorded.
        let (size, digest) = writer.append_file(&candidate.archive_path, source)?;
        files.push(FileEntry {
            path: candidate.archive_path.clone(),
            component: candidate.component,
            size,
            digest,
        });
    }

    let (size, digest) = writer.finish()?;
    Ok(Written {
        size,
        digest,
        files,
        missing,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity;
    use crate::testutil::Fixture;

    #[tokio::test]
    async fn test_full_capture_verifies() {
        let fx = Fixture::new();
        let catalog = fx.catalog();
        let archiver = fx.archiver(catalog.clone());

        for category in [Category::Manual, Category::Daily, Category::Weekly, Category::Monthly] {
            let m = archiver.create_full(category, &CancellationToken::new()).await.unwrap();
            assert_eq!(m.status, Status::Succeeded);
            assert_eq!(m.kind, BackupKind::Full);
            assert!(m.baseline.is_none());
            let archive = m.archive.as_ref().unwrap();
            assert!(verify_archive(&catalog.archive_path(&m), &archive.digest));

            let store = m.store.as_ref().unwrap();
            assert!(store.integrity_ok && store.included);
            let paths: Vec<_> = m.files.iter().map(|f| f.path.as_str()).collect();
            assert_eq!(
                paths,
                [
                    "assets/logo.png",
                    "assets/offers/1/photo.jpg",
                    "assets/offers/2/photo.jpg",
                    "config/config.toml",
                    "config/nginx/site.conf",
                ]
            );
        }
    }

    #[tokio::test]
    async fn test_dotenv_never_reaches_the_archive() {
        let fx = Fixture::new();
        let catalog = fx.catalog();
        let m = fx.archiver(catalog.clone()).create_full(Category::Daily, &CancellationToken::new()).await.unwrap();

        assert!(m.files.iter().all(|f| !f.path.contains(".env")));
        let tar = zstd::decode_all(std::fs::File::open(catalog.archive_path(&m)).unwrap()).unwrap();
        assert!(!tar.windows(b"SECRET_KEY".len()).any(|w| w == b"SECRET_KEY"));
    }

    #[tokio::test]
    async fn test_repeated_full_capture_is_identical() {
        let fx = Fixture::new();
        let archiver = fx.archiver(fx.catalog());
        let cancel = CancellationToken::new();

        let first = archiver.create_full(Category::Daily, &cancel).await.unwrap();
        let second = archiver.create_full(Category::Daily, &cancel).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(first.files, second.files);
        assert_eq!(first.files.len(), second.files.len());
    }

    #[tokio::test]
    async fn test_incremental_holds_exactly_the_delta() {
        let fx = Fixture::new();
        let catalog = fx.catalog();
        let archiver = fx.archiver(catalog.clone());
        let cancel = CancellationToken::new();

        let full = archiver.create_full(Category::Daily, &cancel).await.unwrap();
        fx.write_asset("offers/1/photo.jpg", b"re-shot photo");
        fx.remove_asset("offers/2/photo.jpg");

        let incr = archiver.create_incremental(Category::Daily, &cancel).await.unwrap();
        assert_eq!(incr.kind, BackupKind::Incremental);
        assert_eq!(incr.baseline.as_deref(), Some(full.id.as_str()));
        assert_eq!(incr.files.len(), 1);
        assert_eq!(incr.files[0].path, "assets/offers/1/photo.jpg");
        assert_eq!(incr.files[0].digest, integrity::digest(b"re-shot photo"));
        assert_eq!(incr.tombstones, ["assets/offers/2/photo.jpg"]);
        assert!(!incr.store.as_ref().unwrap().included);
        assert!(verify_archive(&catalog.archive_path(&incr), &incr.archive.as_ref().unwrap().digest));
    }

    fn state_of(paths: &[&str]) -> ChainState {
        let mut state = ChainState::default();
        for path in paths {
            state.files.insert(
                path.to_string(),
                chain::FileState {
                    size: 1,
                    digest: integrity::digest(path.as_bytes()),
                    source: "daily-base".to_string(),
                },
            );
        }
        state
    }

    fn digested(path: &str) -> Digested {
        Digested {
            candidate: Candidate {
                archive_path: path.to_string(),
                component: Component::Assets,
                source: PathBuf::from(path),
            },
            digest: integrity::digest(path.as_bytes()),
        }
    }

    fn unreadable(path: &str) -> MissingFile {
        MissingFile {
            path: path.to_string(),
            reason: "Permission denied".to_string(),
        }
    }

    #[test]
    fn test_unreadable_directory_hides_no_deletions() {
        let state = state_of(&["assets/d/a.jpg", "assets/d/b.jpg", "assets/dx.jpg", "assets/e.jpg"]);
        let (selected, tombstones) = diff_against(
            &state,
            vec![digested("assets/dx.jpg")],
            &[unreadable("assets/d")],
        );
        assert!(selected.is_empty());
        // Only the file that was observed gone is a deletion.
        assert_eq!(tombstones, ["assets/e.jpg"]);
    }

    #[test]
    fn test_unreadable_root_produces_no_tombstones() {
        let state = state_of(&["assets/logo.png", "assets/offers/1/photo.jpg", "config/config.toml"]);
        let (selected, tombstones) = diff_against(
            &state,
            vec![digested("config/config.toml")],
            &[unreadable("assets/")],
        );
        assert!(selected.is_empty());
        assert!(tombstones.is_empty());
    }

    #[tokio::test]
    async fn test_changed_store_is_included_in_incremental() {
        let fx = Fixture::new();
        let archiver = fx.archiver(fx.catalog());
        let cancel = CancellationToken::new();

        let full = archiver.create_full(Category::Daily, &cancel).await.unwrap();
        fx.insert_row("new offer");
        let incr = archiver.create_incremental(Category::Daily, &cancel).await.unwrap();

        let store = incr.store.as_ref().unwrap();
        assert!(store.included);
        assert_ne!(store.digest, full.store.as_ref().unwrap().digest);
        assert!(incr.files.is_empty());
        assert!(incr.tombstones.is_empty());
    }

    #[tokio::test]
    async fn test_incremental_without_baseline_is_full() {
        let fx = Fixture::new();
        let archiver = fx.archiver(fx.catalog());
        let m = archiver.create_incremental(Category::Daily, &CancellationToken::new()).await.unwrap();
        assert_eq!(m.kind, BackupKind::Full);
        assert!(m.baseline.is_none());
    }

    #[tokio::test]
    async fn test_broken_chain_falls_back_to_full() {
        let fx = Fixture::new();
        let catalog = fx.catalog();
        let archiver = fx.archiver(catalog.clone());
        let cancel = CancellationToken::new();

        let full = archiver.create_full(Category::Daily, &cancel).await.unwrap();
        std::fs::remove_file(catalog.archive_path(&full)).unwrap();

        let m = archiver.create_incremental(Category::Daily, &cancel).await.unwrap();
        assert_eq!(m.kind, BackupKind::Full);
        assert_eq!(m.status, Status::Succeeded);
    }

    #[tokio::test]
    async fn test_auto_mode_respects_chain_length() {
        let mut fx = Fixture::new();
        fx.config.archive.max_chain_length = 1;
        let archiver = fx.archiver(fx.catalog());
        let cancel = CancellationToken::new();

        let first = archiver.create(Category::Daily, BackupMode::Auto, &cancel).await.unwrap();
        let second = archiver.create(Category::Daily, BackupMode::Auto, &cancel).await.unwrap();
        let third = archiver.create(Category::Daily, BackupMode::Auto, &cancel).await.unwrap();
        assert_eq!(first.kind, BackupKind::Full);
        assert_eq!(second.kind, BackupKind::Incremental);
        assert_eq!(third.kind, BackupKind::Full);
    }

    #[tokio::test]
    async fn test_empty_roots_give_empty_manifest() {
        let fx = Fixture::new();
        std::fs::remove_dir_all(&fx.config.protected.assets_dir).unwrap();
        for rel in &fx.config.protected.config_files {
            std::fs::remove_file(fx.config.protected.config_root.join(rel)).unwrap();
        }
        let m = fx.archiver(fx.catalog()).create_full(Category::Manual, &CancellationToken::new()).await.unwrap();
        assert_eq!(m.status, Status::Succeeded);
        assert!(m.files.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_fails_run_without_archive() {
        let fx = Fixture::new();
        std::fs::write(&fx.config.protected.database, vec![0x5au8; 4096]).unwrap();
        let catalog = fx.catalog();
        let m = fx.archiver(catalog.clone()).create_full(Category::Daily, &CancellationToken::new()).await.unwrap();

        assert_eq!(m.status, Status::Failed);
        assert!(m.archive.is_none());
        assert!(!m.errors.is_empty());
        assert!(!catalog.partial_path(Category::Daily, &m.id).exists());
        assert!(!catalog.archive_path(&m).exists());
        assert_eq!(catalog.load(&m.id).unwrap().map(|s| s.status), Some(Status::Failed));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_unreadable_asset_degrades_to_partial() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let fx = Fixture::new();
        let cancel = CancellationToken::new();
        let catalog = fx.catalog();
        let archiver = fx.archiver(catalog.clone());
        let full = archiver.create_full(Category::Daily, &cancel).await.unwrap();
        assert_eq!(full.status, Status::Succeeded);

        // A name no archive path can carry.
        let odd = fx.config.protected.assets_dir.join(OsStr::from_bytes(b"caf\xe9.png"));
        std::fs::write(&odd, b"latin-1 name").unwrap();

        let incr = archiver.create_incremental(Category::Daily, &cancel).await.unwrap();
        assert_eq!(incr.status, Status::Partial);
        assert_eq!(incr.missing.len(), 1);
        assert!(incr.missing[0].path.starts_with("assets/caf"));
        assert!(incr.files.is_empty());
        assert!(incr.tombstones.is_empty());
        assert!(catalog.has_archive(&incr));
    }

    #[tokio::test]
    async fn test_cancelled_capture_leaves_nothing() {
        let fx = Fixture::new();
        let catalog = fx.catalog();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx.archiver(catalog.clone()).create_full(Category::Daily, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert!(catalog.list(None).unwrap().is_empty());
    }
}
