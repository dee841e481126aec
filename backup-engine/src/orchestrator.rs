//! Backup orchestrator: the engine's trigger interface.
//!
//! A backup run takes the operation lock, captures, re-verifies the archive,
//! syncs it to every destination and applies retention. Restores take the
//! same lock, so backups and restores never overlap.

use crate::archiver::container;
use crate::archiver::{Archiver, BackupMode};
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::integrity::verify_archive;
use crate::live::{self, LiveSystem};
use crate::lock::{OperationKind, OperationLock};
use crate::manifest::chain;
use crate::manifest::{BackupKind, Category, Component, Manifest, Status, STORE_ENTRY};
use crate::restore::{RestoreResult, Restorer};
use crate::retention::{self, RetentionPolicy, RetentionReport};
use crate::storage::{DestinationOutcome, DurabilityRisk, StorageRegistry};
use crate::utils::errors::{EngineError, ErrorReport, Result};
use chrono::{DateTime, Duration, Utc};
use nix::sys::statvfs::statvfs;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    PartiallySucceeded,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub category: Category,
    pub manifest_id: Option<String>,
    pub kind: Option<BackupKind>,
    pub status: Option<Status>,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub destinations: Vec<DestinationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durability_risk: Option<DurabilityRisk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl RunResult {
    fn started(category: Category, started_at: DateTime<Utc>) -> Self {
        Self {
            category,
            manifest_id: None,
            kind: None,
            status: None,
            outcome: RunOutcome::Failed,
            started_at,
            duration_ms: 0,
            destinations: Vec::new(),
            retention: None,
            durability_risk: None,
            error: None,
        }
    }

    fn finish(mut self) -> Self {
        self.duration_ms = (Utc::now() - self.started_at).num_milliseconds().max(0) as u64;
        match self.outcome {
            RunOutcome::Succeeded => info!(
                category = %self.category,
                manifest_id = ?self.manifest_id,
                duration_ms = self.duration_ms,
                "Backup run succeeded"
            ),
            RunOutcome::PartiallySucceeded => warn!(
                category = %self.category,
                manifest_id = ?self.manifest_id,
                risk = ?self.durability_risk,
                error = ?self.error.as_ref().map(|e| &e.message),
                "Backup run partially succeeded"
            ),
            RunOutcome::Failed => error!(
                category = %self.category,
                manifest_id = ?self.manifest_id,
                error = ?self.error.as_ref().map(|e| &e.message),
                "Backup run failed"
            ),
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthVerdict {
    Healthy,
    Warning,
    Critical,
    NoBackups,
}

impl HealthVerdict {
    fn severity(self) -> u8 {
        match self {
            HealthVerdict::Healthy => 0,
            HealthVerdict::Warning => 1,
            HealthVerdict::NoBackups => 2,
            HealthVerdict::Critical => 3,
        }
    }

    pub fn worst(self, other: HealthVerdict) -> HealthVerdict {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    /// Healthy under 26 hours since the last good backup, warning under 48.
    pub fn from_age(age: Option<Duration>) -> Self {
        match age {
            None => HealthVerdict::NoBackups,
            Some(age) if age < Duration::hours(26) => HealthVerdict::Healthy,
            Some(age) if age < Duration::hours(48) => HealthVerdict::Warning,
            Some(_) => HealthVerdict::Critical,
        }
    }
}

const GIB: u64 = 1024 * 1024 * 1024;

/// Free space on the volume holding the local catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskSpace {
    pub free_bytes: u64,
    pub total_bytes: u64,
    pub verdict: HealthVerdict,
}

impl DiskSpace {
    pub fn measure(dir: &Path, warning_gb: u64) -> Result<Self> {
        let stat = statvfs(dir).map_err(std::io::Error::from)?;
        let fragment = stat.fragment_size() as u64;
        let free_bytes = stat.blocks_available() as u64 * fragment;
        Ok(Self {
            free_bytes,
            total_bytes: stat.blocks() as u64 * fragment,
            verdict: Self::classify(free_bytes, warning_gb),
        })
    }

    /// Critical under 1 GiB (or under the warning level when that is
    /// lower), warning under `warning_gb`.
    pub fn classify(free_bytes: u64, warning_gb: u64) -> HealthVerdict {
        let warning = warning_gb.saturating_mul(GIB);
        if free_bytes < GIB.min(warning) {
            HealthVerdict::Critical
        } else if free_bytes < warning {
            HealthVerdict::Warning
        } else {
            HealthVerdict::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub health: HealthVerdict,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_manifest_id: Option<String>,
    pub manifests: usize,
    pub manifests_by_category: BTreeMap<Category, usize>,
    pub total_bytes: u64,
    pub attention: Vec<String>,
    pub destinations: Vec<String>,
    pub local_is_ephemeral: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub durability_risk: Option<DurabilityRisk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running: Option<OperationKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskSpace>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub manifest_id: String,
    pub ok: bool,
    pub archive_ok: bool,
    pub entries_ok: bool,
    /// Chain ids, oldest first.
    pub chain: Vec<String>,
    pub chain_ok: bool,
    pub problems: Vec<String>,
}

pub struct Engine {
    config: EngineConfig,
    catalog: Arc<Catalog>,
    archiver: Archiver,
    registry: StorageRegistry,
    retention: RetentionPolicy,
    live: Arc<dyn LiveSystem>,
    lock: OperationLock,
}

impl Engine {
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let registry = StorageRegistry::from_config(&config)?;
        let live = live::from_config(&config.live);
        Self::with_parts(config, registry, live)
    }

    pub fn with_parts(config: EngineConfig, registry: StorageRegistry, live: Arc<dyn LiveSystem>) -> Result<Self> {
        let catalog = Arc::new(Catalog::open(&config.storage.local_dir)?);
        let archiver = Archiver::new(&config, Arc::clone(&catalog));
        let retention = RetentionPolicy::from_config(&config.retention);
        let lock = OperationLock::new(catalog.lock_path());
        if let Some(risk) = registry.standing_risk() {
            warn!(risk = ?risk, "Local storage is ephemeral and no remote destination is configured");
        }

        Ok(Self {
            config,
            catalog,
            archiver,
            registry,
            retention,
            live,
            lock,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn run_backup(&self, category: Category) -> Result<RunResult> {
        self.run_backup_with(category, BackupMode::Auto, &CancellationToken::new())
            .await
    }

    /// Fails fast with `Validation` for reserved categories and with
    /// `AlreadyRunning` on lock contention. Every later failure is reported
    /// in the result.
    pub async fn run_backup_with(
        &self,
        category: Category,
        mode: BackupMode,
        cancel: &CancellationToken,
    ) -> Result<RunResult> {
        if category.is_reserved() {
            return Err(EngineError::Validation(format!(
                "category '{}' is reserved for safety snapshots",
                category
            )));
        }
        let _guard = self.lock.try_acquire(OperationKind::Backup)?;
        let mut result = RunResult::started(category, Utc::now());
        info!(category = %category, mode = ?mode, "Backup run started");

        if let Err(e) = self.catalog.sweep() {
            result.error = Some((&e).into());
            return Ok(result.finish());
        }

        if let Err(e) = self.live.quiesce().await {
            warn!(error = %e, "Quiesce failed, capturing anyway");
        }
        let captured = self.archiver.create(category, mode, cancel).await;
        if let Err(e) = self.live.resume().await {
            error!(error = %e, "Resume after capture failed");
        }

        let manifest = match captured {
            Ok(m) => m,
            Err(e) => {
                result.error = Some((&e).into());
                return Ok(result.finish());
            }
        };
        result.manifest_id = Some(manifest.id.clone());
        result.kind = Some(manifest.kind);
        result.status = Some(manifest.status);

        if manifest.status == Status::Failed {
            let err = EngineError::Integrity(manifest.errors.join("; "));
            result.error = Some((&err).into());
            return Ok(result.finish());
        }

        if let Err(e) = self.reverify(&manifest).await {
            result.error = Some((&e).into());
            return Ok(result.finish());
        }

        result.destinations = self.registry.put_all(&self.catalog.pair(&manifest)).await;
        let synced = result.destinations.iter().filter(|d| d.ok).count();
        let first_failure = result.destinations.iter().find(|d| !d.ok).map(|d| ErrorReport {
            kind: "sync_failed".to_string(),
            message: d.error.clone().unwrap_or_default(),
        });

        result.durability_risk = if !self.registry.local_is_ephemeral() {
            None
        } else if self.registry.is_empty() {
            Some(DurabilityRisk::NoRemoteDestination)
        } else if synced == 0 {
            Some(DurabilityRisk::NoRemoteCopy)
        } else {
            None
        };

        match retention::enforce(&self.retention, &self.catalog, &self.registry, Utc::now()).await {
            Ok(report) => result.retention = Some(report),
            Err(e) => warn!(error = %e, "Retention failed"),
        }

        result.outcome = match result.durability_risk {
            Some(DurabilityRisk::NoRemoteCopy) => {
                result.error = Some(ErrorReport {
                    kind: "sync_failed".to_string(),
                    message: format!(
                        "no destination accepted {}; local storage is ephemeral: {}",
                        manifest.id,
                        first_failure.as_ref().map(|f| f.message.as_str()).unwrap_or("")
                    ),
                });
                RunOutcome::Failed
            }
            Some(DurabilityRisk::NoRemoteDestination) => RunOutcome::PartiallySucceeded,
            None if first_failure.is_some() => {
                result.error = first_failure;
                RunOutcome::PartiallySucceeded
            }
            None if manifest.status == Status::Partial => {
                result.error = Some(ErrorReport {
                    kind: "partial_capture".to_string(),
                    message: manifest.errors.join("; "),
                });
                RunOutcome::PartiallySucceeded
            }
            None => RunOutcome::Succeeded,
        };

        Ok(result.finish())
    }

    async fn reverify(&self, manifest: &Manifest) -> Result<()> {
        let path = self.catalog.archive_path(manifest);
        let expected = manifest
            .archive
            .as_ref()
            .map(|a| a.digest.clone())
            .unwrap_or_default();
        let ok = tokio::task::spawn_blocking(move || verify_archive(&path, &expected))
            .await
            .map_err(EngineError::join)?;
        if ok {
            Ok(())
        } else {
            Err(EngineError::Integrity(format!(
                "archive of {} changed after it was committed",
                manifest.id
            )))
        }
    }

    /// Restores `components` (all when empty) from `manifest_id`.
    pub async fn run_restore(&self, manifest_id: &str, components: &[Component]) -> Result<RestoreResult> {
        let _guard = self.lock.try_acquire(OperationKind::Restore)?;
        self.catalog.sweep()?;
        let restorer = Restorer {
            protected: &self.config.protected,
            catalog: &self.catalog,
            archiver: &self.archiver,
            registry: &self.registry,
            live: self.live.as_ref(),
        };
        restorer.restore(manifest_id, components).await
    }

    /// Local manifests, newest first.
    pub fn list_manifests(&self, category: Option<Category>) -> Result<Vec<Manifest>> {
        self.catalog.list(category)
    }

    pub fn get_manifest(&self, manifest_id: &str) -> Result<Manifest> {
        self.catalog
            .load(manifest_id)?
            .ok_or_else(|| EngineError::NotFound(format!("manifest {}", manifest_id)))
    }

    /// Applies retention outside of a backup run.
    pub async fn prune(&self) -> Result<RetentionReport> {
        let _guard = self.lock.try_acquire(OperationKind::Backup)?;
        self.catalog.sweep()?;
        retention::enforce(&self.retention, &self.catalog, &self.registry, Utc::now()).await
    }

    /// Re-checks a stored backup: archive digest, entry list against the
    /// manifest, and every link of its chain.
    pub async fn verify(&self, manifest_id: &str) -> Result<VerifyReport> {
        let manifest = self.get_manifest(manifest_id)?;
        let catalog = Arc::clone(&self.catalog);
        tokio::task::spawn_blocking(move || verify_stored(&catalog, &manifest))
            .await
            .map_err(EngineError::join)
    }

    pub fn status(&self) -> Result<EngineStatus> {
        let manifests = self.catalog.list(None)?;
        let now = Utc::now();

        let last = manifests
            .iter()
            .find(|m| !m.category.is_reserved() && m.is_restorable());
        let mut by_category = BTreeMap::new();
        for m in &manifests {
            *by_category.entry(m.category).or_insert(0) += 1;
        }

        let disk = match DiskSpace::measure(&self.config.storage.local_dir, self.config.storage.disk_warning_gb) {
            Ok(disk) => {
                if disk.verdict != HealthVerdict::Healthy {
                    warn!(free_bytes = disk.free_bytes, "Backup volume is low on space");
                }
                Some(disk)
            }
            Err(e) => {
                warn!(error = %e, "Could not read free space of the backup volume");
                None
            }
        };
        let mut health = HealthVerdict::from_age(last.map(|m| now - m.created_at));
        if let Some(disk) = &disk {
            health = health.worst(disk.verdict);
        }

        Ok(EngineStatus {
            health,
            last_success_at: last.map(|m| m.created_at),
            last_manifest_id: last.map(|m| m.id.clone()),
            manifests: manifests.len(),
            manifests_by_category: by_category,
            total_bytes: manifests
                .iter()
                .filter_map(|m| m.archive.as_ref())
                .map(|a| a.size)
                .sum(),
            attention: manifests
                .iter()
                .filter(|m| m.status != Status::Succeeded)
                .map(|m| m.id.clone())
                .collect(),
            destinations: self.registry.ids(),
            local_is_ephemeral: self.registry.local_is_ephemeral(),
            durability_risk: self.registry.standing_risk(),
            running: self.lock.current(),
            disk,
        })
    }
}

fn verify_stored(catalog: &Catalog, manifest: &Manifest) -> VerifyReport {
    let mut report = VerifyReport {
        manifest_id: manifest.id.clone(),
        ok: false,
        archive_ok: false,
        entries_ok: false,
        chain: Vec::new(),
        chain_ok: false,
        problems: Vec::new(),
    };

    match &manifest.archive {
        Some(info) if catalog.has_archive(manifest) => {
            report.archive_ok = verify_archive(&catalog.archive_path(manifest), &info.digest);
            if !report.archive_ok {
                report.problems.push("archive digest does not match".to_string());
            }
        }
        Some(_) => report.problems.push("archive is missing".to_string()),
        None => report.problems.push("run failed; there is no archive".to_string()),
    }

    if report.archive_ok {
        let mut expected: BTreeMap<String, u64> =
            manifest.files.iter().map(|f| (f.path.clone(), f.size)).collect();
        if let Some(store) = manifest.store.as_ref().filter(|s| s.included) {
            expected.insert(STORE_ENTRY.to_string(), store.size);
        }
        match container::list_entries(&catalog.archive_path(manifest)) {
            Ok(entries) => {
                let actual: BTreeMap<String, u64> = entries.into_iter().collect();
                report.entries_ok = actual == expected;
                if !report.entries_ok {
                    report.problems.push("archive entries differ from the manifest".to_string());
                }
            }
            Err(e) => report.problems.push(format!("archive unreadable: {}", e)),
        }
    }

    match chain::resolve_chain(&manifest.id, |id| catalog.load(id)) {
        Ok(links) => {
            report.chain = links.iter().map(|m| m.id.clone()).collect();
            let broken: Vec<&str> = links
                .iter()
                .filter(|link| {
                    link.archive
                        .as_ref()
                        .map_or(true, |a| !verify_archive(&catalog.archive_path(link), &a.digest))
                })
                .map(|link| link.id.as_str())
                .collect();
            report.chain_ok = broken.is_empty();
            for id in broken {
                report.problems.push(format!("chain link {} is missing or corrupt", id));
            }
        }
        Err(e) => report.problems.push(e.to_string()),
    }

    report.ok = report.archive_ok && report.entries_ok && report.chain_ok;
    report
}
