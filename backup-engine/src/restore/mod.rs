//! Restore engine.
//!
//! A restore moves through these phases:
//!
//! 1. Selecting: the target manifest and the components to restore
//! 2. Validating: the baseline chain is loaded (missing links are fetched
//!    from destinations), every archive is verified and the chain is staged
//!    and checked in a private directory
//! 3. SafetySnapshotting: a `pre_restore` full backup of the live system
//! 4. Extracting: the live system is stopped and components are replaced
//! 5. Verifying: the live files are compared with the target state, then
//!    the system is started and health-checked
//!
//! A failure in phases 4 or 5 rolls the live system back to the safety
//! snapshot. Failures before that leave the live system untouched.

pub mod apply;

use crate::archiver::Archiver;
use crate::catalog::Catalog;
use crate::config::ProtectedConfig;
use crate::integrity::verify_archive;
use crate::live::LiveSystem;
use crate::manifest::chain::{self, ChainState};
use crate::manifest::{BackupKind, Category, Component, Manifest, Status};
use crate::storage::StorageRegistry;
use crate::utils::errors::{EngineError, ErrorReport, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    Selecting,
    Validating,
    SafetySnapshotting,
    Extracting,
    Verifying,
    Committed,
    RolledBack,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreResult {
    pub manifest_id: String,
    pub components: Vec<Component>,
    /// Final phase: `Committed`, `RolledBack` or `Aborted`.
    pub phase: RestorePhase,
    /// Phases entered, in order.
    pub phases: Vec<RestorePhase>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_manifest_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    /// Set when rolling back also failed; the live system needs an operator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<ErrorReport>,
}

impl RestoreResult {
    pub fn succeeded(&self) -> bool {
        self.phase == RestorePhase::Committed
    }

    fn enter(&mut self, phase: RestorePhase) {
        info!(manifest_id = %self.manifest_id, phase = ?phase, "Restore phase");
        self.phase = phase;
        self.phases.push(phase);
    }

    fn abort(mut self, err: &EngineError) -> Self {
        warn!(manifest_id = %self.manifest_id, error = %err, "Restore aborted, live system untouched");
        self.error = Some(err.into());
        self.enter(RestorePhase::Aborted);
        self
    }
}

/// Borrowed view of the engine parts a restore needs.
pub struct Restorer<'a> {
    pub protected: &'a ProtectedConfig,
    pub catalog: &'a Catalog,
    pub archiver: &'a Archiver,
    pub registry: &'a StorageRegistry,
    pub live: &'a dyn LiveSystem,
}

/// Chain staged and checked, ready to be applied.
struct Staged {
    dir: PathBuf,
    tree: PathBuf,
    state: ChainState,
}

impl Restorer<'_> {
    /// Restores `components` (all when empty) to the state recorded by
    /// `manifest_id`. Selection errors are returned as `Err`; everything
    /// later is reported in the result.
    pub async fn restore(&self, manifest_id: &str, components: &[Component]) -> Result<RestoreResult> {
        let mut components: Vec<Component> = if components.is_empty() {
            Component::ALL.to_vec()
        } else {
            components.to_vec()
        };
        components.sort();
        components.dedup();

        let mut result = RestoreResult {
            manifest_id: manifest_id.to_string(),
            components: components.clone(),
            phase: RestorePhase::Selecting,
            phases: vec![RestorePhase::Selecting],
            safety_manifest_id: None,
            error: None,
            rollback_error: None,
        };

        Manifest::validate_id(manifest_id)?;
        let fetch_dir = self.catalog.staging_dir(&format!("fetch-{}", manifest_id))?;
        let target = match self.prefetch_chain(manifest_id, &fetch_dir).await {
            Ok(target) => target,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&fetch_dir);
                return match e {
                    EngineError::Validation(_) => Err(e),
                    other => Ok(result.abort(&other)),
                };
            }
        };
        let _ = std::fs::remove_dir_all(&fetch_dir);

        result.enter(RestorePhase::Validating);
        let staged = match self.validate(&target).await {
            Ok(staged) => staged,
            Err(e) => return Ok(result.abort(&e)),
        };

        result.enter(RestorePhase::SafetySnapshotting);
        let safety = match self
            .archiver
            .create_full(Category::PreRestore, &CancellationToken::new())
            .await
        {
            Ok(m) if m.is_restorable() => m,
            Ok(m) => {
                let err = EngineError::RestoreFailed(format!(
                    "safety snapshot {} failed: {}",
                    m.id,
                    m.errors.join("; ")
                ));
                cleanup(&staged.dir);
                return Ok(result.abort(&err));
            }
            Err(e) => {
                cleanup(&staged.dir);
                return Ok(result.abort(&e));
            }
        };
        result.safety_manifest_id = Some(safety.id.clone());

        let outcome = self.replace_live(&staged, &components, &mut result).await;
        cleanup(&staged.dir);

        match outcome {
            Ok(()) => {
                result.enter(RestorePhase::Committed);
                info!(manifest_id, components = ?components, safety = %safety.id, "Restore committed");
            }
            Err(e) => {
                let err = match e {
                    EngineError::RestoreFailed(_) => e,
                    other => EngineError::RestoreFailed(other.to_string()),
                };
                error!(manifest_id, error = %err, "Restore failed, rolling back");
                result.error = Some((&err).into());
                if let Err(rollback) = self.rollback(&safety, &components).await {
                    error!(manifest_id, safety = %safety.id, error = %rollback, "Rollback failed");
                    result.rollback_error = Some((&rollback).into());
                }
                result.enter(RestorePhase::RolledBack);
            }
        }
        Ok(result)
    }

    /// Ensures every link of the chain is in the local catalog, fetching
    /// from destinations where needed. Returns the target manifest.
    async fn prefetch_chain(&self, manifest_id: &str, fetch_dir: &Path) -> Result<Manifest> {
        let mut next = Some(manifest_id.to_string());
        let mut target = None;
        let mut links = 0usize;

        while let Some(id) = next.take() {
            links += 1;
            if links > 1024 {
                break;
            }
            let manifest = match self.ensure_local(&id, fetch_dir).await {
                Ok(Some(m)) => m,
                Ok(None) => break,
                Err(e) if id == manifest_id => return Err(e),
                Err(e) => {
                    return Err(EngineError::ChainBroken {
                        manifest_id: manifest_id.to_string(),
                        missing_link: id,
                        reason: e.to_string(),
                    })
                }
            };
            if manifest.kind == BackupKind::Incremental {
                next = manifest.baseline.clone();
            }
            if target.is_none() {
                target = Some(manifest);
            }
        }

        let target = target.ok_or_else(|| EngineError::Validation(format!("unknown manifest '{}'", manifest_id)))?;
        if target.status == Status::Failed || target.archive.is_none() {
            return Err(EngineError::Validation(format!(
                "manifest {} is from a failed run and cannot be restored",
                manifest_id
            )));
        }
        Ok(target)
    }

    async fn ensure_local(&self, id: &str, fetch_dir: &Path) -> Result<Option<Manifest>> {
        if let Some(m) = self.catalog.load(id)? {
            return Ok(Some(m));
        }
        match self.registry.fetch(id, fetch_dir).await? {
            Some(pair) => Ok(Some(self.catalog.import(&pair)?)),
            None => Ok(None),
        }
    }

    async fn validate(&self, target: &Manifest) -> Result<Staged> {
        let chain = chain::resolve_chain(&target.id, |id| self.catalog.load(id))?;
        for link in &chain {
            let intact = match &link.archive {
                Some(info) if self.catalog.has_archive(link) => {
                    let path = self.catalog.archive_path(link);
                    let expected = info.digest.clone();
                    tokio::task::spawn_blocking(move || verify_archive(&path, &expected))
                        .await
                        .map_err(EngineError::join)?
                }
                _ => false,
            };
            if intact {
                continue;
            }
            if link.id == target.id {
                return Err(EngineError::Integrity(format!(
                    "archive of {} is missing or does not match its manifest",
                    link.id
                )));
            }
            return Err(EngineError::ChainBroken {
                manifest_id: target.id.clone(),
                missing_link: link.id.clone(),
                reason: "archive is missing or does not match its manifest".into(),
            });
        }

        let dir = self.catalog.staging_dir(&format!("restore-{}", target.id))?;
        let tree = dir.join("tree");
        let catalog = self.catalog.clone();
        let task_tree = tree.clone();
        let staged = tokio::task::spawn_blocking(move || apply::stage(&chain, &catalog, &task_tree))
            .await
            .map_err(EngineError::join)?;

        match staged {
            Ok(state) => Ok(Staged { dir, tree, state }),
            Err(e) => {
                cleanup(&dir);
                Err(e)
            }
        }
    }

    async fn replace_live(&self, staged: &Staged, components: &[Component], result: &mut RestoreResult) -> Result<()> {
        result.enter(RestorePhase::Extracting);
        self.live.stop().await?;
        self.apply_and_verify(&staged.tree, &staged.state, components).await?;

        result.enter(RestorePhase::Verifying);
        self.live.start().await?;
        self.live.health_check().await
    }

    async fn apply_and_verify(&self, tree: &Path, state: &ChainState, components: &[Component]) -> Result<()> {
        let protected = self.protected.clone();
        let tree = tree.to_path_buf();
        let state = state.clone();
        let components = components.to_vec();
        tokio::task::spawn_blocking(move || {
            apply::apply(&protected, &tree, &state, &components)?;
            apply::verify_live(&protected, &state, &components)
        })
        .await
        .map_err(EngineError::join)?
    }

    /// Puts the selected components back as captured by the safety snapshot.
    async fn rollback(&self, safety: &Manifest, components: &[Component]) -> Result<()> {
        let staged = self.validate(safety).await?;
        if let Err(e) = self.live.stop().await {
            warn!(error = %e, "Stop before rollback failed, continuing");
        }
        let applied = self.apply_and_verify(&staged.tree, &staged.state, components).await;
        cleanup(&staged.dir);
        applied?;

        self.live.start().await?;
        self.live.health_check().await?;
        info!(safety = %safety.id, "Live system rolled back to safety snapshot");
        Ok(())
    }
}

fn cleanup(dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(dir) {
        warn!(path = %dir.display(), error = %e, "Failed to clean restore staging");
    }
}
