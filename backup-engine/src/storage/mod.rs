//! Storage destinations.
//!
//! Every destination kind implements [`Destination`]. The orchestrator and
//! the restore engine only talk to the [`StorageRegistry`], which wraps each
//! call in the retry policy.
//!
//! Remote layout mirrors the local catalog:
//! `<category>/<id>.tar.zst` and `<category>/<id>.manifest.json`. An archive
//! is always fully uploaded before its manifest, and listings only report
//! ids whose manifest exists.

pub mod http;
pub mod local;
pub mod retry;
pub mod sftp;

use crate::config::{DestinationKind, EngineConfig};
use crate::manifest::{Category, Manifest, ARCHIVE_SUFFIX, MANIFEST_SUFFIX};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// A manifest with the local paths of both halves of its pair.
#[derive(Debug, Clone)]
pub struct ArtifactPair {
    pub manifest: Manifest,
    pub archive_path: PathBuf,
    pub manifest_path: PathBuf,
}

/// A pair held by a destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub destination: String,
    pub manifest_id: String,
    pub category: Category,
}

impl RemoteRef {
    pub fn new(destination: &str, manifest: &Manifest) -> Self {
        Self {
            destination: destination.to_string(),
            manifest_id: manifest.id.clone(),
            category: manifest.category,
        }
    }

    /// Parses a manifest key (`<category>/<id>.manifest.json`).
    pub fn from_manifest_key(destination: &str, key: &str) -> Option<Self> {
        let name = key.rsplit('/').next()?;
        let id = name.strip_suffix(MANIFEST_SUFFIX)?;
        let category = Manifest::validate_id(id).ok()?;
        Some(Self {
            destination: destination.to_string(),
            manifest_id: id.to_string(),
            category,
        })
    }

    pub fn archive_key(&self) -> String {
        format!("{}/{}{}", self.category.as_str(), self.manifest_id, ARCHIVE_SUFFIX)
    }

    pub fn manifest_key(&self) -> String {
        format!("{}/{}{}", self.category.as_str(), self.manifest_id, MANIFEST_SUFFIX)
    }
}

/// Uniform contract over local folders, sync folders, SFTP and object
/// storage.
#[async_trait]
pub trait Destination: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> DestinationKind;

    /// Uploads archive then manifest. On failure nothing is listable.
    async fn put(&self, pair: &ArtifactPair) -> Result<RemoteRef>;

    /// Pairs whose manifest is present.
    async fn list(&self) -> Result<Vec<RemoteRef>>;

    /// Downloads both halves into `local_dir`.
    async fn get(&self, remote: &RemoteRef, local_dir: &Path) -> Result<ArtifactPair>;

    /// Reads only the manifest of a listed pair.
    async fn get_manifest(&self, remote: &RemoteRef) -> Result<Manifest>;

    /// Removes manifest then archive. Missing objects are not an error.
    async fn delete(&self, remote: &RemoteRef) -> Result<()>;
}

/// Outcome of syncing one pair to one destination.
#[derive(Debug, Clone, Serialize)]
pub struct DestinationOutcome {
    pub destination: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Standing conditions under which backups are not durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityRisk {
    /// Local storage is ephemeral and no remote destination is configured.
    NoRemoteDestination,
    /// Local storage is ephemeral and every remote put failed.
    NoRemoteCopy,
}

pub struct StorageRegistry {
    destinations: Vec<Arc<dyn Destination>>,
    retry: RetryPolicy,
    local_is_ephemeral: bool,
    max_parallel: usize,
}

impl StorageRegistry {
    /// Builds every configured destination. Credentials are resolved here,
    /// once.
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut destinations: Vec<Arc<dyn Destination>> = Vec::new();
        for dest in &config.storage.destinations {
            let built: Arc<dyn Destination> = match dest.kind {
                DestinationKind::Local | DestinationKind::SyncFolder => {
                    Arc::new(local::FolderDestination::from_config(dest)?)
                }
                DestinationKind::Sftp => {
                    Arc::new(sftp::SftpDestination::from_config(dest, config.sync.timeout_secs)?)
                }
                DestinationKind::HttpObject => {
                    Arc::new(http::HttpObjectDestination::from_config(dest, config.sync.timeout_secs)?)
                }
            };
            destinations.push(built);
        }

        info!(
            destinations = destinations.len(),
            local_is_ephemeral = config.storage.local_is_ephemeral,
            "Storage registry ready"
        );
        Ok(Self::new(
            destinations,
            RetryPolicy::from_config(&config.sync),
            config.storage.local_is_ephemeral,
            config.sync.max_parallel,
        ))
    }

    pub fn new(
        destinations: Vec<Arc<dyn Destination>>,
        retry: RetryPolicy,
        local_is_ephemeral: bool,
        max_parallel: usize,
    ) -> Self {
        Self {
            destinations,
            retry,
            local_is_ephemeral,
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.destinations.iter().map(|d| d.id().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn local_is_ephemeral(&self) -> bool {
        self.local_is_ephemeral
    }

    /// Risk that holds regardless of any particular run.
    pub fn standing_risk(&self) -> Option<DurabilityRisk> {
        (self.local_is_ephemeral && self.destinations.is_empty())
            .then_some(DurabilityRisk::NoRemoteDestination)
    }

    fn get(&self, id: &str) -> Result<&Arc<dyn Destination>> {
        self.destinations
            .iter()
            .find(|d| d.id() == id)
            .ok_or_else(|| EngineError::NotFound(format!("destination '{}'", id)))
    }

    pub async fn put(&self, id: &str, pair: &ArtifactPair) -> Result<RemoteRef> {
        let dest = self.get(id)?;
        self.retry.run(id, "put", || dest.put(pair)).await
    }

    pub async fn list(&self, id: &str) -> Result<Vec<RemoteRef>> {
        let dest = self.get(id)?;
        self.retry.run(id, "list", || dest.list()).await
    }

    pub async fn get_pair(&self, remote: &RemoteRef, local_dir: &Path) -> Result<ArtifactPair> {
        let dest = self.get(&remote.destination)?;
        self.retry
            .run(&remote.destination, "get", || dest.get(remote, local_dir))
            .await
    }

    pub async fn get_manifest(&self, remote: &RemoteRef) -> Result<Manifest> {
        let dest = self.get(&remote.destination)?;
        self.retry
            .run(&remote.destination, "get_manifest", || dest.get_manifest(remote))
            .await
    }

    pub async fn delete(&self, remote: &RemoteRef) -> Result<()> {
        let dest = self.get(&remote.destination)?;
        self.retry.run(&remote.destination, "delete", || dest.delete(remote)).await
    }

    /// Puts the pair on every destination concurrently. One destination
    /// failing does not affect the others.
    pub async fn put_all(&self, pair: &ArtifactPair) -> Vec<DestinationOutcome> {
        let futures: Vec<_> = self
            .destinations
            .iter()
            .map(|dest| async move {
                let id = dest.id().to_string();
                match self.retry.run(&id, "put", || dest.put(pair)).await {
                    Ok(remote) => {
                        info!(destination = %id, manifest_id = %pair.manifest.id, "Synced to destination");
                        DestinationOutcome {
                            destination: id,
                            ok: true,
                            remote: Some(remote),
                            error: None,
                        }
                    }
                    Err(e) => {
                        warn!(destination = %id, manifest_id = %pair.manifest.id, error = %e, "Sync failed");
                        DestinationOutcome {
                            destination: id,
                            ok: false,
                            remote: None,
                            error: Some(e.to_string()),
                        }
                    }
                }
            })
            .collect();
        let mut outcomes: Vec<DestinationOutcome> = stream::iter(futures)
            .buffer_unordered(self.max_parallel)
            .collect()
            .await;

        outcomes.sort_by(|a, b| a.destination.cmp(&b.destination));
        outcomes
    }

    /// Fetches a pair from the first destination holding it.
    pub async fn fetch(&self, manifest_id: &str, local_dir: &Path) -> Result<Option<ArtifactPair>> {
        let category = Manifest::validate_id(manifest_id)?;
        for dest in &self.destinations {
            let remote = RemoteRef {
                destination: dest.id().to_string(),
                manifest_id: manifest_id.to_string(),
                category,
            };
            let listed = match self.list(dest.id()).await {
                Ok(refs) => refs.contains(&remote),
                Err(e) => {
                    warn!(destination = %dest.id(), error = %e, "Listing failed while fetching");
                    continue;
                }
            };
            if !listed {
                continue;
            }
            match self.get_pair(&remote, local_dir).await {
                Ok(pair) => return Ok(Some(pair)),
                Err(e) => warn!(destination = %dest.id(), manifest_id, error = %e, "Fetch failed"),
            }
        }
        Ok(None)
    }

    /// Deletes a pair from every destination. Returns failures as text.
    pub async fn delete_everywhere(&self, manifest: &Manifest) -> Vec<String> {
        let mut failures = Vec::new();
        for dest in &self.destinations {
            let remote = RemoteRef::new(dest.id(), manifest);
            if let Err(e) = self.delete(&remote).await {
                warn!(destination = %dest.id(), manifest_id = %manifest.id, error = %e, "Remote delete failed");
                failures.push(format!("{}: {}", dest.id(), e));
            }
        }
        failures
    }
}
