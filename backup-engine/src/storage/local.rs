//! Folder destinations: a directory on persistent storage, or a folder
//! mirrored by a sync client (Dropbox, OneDrive, Drive).
//!
//! Files are copied under a temporary name and renamed into place. Sync
//! folders keep their temporaries in a `.partial` subdirectory so the sync
//! client never sees a half-written file at its final name.

use super::{ArtifactPair, Destination, RemoteRef};
use crate::config::{DestinationConfig, DestinationKind};
use crate::manifest::{Category, Manifest};
use crate::utils::errors::Result;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

pub struct FolderDestination {
    id: String,
    root: PathBuf,
    kind: DestinationKind,
}

impl FolderDestination {
    pub fn new(id: &str, root: PathBuf, kind: DestinationKind) -> Self {
        Self {
            id: id.to_string(),
            root,
            kind,
        }
    }

    pub fn from_config(dest: &DestinationConfig) -> Result<Self> {
        let path = dest.require(&dest.path, "path")?;
        Ok(Self::new(&dest.id, path.clone(), dest.kind))
    }

    fn scratch_dir(&self) -> PathBuf {
        match self.kind {
            DestinationKind::SyncFolder => self.root.join(".partial"),
            _ => self.root.clone(),
        }
    }

    async fn place(&self, source: &Path, key: &str) -> Result<()> {
        let final_path = self.root.join(key);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let scratch = self.scratch_dir();
        fs::create_dir_all(&scratch).await?;

        let file_name = key.rsplit('/').next().unwrap_or(key);
        let tmp = scratch.join(format!(".{}.part", file_name));

        let copied = async {
            fs::copy(source, &tmp).await?;
            fs::File::open(&tmp).await?.sync_all().await?;
            fs::rename(&tmp, &final_path).await
        }
        .await;

        if let Err(e) = copied {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

#[async_trait]
impl Destination for FolderDestination {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> DestinationKind {
        self.kind
    }

    async fn put(&self, pair: &ArtifactPair) -> Result<RemoteRef> {
        let remote = RemoteRef::new(&self.id, &pair.manifest);
        self.place(&pair.archive_path, &remote.archive_key()).await?;
        if let Err(e) = self.place(&pair.manifest_path, &remote.manifest_key()).await {
            let _ = fs::remove_file(self.root.join(remote.archive_key())).await;
            return Err(e);
        }
        debug!(destination = %self.id, manifest_id = %remote.manifest_id, "Pair placed");
        Ok(remote)
    }

    async fn list(&self) -> Result<Vec<RemoteRef>> {
        let mut refs = Vec::new();
        for category in Category::ALL {
            let dir = self.root.join(category.as_str());
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let key = format!("{}/{}", category.as_str(), name);
                if let Some(remote) = RemoteRef::from_manifest_key(&self.id, &key) {
                    refs.push(remote);
                }
            }
        }
        refs.sort_by(|a, b| a.manifest_id.cmp(&b.manifest_id));
        Ok(refs)
    }

    async fn get(&self, remote: &RemoteRef, local_dir: &Path) -> Result<ArtifactPair> {
        fs::create_dir_all(local_dir).await?;
        let archive_path = local_dir.join(Manifest::archive_file_name(&remote.manifest_id));
        let manifest_path = local_dir.join(Manifest::manifest_file_name(&remote.manifest_id));

        fs::copy(self.root.join(remote.manifest_key()), &manifest_path).await?;
        fs::copy(self.root.join(remote.archive_key()), &archive_path).await?;
        let manifest = Manifest::from_slice(&fs::read(&manifest_path).await?)?;

        Ok(ArtifactPair {
            manifest,
            archive_path,
            manifest_path,
        })
    }

    async fn get_manifest(&self, remote: &RemoteRef) -> Result<Manifest> {
        Manifest::from_slice(&fs::read(self.root.join(remote.manifest_key())).await?)
    }

    async fn delete(&self, remote: &RemoteRef) -> Result<()> {
        for key in [remote.manifest_key(), remote.archive_key()] {
            match fs::remove_file(self.root.join(&key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
