//! Local catalog of manifest/archive pairs.
//!
//! Layout under the local backup directory:
//!
//! ```text
//! <local_dir>/<category>/<id>.tar.zst
//! <local_dir>/<category>/<id>.manifest.json
//! <local_dir>/.staging/          scratch space for captures and restores
//! <local_dir>/.operation.lock    held while a backup or restore runs
//! ```
//!
//! An archive is renamed into place before its manifest is published, so a
//! visible manifest always has its archive. An archive whose manifest could
//! not be published is moved back to scratch, and `sweep` removes any
//! archive left without a manifest. Deletion runs the other way
//! round through a `.deleting` marker, and [`Catalog::sweep`] finishes any
//! deletion interrupted by a crash.

use crate::integrity;
use crate::manifest::{Category, Manifest, ARCHIVE_SUFFIX, MANIFEST_SUFFIX};
use crate::storage::ArtifactPair;
use crate::utils::errors::{EngineError, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const STAGING_DIR: &str = ".staging";
const LOCK_FILE: &str = ".operation.lock";
const DELETING_SUFFIX: &str = ".deleting";
const PARTIAL_SUFFIX: &str = ".partial";
const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct Catalog {
    root: PathBuf,
}

impl Catalog {
    pub fn open(root: &Path) -> Result<Self> {
        for category in Category::ALL {
            fs::create_dir_all(root.join(category.as_str()))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn category_dir(&self, category: Category) -> PathBuf {
        self.root.join(category.as_str())
    }

    pub fn manifest_path(&self, category: Category, id: &str) -> PathBuf {
        self.category_dir(category).join(Manifest::manifest_file_name(id))
    }

    pub fn archive_path(&self, manifest: &Manifest) -> PathBuf {
        self.category_dir(manifest.category)
            .join(Manifest::archive_file_name(&manifest.id))
    }

    pub fn partial_path(&self, category: Category, id: &str) -> PathBuf {
        self.category_dir(category)
            .join(format!("{}{}", Manifest::archive_file_name(id), PARTIAL_SUFFIX))
    }

    /// Fresh scratch directory under `.staging`.
    pub fn staging_dir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(STAGING_DIR).join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    pub fn pair(&self, manifest: &Manifest) -> ArtifactPair {
        ArtifactPair {
            manifest: manifest.clone(),
            archive_path: self.archive_path(manifest),
            manifest_path: self.manifest_path(manifest.category, &manifest.id),
        }
    }

    pub fn has_archive(&self, manifest: &Manifest) -> bool {
        manifest.archive.is_some() && self.archive_path(manifest).is_file()
    }

    /// Publishes a manifest, moving `partial` into place as its archive first.
    /// Manifests are never overwritten.
    pub fn commit(&self, manifest: &Manifest, partial: Option<&Path>) -> Result<()> {
        let manifest_path = self.manifest_path(manifest.category, &manifest.id);
        if manifest_path.exists() {
            return Err(EngineError::Validation(format!(
                "manifest {} already exists",
                manifest.id
            )));
        }

        let tmp = with_suffix(&manifest_path, TMP_SUFFIX);
        write_synced(&tmp, manifest.to_json()?.as_bytes())?;

        let archive = self.archive_path(manifest);
        if let Some(partial) = partial {
            if let Err(e) = fs::rename(partial, &archive) {
                let _ = fs::remove_file(&tmp);
                return Err(e.into());
            }
        }

        if let Err(e) = publish(&tmp, &manifest_path, &manifest.id) {
            let _ = fs::remove_file(&tmp);
            // The archive goes back to scratch so it is never visible alone.
            if let Some(partial) = partial {
                if fs::rename(&archive, partial).is_err() {
                    let _ = fs::remove_file(&archive);
                }
            }
            return Err(e);
        }

        debug!(manifest_id = %manifest.id, path = %manifest_path.display(), "Manifest committed");
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<Option<Manifest>> {
        let category = Manifest::validate_id(id)?;
        match fs::read(self.manifest_path(category, id)) {
            Ok(bytes) => Ok(Some(Manifest::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Manifests, newest first. Unreadable manifests are skipped with a warning.
    pub fn list(&self, category: Option<Category>) -> Result<Vec<Manifest>> {
        let categories: Vec<Category> = match category {
            Some(c) => vec![c],
            None => Category::ALL.to_vec(),
        };

        let mut manifests = Vec::new();
        for category in categories {
            let dir = self.category_dir(category);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let path = entry?.path();
                let is_manifest = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX));
                if !is_manifest {
                    continue;
                }
                match fs::read(&path).map_err(EngineError::from).and_then(|b| Manifest::from_slice(&b)) {
                    Ok(m) => manifests.push(m),
                    Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable manifest"),
                }
            }
        }

        manifests.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(manifests)
    }

    /// Deletes a pair so that neither half outlives the other.
    pub fn delete_pair(&self, manifest: &Manifest) -> Result<()> {
        let manifest_path = self.manifest_path(manifest.category, &manifest.id);
        let marker = with_suffix(&manifest_path, DELETING_SUFFIX);

        match fs::rename(&manifest_path, &marker) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound && marker.exists() => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(EngineError::NotFound(format!("manifest {}", manifest.id)));
            }
            Err(e) => return Err(e.into()),
        }

        remove_if_present(&self.archive_path(manifest))?;
        remove_if_present(&marker)?;
        info!(manifest_id = %manifest.id, category = %manifest.category, "Deleted backup");
        Ok(())
    }

    /// Adopts a pair fetched into a staging directory after checking its
    /// archive digest.
    pub fn import(&self, pair: &ArtifactPair) -> Result<Manifest> {
        let manifest = &pair.manifest;
        Manifest::validate_id(&manifest.id)?;
        let expected = manifest
            .archive
            .as_ref()
            .map(|a| a.digest.clone())
            .ok_or_else(|| EngineError::Integrity(format!("manifest {} has no archive", manifest.id)))?;
        if !integrity::verify_archive(&pair.archive_path, &expected) {
            return Err(EngineError::Integrity(format!(
                "fetched archive of {} does not match its manifest",
                manifest.id
            )));
        }

        let partial = self.partial_path(manifest.category, &manifest.id);
        if fs::rename(&pair.archive_path, &partial).is_err() {
            fs::copy(&pair.archive_path, &partial)?;
        }
        self.commit(manifest, Some(&partial))?;
        info!(manifest_id = %manifest.id, "Imported backup from remote destination");
        Ok(manifest.clone())
    }

    /// Clears scratch files, finishes interrupted deletions and removes
    /// archives left without a manifest. Call only
    /// while holding the operation lock.
    pub fn sweep(&self) -> Result<()> {
        let staging = self.root.join(STAGING_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }

        for category in Category::ALL {
            let dir = self.category_dir(category);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let path = entry?.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                    continue;
                };
                if name.ends_with(PARTIAL_SUFFIX) || name.ends_with(TMP_SUFFIX) {
                    debug!(path = %path.display(), "Removing leftover scratch file");
                    remove_if_present(&path)?;
                } else if let Some(manifest_name) = name.strip_suffix(DELETING_SUFFIX) {
                    if let Some(id) = manifest_name.strip_suffix(MANIFEST_SUFFIX) {
                        warn!(manifest_id = %id, "Finishing interrupted deletion");
                        remove_if_present(&dir.join(Manifest::archive_file_name(id)))?;
                    }
                    remove_if_present(&path)?;
                } else if let Some(id) = name.strip_suffix(ARCHIVE_SUFFIX) {
                    if !dir.join(Manifest::manifest_file_name(id)).exists() {
                        warn!(path = %path.display(), "Removing archive without a manifest");
                        remove_if_present(&path)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

/// Moves `tmp` to `manifest_path` without ever replacing a manifest.
fn publish(tmp: &Path, manifest_path: &Path, id: &str) -> Result<()> {
    match fs::hard_link(tmp, manifest_path) {
        Ok(()) => {
            // Published; a leftover temp file is swept later.
            let _ = fs::remove_file(tmp);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            Err(EngineError::Validation(format!("manifest {} already exists", id)))
        }
        Err(_) => fs::rename(tmp, manifest_path).map_err(EngineError::from),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ArchiveInfo, BackupKind, Status, FORMAT_VERSION};
    use chrono::{Duration, Utc};
    use tempfile::TempDir;

    fn manifest(category: Category, age_days: i64) -> Manifest {
        let created_at = Utc::now() - Duration::days(age_days);
        Manifest {
            format_version: FORMAT_VERSION,
            id: Manifest::new_id(category, created_at),
            category,
            kind: BackupKind::Full,
            created_at,
            baseline: None,
            source_host: "test".into(),
            store: None,
            files: vec![],
            tombstones: vec![],
            missing: vec![],
            archive: Some(ArchiveInfo {
                file_name: String::new(),
                size: 7,
                digest: integrity::digest(b"archive"),
                compression: "zstd".into(),
            }),
            status: Status::Succeeded,
            errors: vec![],
        }
    }

    fn commit_with_archive(catalog: &Catalog, m: &Manifest) {
        let partial = catalog.partial_path(m.category, &m.id);
        fs::write(&partial, b"archive").unwrap();
        catalog.commit(m, Some(&partial)).unwrap();
    }

    #[test]
    fn test_commit_load_and_list_order() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let old = manifest(Category::Daily, 3);
        let new = manifest(Category::Weekly, 1);
        commit_with_archive(&catalog, &old);
        commit_with_archive(&catalog, &new);

        assert!(catalog.has_archive(&old));
        assert!(!catalog.partial_path(old.category, &old.id).exists());
        assert_eq!(catalog.load(&old.id).unwrap(), Some(old.clone()));

        let all = catalog.list(None).unwrap();
        assert_eq!(all.iter().map(|m| m.id.clone()).collect::<Vec<_>>(), [new.id.clone(), old.id.clone()]);
        assert_eq!(catalog.list(Some(Category::Daily)).unwrap().len(), 1);
        assert!(catalog.list(Some(Category::Monthly)).unwrap().is_empty());
    }

    #[test]
    fn test_manifests_are_immutable() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let m = manifest(Category::Manual, 0);
        commit_with_archive(&catalog, &m);

        let mut changed = m.clone();
        changed.errors.push("rewritten".into());
        assert!(matches!(catalog.commit(&changed, None), Err(EngineError::Validation(_))));
        assert_eq!(catalog.load(&m.id).unwrap(), Some(m));
    }

    #[test]
    fn test_delete_pair_removes_both_halves() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let m = manifest(Category::Daily, 40);
        commit_with_archive(&catalog, &m);

        catalog.delete_pair(&m).unwrap();
        assert!(!catalog.archive_path(&m).exists());
        assert!(catalog.load(&m.id).unwrap().is_none());
        assert!(matches!(catalog.delete_pair(&m), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn test_sweep_finishes_interrupted_deletion() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let m = manifest(Category::Daily, 40);
        commit_with_archive(&catalog, &m);

        // Crash after the marker rename, before the archive was removed.
        let manifest_path = catalog.manifest_path(m.category, &m.id);
        fs::rename(&manifest_path, with_suffix(&manifest_path, DELETING_SUFFIX)).unwrap();
        let stray = catalog.partial_path(Category::Daily, "daily-20240101T000000Z-deadbeef");
        fs::write(&stray, b"half").unwrap();

        assert!(catalog.list(None).unwrap().is_empty(), "marker hides the manifest");
        catalog.sweep().unwrap();
        assert!(!catalog.archive_path(&m).exists());
        assert!(!with_suffix(&manifest_path, DELETING_SUFFIX).exists());
        assert!(!stray.exists());
    }

    #[test]
    fn test_failed_publish_leaves_no_archive() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let m = manifest(Category::Daily, 1);
        let partial = catalog.partial_path(m.category, &m.id);
        fs::write(&partial, b"archive").unwrap();

        // A directory in the way of the manifest temp file.
        let tmp = with_suffix(&catalog.manifest_path(m.category, &m.id), TMP_SUFFIX);
        fs::create_dir(&tmp).unwrap();

        assert!(catalog.commit(&m, Some(&partial)).is_err());
        assert!(!catalog.archive_path(&m).exists());
        assert!(catalog.list(None).unwrap().is_empty());

        fs::remove_dir(&tmp).unwrap();
        catalog.sweep().unwrap();
        assert!(!partial.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_publish_conflict_moves_archive_back() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let m = manifest(Category::Daily, 1);
        let partial = catalog.partial_path(m.category, &m.id);
        fs::write(&partial, b"archive").unwrap();

        // Dangling link: invisible to the existence check, fatal to the link step.
        std::os::unix::fs::symlink(dir.path().join("nowhere"), catalog.manifest_path(m.category, &m.id)).unwrap();

        let err = catalog.commit(&m, Some(&partial)).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(!catalog.archive_path(&m).exists());
        assert_eq!(fs::read(&partial).unwrap(), b"archive");
        assert!(!with_suffix(&catalog.manifest_path(m.category, &m.id), TMP_SUFFIX).exists());
    }

    #[test]
    fn test_sweep_removes_archive_without_manifest() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let kept = manifest(Category::Weekly, 2);
        commit_with_archive(&catalog, &kept);
        let orphan = manifest(Category::Weekly, 1);
        fs::write(catalog.archive_path(&orphan), b"archive").unwrap();

        catalog.sweep().unwrap();
        assert!(!catalog.archive_path(&orphan).exists());
        assert!(catalog.has_archive(&kept));
    }

    #[test]
    fn test_load_rejects_malformed_id() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        assert!(catalog.load("../../etc/passwd").is_err());
        assert_eq!(catalog.load("daily-20240101T000000Z-00000000").unwrap(), None);
    }

    #[test]
    fn test_import_checks_digest() {
        let dir = TempDir::new().unwrap();
        let catalog = Catalog::open(&dir.path().join("catalog")).unwrap();
        let m = manifest(Category::Daily, 1);

        let fetched = dir.path().join("fetched.tar.zst");
        fs::write(&fetched, b"tampered").unwrap();
        let pair = ArtifactPair {
            manifest: m.clone(),
            archive_path: fetched.clone(),
            manifest_path: dir.path().join("fetched.manifest.json"),
        };
        assert!(matches!(catalog.import(&pair), Err(EngineError::Integrity(_))));

        fs::write(&fetched, b"archive").unwrap();
        catalog.import(&pair).unwrap();
        assert!(catalog.has_archive(&m));
        assert_eq!(catalog.load(&m.id).unwrap(), Some(m));
    }
}
