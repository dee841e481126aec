//! Baseline chains: full -> incr1 -> incr2 ...
//!
//! Resolving walks baseline links back to the nearest full manifest.
//! Replaying folds the chain, oldest first, into the file state the target
//! manifest represents.

use super::{BackupKind, Manifest, MissingFile, Status, STORE_ENTRY};
use crate::utils::errors::{EngineError, Result};
use std::collections::{BTreeMap, HashSet};

/// Upper bound on links followed, guards against corrupt cyclic links.
const MAX_CHAIN_LINKS: usize = 1024;

/// Reconstructed content of one path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub size: u64,
    pub digest: String,
    /// Manifest whose archive holds these bytes.
    pub source: String,
}

/// File state at a point of a chain, keyed by archive path. The store
/// export is held under [`STORE_ENTRY`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainState {
    pub files: BTreeMap<String, FileState>,
    /// Paths the latest capture could not read. Their absence from `files`
    /// says nothing about the live system.
    pub missing: Vec<MissingFile>,
}

impl ChainState {
    pub fn store(&self) -> Option<&FileState> {
        self.files.get(STORE_ENTRY)
    }

    /// Path -> digest view without provenance.
    pub fn digests(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|(p, f)| (p.clone(), f.digest.clone()))
            .collect()
    }

    pub fn apply(&mut self, manifest: &Manifest) {
        if manifest.kind == BackupKind::Full {
            self.files.clear();
        }
        if let Some(store) = manifest.store.as_ref().filter(|s| s.included) {
            self.files.insert(
                STORE_ENTRY.to_string(),
                FileState {
                    size: store.size,
                    digest: store.digest.clone(),
                    source: manifest.id.clone(),
                },
            );
        }
        for entry in &manifest.files {
            self.files.insert(
                entry.path.clone(),
                FileState {
                    size: entry.size,
                    digest: entry.digest.clone(),
                    source: manifest.id.clone(),
                },
            );
        }
        for path in &manifest.tombstones {
            self.files.remove(path);
        }
        self.missing = manifest.missing.clone();
    }

    /// Whether a path absent from the state was simply not captured.
    pub fn uncaptured(&self, path: &str) -> bool {
        !self.files.contains_key(path) && self.missing.iter().any(|m| m.covers(path))
    }
}

/// Loads the chain ending at `target`, oldest (full) first.
pub fn resolve_chain<F>(target: &str, mut lookup: F) -> Result<Vec<Manifest>>
where
    F: FnMut(&str) -> Result<Option<Manifest>>,
{
    let mut links = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some(target.to_string());

    while let Some(id) = next {
        if !seen.insert(id.clone()) || links.len() >= MAX_CHAIN_LINKS {
            return Err(broken(target, &id, "baseline links form a cycle"));
        }
        let manifest = match lookup(&id)? {
            Some(m) => m,
            None if id == target => {
                return Err(EngineError::NotFound(format!("manifest {}", target)));
            }
            None => return Err(broken(target, &id, "manifest is missing")),
        };
        if manifest.status == Status::Failed || manifest.archive.is_none() {
            return Err(broken(target, &id, "link has no usable archive"));
        }
        next = match manifest.kind {
            BackupKind::Full => None,
            BackupKind::Incremental => match &manifest.baseline {
                Some(baseline) => Some(baseline.clone()),
                None => return Err(broken(target, &id, "incremental without baseline")),
            },
        };
        links.push(manifest);
    }

    links.reverse();
    Ok(links)
}

/// Folds a chain (oldest first) into the state of its last manifest.
pub fn replay(chain: &[Manifest]) -> ChainState {
    let mut state = ChainState::default();
    for manifest in chain {
        state.apply(manifest);
    }
    state
}

fn broken(target: &str, link: &str, reason: &str) -> EngineError {
    EngineError::ChainBroken {
        manifest_id: target.to_string(),
        missing_link: link.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ArchiveInfo, Category, Component, FileEntry, StoreCapture, FORMAT_VERSION};
    use chrono::Utc;
    use std::collections::HashMap;

    fn entry(path: &str, digest: &str) -> FileEntry {
        FileEntry {
            path: path.into(),
            component: Component::of_path(path).unwrap(),
            size: 1,
            digest: digest.into(),
        }
    }

    fn manifest(id: &str, baseline: Option<&str>, files: Vec<FileEntry>, tombstones: &[&str]) -> Manifest {
        Manifest {
            format_version: FORMAT_VERSION,
            id: id.into(),
            category: Category::Daily,
            kind: if baseline.is_some() { BackupKind::Incremental } else { BackupKind::Full },
            created_at: Utc::now(),
            baseline: baseline.map(String::from),
            source_host: "test".into(),
            store: Some(StoreCapture {
                path: STORE_ENTRY.into(),
                size: 1,
                digest: format!("store-{}", id),
                integrity_ok: true,
                integrity_detail: "ok".into(),
                included: baseline.is_none(),
            }),
            files,
            tombstones: tombstones.iter().map(|s| s.to_string()).collect(),
            missing: vec![],
            archive: Some(ArchiveInfo {
                file_name: format!("{}.tar.zst", id),
                size: 1,
                digest: "00".into(),
                compression: "zstd".into(),
            }),
            status: Status::Succeeded,
            errors: vec![],
        }
    }

    fn catalog(items: Vec<Manifest>) -> HashMap<String, Manifest> {
        items.into_iter().map(|m| (m.id.clone(), m)).collect()
    }

    #[test]
    fn test_resolve_and_replay() {
        let full = manifest(
            "daily-0",
            None,
            vec![entry("assets/a", "a0"), entry("assets/b", "b0"), entry("config/c", "c0")],
            &[],
        );
        let incr1 = manifest("daily-1", Some("daily-0"), vec![entry("assets/a", "a1")], &["assets/b"]);
        let incr2 = manifest("daily-2", Some("daily-1"), vec![entry("assets/d", "d2")], &[]);
        let all = catalog(vec![full, incr1, incr2]);

        let chain = resolve_chain("daily-2", |id| Ok(all.get(id).cloned())).unwrap();
        let ids: Vec<_> = chain.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["daily-0", "daily-1", "daily-2"]);

        let state = replay(&chain);
        let digests = state.digests();
        assert_eq!(digests.get("assets/a").map(String::as_str), Some("a1"));
        assert!(!digests.contains_key("assets/b"));
        assert_eq!(digests.get("assets/d").map(String::as_str), Some("d2"));
        assert_eq!(state.store().unwrap().source, "daily-0");
        assert_eq!(state.files["config/c"].source, "daily-0");
    }

    #[test]
    fn test_missing_link_breaks_chain() {
        let incr2 = manifest("daily-2", Some("daily-1"), vec![], &[]);
        let all = catalog(vec![incr2]);
        let err = resolve_chain("daily-2", |id| Ok(all.get(id).cloned())).unwrap_err();
        match err {
            EngineError::ChainBroken { missing_link, .. } => assert_eq!(missing_link, "daily-1"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_failed_link_breaks_chain() {
        let mut full = manifest("daily-0", None, vec![], &[]);
        full.status = Status::Failed;
        full.archive = None;
        let incr = manifest("daily-1", Some("daily-0"), vec![], &[]);
        let all = catalog(vec![full, incr]);
        assert!(matches!(
            resolve_chain("daily-1", |id| Ok(all.get(id).cloned())),
            Err(EngineError::ChainBroken { .. })
        ));
    }

    #[test]
    fn test_cycle_is_detected() {
        let a = manifest("daily-a", Some("daily-b"), vec![], &[]);
        let b = manifest("daily-b", Some("daily-a"), vec![], &[]);
        let all = catalog(vec![a, b]);
        assert!(matches!(
            resolve_chain("daily-a", |id| Ok(all.get(id).cloned())),
            Err(EngineError::ChainBroken { .. })
        ));
    }

    #[test]
    fn test_unknown_target_is_not_found() {
        let all: HashMap<String, Manifest> = HashMap::new();
        assert!(matches!(
            resolve_chain("daily-x", |id| Ok(all.get(id).cloned())),
            Err(EngineError::NotFound(_))
        ));
    }
}
