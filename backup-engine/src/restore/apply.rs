//! Blocking steps of a restore: staging a chain into a private directory and
//! moving staged components onto the live system.

use crate::archiver::container;
use crate::catalog::Catalog;
use crate::config::ProtectedConfig;
use crate::fs::walker::{portable, walk_directory, WalkOptions};
use crate::integrity::{digest_file, verify_store};
use crate::manifest::chain::{self, ChainState};
use crate::manifest::{Component, Manifest, STORE_ENTRY};
use crate::store;
use crate::utils::errors::{EngineError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Extracts the chain (oldest first) into `tree`, applying tombstones, and
/// checks the result against the replayed state.
pub fn stage(chain: &[Manifest], catalog: &Catalog, tree: &Path) -> Result<ChainState> {
    fs::create_dir_all(tree)?;
    for manifest in chain {
        let written = container::extract(&catalog.archive_path(manifest), tree)?;
        for path in &manifest.tombstones {
            remove_file_if_present(&tree.join(path))?;
        }
        debug!(manifest_id = %manifest.id, entries = written.len(), "Archive staged");
    }

    let state = chain::replay(chain);
    check_tree(tree, &state)?;
    Ok(state)
}

/// The staged tree holds exactly the state's paths with matching digests.
fn check_tree(tree: &Path, state: &ChainState) -> Result<()> {
    let walk = walk_directory(tree, &WalkOptions::excluding(&[]));
    if let Some((path, reason)) = walk.unreadable.first() {
        return Err(EngineError::Integrity(format!("staged {} unreadable: {}", path, reason)));
    }

    let mut staged = BTreeMap::new();
    for file in walk.files {
        let (_, digest) = digest_file(&file.path)?;
        staged.insert(file.portable_path(), digest);
    }

    let expected = state.digests();
    for (path, digest) in &expected {
        match staged.get(path) {
            Some(actual) if actual == digest => {}
            Some(_) => {
                return Err(EngineError::Integrity(format!("staged {} does not match its manifest", path)));
            }
            None => {
                return Err(EngineError::Integrity(format!("staged {} is missing", path)));
            }
        }
    }
    if let Some(extra) = staged.keys().find(|p| !expected.contains_key(*p)) {
        return Err(EngineError::Integrity(format!("staged {} is not in the target state", extra)));
    }
    Ok(())
}

/// Replaces each selected component of the live system with its staged
/// version. Live files absent from the target state are removed unless the
/// capture listed them as unreadable.
pub fn apply(protected: &ProtectedConfig, tree: &Path, state: &ChainState, components: &[Component]) -> Result<()> {
    for component in components {
        match component {
            Component::Database => apply_store(protected, tree, state)?,
            Component::Assets => apply_assets(protected, tree, state)?,
            Component::Config => apply_config(protected, tree, state)?,
        }
        info!(component = %component, "Component restored");
    }
    Ok(())
}

fn apply_store(protected: &ProtectedConfig, tree: &Path, state: &ChainState) -> Result<()> {
    let database = &protected.database;
    if state.store().is_none() {
        remove_file_if_present(database)?;
        store::remove_side_files(database)?;
        return Ok(());
    }

    if let Some(parent) = database.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = sibling(database, ".restore-tmp");
    fs::copy(tree.join(STORE_ENTRY), &tmp)?;
    fs::File::open(&tmp)?.sync_all()?;
    // Stale WAL or journal files would be replayed into the restored store.
    store::remove_side_files(database)?;
    fs::rename(&tmp, database)?;
    Ok(())
}

fn apply_assets(protected: &ProtectedConfig, tree: &Path, state: &ChainState) -> Result<()> {
    let prefix = Component::Assets.prefix();
    let wanted: BTreeMap<&str, &str> = state
        .files
        .keys()
        .filter_map(|path| path.strip_prefix(prefix).map(|rel| (rel, path.as_str())))
        .collect();

    let live = walk_directory(&protected.assets_dir, &WalkOptions::excluding(&protected.exclude_patterns));
    for file in &live.files {
        let rel = file.portable_path();
        if !wanted.contains_key(rel.as_str()) && !state.uncaptured(&format!("{}{}", prefix, rel)) {
            debug!(path = %file.path.display(), "Removing asset not in the restored state");
            remove_file_if_present(&file.path)?;
        }
    }

    for (rel, archive_path) in wanted {
        replace_file(&tree.join(archive_path), &protected.assets_dir.join(rel))?;
    }
    Ok(())
}

fn apply_config(protected: &ProtectedConfig, tree: &Path, state: &ChainState) -> Result<()> {
    for (rel, archive_path) in config_targets(protected, state) {
        let target = protected.config_root.join(&rel);
        if state.files.contains_key(&archive_path) {
            replace_file(&tree.join(&archive_path), &target)?;
        } else if !state.uncaptured(&archive_path) {
            remove_file_if_present(&target)?;
        }
    }
    Ok(())
}

/// Configured files plus any config entry in the state, as
/// `(relative path, archive path)`.
fn config_targets(protected: &ProtectedConfig, state: &ChainState) -> BTreeMap<String, String> {
    let prefix = Component::Config.prefix();
    let mut targets: BTreeMap<String, String> = protected
        .config_files
        .iter()
        .map(|rel| {
            let rel = portable(rel);
            let archive_path = format!("{}{}", prefix, rel);
            (rel, archive_path)
        })
        .collect();
    for path in state.files.keys() {
        if let Some(rel) = path.strip_prefix(prefix) {
            targets.insert(rel.to_string(), path.clone());
        }
    }
    targets
}

/// Checks the live system against the state for the selected components.
pub fn verify_live(protected: &ProtectedConfig, state: &ChainState, components: &[Component]) -> Result<()> {
    let expected = state.digests();
    for component in components {
        let mut actual: BTreeMap<String, String> = BTreeMap::new();
        match component {
            Component::Database => {
                if protected.database.exists() {
                    actual.insert(STORE_ENTRY.to_string(), digest_file(&protected.database)?.1);
                }
            }
            Component::Assets => {
                let live = walk_directory(
                    &protected.assets_dir,
                    &WalkOptions::excluding(&protected.exclude_patterns),
                );
                for file in live.files {
                    let path = format!("{}{}", Component::Assets.prefix(), file.portable_path());
                    if !state.uncaptured(&path) {
                        actual.insert(path, digest_file(&file.path)?.1);
                    }
                }
            }
            Component::Config => {
                for (rel, archive_path) in config_targets(protected, state) {
                    let target = protected.config_root.join(&rel);
                    if target.is_file() && !state.uncaptured(&archive_path) {
                        actual.insert(archive_path, digest_file(&target)?.1);
                    }
                }
            }
        }

        let wanted: BTreeMap<&String, &String> = expected
            .iter()
            .filter(|(path, _)| Component::of_path(path) == Some(*component))
            .collect();
        let got: BTreeMap<&String, &String> = actual.iter().collect();
        if wanted != got {
            return Err(EngineError::RestoreFailed(format!(
                "live {} does not match the restored state",
                component
            )));
        }

        if *component == Component::Database && state.store().is_some() {
            let check = verify_store(&protected.database);
            if !check.ok {
                return Err(EngineError::RestoreFailed(format!(
                    "restored store failed its integrity check: {}",
                    check.detail
                )));
            }
        }
    }
    Ok(())
}

fn replace_file(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = sibling(target, ".restore-tmp");
    fs::copy(source, &tmp)?;
    fs::rename(&tmp, target)?;
    Ok(())
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn remove_file_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
