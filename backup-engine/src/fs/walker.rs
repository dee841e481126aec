//! Deterministic traversal of the protected asset tree.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

const NON_UTF8_NAME: &str = "file name is not valid UTF-8";

/// Options for directory walking
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Follow symbolic links
    pub follow_links: bool,

    /// Maximum depth (None = unlimited)
    pub max_depth: Option<usize>,

    /// File or directory names to skip (exact match)
    pub exclude_patterns: Vec<String>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            follow_links: false,
            max_depth: None,
            exclude_patterns: vec![
                ".git".to_string(),
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
            ],
        }
    }
}

impl WalkOptions {
    pub fn excluding(patterns: &[String]) -> Self {
        Self {
            exclude_patterns: patterns.to_vec(),
            ..Self::default()
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Relative path from the root
    pub relative_path: PathBuf,

    /// File size in bytes
    pub size: u64,

    /// Is this a symlink?
    pub is_symlink: bool,
}

impl FileInfo {
    /// For symlinks, resolves to the target to get the real file size.
    /// Returns None for directories and for symlinks to directories or
    /// broken symlinks.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let raw_metadata = entry.metadata().map_err(std::io::Error::other)?;
        let path = entry.path().to_path_buf();
        let relative_path = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
        let is_symlink = raw_metadata.is_symlink();

        let size = if is_symlink {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved.len(),
                _ => return Ok(None),
            }
        } else if raw_metadata.is_file() {
            raw_metadata.len()
        } else {
            return Ok(None);
        };

        Ok(Some(Self {
            path,
            relative_path,
            size,
            is_symlink,
        }))
    }

    /// Relative path with `/` separators, as stored in archives.
    pub fn portable_path(&self) -> String {
        portable(&self.relative_path)
    }
}

/// Entries the walk could not read, with the reason.
#[derive(Debug, Default)]
pub struct WalkResult {
    pub files: Vec<FileInfo>,
    pub unreadable: Vec<(String, String)>,
}

/// Walk a directory tree and collect all files, sorted by relative path.
///
/// A missing root yields an empty result. Unreadable entries are reported in
/// [`WalkResult::unreadable`] instead of aborting the walk.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> WalkResult {
    let mut result = WalkResult::default();
    if !root.exists() {
        return result;
    }

    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name();

    if let Some(max_depth) = options.max_depth {
        walker = walker.max_depth(max_depth);
    }

    let patterns = &options.exclude_patterns;
    let mut entries = walker
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !should_exclude(e, patterns));
    while let Some(entry) = entries.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e
                    .path()
                    .map(|p| portable(p.strip_prefix(root).unwrap_or(p)))
                    .unwrap_or_default();
                result.unreadable.push((path, e.to_string()));
                continue;
            }
        };

        // Archive paths are UTF-8; a lossy name would restore as a different file.
        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        if entry.depth() > 0 && rel.to_str().is_none() {
            result.unreadable.push((portable(rel), NON_UTF8_NAME.to_string()));
            if entry.file_type().is_dir() {
                entries.skip_current_dir();
            }
            continue;
        }

        if entry.file_type().is_dir() {
            continue;
        }

        match FileInfo::from_entry(&entry, root) {
            Ok(Some(info)) => result.files.push(info),
            Ok(None) => {}
            Err(e) => {
                let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
                result.unreadable.push((portable(rel), e.to_string()));
            }
        }
    }

    result.files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    result
}

/// Check if a directory entry should be excluded based on patterns
fn should_exclude(entry: &DirEntry, patterns: &[String]) -> bool {
    let file_name = entry.file_name().to_string_lossy();
    patterns.iter().any(|p| file_name == p.as_str())
}

pub fn portable(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
