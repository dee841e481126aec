//! Archive container: a zstd-compressed tar.
//!
//! Entries live under `store/`, `assets/` and `config/` only. Headers carry
//! fixed ownership, mode and mtime, so the same entries always produce the
//! same archive bytes.

use crate::integrity::{HashingReader, HashingWriter};
use crate::manifest::Component;
use crate::utils::errors::{EngineError, Result};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component as PathComponent, Path, PathBuf};
use tar::{EntryType, Header};
use zstd::stream::read::Decoder;
use zstd::stream::write::Encoder;

pub struct ArchiveWriter {
    builder: tar::Builder<Encoder<'static, HashingWriter<File>>>,
}

impl ArchiveWriter {
    pub fn create(path: &Path, level: i32) -> io::Result<Self> {
        let file = File::create(path)?;
        let encoder = Encoder::new(HashingWriter::new(file), level)?;
        Ok(Self {
            builder: tar::Builder::new(encoder),
        })
    }

    /// Streams a regular file into the archive. Returns `(size, digest)` of
    /// the entry's bytes. A file that shrinks while being read is an error.
    pub fn append_file(&mut self, archive_path: &str, file: File) -> io::Result<(u64, String)> {
        let len = file.metadata()?.len();
        self.append_reader(archive_path, len, file)
    }

    /// Appends exactly `len` bytes from `reader`.
    pub fn append_reader<R: Read>(&mut self, archive_path: &str, len: u64, reader: R) -> io::Result<(u64, String)> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(len);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);

        let mut hashing = HashingReader::new(reader.take(len));
        self.builder.append_data(&mut header, archive_path, &mut hashing)?;
        let (read, digest) = hashing.finish();
        if read != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{}: {} of {} bytes read", archive_path, read, len),
            ));
        }
        Ok((read, digest))
    }

    /// Finishes the stream and syncs the file. Returns `(size, digest)` of
    /// the bytes written.
    pub fn finish(self) -> io::Result<(u64, String)> {
        let encoder = self.builder.into_inner()?;
        let hashing = encoder.finish()?;
        let (file, size, digest) = hashing.finish();
        file.sync_all()?;
        Ok((size, digest))
    }
}

/// Extracts every entry into `dest`, overwriting existing files. Returns the
/// archive paths written.
pub fn extract(archive: &Path, dest: &Path) -> Result<Vec<String>> {
    let decoder = Decoder::new(File::open(archive)?)?;
    let mut tar = tar::Archive::new(decoder);
    let mut written = Vec::new();

    for entry in tar.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != EntryType::Regular {
            return Err(EngineError::Integrity(format!(
                "{}: unexpected non-file entry",
                archive.display()
            )));
        }
        let raw = entry.path()?.into_owned();
        let archive_path = checked_path(&raw)?;

        let target = dest.join(&raw);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        written.push(archive_path);
    }

    Ok(written)
}

/// Archive paths and sizes, in archive order.
pub fn list_entries(archive: &Path) -> Result<Vec<(String, u64)>> {
    let decoder = Decoder::new(File::open(archive)?)?;
    let mut tar = tar::Archive::new(decoder);
    let mut entries = Vec::new();
    for entry in tar.entries()? {
        let entry = entry?;
        let raw: PathBuf = entry.path()?.into_owned();
        entries.push((checked_path(&raw)?, entry.size()));
    }
    Ok(entries)
}

/// Only relative paths below a component prefix are accepted.
fn checked_path(raw: &Path) -> Result<String> {
    let mut parts = Vec::new();
    for component in raw.components() {
        match component {
            PathComponent::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => {
                return Err(EngineError::Integrity(format!(
                    "archive entry '{}' escapes the archive root",
                    raw.display()
                )))
            }
        }
    }
    let path = parts.join("/");
    if parts.len() < 2 || Component::of_path(&path).is_none() {
        return Err(EngineError::Integrity(format!(
            "archive entry '{}' is outside the known components",
            path
        )));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::{digest, digest_file};
    use tempfile::TempDir;

    fn build(path: &Path, entries: &[(&str, &[u8])]) -> (u64, String) {
        let mut writer = ArchiveWriter::create(path, 3).unwrap();
        for (name, bytes) in entries {
            writer.append_reader(name, bytes.len() as u64, *bytes).unwrap();
        }
        writer.finish().unwrap()
    }

    #[test]
    fn test_reported_digest_matches_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tar.zst");
        let (size, hex) = build(&path, &[("assets/a.txt", b"hello"), ("config/app.toml", b"x = 1")]);

        let (disk_size, disk_hex) = digest_file(&path).unwrap();
        assert_eq!(size, disk_size);
        assert_eq!(hex, disk_hex);
    }

    #[test]
    fn test_same_entries_same_bytes() {
        let dir = TempDir::new().unwrap();
        let entries: &[(&str, &[u8])] = &[("store/database.sqlite3", b"db"), ("assets/x/y.bin", b"yy")];
        let (_, first) = build(&dir.path().join("1.tar.zst"), entries);
        let (_, second) = build(&dir.path().join("2.tar.zst"), entries);
        assert_eq!(first, second);
    }

    #[test]
    fn test_extract_and_list() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tar.zst");
        let long_name = format!("assets/{}photo.jpg", "deep/".repeat(40));
        build(&path, &[("assets/a.txt", b"hello"), (long_name.as_str(), b"jpeg")]);

        let listed = list_entries(&path).unwrap();
        assert_eq!(listed[0], ("assets/a.txt".to_string(), 5));
        assert_eq!(listed[1].0, long_name);

        let out = dir.path().join("out");
        let written = extract(&path, &out).unwrap();
        assert_eq!(written.len(), 2);
        assert_eq!(fs::read(out.join("assets/a.txt")).unwrap(), b"hello");
        assert_eq!(digest(&fs::read(out.join(&long_name)).unwrap()), digest(b"jpeg"));
    }

    #[test]
    fn test_file_entries_are_streamed_with_their_digest() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("photo.jpg");
        let bytes: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        fs::write(&source, &bytes).unwrap();

        let path = dir.path().join("a.tar.zst");
        let mut writer = ArchiveWriter::create(&path, 3).unwrap();
        let (size, hex) = writer
            .append_file("assets/photo.jpg", File::open(&source).unwrap())
            .unwrap();
        writer.finish().unwrap();
        assert_eq!(size, bytes.len() as u64);
        assert_eq!(hex, digest(&bytes));

        let out = dir.path().join("out");
        extract(&path, &out).unwrap();
        assert_eq!(fs::read(out.join("assets/photo.jpg")).unwrap(), bytes);
    }

    #[test]
    fn test_short_source_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut writer = ArchiveWriter::create(&dir.path().join("a.tar.zst"), 3).unwrap();
        let err = writer.append_reader("assets/a.txt", 10, &b"short"[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_rejects_foreign_paths() {
        assert!(checked_path(Path::new("assets/ok.txt")).is_ok());
        assert!(checked_path(Path::new("etc/passwd")).is_err());
        assert!(checked_path(Path::new("assets/../../etc/passwd")).is_err());
        assert!(checked_path(Path::new("/assets/x")).is_err());
        assert!(checked_path(Path::new("assets")).is_err());
    }
}
