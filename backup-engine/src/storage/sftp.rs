//! SFTP destination over ssh2. Every operation opens its own session on a
//! blocking thread.
//!
//! A retried attempt can overlap a timed-out one still running on its
//! thread, so each upload writes its own scratch file and the session
//! timeout follows `sync.timeout_secs`.

use super::{ArtifactPair, Destination, RemoteRef};
use crate::config::{DestinationConfig, DestinationKind};
use crate::manifest::{Category, Manifest};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use ssh2::{ErrorCode, OpenFlags, OpenType, RenameFlags, Session, Sftp};
use std::fs::File;
use std::io;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_PORT: u16 = 22;
// LIBSSH2_FX_NO_SUCH_FILE
const NO_SUCH_FILE: i32 = 2;

enum SftpAuth {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

struct SftpTarget {
    host: String,
    port: u16,
    username: String,
    remote_dir: String,
    auth: SftpAuth,
    timeout_ms: u32,
}

impl SftpTarget {
    fn remote_path(&self, key: &str) -> String {
        format!("{}/{}", self.remote_dir.trim_end_matches('/'), key)
    }

    fn connect(&self) -> Result<(Session, Sftp)> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .map_err(|e| EngineError::Network(format!("{}:{}: {}", self.host, self.port, e)))?;
        let mut sess = Session::new().map_err(network)?;
        sess.set_tcp_stream(tcp);
        sess.set_timeout(self.timeout_ms);
        sess.handshake().map_err(network)?;

        let auth = match &self.auth {
            SftpAuth::Password(password) => sess.userauth_password(&self.username, password),
            SftpAuth::KeyFile { path, passphrase } => {
                sess.userauth_pubkey_file(&self.username, None, path, passphrase.as_deref())
            }
        };
        if let Err(e) = auth {
            return Err(EngineError::Storage(format!(
                "SSH authentication failed for {}@{}: {}",
                self.username, self.host, e
            )));
        }
        if !sess.authenticated() {
            return Err(EngineError::Storage(format!(
                "SSH authentication failed for {}@{}",
                self.username, self.host
            )));
        }

        let sftp = sess.sftp().map_err(network)?;
        Ok((sess, sftp))
    }
}

fn network(e: ssh2::Error) -> EngineError {
    EngineError::Network(e.to_string())
}

fn is_missing(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::SFTP(NO_SUCH_FILE))
}

fn mkdir_all(sftp: &Sftp, dir: &str) -> Result<()> {
    let mut current = String::new();
    for part in dir.split('/') {
        if part.is_empty() {
            current.push('/');
            continue;
        }
        if !current.is_empty() && !current.ends_with('/') {
            current.push('/');
        }
        current.push_str(part);
        let path = Path::new(&current);
        if sftp.stat(path).is_err() {
            sftp.mkdir(path, 0o755).map_err(network)?;
        }
    }
    Ok(())
}

/// ssh2 treats 0 as "no timeout".
fn session_timeout_ms(timeout_secs: u64) -> u32 {
    u32::try_from(timeout_secs.max(1).saturating_mul(1000)).unwrap_or(u32::MAX)
}

fn scratch_name(remote: &str) -> String {
    format!("{}.{}.part", remote, uuid::Uuid::new_v4().simple())
}

fn upload(sftp: &Sftp, local: &Path, remote: &str) -> Result<()> {
    let tmp = scratch_name(remote);
    let copied = (|| -> Result<()> {
        let mut source = File::open(local)?;
        let mut dest = sftp
            .open_mode(
                Path::new(&tmp),
                OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                0o644,
                OpenType::File,
            )
            .map_err(network)?;
        io::copy(&mut source, &mut dest)?;
        drop(dest);
        sftp.rename(
            Path::new(&tmp),
            Path::new(remote),
            Some(RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE),
        )
        .map_err(network)
    })();

    if copied.is_err() {
        let _ = sftp.unlink(Path::new(&tmp));
    }
    copied
}

fn read_remote(sftp: &Sftp, remote: &str) -> Result<Vec<u8>> {
    let mut source = sftp.open(Path::new(remote)).map_err(network)?;
    let mut bytes = Vec::new();
    io::Read::read_to_end(&mut source, &mut bytes)?;
    Ok(bytes)
}

fn download(sftp: &Sftp, remote: &str, local: &Path) -> Result<()> {
    let mut source = sftp.open(Path::new(remote)).map_err(network)?;
    let mut dest = File::create(local)?;
    io::copy(&mut source, &mut dest)?;
    dest.sync_all()?;
    Ok(())
}

pub struct SftpDestination {
    id: String,
    target: Arc<SftpTarget>,
}

impl SftpDestination {
    pub fn from_config(dest: &DestinationConfig, timeout_secs: u64) -> Result<Self> {
        let host = dest.require(&dest.host, "host")?.clone();
        let username = dest.require(&dest.username, "username")?.clone();
        let remote_dir = dest.require(&dest.remote_dir, "remote_dir")?.clone();

        let auth = match (&dest.key_file, &dest.credential) {
            (Some(path), credential) => SftpAuth::KeyFile {
                path: path.clone(),
                passphrase: credential.as_ref().map(|c| c.resolve()).transpose()?,
            },
            (None, Some(credential)) => SftpAuth::Password(credential.resolve()?),
            (None, None) => {
                return Err(EngineError::Config(format!(
                    "destination '{}' (sftp) requires 'key_file' or 'credential'",
                    dest.id
                )))
            }
        };

        Ok(Self {
            id: dest.id.clone(),
            target: Arc::new(SftpTarget {
                host,
                port: dest.port.unwrap_or(DEFAULT_PORT),
                username,
                remote_dir,
                auth,
                timeout_ms: session_timeout_ms(timeout_secs),
            }),
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&SftpTarget) -> Result<T> + Send + 'static,
    {
        let target = Arc::clone(&self.target);
        tokio::task::spawn_blocking(move || f(&target))
            .await
            .map_err(EngineError::join)?
    }
}

#[async_trait]
impl Destination for SftpDestination {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> DestinationKind {
        DestinationKind::Sftp
    }

    async fn put(&self, pair: &ArtifactPair) -> Result<RemoteRef> {
        let remote = RemoteRef::new(&self.id, &pair.manifest);
        let archive_key = remote.archive_key();
        let manifest_key = remote.manifest_key();
        let archive_path = pair.archive_path.clone();
        let manifest_path = pair.manifest_path.clone();
        let category = remote.category;

        self.blocking(move |target| {
            let (_sess, sftp) = target.connect()?;
            mkdir_all(&sftp, &target.remote_path(category.as_str()))?;
            let remote_archive = target.remote_path(&archive_key);
            upload(&sftp, &archive_path, &remote_archive)?;
            if let Err(e) = upload(&sftp, &manifest_path, &target.remote_path(&manifest_key)) {
                let _ = sftp.unlink(Path::new(&remote_archive));
                return Err(e);
            }
            Ok(())
        })
        .await?;

        debug!(destination = %self.id, manifest_id = %remote.manifest_id, "Pair uploaded over SFTP");
        Ok(remote)
    }

    async fn list(&self) -> Result<Vec<RemoteRef>> {
        let id = self.id.clone();
        self.blocking(move |target| {
            let (_sess, sftp) = target.connect()?;
            let mut refs = Vec::new();
            for category in Category::ALL {
                let entries = match sftp.readdir(Path::new(&target.remote_path(category.as_str()))) {
                    Ok(entries) => entries,
                    Err(e) if is_missing(&e) => continue,
                    Err(e) => return Err(network(e)),
                };
                for (path, _) in entries {
                    let Some(name) = path.file_name() else { continue };
                    let key = format!("{}/{}", category.as_str(), name.to_string_lossy());
                    if let Some(remote) = RemoteRef::from_manifest_key(&id, &key) {
                        refs.push(remote);
                    }
                }
            }
            refs.sort_by(|a, b| a.manifest_id.cmp(&b.manifest_id));
            Ok(refs)
        })
        .await
    }

    async fn get(&self, remote: &RemoteRef, local_dir: &Path) -> Result<ArtifactPair> {
        std::fs::create_dir_all(local_dir)?;
        let archive_path = local_dir.join(Manifest::archive_file_name(&remote.manifest_id));
        let manifest_path = local_dir.join(Manifest::manifest_file_name(&remote.manifest_id));
        let archive_key = remote.archive_key();
        let manifest_key = remote.manifest_key();

        let (a, m) = (archive_path.clone(), manifest_path.clone());
        self.blocking(move |target| {
            let (_sess, sftp) = target.connect()?;
            download(&sftp, &target.remote_path(&manifest_key), &m)?;
            download(&sftp, &target.remote_path(&archive_key), &a)
        })
        .await?;

        let manifest = Manifest::from_slice(&tokio::fs::read(&manifest_path).await?)?;
        Ok(ArtifactPair {
            manifest,
            archive_path,
            manifest_path,
        })
    }

    async fn get_manifest(&self, remote: &RemoteRef) -> Result<Manifest> {
        let key = remote.manifest_key();
        let bytes = self
            .blocking(move |target| {
                let (_sess, sftp) = target.connect()?;
                read_remote(&sftp, &target.remote_path(&key))
            })
            .await?;
        Manifest::from_slice(&bytes)
    }

    async fn delete(&self, remote: &RemoteRef) -> Result<()> {
        let keys = [remote.manifest_key(), remote.archive_key()];
        self.blocking(move |target| {
            let (_sess, sftp) = target.connect()?;
            for key in &keys {
                match sftp.unlink(Path::new(&target.remote_path(key))) {
                    Ok(()) => {}
                    Err(e) if is_missing(&e) => {}
                    Err(e) => return Err(network(e)),
                }
            }
            Ok(())
        })
        .await
    }
}
