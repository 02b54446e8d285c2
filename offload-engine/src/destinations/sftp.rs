//! SFTP over libssh2. Every session runs on the blocking thread pool.

use crate::transfer::{file_name, DeleteOutcome, Destination, RemoteObject};
use crate::{OffloadError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, BufWriter};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// libssh2 status for "no such file" on SFTP operations.
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;

#[derive(Clone, Serialize, Deserialize)]
pub struct SftpConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: String,

    #[serde(default)]
    pub password: String,

    /// Private key file; takes precedence over the password when set
    #[serde(default)]
    pub private_key_path: Option<PathBuf>,

    #[serde(default)]
    pub passphrase: Option<String>,

    /// Remote directory receiving the archives
    #[serde(default)]
    pub remote_dir: String,
}

fn default_port() -> u16 {
    22
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            private_key_path: None,
            passphrase: None,
            remote_dir: String::new(),
        }
    }
}

impl std::fmt::Debug for SftpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("remote_dir", &self.remote_dir)
            .finish_non_exhaustive()
    }
}

impl SftpConfig {
    pub fn is_connected(&self) -> bool {
        !self.host.is_empty()
            && !self.username.is_empty()
            && (!self.password.is_empty() || self.private_key_path.is_some())
    }

    fn remote_path(&self, filename: &str) -> PathBuf {
        let dir = if self.remote_dir.is_empty() { "." } else { self.remote_dir.as_str() };
        Path::new(dir).join(filename)
    }
}

#[derive(Debug)]
pub struct SftpDestination {
    id: String,
    name: String,
    config: SftpConfig,
    connect_timeout: Duration,
}

impl SftpDestination {
    pub fn new(id: &str, name: &str, config: SftpConfig, connect_timeout: Duration) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            config,
            connect_timeout,
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.config.is_connected() {
            Ok(())
        } else {
            Err(OffloadError::NotConfigured(format!("{}: host, username and password or key", self.id)))
        }
    }

    /// Run `op` against a fresh SFTP session on the blocking pool.
    async fn with_sftp<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&ssh2::Sftp, &SftpConfig) -> Result<T> + Send + 'static,
    {
        self.ensure_connected()?;
        let config = self.config.clone();
        let timeout = self.connect_timeout;
        tokio::task::spawn_blocking(move || {
            let session = connect(&config, timeout)?;
            let sftp = session.sftp()?;
            op(&sftp, &config)
        })
        .await
        .map_err(|e| OffloadError::Transport(format!("SFTP task failed: {e}")))?
    }
}

fn connect(config: &SftpConfig, timeout: Duration) -> Result<ssh2::Session> {
    use std::net::ToSocketAddrs;

    let addr = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .map_err(|e| OffloadError::Transport(format!("resolve {}: {e}", config.host)))?
        .next()
        .ok_or_else(|| OffloadError::Transport(format!("no address for {}", config.host)))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| OffloadError::Transport(format!("connect {addr}: {e}")))?;

    let mut session = ssh2::Session::new()?;
    session.set_timeout(timeout.as_millis() as u32);
    session.set_tcp_stream(tcp);
    session.handshake()?;

    match &config.private_key_path {
        Some(key) => session.userauth_pubkey_file(&config.username, None, key, config.passphrase.as_deref())?,
        None => session.userauth_password(&config.username, &config.password)?,
    }
    if !session.authenticated() {
        return Err(OffloadError::Transport("SSH authentication failed".into()));
    }
    Ok(session)
}

fn is_missing(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE))
}

#[async_trait]
impl Destination for SftpDestination {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.config.is_connected()
    }

    async fn upload(&self, local_path: &Path, task_id: &str) -> Result<()> {
        let filename = file_name(local_path)?;
        let local = local_path.to_path_buf();
        info!(destination = %self.id, task_id, file = %filename, "Uploading over SFTP");

        let written = self
            .with_sftp(move |sftp, config| {
                let remote = config.remote_path(&filename);
                let mut reader = BufReader::new(std::fs::File::open(&local)?);
                let mut writer = BufWriter::new(sftp.create(&remote)?);
                let n = std::io::copy(&mut reader, &mut writer)?;
                writer.into_inner().map_err(|e| e.into_error())?;
                Ok(n)
            })
            .await?;
        debug!(destination = %self.id, bytes = written, "SFTP upload finished");
        Ok(())
    }

    async fn try_list_remote_backups(&self) -> Result<Vec<RemoteObject>> {
        self.with_sftp(|sftp, config| {
            let dir = config.remote_path("");
            let entries = match sftp.readdir(&dir) {
                Ok(entries) => entries,
                Err(e) if is_missing(&e) => return Ok(Vec::new()),
                Err(e) => return Err(e.into()),
            };
            Ok(entries
                .into_iter()
                .filter(|(_, stat)| stat.is_file())
                .filter_map(|(path, stat)| {
                    let name = path.file_name()?.to_str()?.to_string();
                    Some(RemoteObject {
                        name,
                        size_bytes: stat.size.unwrap_or(0),
                        modified_at: stat.mtime.map(|t| t as i64).unwrap_or(0),
                        id: None,
                    })
                })
                .collect())
        })
        .await
    }

    async fn delete_remote_backup_by_name(&self, filename: &str) -> Result<DeleteOutcome> {
        let name = filename.to_string();
        self.with_sftp(move |sftp, config| match sftp.unlink(&config.remote_path(&name)) {
            Ok(()) => Ok(DeleteOutcome::deleted(&name)),
            Err(e) if is_missing(&e) => Ok(DeleteOutcome::already_absent(&name)),
            Err(e) => Err(e.into()),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_needs_secret() {
        let mut config = SftpConfig {
            host: "backup.example.com".into(),
            username: "backup".into(),
            ..Default::default()
        };
        assert!(!config.is_connected());
        config.private_key_path = Some(PathBuf::from("/home/backup/.ssh/id_ed25519"));
        assert!(config.is_connected());
    }

    #[test]
    fn test_remote_path() {
        let config = SftpConfig {
            remote_dir: "/srv/backups".into(),
            ..Default::default()
        };
        assert_eq!(config.remote_path("a.zip"), PathBuf::from("/srv/backups/a.zip"));
        assert_eq!(SftpConfig::default().remote_path("a.zip"), PathBuf::from("./a.zip"));
    }

    #[test]
    fn test_default_port_from_toml() {
        let config: SftpConfig = toml::from_str("host = \"h\"\nusername = \"u\"\npassword = \"p\"").unwrap();
        assert_eq!(config.port, 22);
        assert!(config.is_connected());
    }

    #[tokio::test]
    async fn test_unconfigured_fails_without_network() {
        let dest = SftpDestination::new("sftp", "SFTP", SftpConfig::default(), Duration::from_secs(1));
        let err = dest.delete_remote_backup_by_name("a.zip").await.unwrap_err();
        assert!(matches!(err, OffloadError::NotConfigured(_)));
    }
}
