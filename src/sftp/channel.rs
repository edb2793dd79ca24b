//! File-transfer channel
//!
//! `RemoteFs` is the only surface the cache and the transfer engine use.
//! `SftpChannel` implements it on top of a russh-sftp session.

use std::io::SeekFrom;
use std::pin::Pin;

use async_trait::async_trait;
use russh_sftp::client::error::Error as SftpErrorInner;
use russh_sftp::client::fs::Metadata;
use russh_sftp::client::SftpSession as RusshSftpSession;
use russh_sftp::protocol::{OpenFlags, StatusCode};
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite};
use tracing::{debug, info};

use super::error::SftpError;
use super::types::{RemoteEntry, RemoteStat};
use crate::ssh::{HandleController, SshError};

pub type RemoteReader = Pin<Box<dyn AsyncRead + Send>>;
pub type RemoteWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Remote filesystem operations over one channel
#[async_trait]
pub trait RemoteFs: Send + Sync {
    /// Entries of `path`, `.` and `..` excluded
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError>;

    /// Attributes of `path`, `None` if it does not exist
    async fn lookup(&self, path: &str) -> Result<Option<RemoteStat>, SftpError>;

    /// Open for reading, positioned at `offset`
    async fn open_read(&self, path: &str, offset: u64) -> Result<RemoteReader, SftpError>;

    /// Open for writing. `append` keeps existing content and writes at the
    /// end; otherwise the file is created or truncated.
    async fn open_write(&self, path: &str, append: bool) -> Result<RemoteWriter, SftpError>;

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError>;

    async fn remove_file(&self, path: &str) -> Result<(), SftpError>;

    /// Remove an empty directory
    async fn remove_dir(&self, path: &str) -> Result<(), SftpError>;

    async fn create_dir(&self, path: &str) -> Result<(), SftpError>;

    /// Cheap liveness check before reuse
    async fn health_check(&self) -> bool;

    async fn close(&self);
}

/// SFTP subsystem channel
pub struct SftpChannel {
    sftp: RusshSftpSession,
    session_id: String,
}

impl SftpChannel {
    /// Open the `sftp` subsystem on a fresh session channel
    pub async fn open(controller: &HandleController, session_id: &str) -> Result<Self, SshError> {
        info!("Opening SFTP subsystem for session {}", session_id);

        let channel = controller.open_session_channel().await?;

        channel.request_subsystem(true, "sftp").await.map_err(|e| {
            SshError::ChannelError(format!("Failed to request SFTP subsystem: {}", e))
        })?;

        let sftp = RusshSftpSession::new(channel.into_stream())
            .await
            .map_err(|e| SshError::ChannelError(format!("SFTP handshake failed: {}", e)))?;

        info!("SFTP subsystem opened for session {}", session_id);

        Ok(Self {
            sftp,
            session_id: session_id.to_string(),
        })
    }
}

fn to_stat(metadata: &Metadata) -> RemoteStat {
    RemoteStat {
        size: metadata.size.unwrap_or(0),
        modified_at: metadata.mtime.map(u64::from).unwrap_or(0),
        mode: metadata.permissions.unwrap_or(0),
        is_dir: metadata.is_dir(),
    }
}

fn is_not_found(err: &SftpErrorInner) -> bool {
    matches!(err, SftpErrorInner::Status(status) if matches!(status.status_code, StatusCode::NoSuchFile))
}

/// Map SFTP errors to our error type
fn map_sftp_error(err: SftpErrorInner, path: &str) -> SftpError {
    match &err {
        SftpErrorInner::Status(status) => match status.status_code {
            StatusCode::NoSuchFile => SftpError::FileNotFound(path.to_string()),
            StatusCode::PermissionDenied => SftpError::PermissionDenied(path.to_string()),
            _ => SftpError::ProtocolError(err.to_string()),
        },
        SftpErrorInner::IO(msg) => SftpError::ChannelError(msg.clone()),
        _ => SftpError::ProtocolError(err.to_string()),
    }
}

#[async_trait]
impl RemoteFs for SftpChannel {
    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, SftpError> {
        let entries = self
            .sftp
            .read_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))?;

        Ok(entries
            .filter(|entry| {
                let name = entry.file_name();
                name != "." && name != ".."
            })
            .map(|entry| RemoteEntry {
                stat: to_stat(&entry.metadata()),
                name: entry.file_name(),
            })
            .collect())
    }

    async fn lookup(&self, path: &str) -> Result<Option<RemoteStat>, SftpError> {
        match self.sftp.metadata(path).await {
            Ok(metadata) => Ok(Some(to_stat(&metadata))),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(map_sftp_error(e, path)),
        }
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<RemoteReader, SftpError> {
        let mut file = self.sftp.open(path).await.map_err(|e| map_sftp_error(e, path))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset)).await?;
            debug!("Seeked remote file {} to offset {}", path, offset);
        }
        Ok(Box::pin(file))
    }

    async fn open_write(&self, path: &str, append: bool) -> Result<RemoteWriter, SftpError> {
        let file = if append {
            let mut file = self
                .sftp
                .open_with_flags(path, OpenFlags::WRITE | OpenFlags::APPEND)
                .await
                .map_err(|e| map_sftp_error(e, path))?;
            // Servers that ignore APPEND still get the right write offset
            let end = file.seek(SeekFrom::End(0)).await?;
            debug!("Appending to remote file {} at offset {}", path, end);
            file
        } else {
            self.sftp.create(path).await.map_err(|e| map_sftp_error(e, path))?
        };
        Ok(Box::pin(file))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.sftp
            .rename(from, to)
            .await
            .map_err(|e| map_sftp_error(e, from))
    }

    async fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_file(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .remove_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn create_dir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .create_dir(path)
            .await
            .map_err(|e| map_sftp_error(e, path))
    }

    async fn health_check(&self) -> bool {
        self.sftp.read_dir(".").await.is_ok()
    }

    async fn close(&self) {
        if let Err(e) = self.sftp.close().await {
            debug!("SFTP close for session {} failed: {}", self.session_id, e);
        }
    }
}
