//! SFTP Error types

use thiserror::Error;

use crate::ssh::SshError;

#[derive(Error, Debug)]
pub enum SftpError {
    #[error("Not connected: {0}")]
    NotConnected(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transfer of {path} failed: {message}")]
    Transfer { path: String, message: String },

    #[error("{op} {path} failed: {message}")]
    RemoteOperation {
        op: &'static str,
        path: String,
        message: String,
    },

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("SFTP protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl SftpError {
    pub fn transfer(path: &str, err: impl std::fmt::Display) -> Self {
        SftpError::Transfer {
            path: path.to_string(),
            message: err.to_string(),
        }
    }

    pub fn remote(op: &'static str, path: &str, err: impl std::fmt::Display) -> Self {
        SftpError::RemoteOperation {
            op,
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

impl From<SshError> for SftpError {
    fn from(err: SshError) -> Self {
        match err {
            SshError::Disconnected => SftpError::NotConnected("connection closed".to_string()),
            other => SftpError::ChannelError(other.to_string()),
        }
    }
}
