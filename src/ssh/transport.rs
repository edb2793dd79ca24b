//! Transport seams
//!
//! The pool and everything above it only see these traits. The russh-backed
//! implementation lives in `client.rs`; tests plug in an in-memory one.

use std::sync::Arc;

use async_trait::async_trait;

use super::error::SshError;
use crate::config::ConnectionProfile;
use crate::sftp::RemoteFs;

/// Secrets resolved for one connect attempt
#[derive(Clone, Default)]
pub struct Secret {
    /// Password, or passphrase of an encrypted key
    pub value: Option<String>,
}

impl Secret {
    pub fn none() -> Self {
        Self { value: None }
    }

    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
        }
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.value.as_deref()
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.value.is_some() { "Secret(***)" } else { "Secret(none)" })
    }
}

/// Opens authenticated sessions
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open and authenticate one session.
    ///
    /// A handle that got past the handshake but failed authentication must be
    /// closed before the error is returned.
    async fn connect(
        &self,
        profile: &ConnectionProfile,
        secret: Secret,
    ) -> Result<Arc<dyn Transport>, SshError>;
}

/// A live authenticated connection
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the underlying connection is still up. Never touches the network.
    fn is_active(&self) -> bool;

    /// Open a file-transfer channel
    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>, SshError>;

    /// Run `command` on a fresh exec channel
    async fn open_exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, SshError>;

    async fn close(&self);
}

/// Output of a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exit(u32),
}

/// A running remote command
#[async_trait]
pub trait ExecChannel: Send {
    /// Next output event, `None` once the channel closed
    async fn next_event(&mut self) -> Option<ExecEvent>;

    async fn close(&mut self);
}
