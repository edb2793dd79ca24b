//! SSH Client implementation using russh

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PublicKey;
use russh::{Channel, ChannelMsg};
use tracing::{debug, info, warn};

use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use super::transport::{Connector, ExecChannel, ExecEvent, Secret, Transport};
use crate::config::{AuthMethod, ConnectionProfile};
use crate::sftp::{RemoteFs, SftpChannel};

/// Connector backed by russh
#[derive(Debug, Default, Clone, Copy)]
pub struct RusshConnector;

impl RusshConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        profile: &ConnectionProfile,
        secret: Secret,
    ) -> Result<Arc<dyn Transport>, SshError> {
        let addr = format!("{}:{}", profile.host, profile.port);

        info!("Connecting to SSH server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SshError::ConnectionFailed(format!("Failed to resolve address: {}", e)))?
            .next()
            .ok_or_else(|| SshError::ConnectionFailed("No address found".to_string()))?;

        let ssh_config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_max: 3,
            ..Default::default()
        };

        let handler = ClientHandler::new(
            profile.host.clone(),
            profile.port,
            profile.strict_host_key_checking,
        );

        let mut handle = client::connect(Arc::new(ssh_config), socket_addr, handler)
            .await
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;

        debug!("SSH handshake completed for {}", profile.name);

        let outcome = authenticate(&mut handle, profile, &secret).await;
        match outcome {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                // Close the half-open handle before reporting the failure
                let _ = handle
                    .disconnect(russh::Disconnect::ByApplication, "Authentication failed", "en")
                    .await;
                return Err(match outcome {
                    Err(e) => e,
                    _ => SshError::AuthenticationFailed(
                        "Authentication rejected by server".to_string(),
                    ),
                });
            }
        }

        info!("SSH authentication successful for {}", profile.name);

        let session_id = uuid::Uuid::new_v4().to_string();
        let controller = spawn_handle_owner_task(handle, session_id.clone());

        Ok(Arc::new(RusshTransport {
            controller,
            session_id,
        }))
    }
}

async fn authenticate(
    handle: &mut client::Handle<ClientHandler>,
    profile: &ConnectionProfile,
    secret: &Secret,
) -> Result<bool, SshError> {
    let result = match &profile.auth {
        AuthMethod::Password { .. } => {
            let password = secret.as_deref().unwrap_or_default();
            handle
                .authenticate_password(&profile.user, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
        AuthMethod::Key { key_path, .. } => {
            let key = russh::keys::load_secret_key(key_path, secret.as_deref())
                .map_err(|e| SshError::KeyError(e.to_string()))?;

            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);

            handle
                .authenticate_publickey(&profile.user, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
    };

    Ok(result.success())
}

/// Client handler for russh callbacks
///
/// Verifies host keys against ~/.ssh/known_hosts. Unknown keys are learned
/// unless strict checking is on; changed keys are always rejected.
pub struct ClientHandler {
    host: String,
    port: u16,
    strict: bool,
    /// `None` is the user's default known_hosts file
    known_hosts: Option<PathBuf>,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, strict: bool) -> Self {
        Self {
            host,
            port,
            strict,
            known_hosts: None,
        }
    }

    /// Check and learn against `path` instead of ~/.ssh/known_hosts
    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    fn lookup(&self, key: &PublicKey) -> Result<bool, russh::keys::Error> {
        match &self.known_hosts {
            Some(path) => russh::keys::check_known_hosts_path(&self.host, self.port, key, path),
            None => russh::keys::check_known_hosts(&self.host, self.port, key),
        }
    }

    fn learn(&self, key: &PublicKey) -> Result<(), russh::keys::Error> {
        match &self.known_hosts {
            Some(path) => {
                russh::keys::known_hosts::learn_known_hosts_path(&self.host, self.port, key, path)
            }
            None => russh::keys::known_hosts::learn_known_hosts(&self.host, self.port, key),
        }
    }

    /// Host key policy, shared by the russh callback and tests
    fn verify_host_key(&self, server_public_key: &PublicKey) -> Result<bool, SshError> {
        match self.lookup(server_public_key) {
            Ok(true) => {
                info!("Host key verified for {}:{}", self.host, self.port);
                Ok(true)
            }
            Ok(false) if self.strict => {
                warn!(
                    "Unknown host key for {}:{}. Strict mode enabled, rejecting.",
                    self.host, self.port
                );
                Err(SshError::ConnectionFailed(format!(
                    "Host key verification failed: unknown host {}:{}",
                    self.host, self.port
                )))
            }
            Ok(false) => {
                info!("New host {}:{}, adding to known_hosts", self.host, self.port);
                if let Err(e) = self.learn(server_public_key) {
                    warn!("Failed to save host key: {}", e);
                }
                Ok(true)
            }
            Err(russh::keys::Error::KeyChanged { line }) => {
                warn!(
                    "HOST KEY CHANGED for {}:{} (known_hosts line {})!",
                    self.host, self.port, line
                );
                Err(SshError::ConnectionFailed(format!(
                    "Host key for {}:{} has changed (known_hosts line {}). \
                     Remove the old key if the change is legitimate.",
                    self.host, self.port, line
                )))
            }
            Err(e) => Err(SshError::KeyError(e.to_string())),
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.verify_host_key(server_public_key)
    }
}

/// Authenticated russh connection, driven through its handle owner task
pub struct RusshTransport {
    controller: HandleController,
    session_id: String,
}

#[async_trait]
impl Transport for RusshTransport {
    fn is_active(&self) -> bool {
        self.controller.is_connected()
    }

    async fn open_sftp(&self) -> Result<Arc<dyn RemoteFs>, SshError> {
        let channel = SftpChannel::open(&self.controller, &self.session_id).await?;
        Ok(Arc::new(channel))
    }

    async fn open_exec(&self, command: &str) -> Result<Box<dyn ExecChannel>, SshError> {
        let channel = self.controller.open_session_channel().await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshError::ChannelError(format!("Exec request failed: {}", e)))?;

        debug!("Exec channel opened for session {}", self.session_id);
        Ok(Box::new(RusshExec { channel }))
    }

    async fn close(&self) {
        self.controller.disconnect().await;
    }
}

struct RusshExec {
    channel: Channel<Msg>,
}

#[async_trait]
impl ExecChannel for RusshExec {
    async fn next_event(&mut self) -> Option<ExecEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { data } => return Some(ExecEvent::Stdout(data.to_vec())),
                // ext 1 is SSH_EXTENDED_DATA_STDERR
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    return Some(ExecEvent::Stderr(data.to_vec()))
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Some(ExecEvent::Exit(exit_status))
                }
                ChannelMsg::Close => return None,
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.channel.eof().await;
        let _ = self.channel.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // github.com's published ed25519 host key
    const HOST_KEY: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    fn host_key() -> PublicKey {
        PublicKey::from_openssh(HOST_KEY).unwrap()
    }

    #[test]
    fn test_unknown_host_is_learned() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        let handler = ClientHandler::new("10.0.0.5".to_string(), 2222, false)
            .with_known_hosts(&known_hosts);

        assert!(handler.verify_host_key(&host_key()).unwrap());

        let contents = std::fs::read_to_string(&known_hosts).unwrap();
        assert!(contents.contains("10.0.0.5"));
        // Now known, so even strict checking accepts it
        let strict = ClientHandler::new("10.0.0.5".to_string(), 2222, true)
            .with_known_hosts(&known_hosts);
        assert!(strict.verify_host_key(&host_key()).unwrap());
    }

    #[test]
    fn test_strict_rejects_unknown_host() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        std::fs::write(&known_hosts, "").unwrap();
        let handler = ClientHandler::new("10.0.0.6".to_string(), 22, true)
            .with_known_hosts(&known_hosts);

        assert!(matches!(
            handler.verify_host_key(&host_key()),
            Err(SshError::ConnectionFailed(_))
        ));
        assert_eq!(std::fs::read_to_string(&known_hosts).unwrap(), "");
    }
}
