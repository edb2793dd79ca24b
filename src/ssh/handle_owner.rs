//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>`. Everything else talks to
//! it through a cloneable `HandleController` over an mpsc channel, so no lock
//! is ever held across an SSH round trip.
//!
//! The task ends when a disconnect is requested, when every controller is
//! dropped, or when the underlying connection goes away. Once it has ended
//! the command channel is closed, which is what `is_connected` reports.

use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner checks whether the connection dropped underneath it
const LINK_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a session channel (SFTP subsystem or exec)
    ChannelOpenSession {
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    pub fn new(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        Self { cmd_tx }
    }

    /// Open a session channel
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenSession { reply_tx })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController.
pub fn spawn_handle_owner_task(handle: Handle<ClientHandler>, session_id: String) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let handle = handle;
        let mut link_check = tokio::time::interval(LINK_CHECK_INTERVAL);

        info!("Handle owner task started for session {}", session_id);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(HandleCommand::ChannelOpenSession { reply_tx }) => {
                        let result = handle.channel_open_session().await;
                        if reply_tx.send(result).is_err() {
                            warn!("Caller dropped before receiving channel_open_session result");
                        }
                    }
                    Some(HandleCommand::Disconnect) => {
                        info!("Disconnect requested for session {}", session_id);
                        break;
                    }
                    None => {
                        info!("All controllers dropped for session {}", session_id);
                        break;
                    }
                },
                _ = link_check.tick() => {
                    if handle.is_closed() {
                        warn!("Connection closed underneath session {}", session_id);
                        break;
                    }
                }
            }
        }

        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for session {}", session_id);
    });

    HandleController { cmd_tx }
}

/// Close the receiver and fail every queued command with `Disconnect`
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenSession { reply_tx } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {
                debug!("Dropping queued disconnect, already shutting down");
            }
        }
    }
}
