//! Remote script execution
//!
//! Runs `cd <dir> && <script> <params>` on an exec channel of a pooled
//! session and streams its output. There is at most one running command
//! per connection name.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ssh::{ExecEvent, SessionPool, SshError};

pub const FINISHED_MARKER: &str = "--- Script finished ---";
pub const TERMINATED_MARKER: &str = "--- Script terminated ---";

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("Not connected to '{0}'")]
    NotConnected(String),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

/// What to run and where
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRequest {
    pub script: String,
    #[serde(default = "default_exec_dir")]
    pub exec_dir: String,
    #[serde(default)]
    pub params: String,
}

fn default_exec_dir() -> String {
    ".".to_string()
}

impl ScriptRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            exec_dir: default_exec_dir(),
            params: String::new(),
        }
    }

    pub fn in_dir(mut self, exec_dir: impl Into<String>) -> Self {
        self.exec_dir = exec_dir.into();
        self
    }

    pub fn with_params(mut self, params: impl Into<String>) -> Self {
        self.params = params.into();
        self
    }

    /// Shell command line sent to the remote side
    pub fn command(&self) -> String {
        let exec_dir = if self.exec_dir.trim().is_empty() {
            "."
        } else {
            self.exec_dir.as_str()
        };
        let params = self.params.trim();
        if params.is_empty() {
            format!("cd {} && {}", exec_dir, self.script)
        } else {
            format!("cd {} && {} {}", exec_dir, self.script, params)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Synthetic markers, never remote output
    Info,
}

/// One piece of command output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub text: String,
}

impl OutputChunk {
    fn new(stream: OutputStream, text: impl Into<String>) -> Self {
        Self {
            stream,
            text: text.into(),
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptOutcome {
    pub exit_status: Option<u32>,
    pub terminated: bool,
}

struct RunningCommand {
    run_id: u64,
    token: CancellationToken,
}

pub struct CommandRunner {
    pool: Arc<SessionPool>,
    running: DashMap<String, RunningCommand>,
    next_run_id: AtomicU64,
}

impl CommandRunner {
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self {
            pool,
            running: DashMap::new(),
            next_run_id: AtomicU64::new(1),
        }
    }

    /// Run a script and stream its output until the channel closes.
    ///
    /// Starting a run for a name that already has one terminates the old run.
    pub async fn run<F>(
        &self,
        name: &str,
        request: &ScriptRequest,
        mut on_output: F,
    ) -> Result<ScriptOutcome, ScriptError>
    where
        F: FnMut(OutputChunk) + Send,
    {
        let session = self
            .pool
            .get(name)
            .await
            .ok_or_else(|| ScriptError::NotConnected(name.to_string()))?;

        let command = request.command();
        info!("Running on {}: {}", name, command);
        let mut channel = session.transport().open_exec(&command).await?;

        let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self.running.insert(
            name.to_string(),
            RunningCommand {
                run_id,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            warn!("Terminating previous command on {}", name);
            previous.token.cancel();
        }

        let mut exit_status = None;
        let terminated = loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break true,
                event = channel.next_event() => match event {
                    Some(ExecEvent::Stdout(bytes)) => {
                        on_output(OutputChunk::new(OutputStream::Stdout, String::from_utf8_lossy(&bytes)));
                    }
                    Some(ExecEvent::Stderr(bytes)) => {
                        on_output(OutputChunk::new(OutputStream::Stderr, String::from_utf8_lossy(&bytes)));
                    }
                    Some(ExecEvent::Exit(code)) => {
                        debug!("Command on {} exited with {}", name, code);
                        exit_status = Some(code);
                    }
                    None => break false,
                },
            }
        };

        channel.close().await;
        self.running.remove_if(name, |_, running| running.run_id == run_id);

        let marker = if terminated {
            TERMINATED_MARKER.to_string()
        } else {
            match exit_status {
                Some(code) => format!("--- Script finished (exit {}) ---", code),
                None => FINISHED_MARKER.to_string(),
            }
        };
        info!("Command on {} ended: {}", name, marker);
        on_output(OutputChunk::new(OutputStream::Info, marker));

        Ok(ScriptOutcome {
            exit_status,
            terminated,
        })
    }

    /// Stop the running command for `name`. Returns whether one was running.
    pub fn terminate(&self, name: &str) -> bool {
        match self.running.remove(name) {
            Some((_, running)) => {
                running.token.cancel();
                info!("Terminate requested for command on {}", name);
                true
            }
            None => false,
        }
    }

    pub fn terminate_all(&self) {
        let names: Vec<String> = self.running.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            self.terminate(&name);
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.running.contains_key(name)
    }
}
