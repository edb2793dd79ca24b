//! Session Pool
//!
//! Owns at most one live `Session` per connection name.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  SessionPool                                             │
//! │  slots: DashMap<name, Arc<Mutex<Option<Arc<Session>>>>>  │
//! │    ├── "box1" ──► Session { id, transport, last_used }   │
//! │    └── "box2" ──► None (disconnected or evicted)         │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Each name has its own async lock, so a slow handshake against one host
//! never blocks lookups against another. Slots are created on first connect
//! and never removed; an empty slot simply holds `None`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::key_file::check_key_file;
use super::transport::{Connector, Secret, Transport};
use crate::config::{AuthMethod, ConfigError, ConnectionProfile, CredentialStore, PoolSettings, ProfileBook};

/// Pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to connect '{name}' after {attempts} attempt(s): {source}")]
    Connection {
        name: String,
        attempts: u32,
        #[source]
        source: SshError,
    },
}

/// A live authenticated connection to one named target
pub struct Session {
    /// Unique id, changes on every reconnect
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    transport: Arc<dyn Transport>,
    last_used: parking_lot::Mutex<Instant>,
    leases: AtomicUsize,
}

impl Session {
    fn new(name: &str, transport: Arc<dyn Transport>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
            transport,
            last_used: parking_lot::Mutex::new(Instant::now()),
            leases: AtomicUsize::new(0),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Flag inspection only, never a round trip
    pub fn is_alive(&self) -> bool {
        self.transport.is_active()
    }

    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Mark the session busy until the lease is dropped
    pub fn lease(self: &Arc<Self>) -> SessionLease {
        self.leases.fetch_add(1, Ordering::SeqCst);
        self.touch();
        SessionLease {
            session: self.clone(),
        }
    }

    /// Whether a long-running operation holds a lease
    pub fn is_busy(&self) -> bool {
        self.leases.load(Ordering::SeqCst) > 0
    }

    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_used())
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            id: self.id.clone(),
            created_at: self.created_at,
            idle_secs: self.idle_for().as_secs(),
            alive: self.is_alive(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Keeps a session out of the idle sweep for as long as it lives.
///
/// Dropping the lease counts as a use of the session.
pub struct SessionLease {
    session: Arc<Session>,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.session.touch();
        self.session.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serializable session snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub name: String,
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub alive: bool,
}

/// Retry policy of a single connect call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Authentication attempts, 0 behaves like 1
    pub max_retries: u32,
    pub per_attempt_timeout: Duration,
    /// Delay after the first failure, doubled after every further one
    pub base_delay: Duration,
}

impl From<&PoolSettings> for ConnectOptions {
    fn from(settings: &PoolSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            per_attempt_timeout: Duration::from_secs(settings.connect_timeout_secs),
            base_delay: Duration::from_millis(settings.base_delay_ms),
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from(&PoolSettings::default())
    }
}

/// Delay slept after the failed attempt `attempt` (0-based)
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

type Slot = Arc<Mutex<Option<Arc<Session>>>>;

/// Pool of live sessions keyed by connection name
pub struct SessionPool {
    profiles: Arc<ProfileBook>,
    credentials: Arc<dyn CredentialStore>,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    slots: DashMap<String, Slot>,
}

impl SessionPool {
    pub fn new(
        profiles: Arc<ProfileBook>,
        credentials: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            profiles,
            credentials,
            connector,
            settings,
            slots: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    pub fn profiles(&self) -> &Arc<ProfileBook> {
        &self.profiles
    }

    fn slot(&self, name: &str) -> Slot {
        self.slots.entry(name.to_string()).or_default().value().clone()
    }

    fn existing_slot(&self, name: &str) -> Option<Slot> {
        self.slots.get(name).map(|slot| slot.value().clone())
    }

    fn all_slots(&self) -> Vec<(String, Slot)> {
        self.slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Connect using the retry policy from the pool settings
    pub async fn connect_default(&self, name: &str) -> Result<Arc<Session>, PoolError> {
        self.connect(name, ConnectOptions::from(&self.settings)).await
    }

    /// Return the live session for `name`, or authenticate a new one.
    ///
    /// Failed attempts are retried with exponential backoff. Configuration
    /// problems fail immediately.
    pub async fn connect(
        &self,
        name: &str,
        options: ConnectOptions,
    ) -> Result<Arc<Session>, PoolError> {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;

        if let Some(session) = guard.as_ref() {
            if session.is_alive() {
                session.touch();
                debug!("Reusing live session {} for {}", session.id, name);
                return Ok(session.clone());
            }
        }
        if let Some(stale) = guard.take() {
            warn!("Session {} for {} is dead, reconnecting", stale.id, name);
            stale.transport.close().await;
        }

        let profile = self.profiles.require(name)?;
        profile.validate()?;
        if let AuthMethod::Key { key_path, .. } = &profile.auth {
            check_key_file(key_path)?;
        }
        let secret = self.resolve_secret(&profile)?;

        let attempts = options.max_retries.max(1);
        let mut last_error = SshError::Disconnected;

        for attempt in 0..attempts {
            debug!(
                "Connecting {} ({}), attempt {}/{}",
                name,
                profile.target(),
                attempt + 1,
                attempts
            );

            let outcome = tokio::time::timeout(
                options.per_attempt_timeout,
                self.connector.connect(&profile, secret.clone()),
            )
            .await;

            match outcome {
                Ok(Ok(transport)) => {
                    let session = Arc::new(Session::new(name, transport));
                    info!("Session {} established for {}", session.id, name);
                    *guard = Some(session.clone());
                    return Ok(session);
                }
                Ok(Err(e)) => {
                    warn!("Connect attempt {} for {} failed: {}", attempt + 1, name, e);
                    last_error = e;
                }
                Err(_) => {
                    warn!(
                        "Connect attempt {} for {} timed out after {:?}",
                        attempt + 1,
                        name,
                        options.per_attempt_timeout
                    );
                    last_error = SshError::Timeout(format!(
                        "no response within {:?}",
                        options.per_attempt_timeout
                    ));
                }
            }

            if attempt + 1 < attempts {
                let delay = backoff_delay(options.base_delay, attempt);
                debug!("Retrying {} in {:?}", name, delay);
                tokio::time::sleep(delay).await;
            }
        }

        Err(PoolError::Connection {
            name: name.to_string(),
            attempts,
            source: last_error,
        })
    }

    fn resolve_secret(&self, profile: &ConnectionProfile) -> Result<Secret, ConfigError> {
        match &profile.auth {
            AuthMethod::Password { credential_ref } => {
                Ok(Secret::new(self.credentials.secret(credential_ref)?))
            }
            AuthMethod::Key {
                passphrase_ref: Some(passphrase_ref),
                ..
            } => Ok(Secret::new(self.credentials.secret(passphrase_ref)?)),
            AuthMethod::Key { .. } => Ok(Secret::none()),
        }
    }

    /// Live session for `name`, if any. Never connects.
    ///
    /// A dead session is evicted on the spot. A live one counts as used.
    pub async fn get(&self, name: &str) -> Option<Arc<Session>> {
        let slot = self.existing_slot(name)?;
        let mut guard = slot.lock().await;

        match guard.as_ref() {
            Some(session) if session.is_alive() => {
                session.touch();
                Some(session.clone())
            }
            Some(_) => {
                if let Some(dead) = guard.take() {
                    info!("Evicting dead session {} for {}", dead.id, name);
                    dead.transport.close().await;
                }
                None
            }
            None => None,
        }
    }

    /// Close and forget the session for `name`. Idempotent.
    pub async fn disconnect(&self, name: &str) {
        let Some(slot) = self.existing_slot(name) else {
            return;
        };
        let session = slot.lock().await.take();
        if let Some(session) = session {
            session.transport.close().await;
            info!("Session {} for {} disconnected", session.id, name);
        }
    }

    pub async fn disconnect_all(&self) {
        for (name, _) in self.all_slots() {
            self.disconnect(&name).await;
        }
    }

    /// Evict every session unused for longer than `timeout`.
    ///
    /// Slots locked by an in-flight connect and leased sessions are busy and
    /// skipped. Returns the
    /// evicted names.
    pub async fn sweep_idle(&self, timeout: Duration) -> Vec<String> {
        let mut evicted = Vec::new();

        for (name, slot) in self.all_slots() {
            let Ok(mut guard) = slot.try_lock() else {
                debug!("Skipping busy slot {} during idle sweep", name);
                continue;
            };

            let idle = match guard.as_ref() {
                Some(session) if session.is_busy() => {
                    debug!("Session {} for {} is leased, not idle", session.id, name);
                    false
                }
                Some(session) => session.idle_for() > timeout,
                None => false,
            };
            if !idle {
                continue;
            }

            if let Some(session) = guard.take() {
                info!(
                    "Session {} for {} idle for {:?}, evicting",
                    session.id,
                    name,
                    session.idle_for()
                );
                session.transport.close().await;
                evicted.push(name);
            }
        }

        evicted
    }

    /// Run `sweep_idle` every `interval` until the pool is dropped
    pub fn spawn_idle_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else {
                    debug!("Session pool dropped, idle sweeper exiting");
                    break;
                };
                let evicted = pool.sweep_idle(timeout).await;
                if !evicted.is_empty() {
                    info!("Idle sweep evicted {} session(s)", evicted.len());
                }
            }
        })
    }

    /// Snapshot of every held session, busy slots excluded
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .all_slots()
            .into_iter()
            .filter_map(|(_, slot)| {
                let guard = slot.try_lock().ok()?;
                guard.as_ref().map(|session| session.info())
            })
            .collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        sessions
    }
}
