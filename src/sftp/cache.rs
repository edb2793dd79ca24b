//! Sub-session cache
//!
//! Keeps one file-transfer channel per connection name so rapid operations
//! (directory refreshes, multi-file transfers) skip the subsystem handshake.
//! A channel is reused only while its parent session is the pool's current
//! one, it is younger than the TTL and it passes a health check.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::channel::RemoteFs;
use super::error::SftpError;
use crate::ssh::{Session, SessionLease, SessionPool};

struct CachedChannel {
    /// Session the channel was opened from
    session_id: String,
    channel: Arc<dyn RemoteFs>,
    cached_at: Instant,
}

type Slot = Arc<Mutex<Option<CachedChannel>>>;

/// Per-name cache of SFTP channels
pub struct SubSessionCache {
    pool: Arc<SessionPool>,
    ttl: Duration,
    slots: DashMap<String, Slot>,
}

impl SubSessionCache {
    pub fn new(pool: Arc<SessionPool>, ttl: Duration) -> Self {
        Self {
            pool,
            ttl,
            slots: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    fn slot(&self, name: &str) -> Slot {
        self.slots.entry(name.to_string()).or_default().value().clone()
    }

    fn existing_slot(&self, name: &str) -> Option<Slot> {
        self.slots.get(name).map(|slot| slot.value().clone())
    }

    /// A usable channel for `name`.
    ///
    /// Never connects: the caller must have connected the name first.
    pub async fn acquire(&self, name: &str) -> Result<Arc<dyn RemoteFs>, SftpError> {
        let (channel, _session) = self.acquire_with_session(name).await?;
        Ok(channel)
    }

    /// Like [`acquire`](Self::acquire), also leasing the parent session so
    /// the idle sweep leaves it alone until the lease is dropped
    pub async fn acquire_leased(
        &self,
        name: &str,
    ) -> Result<(Arc<dyn RemoteFs>, SessionLease), SftpError> {
        let (channel, session) = self.acquire_with_session(name).await?;
        Ok((channel, session.lease()))
    }

    async fn acquire_with_session(
        &self,
        name: &str,
    ) -> Result<(Arc<dyn RemoteFs>, Arc<Session>), SftpError> {
        let slot = self.slot(name);
        let mut guard = slot.lock().await;

        let Some(session) = self.pool.get(name).await else {
            if let Some(stale) = guard.take() {
                stale.channel.close().await;
            }
            return Err(SftpError::NotConnected(name.to_string()));
        };

        if let Some(cached) = guard.as_ref() {
            let fresh = cached.session_id == session.id && cached.cached_at.elapsed() < self.ttl;
            if fresh && cached.channel.health_check().await {
                debug!("Reusing cached SFTP channel for {}", name);
                return Ok((cached.channel.clone(), session));
            }
        }
        if let Some(stale) = guard.take() {
            debug!("Discarding stale SFTP channel for {}", name);
            stale.channel.close().await;
        }

        let channel = session.transport().open_sftp().await?;
        info!("SFTP channel opened for {} (session {})", name, session.id);

        *guard = Some(CachedChannel {
            session_id: session.id.clone(),
            channel: channel.clone(),
            cached_at: Instant::now(),
        });
        Ok((channel, session))
    }

    /// Close the cached channel for `name`, if any
    pub async fn close(&self, name: &str) {
        let Some(slot) = self.existing_slot(name) else {
            return;
        };
        let cached = slot.lock().await.take();
        if let Some(cached) = cached {
            cached.channel.close().await;
            debug!("SFTP channel for {} closed", name);
        }
    }

    pub async fn close_all(&self) {
        let names: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        for name in names {
            self.close(&name).await;
        }
    }

    /// Number of cached channels, busy slots excluded
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .map(|guard| guard.is_some())
                    .unwrap_or(false)
            })
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
