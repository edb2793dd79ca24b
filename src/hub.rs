//! Remote hub
//!
//! Wires the session pool, the sub-session cache, the transfer engine and
//! the command runner together. Construct one per process and share it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{CredentialStore, PoolSettings, ProfileBook};
use crate::script::CommandRunner;
use crate::sftp::{SubSessionCache, TransferEngine};
use crate::ssh::{Connector, PoolError, Session, SessionPool};

pub struct RemoteHub {
    pool: Arc<SessionPool>,
    cache: Arc<SubSessionCache>,
    transfers: TransferEngine,
    scripts: CommandRunner,
}

impl RemoteHub {
    pub fn new(
        profiles: Arc<ProfileBook>,
        credentials: Arc<dyn CredentialStore>,
        connector: Arc<dyn Connector>,
        settings: PoolSettings,
    ) -> Self {
        let sftp_ttl = Duration::from_secs(settings.sftp_ttl_secs);
        let pool = Arc::new(SessionPool::new(profiles, credentials, connector, settings));
        let cache = Arc::new(SubSessionCache::new(pool.clone(), sftp_ttl));

        Self {
            transfers: TransferEngine::new(cache.clone()),
            scripts: CommandRunner::new(pool.clone()),
            pool,
            cache,
        }
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    pub fn scripts(&self) -> &CommandRunner {
        &self.scripts
    }

    /// Connect with the retry policy from the settings
    pub async fn connect(&self, name: &str) -> Result<Arc<Session>, PoolError> {
        self.pool.connect_default(name).await
    }

    /// Stop the script, drop the cached channel, close the session
    pub async fn disconnect(&self, name: &str) {
        self.scripts.terminate(name);
        self.cache.close(name).await;
        self.pool.disconnect(name).await;
        info!("Disconnected {}", name);
    }

    pub async fn shutdown(&self) {
        self.scripts.terminate_all();
        self.cache.close_all().await;
        self.pool.disconnect_all().await;
        info!("Remote hub shut down");
    }

    /// Evict idle sessions together with their cached channels
    pub async fn sweep_idle(&self) -> Vec<String> {
        let timeout = Duration::from_secs(self.pool.settings().idle_timeout_secs);
        let evicted = self.pool.sweep_idle(timeout).await;
        for name in &evicted {
            self.cache.close(name).await;
        }
        evicted
    }

    /// Periodic `sweep_idle` until the hub is dropped
    pub fn start_idle_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.pool.settings().sweep_interval_secs.max(1));
        let hub: Weak<Self> = Arc::downgrade(self);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                let Some(hub) = hub.upgrade() else {
                    debug!("Remote hub dropped, idle sweeper exiting");
                    break;
                };
                let evicted = hub.sweep_idle().await;
                if !evicted.is_empty() {
                    info!("Idle sweep evicted: {}", evicted.join(", "));
                }
            }
        })
    }
}
