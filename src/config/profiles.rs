//! In-memory profile book shared by the pool and the transfer engine

use std::collections::BTreeMap;

use parking_lot::RwLock;

use super::types::{ConfigError, ConfigFile, ConnectionProfile};

/// Thread-safe view of the saved connection profiles
#[derive(Default)]
pub struct ProfileBook {
    profiles: RwLock<BTreeMap<String, ConnectionProfile>>,
}

impl ProfileBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a loaded config file, skipping invalid entries
    pub fn from_config(config: &ConfigFile) -> Self {
        let book = Self::new();
        for (key, profile) in &config.connections {
            // The map key is authoritative for the name
            let mut profile = profile.clone();
            profile.name = key.clone();
            if let Err(e) = book.upsert(profile) {
                tracing::warn!("Skipping connection '{}': {}", key, e);
            }
        }
        book
    }

    /// Insert or replace a profile after validating it
    pub fn upsert(&self, profile: ConnectionProfile) -> Result<(), ConfigError> {
        profile.validate()?;
        self.profiles.write().insert(profile.name.clone(), profile);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<ConnectionProfile> {
        self.profiles.write().remove(name)
    }

    pub fn get(&self, name: &str) -> Option<ConnectionProfile> {
        self.profiles.read().get(name).cloned()
    }

    /// Like [`get`](Self::get) but a missing profile is an error
    pub fn require(&self, name: &str) -> Result<ConnectionProfile, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.read().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<ConnectionProfile> {
        self.profiles.read().values().cloned().collect()
    }

    /// Write the profiles back into a config file
    pub fn store_into(&self, config: &mut ConfigFile) {
        config.connections = self.profiles.read().clone();
    }
}
