//! Credential lookup
//!
//! Profiles only carry an opaque credential reference. The secret behind it
//! comes from one of the stores below; the system keychain is the default.

use std::collections::HashMap;

use keyring::Entry;
use parking_lot::RwLock;

use super::types::ConfigError;

/// Service name for keychain entries
const SERVICE_NAME: &str = "dev.sshdeck";

/// Prefix of environment variables read by [`EnvCredentials`]
const ENV_PREFIX: &str = "SSHDECK_SECRET_";

/// Resolves a credential reference into a secret
pub trait CredentialStore: Send + Sync {
    fn secret(&self, credential_ref: &str) -> Result<String, ConfigError>;
}

/// System keychain backed store
pub struct Keychain {
    service: String,
}

impl Keychain {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    /// Create with custom service name
    pub fn with_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, credential_ref: &str) -> Result<Entry, ConfigError> {
        // Explicit account keeps the keychain identity stable across hosts
        let account = format!("{}@{}", whoami::username(), credential_ref);
        Entry::new(&self.service, &account).map_err(|e| ConfigError::CredentialStore(e.to_string()))
    }

    /// Store a secret under the given reference
    pub fn store(&self, credential_ref: &str, secret: &str) -> Result<(), ConfigError> {
        tracing::info!("Keychain store: service={}, ref={}", self.service, credential_ref);
        self.entry(credential_ref)?
            .set_password(secret)
            .map_err(|e| ConfigError::CredentialStore(e.to_string()))
    }

    /// Delete a stored secret; a missing entry is not an error
    pub fn delete(&self, credential_ref: &str) -> Result<(), ConfigError> {
        match self.entry(credential_ref)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(ConfigError::CredentialStore(e.to_string())),
        }
    }
}

impl Default for Keychain {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for Keychain {
    fn secret(&self, credential_ref: &str) -> Result<String, ConfigError> {
        match self.entry(credential_ref)?.get_password() {
            Ok(secret) => Ok(secret),
            Err(keyring::Error::NoEntry) => {
                Err(ConfigError::MissingCredential(credential_ref.to_string()))
            }
            Err(e) => Err(ConfigError::CredentialStore(e.to_string())),
        }
    }
}

/// Reads `SSHDECK_SECRET_<REF>` variables, for headless use
///
/// The reference is upper-cased and every non-alphanumeric character
/// becomes `_`, so `box1-pw` reads `SSHDECK_SECRET_BOX1_PW`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl EnvCredentials {
    pub fn var_name(credential_ref: &str) -> String {
        let suffix: String = credential_ref
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", ENV_PREFIX, suffix)
    }
}

impl CredentialStore for EnvCredentials {
    fn secret(&self, credential_ref: &str) -> Result<String, ConfigError> {
        std::env::var(Self::var_name(credential_ref))
            .map_err(|_| ConfigError::MissingCredential(credential_ref.to_string()))
    }
}

/// In-process secrets
#[derive(Default)]
pub struct MemoryCredentials {
    secrets: RwLock<HashMap<String, String>>,
}

impl MemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, credential_ref: impl Into<String>, secret: impl Into<String>) {
        self.secrets.write().insert(credential_ref.into(), secret.into());
    }
}

impl CredentialStore for MemoryCredentials {
    fn secret(&self, credential_ref: &str) -> Result<String, ConfigError> {
        self.secrets
            .read()
            .get(credential_ref)
            .cloned()
            .ok_or_else(|| ConfigError::MissingCredential(credential_ref.to_string()))
    }
}

/// Tries each store in order; the first hit wins
pub struct ChainedCredentials {
    stores: Vec<Box<dyn CredentialStore>>,
}

impl ChainedCredentials {
    pub fn new(stores: Vec<Box<dyn CredentialStore>>) -> Self {
        Self { stores }
    }
}

impl CredentialStore for ChainedCredentials {
    fn secret(&self, credential_ref: &str) -> Result<String, ConfigError> {
        let mut last_err = ConfigError::MissingCredential(credential_ref.to_string());
        for store in &self.stores {
            match store.secret(credential_ref) {
                Ok(secret) => return Ok(secret),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }
}
