//! Connection profile and pool settings types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Current config file version
pub const CONFIG_VERSION: u32 = 1;

/// Configuration errors
///
/// Surfaced immediately and never retried.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Connection profile not found: {0}")]
    UnknownProfile(String),

    #[error("Invalid connection profile '{name}': {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("SSH key not found at path: {0}")]
    MissingKeyFile(String),

    #[error("SSH key {path} has insecure permissions {mode:o} (expected 600 or 400)")]
    InsecureKeyPermissions { path: String, mode: u32 },

    #[error("No secret stored for credential reference: {0}")]
    MissingCredential(String),

    #[error("Credential store error: {0}")]
    CredentialStore(String),
}

/// Authentication method of a saved connection
///
/// Serialized flat into the profile, tagged by `authMethod`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "authMethod", rename_all = "lowercase")]
pub enum AuthMethod {
    /// Password looked up through the credential store
    Password {
        #[serde(rename = "credentialRef")]
        credential_ref: String,
    },

    /// Private key file, optionally encrypted
    Key {
        #[serde(rename = "keyPath")]
        key_path: String,
        /// Credential reference for the key passphrase
        #[serde(
            rename = "passphraseRef",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        passphrase_ref: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(credential_ref: impl Into<String>) -> Self {
        Self::Password {
            credential_ref: credential_ref.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase_ref: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase_ref,
        }
    }

    /// Short label used in logs and listings
    pub fn label(&self) -> &'static str {
        match self {
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } => "key",
        }
    }
}

/// A saved connection target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProfile {
    /// Unique connection name
    pub name: String,

    /// Remote host address
    pub host: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub user: String,

    /// Remote directory used for "home" navigation
    #[serde(default = "default_dir")]
    pub default_dir: String,

    /// Authentication method
    #[serde(flatten)]
    pub auth: AuthMethod,

    /// Reject unknown host keys instead of learning them
    #[serde(default)]
    pub strict_host_key_checking: bool,
}

fn default_port() -> u16 {
    22
}

fn default_dir() -> String {
    "/".to_string()
}

impl ConnectionProfile {
    /// Create a profile with password authentication
    pub fn with_password(
        name: impl Into<String>,
        host: impl Into<String>,
        user: impl Into<String>,
        credential_ref: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            user: user.into(),
            default_dir: default_dir(),
            auth: AuthMethod::password(credential_ref),
            strict_host_key_checking: false,
        }
    }

    /// Create a profile with key authentication
    pub fn with_key(
        name: impl Into<String>,
        host: impl Into<String>,
        user: impl Into<String>,
        key_path: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            user: user.into(),
            default_dir: default_dir(),
            auth: AuthMethod::key(key_path, None),
            strict_host_key_checking: false,
        }
    }

    /// Check that every required field is present
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidProfile {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("connection name is required"));
        }
        if self.host.trim().is_empty() {
            return Err(invalid("host is required"));
        }
        if self.user.trim().is_empty() {
            return Err(invalid("user is required"));
        }
        if self.port == 0 {
            return Err(invalid("port must be non-zero"));
        }
        match &self.auth {
            AuthMethod::Password { credential_ref } if credential_ref.trim().is_empty() => {
                Err(invalid("password authentication requires a credential reference"))
            }
            AuthMethod::Key { key_path, .. } if key_path.trim().is_empty() => {
                Err(invalid("key authentication requires a key path"))
            }
            _ => Ok(()),
        }
    }

    /// `user@host:port`, for logs
    pub fn target(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }
}

/// Session pool and transfer cache tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSettings {
    /// Authentication attempts per connect
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds, doubled on every retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Timeout of a single connect attempt in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Sessions unused for longer than this are evicted
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Maximum age of a cached SFTP channel
    #[serde(default = "default_sftp_ttl_secs")]
    pub sftp_ttl_secs: u64,

    /// How often the idle sweeper runs
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    5 * 60
}

fn default_sftp_ttl_secs() -> u64 {
    5 * 60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            sftp_ttl_secs: default_sftp_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// On-disk configuration file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "current_version")]
    pub version: u32,

    #[serde(default)]
    pub settings: PoolSettings,

    /// Connection name -> profile
    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionProfile>,
}

fn current_version() -> u32 {
    CONFIG_VERSION
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            settings: PoolSettings::default(),
            connections: BTreeMap::new(),
        }
    }
}
