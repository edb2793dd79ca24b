//! Configuration Management Module
//!
//! Handles persistent storage of connection profiles, pool settings,
//! and credential lookup via the system keychain.

pub mod keychain;
pub mod profiles;
pub mod storage;
pub mod types;

pub use keychain::{ChainedCredentials, CredentialStore, EnvCredentials, Keychain, MemoryCredentials};
pub use profiles::ProfileBook;
pub use storage::{config_dir, connections_file, ConfigStorage, StorageError};
pub use types::{
    AuthMethod, ConfigError, ConfigFile, ConnectionProfile, PoolSettings, CONFIG_VERSION,
};
