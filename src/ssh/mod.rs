//! SSH module - connections and the session pool
//!
//! # Features
//! - Password and public key authentication via russh
//! - Host key verification via ~/.ssh/known_hosts
//! - Private key permission checks
//! - Session pool with retry/backoff, liveness lookups and idle eviction

mod client;
mod error;
mod handle_owner;
pub mod key_file;
pub mod pool;
pub mod transport;

pub use client::{ClientHandler, RusshConnector, RusshTransport};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use key_file::check_key_file;
pub use pool::{
    backoff_delay, ConnectOptions, PoolError, Session, SessionInfo, SessionLease, SessionPool,
};
pub use transport::{Connector, ExecChannel, ExecEvent, Secret, Transport};
