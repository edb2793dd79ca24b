//! SFTP file management module
//!
//! Provides remote file browsing, resumable upload/download and simple
//! remote filesystem mutations over cached SFTP channels.

pub mod cache;
pub mod channel;
pub mod engine;
pub mod error;
pub mod path_utils;
pub mod types;

pub use cache::SubSessionCache;
pub use channel::{RemoteFs, RemoteReader, RemoteWriter, SftpChannel};
pub use engine::{ProgressFn, TransferEngine};
pub use error::SftpError;
pub use path_utils::{join_remote_path, normalize_remote_path, parent_remote_path};
pub use types::*;
