//! SSHDeck core
//!
//! Session pooling, cached SFTP channels, resumable transfers and remote
//! script execution over SSH.

// Use mimalloc as the global allocator for better performance
// with many short-lived transfer buffers
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod cli;
pub mod commands;
pub mod config;
pub mod hub;
pub mod script;
pub mod sftp;
pub mod ssh;

#[cfg(test)]
mod mock;

pub use hub::RemoteHub;

use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialise tracing on stderr.
///
/// `RUST_LOG` wins over the verbose flag.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(stderr).with_target(false))
        .init();
}
