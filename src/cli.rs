use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "sshdeck")]
#[command(about = "Browse, transfer files to and run scripts on remote machines over SSH")]
#[command(version)]
pub struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Connections file (default: ~/.sshdeck/connections.json)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage saved connections
    Profiles {
        #[command(subcommand)]
        action: Option<ProfileAction>,
    },

    /// Store or delete a secret in the system keychain
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },

    /// List a remote directory (defaults to the connection's home)
    Ls {
        name: String,
        path: Option<String>,
    },

    /// Download a remote file
    Get {
        name: String,
        remote: String,
        local: PathBuf,
    },

    /// Upload a local file
    Put {
        name: String,
        local: PathBuf,
        remote: String,
    },

    /// Delete a remote file
    Rm { name: String, path: String },

    /// Remove an empty remote directory
    Rmdir { name: String, path: String },

    /// Rename a remote path
    #[command(alias = "rename")]
    Mv {
        name: String,
        from: String,
        to: String,
    },

    /// Create a remote directory
    Mkdir { name: String, path: String },

    /// Run a script and stream its output
    Run {
        name: String,
        script: String,
        /// Working directory on the remote side
        #[arg(short = 'd', long, default_value = ".")]
        dir: String,
        /// Extra parameters appended to the script
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        params: Vec<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProfileAction {
    /// List saved connections (default)
    List,

    /// Add or replace a connection
    Add {
        name: String,
        host: String,
        user: String,
        #[arg(short, long, default_value_t = 22)]
        port: u16,
        /// Remote directory used as home
        #[arg(long, default_value = "/")]
        default_dir: String,
        /// Keychain reference of the password
        #[arg(long, conflicts_with = "key", required_unless_present = "key")]
        password_ref: Option<String>,
        /// Private key file
        #[arg(long)]
        key: Option<String>,
        /// Keychain reference of the key passphrase
        #[arg(long, requires = "key")]
        passphrase_ref: Option<String>,
        /// Reject unknown host keys
        #[arg(long)]
        strict: bool,
    },

    /// Remove a connection
    Remove { name: String },
}

#[derive(Subcommand, Debug)]
pub enum SecretAction {
    /// Read a secret from stdin and store it under REF
    Set {
        #[arg(value_name = "REF")]
        credential_ref: String,
    },

    /// Delete the secret stored under REF
    Delete {
        #[arg(value_name = "REF")]
        credential_ref: String,
    },
}
