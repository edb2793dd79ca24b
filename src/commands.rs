//! CLI command dispatch
//!
//! Every remote command connects the named profile, performs one operation
//! and shuts the hub down again. Relative remote paths are taken from the
//! profile's default directory.

use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;

use crate::cli::{Cli, Commands, ProfileAction, SecretAction};
use crate::config::{
    AuthMethod, ChainedCredentials, ConfigStorage, ConnectionProfile, EnvCredentials, Keychain,
    ProfileBook,
};
use crate::hub::RemoteHub;
use crate::script::{OutputStream, ScriptRequest};
use crate::ssh::RusshConnector;

pub async fn dispatch(cli: Cli) -> Result<()> {
    let storage = match cli.config {
        Some(path) => ConfigStorage::with_path(path),
        None => ConfigStorage::new()?,
    };

    match cli.command {
        Commands::Profiles { action } => profiles(&storage, action.unwrap_or(ProfileAction::List)).await,
        Commands::Secret { action } => secret(action),
        remote => {
            let config = storage
                .load()
                .await
                .with_context(|| format!("loading {}", storage.path().display()))?;
            let profiles = Arc::new(ProfileBook::from_config(&config));
            let credentials = ChainedCredentials::new(vec![
                Box::new(EnvCredentials),
                Box::new(Keychain::new()),
            ]);
            let hub = RemoteHub::new(
                profiles,
                Arc::new(credentials),
                Arc::new(RusshConnector::new()),
                config.settings.clone(),
            );

            let result = run_remote(&hub, remote).await;
            hub.shutdown().await;
            result
        }
    }
}

async fn run_remote(hub: &RemoteHub, command: Commands) -> Result<()> {
    match command {
        Commands::Ls { name, path } => {
            hub.connect(&name).await?;
            let path = hub
                .transfers()
                .resolve_path(&name, path.as_deref().unwrap_or(""));
            let entries = hub.transfers().list_directory(&name, &path).await?;
            print_json(&entries)
        }
        Commands::Get {
            name,
            remote,
            local,
        } => {
            hub.connect(&name).await?;
            let local = path_str(&local)?;
            let remote = hub.transfers().resolve_path(&name, &remote);
            let mut progress = progress_printer();
            let outcome = hub
                .transfers()
                .download(&name, &remote, local, Some(&mut progress))
                .await?;
            eprintln!();
            print_json(&outcome)
        }
        Commands::Put {
            name,
            local,
            remote,
        } => {
            hub.connect(&name).await?;
            let local = path_str(&local)?;
            let remote = hub.transfers().resolve_path(&name, &remote);
            let mut progress = progress_printer();
            let outcome = hub
                .transfers()
                .upload(&name, local, &remote, Some(&mut progress))
                .await?;
            eprintln!();
            print_json(&outcome)
        }
        Commands::Rm { name, path } => {
            hub.connect(&name).await?;
            let path = hub.transfers().resolve_path(&name, &path);
            Ok(hub.transfers().delete(&name, &path).await?)
        }
        Commands::Rmdir { name, path } => {
            hub.connect(&name).await?;
            let path = hub.transfers().resolve_path(&name, &path);
            Ok(hub.transfers().rmdir(&name, &path).await?)
        }
        Commands::Mv { name, from, to } => {
            hub.connect(&name).await?;
            let from = hub.transfers().resolve_path(&name, &from);
            let to = hub.transfers().resolve_path(&name, &to);
            Ok(hub.transfers().rename(&name, &from, &to).await?)
        }
        Commands::Mkdir { name, path } => {
            hub.connect(&name).await?;
            let path = hub.transfers().resolve_path(&name, &path);
            Ok(hub.transfers().mkdir(&name, &path).await?)
        }
        Commands::Run {
            name,
            script,
            dir,
            params,
        } => {
            hub.connect(&name).await?;
            let request = ScriptRequest::new(script)
                .in_dir(dir)
                .with_params(params.join(" "));
            let outcome = hub
                .scripts()
                .run(&name, &request, |chunk| match chunk.stream {
                    OutputStream::Stdout => {
                        print!("{}", chunk.text);
                        let _ = std::io::stdout().flush();
                    }
                    OutputStream::Stderr => eprint!("{}", chunk.text),
                    OutputStream::Info => eprintln!("\n{}", chunk.text),
                })
                .await?;
            match outcome.exit_status {
                Some(0) | None => Ok(()),
                Some(code) => bail!("script exited with status {}", code),
            }
        }
        Commands::Profiles { .. } | Commands::Secret { .. } => Ok(()),
    }
}

async fn profiles(storage: &ConfigStorage, action: ProfileAction) -> Result<()> {
    let mut config = storage.load().await?;
    let book = ProfileBook::from_config(&config);

    match action {
        ProfileAction::List => return print_json(&book.snapshot()),
        ProfileAction::Add {
            name,
            host,
            user,
            port,
            default_dir,
            password_ref,
            key,
            passphrase_ref,
            strict,
        } => {
            let auth = match (password_ref, key) {
                (_, Some(key_path)) => AuthMethod::key(key_path, passphrase_ref),
                (Some(credential_ref), None) => AuthMethod::password(credential_ref),
                (None, None) => bail!("either --password-ref or --key is required"),
            };
            let profile = ConnectionProfile {
                name: name.clone(),
                host,
                port,
                user,
                default_dir,
                auth,
                strict_host_key_checking: strict,
            };
            book.upsert(profile)?;
            info!("Saved connection {}", name);
        }
        ProfileAction::Remove { name } => {
            if book.remove(&name).is_none() {
                bail!("no connection named '{}'", name);
            }
            info!("Removed connection {}", name);
        }
    }

    book.store_into(&mut config);
    storage.save(&config).await?;
    Ok(())
}

fn secret(action: SecretAction) -> Result<()> {
    let keychain = Keychain::new();
    match action {
        SecretAction::Set { credential_ref } => {
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            let secret = line.trim_end_matches(['\r', '\n']);
            if secret.is_empty() {
                bail!("empty secret on stdin");
            }
            keychain.store(&credential_ref, secret)?;
        }
        SecretAction::Delete { credential_ref } => keychain.delete(&credential_ref)?,
    }
    Ok(())
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

fn progress_printer() -> impl FnMut(u64, u64) + Send {
    |done, total| {
        let percent = if total == 0 { 100 } else { done * 100 / total };
        eprint!("\r{} / {} bytes ({}%)", done, total, percent);
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
