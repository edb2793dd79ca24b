//! Transfer engine
//!
//! Directory listing, resumable chunked transfers and single-call remote
//! mutations, all on channels from the sub-session cache.
//!
//! # Transfers
//! 1. Data goes to `<dest>.part` (local for downloads, remote for uploads)
//! 2. A partial strictly smaller than the source is resumed from its end,
//!    anything else starts over
//! 3. Once every byte arrived, the partial is renamed to its final name. An
//!    upload moves an existing destination aside first and restores it if
//!    the rename fails
//! 4. On any failure the partial is deleted before the error is returned

use std::io::SeekFrom;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::cache::SubSessionCache;
use super::channel::RemoteFs;
use super::error::SftpError;
use super::path_utils::{join_remote_path, normalize_remote_path};
use super::types::{
    sort_entries, FileEntry, RemoteEntry, TransferDirection, TransferOutcome, TransferPhase,
    TransferTask, BACKUP_SUFFIX,
};

/// Called with `(transferred, total)` after every chunk
pub type ProgressFn<'a> = Option<&'a mut (dyn FnMut(u64, u64) + Send)>;

pub struct TransferEngine {
    cache: Arc<SubSessionCache>,
}

impl TransferEngine {
    pub fn new(cache: Arc<SubSessionCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<SubSessionCache> {
        &self.cache
    }

    /// Entries of `path`, directories first, then case-insensitive by name
    pub async fn list_directory(&self, name: &str, path: &str) -> Result<Vec<FileEntry>, SftpError> {
        let channel = self.cache.acquire(name).await?;
        let path = normalize_remote_path(path);

        let mut entries: Vec<FileEntry> = channel
            .read_dir(&path)
            .await?
            .into_iter()
            .filter(|entry| entry.name != "." && entry.name != "..")
            .map(FileEntry::from)
            .collect();
        sort_entries(&mut entries);

        debug!("Listed {} entries in {}:{}", entries.len(), name, path);
        Ok(entries)
    }

    /// Attributes of a single remote path
    pub async fn stat(&self, name: &str, path: &str) -> Result<FileEntry, SftpError> {
        let channel = self.cache.acquire(name).await?;
        let stat = channel
            .lookup(path)
            .await?
            .ok_or_else(|| SftpError::FileNotFound(path.to_string()))?;

        let normalized = normalize_remote_path(path);
        let file_name = match normalized.rsplit('/').next() {
            Some("") | None => "/".to_string(),
            Some(last) => last.to_string(),
        };
        Ok(FileEntry::from(RemoteEntry {
            name: file_name,
            stat,
        }))
    }

    /// The profile's default directory, used for "home" navigation
    pub fn home_dir(&self, name: &str) -> String {
        self.cache
            .pool()
            .profiles()
            .get(name)
            .map(|profile| normalize_remote_path(&profile.default_dir))
            .unwrap_or_else(|| "/".to_string())
    }

    /// Resolve a user-supplied path against the profile's default directory
    pub fn resolve_path(&self, name: &str, path: &str) -> String {
        join_remote_path(&self.home_dir(name), path)
    }

    /// Download `remote_path` into `local_path`, resuming a local partial
    pub async fn download(
        &self,
        name: &str,
        remote_path: &str,
        local_path: &str,
        on_progress: ProgressFn<'_>,
    ) -> Result<TransferOutcome, SftpError> {
        let (channel, _lease) = self.cache.acquire_leased(name).await?;
        let mut task = TransferTask::new(TransferDirection::Download, remote_path, local_path);

        match download_inner(channel.as_ref(), &mut task, on_progress).await {
            Ok(outcome) => {
                task.enter(TransferPhase::Done);
                info!(
                    "Download complete: {}:{} -> {} ({} bytes)",
                    name, remote_path, local_path, outcome.bytes
                );
                Ok(outcome)
            }
            Err(e) => {
                task.enter(TransferPhase::Failed);
                let temp = task.temp_path();
                match tokio::fs::remove_file(&temp).await {
                    Ok(()) => debug!("Removed partial download {}", temp),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => warn!("Failed to remove partial download {}: {}", temp, err),
                }
                warn!("Download of {}:{} failed: {}", name, remote_path, e);
                Err(e)
            }
        }
    }

    /// Upload `local_path` to `remote_path`, resuming a remote partial
    pub async fn upload(
        &self,
        name: &str,
        local_path: &str,
        remote_path: &str,
        on_progress: ProgressFn<'_>,
    ) -> Result<TransferOutcome, SftpError> {
        let (channel, _lease) = self.cache.acquire_leased(name).await?;
        let mut task = TransferTask::new(TransferDirection::Upload, local_path, remote_path);

        match upload_inner(channel.as_ref(), &mut task, on_progress).await {
            Ok(outcome) => {
                task.enter(TransferPhase::Done);
                info!(
                    "Upload complete: {} -> {}:{} ({} bytes)",
                    local_path, name, remote_path, outcome.bytes
                );
                Ok(outcome)
            }
            Err(e) => {
                task.enter(TransferPhase::Failed);
                let temp = task.temp_path();
                // Best effort: the channel may be the thing that failed
                match channel.lookup(&temp).await {
                    Ok(Some(_)) => {
                        if let Err(err) = channel.remove_file(&temp).await {
                            warn!("Failed to remove remote partial {}: {}", temp, err);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!("Could not check remote partial {}: {}", temp, err),
                }
                warn!("Upload of {} to {}:{} failed: {}", local_path, name, remote_path, e);
                Err(e)
            }
        }
    }

    pub async fn delete(&self, name: &str, path: &str) -> Result<(), SftpError> {
        let channel = self.cache.acquire(name).await?;
        channel
            .remove_file(path)
            .await
            .map_err(|e| SftpError::remote("delete", path, e))?;
        info!("Deleted {}:{}", name, path);
        Ok(())
    }

    /// Remove an empty directory. Non-empty directories fail as reported.
    pub async fn rmdir(&self, name: &str, path: &str) -> Result<(), SftpError> {
        let channel = self.cache.acquire(name).await?;
        channel
            .remove_dir(path)
            .await
            .map_err(|e| SftpError::remote("rmdir", path, e))?;
        info!("Removed directory {}:{}", name, path);
        Ok(())
    }

    pub async fn rename(&self, name: &str, old_path: &str, new_path: &str) -> Result<(), SftpError> {
        let channel = self.cache.acquire(name).await?;
        channel
            .rename(old_path, new_path)
            .await
            .map_err(|e| SftpError::remote("rename", old_path, e))?;
        info!("Renamed {}:{} -> {}", name, old_path, new_path);
        Ok(())
    }

    pub async fn mkdir(&self, name: &str, path: &str) -> Result<(), SftpError> {
        let channel = self.cache.acquire(name).await?;
        channel
            .create_dir(path)
            .await
            .map_err(|e| SftpError::remote("mkdir", path, e))?;
        info!("Created directory {}:{}", name, path);
        Ok(())
    }
}

async fn download_inner(
    channel: &dyn RemoteFs,
    task: &mut TransferTask,
    mut on_progress: ProgressFn<'_>,
) -> Result<TransferOutcome, SftpError> {
    task.enter(TransferPhase::CheckResume);
    let remote_path = task.source_path.clone();
    let temp = task.temp_path();

    let stat = channel
        .lookup(&remote_path)
        .await?
        .ok_or_else(|| SftpError::FileNotFound(remote_path.clone()))?;
    if stat.is_dir {
        return Err(SftpError::transfer(&remote_path, "is a directory"));
    }
    task.total_bytes = stat.size;

    let partial = match tokio::fs::metadata(&temp).await {
        Ok(metadata) if metadata.is_file() => metadata.len(),
        _ => 0,
    };
    let offset = if partial > 0 && partial < task.total_bytes {
        task.enter(TransferPhase::Resume);
        info!("Resuming download of {} from offset {}", remote_path, partial);
        partial
    } else {
        if partial > 0 {
            debug!(
                "Partial {} has {} bytes, remote has {}, starting over",
                temp, partial, task.total_bytes
            );
        }
        task.enter(TransferPhase::Fresh);
        0
    };
    task.transferred_bytes = offset;

    let mut local_file = if offset > 0 {
        let mut file = tokio::fs::OpenOptions::new().write(true).open(&temp).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file
    } else {
        tokio::fs::File::create(&temp).await?
    };
    let mut remote_file = channel.open_read(&remote_path, offset).await?;

    task.enter(TransferPhase::Transferring);
    let mut buffer = vec![0u8; task.chunk_size];

    while task.transferred_bytes < task.total_bytes {
        let want = (task.total_bytes - task.transferred_bytes).min(task.chunk_size as u64) as usize;
        let n = remote_file
            .read(&mut buffer[..want])
            .await
            .map_err(|e| SftpError::transfer(&remote_path, e))?;
        if n == 0 {
            return Err(SftpError::transfer(
                &remote_path,
                format!(
                    "unexpected end of file after {} of {} bytes",
                    task.transferred_bytes, task.total_bytes
                ),
            ));
        }

        local_file
            .write_all(&buffer[..n])
            .await
            .map_err(|e| SftpError::transfer(&temp, e))?;
        task.transferred_bytes += n as u64;

        if let Some(report) = on_progress.as_deref_mut() {
            report(task.transferred_bytes, task.total_bytes);
        }
    }

    local_file.flush().await?;
    local_file.sync_all().await?;
    drop(local_file);

    task.enter(TransferPhase::Commit);
    if !task.is_complete() {
        return Err(SftpError::transfer(&remote_path, "incomplete transfer"));
    }
    tokio::fs::rename(&temp, &task.dest_path)
        .await
        .map_err(|e| SftpError::transfer(&task.dest_path, e))?;

    Ok(TransferOutcome {
        bytes: task.total_bytes,
        resumed_from: offset,
    })
}

async fn upload_inner(
    channel: &dyn RemoteFs,
    task: &mut TransferTask,
    mut on_progress: ProgressFn<'_>,
) -> Result<TransferOutcome, SftpError> {
    task.enter(TransferPhase::CheckResume);
    let local_path = task.source_path.clone();
    let remote_path = task.dest_path.clone();
    let temp = task.temp_path();

    let metadata = match tokio::fs::metadata(&local_path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(SftpError::FileNotFound(local_path))
        }
        Err(e) => return Err(e.into()),
    };
    if !metadata.is_file() {
        return Err(SftpError::transfer(&local_path, "not a regular file"));
    }
    task.total_bytes = metadata.len();

    let partial = match channel.lookup(&temp).await? {
        Some(stat) if !stat.is_dir => stat.size,
        _ => 0,
    };
    let offset = if partial > 0 && partial < task.total_bytes {
        task.enter(TransferPhase::Resume);
        info!("Resuming upload to {} from offset {}", remote_path, partial);
        partial
    } else {
        if partial > 0 {
            debug!(
                "Remote partial {} has {} bytes, local has {}, starting over",
                temp, partial, task.total_bytes
            );
        }
        task.enter(TransferPhase::Fresh);
        0
    };
    task.transferred_bytes = offset;

    let mut local_file = tokio::fs::File::open(&local_path).await?;
    if offset > 0 {
        local_file.seek(SeekFrom::Start(offset)).await?;
    }
    let mut remote_file = channel.open_write(&temp, offset > 0).await?;

    task.enter(TransferPhase::Transferring);
    let mut buffer = vec![0u8; task.chunk_size];

    while task.transferred_bytes < task.total_bytes {
        let want = (task.total_bytes - task.transferred_bytes).min(task.chunk_size as u64) as usize;
        let n = local_file
            .read(&mut buffer[..want])
            .await
            .map_err(|e| SftpError::transfer(&local_path, e))?;
        if n == 0 {
            return Err(SftpError::transfer(
                &local_path,
                format!(
                    "file shrank during upload, {} of {} bytes read",
                    task.transferred_bytes, task.total_bytes
                ),
            ));
        }

        remote_file
            .write_all(&buffer[..n])
            .await
            .map_err(|e| SftpError::transfer(&remote_path, e))?;
        task.transferred_bytes += n as u64;

        if let Some(report) = on_progress.as_deref_mut() {
            report(task.transferred_bytes, task.total_bytes);
        }
    }

    remote_file
        .flush()
        .await
        .map_err(|e| SftpError::transfer(&remote_path, e))?;
    remote_file
        .shutdown()
        .await
        .map_err(|e| SftpError::transfer(&remote_path, e))?;
    drop(remote_file);

    task.enter(TransferPhase::Commit);
    if !task.is_complete() {
        return Err(SftpError::transfer(&remote_path, "incomplete transfer"));
    }
    commit_upload(channel, &temp, &remote_path).await?;

    Ok(TransferOutcome {
        bytes: task.total_bytes,
        resumed_from: offset,
    })
}

/// Move the finished upload into place.
///
/// SFTP v3 rename refuses to replace an existing file, so an existing
/// destination is first moved to `<dest>.bak` and put back if the final
/// rename fails.
async fn commit_upload(
    channel: &dyn RemoteFs,
    temp: &str,
    remote_path: &str,
) -> Result<(), SftpError> {
    let backup = format!("{}{}", remote_path, BACKUP_SUFFIX);
    let displaced = match channel.lookup(remote_path).await? {
        Some(_) => {
            if channel.lookup(&backup).await?.is_some() {
                channel.remove_file(&backup).await?;
            }
            channel.rename(remote_path, &backup).await?;
            true
        }
        None => false,
    };

    if let Err(e) = channel.rename(temp, remote_path).await {
        if displaced {
            match channel.rename(&backup, remote_path).await {
                Ok(()) => info!("Restored {} after failed commit", remote_path),
                Err(err) => warn!("Could not restore {} from {}: {}", remote_path, backup, err),
            }
        }
        return Err(e);
    }

    if displaced {
        if let Err(e) = channel.remove_file(&backup).await {
            warn!("Failed to remove replaced file {}: {}", backup, e);
        }
    }
    Ok(())
}
