//! Configuration Storage
//!
//! The profile file lives at `~/.sshdeck/connections.json`, or under
//! `$SSHDECK_HOME` when that is set.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::types::{ConfigFile, CONFIG_VERSION};

const HOME_ENV: &str = "SSHDECK_HOME";
const FILE_NAME: &str = "connections.json";

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config version {found} is newer than supported {supported}")]
    VersionTooNew { found: u32, supported: u32 },
}

/// Directory holding the profile file
pub fn config_dir() -> Result<PathBuf, StorageError> {
    resolve_config_dir(std::env::var_os(HOME_ENV), dirs::home_dir())
}

fn resolve_config_dir(
    override_dir: Option<OsString>,
    home: Option<PathBuf>,
) -> Result<PathBuf, StorageError> {
    match override_dir.filter(|dir| !dir.is_empty()) {
        Some(dir) => Ok(PathBuf::from(dir)),
        None => home
            .map(|home| home.join(".sshdeck"))
            .ok_or(StorageError::NoConfigDir),
    }
}

pub fn connections_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join(FILE_NAME))
}

/// What was found at the config path
enum Stored {
    Missing,
    Parsed(ConfigFile),
    Unreadable(serde_json::Error),
}

/// Reads and writes one profile file
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self::with_path(connections_file()?))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the profile file.
    ///
    /// A missing file yields the defaults. A file that does not parse is
    /// moved aside to `connections.json.corrupt-<timestamp>` and the
    /// defaults are returned, so the next save starts clean.
    pub async fn load(&self) -> Result<ConfigFile, StorageError> {
        match self.read().await? {
            Stored::Missing => Ok(ConfigFile::default()),
            Stored::Parsed(config) if config.version > CONFIG_VERSION => {
                Err(StorageError::VersionTooNew {
                    found: config.version,
                    supported: CONFIG_VERSION,
                })
            }
            Stored::Parsed(config) => Ok(config),
            Stored::Unreadable(e) => {
                tracing::warn!("Config file {:?} is corrupted: {}", self.path, e);
                match self.quarantine().await {
                    Ok(moved_to) => tracing::warn!("Moved it to {:?}, using defaults", moved_to),
                    Err(err) => tracing::error!("Could not move corrupted config aside: {}", err),
                }
                Ok(ConfigFile::default())
            }
        }
    }

    async fn read(&self) -> Result<Stored, StorageError> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Stored::Missing),
            Err(e) => return Err(e.into()),
        };
        Ok(match serde_json::from_str(&contents) {
            Ok(config) => Stored::Parsed(config),
            Err(e) => Stored::Unreadable(e),
        })
    }

    /// Write the profile file atomically.
    ///
    /// The temp name carries the process id so two concurrent invocations
    /// never write into the same temp file. On Unix the file is 0600.
    pub async fn save(&self, config: &ConfigFile) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_vec_pretty(config)?;
        let temp_path = self.sibling(&format!("{}.tmp", std::process::id()));

        if let Err(e) = write_private(&temp_path, &json).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        fs::rename(&temp_path, &self.path).await?;

        tracing::debug!(
            "Saved {} connection profiles to {:?}",
            config.connections.len(),
            self.path
        );
        Ok(())
    }

    async fn quarantine(&self) -> Result<PathBuf, StorageError> {
        let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let target = self.sibling(&format!("corrupt-{}", stamp));
        fs::rename(&self.path, &target).await?;
        Ok(target)
    }

    /// `<path>.<suffix>` next to the profile file
    fn sibling(&self, suffix: &str) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from(FILE_NAME));
        name.push(".");
        name.push(suffix);
        self.path.with_file_name(name)
    }
}

async fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionProfile;
    use tempfile::tempdir;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_config_dir_resolution() {
        let home = Some(PathBuf::from("/home/ops"));
        assert_eq!(
            resolve_config_dir(None, home.clone()).unwrap(),
            PathBuf::from("/home/ops/.sshdeck")
        );
        assert_eq!(
            resolve_config_dir(Some(OsString::from("/etc/sshdeck")), home.clone()).unwrap(),
            PathBuf::from("/etc/sshdeck")
        );
        // empty override is ignored
        assert_eq!(
            resolve_config_dir(Some(OsString::new()), home).unwrap(),
            PathBuf::from("/home/ops/.sshdeck")
        );
        assert!(matches!(
            resolve_config_dir(None, None),
            Err(StorageError::NoConfigDir)
        ));
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("connections.json"));

        let config = storage.load().await.unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(config.connections.is_empty());
        assert!(entries(temp.path()).is_empty());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let dir = temp.path().join("nested");
        let storage = ConfigStorage::with_path(dir.join("connections.json"));

        let mut config = ConfigFile::default();
        let mut profile = ConnectionProfile::with_password("box1", "10.0.0.1", "ops", "box1-pw");
        profile.default_dir = "/srv/app".to_string();
        config.connections.insert("box1".to_string(), profile.clone());
        config.settings.max_retries = 5;

        storage.save(&config).await.unwrap();
        assert_eq!(entries(&dir), vec!["connections.json"]);

        let loaded = storage.load().await.unwrap();
        assert_eq!(loaded.settings.max_retries, 5);
        assert_eq!(loaded.connections.get("box1"), Some(&profile));
    }

    #[tokio::test]
    async fn test_save_replaces_previous_contents() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("connections.json"));

        let mut config = ConfigFile::default();
        config.connections.insert(
            "box1".to_string(),
            ConnectionProfile::with_password("box1", "10.0.0.1", "ops", "pw"),
        );
        storage.save(&config).await.unwrap();
        config.connections.clear();
        storage.save(&config).await.unwrap();

        assert!(storage.load().await.unwrap().connections.is_empty());
        assert_eq!(entries(temp.path()), vec!["connections.json"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_saved_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempdir().unwrap();
        let path = temp.path().join("connections.json");
        ConfigStorage::with_path(&path)
            .save(&ConfigFile::default())
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[tokio::test]
    async fn test_corrupted_file_is_moved_aside() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("connections.json");
        std::fs::write(&path, "{ not json").unwrap();

        let storage = ConfigStorage::with_path(&path);
        let config = storage.load().await.unwrap();
        assert!(config.connections.is_empty());
        assert!(!path.exists());

        let names = entries(temp.path());
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("connections.json.corrupt-"));
        let kept = std::fs::read_to_string(temp.path().join(&names[0])).unwrap();
        assert_eq!(kept, "{ not json");
    }

    #[tokio::test]
    async fn test_newer_version_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("connections.json");
        std::fs::write(&path, r#"{"version": 99, "connections": {}}"#).unwrap();

        let storage = ConfigStorage::with_path(&path);
        match storage.load().await {
            Err(StorageError::VersionTooNew { found, supported }) => {
                assert_eq!(found, 99);
                assert_eq!(supported, CONFIG_VERSION);
            }
            other => panic!("Expected VersionTooNew, got {:?}", other),
        }
        // a newer file is left untouched
        assert!(path.exists());
    }
}
