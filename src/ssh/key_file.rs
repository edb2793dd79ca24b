//! Private key file checks run before every key-based connect

use std::path::Path;

use tracing::{info, warn};

use crate::config::ConfigError;

/// Make sure a private key exists and is only readable by its owner.
///
/// Group or world access bits are corrected to 0600 when possible. If the
/// mode cannot be changed the key is refused.
pub fn check_key_file(path: &str) -> Result<(), ConfigError> {
    let key_path = Path::new(path);
    let metadata = match std::fs::metadata(key_path) {
        Ok(m) if m.is_file() => m,
        _ => return Err(ConfigError::MissingKeyFile(path.to_string())),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            warn!("SSH key {} has permissions {:o}, restricting to 600", path, mode);
            let fixed = std::fs::Permissions::from_mode(0o600);
            if let Err(e) = std::fs::set_permissions(key_path, fixed) {
                warn!("Could not fix permissions of {}: {}", path, e);
                return Err(ConfigError::InsecureKeyPermissions {
                    path: path.to_string(),
                    mode,
                });
            }
            info!("Permissions of {} set to 600", path);
        }
    }

    #[cfg(not(unix))]
    let _ = metadata;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_missing");
        let result = check_key_file(path.to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::MissingKeyFile(_))));
    }

    #[test]
    fn test_directory_is_not_a_key() {
        let dir = tempfile::tempdir().unwrap();
        let result = check_key_file(dir.path().to_str().unwrap());
        assert!(matches!(result, Err(ConfigError::MissingKeyFile(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_loose_permissions_are_tightened() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_ed25519");
        std::fs::write(&path, "key").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

        check_key_file(path.to_str().unwrap()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn test_owner_only_is_left_alone() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_rsa");
        std::fs::write(&path, "key").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o400)).unwrap();

        check_key_file(path.to_str().unwrap()).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o400);
    }
}
