//! Remote path helpers
//!
//! Remote SFTP paths always use `/`, whatever the local or remote OS. Paths
//! typed on Windows may still arrive with `\`, so both helpers accept either.

/// Check if a remote SFTP path is absolute.
pub fn is_absolute_remote_path(path: &str) -> bool {
    path.starts_with('/')
}

/// Canonical display form of a remote path.
///
/// - `\` becomes `/`
/// - a leading `/` is added, repeated slashes collapse
/// - a trailing `/` is dropped, except for the root itself
/// - an empty path is the root
pub fn normalize_remote_path(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let path = path.replace('\\', "/");
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Join remote path components and resolve `.` and `..`.
///
/// An absolute `component` replaces `base`. `..` never climbs above the root.
pub fn join_remote_path(base: &str, component: &str) -> String {
    let component = component.replace('\\', "/");
    let joined = if is_absolute_remote_path(&component) {
        component
    } else {
        format!("{}/{}", base.replace('\\', "/"), component)
    };

    let mut resolved: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                resolved.pop();
            }
            name => resolved.push(name),
        }
    }
    format!("/{}", resolved.join("/"))
}

/// Parent directory; the root is its own parent
pub fn parent_remote_path(path: &str) -> String {
    let path = normalize_remote_path(path);
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}
