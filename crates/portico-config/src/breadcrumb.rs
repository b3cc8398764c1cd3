use std::path::{Path, PathBuf};

use portico_common::paths;

/// Breadcrumb filename written by the daemon for client discovery.
const BREADCRUMB_FILENAME: &str = "portico.endpoint";

/// Path to the breadcrumb file that advertises the admin endpoint.
///
/// `$XDG_RUNTIME_DIR` on Unix when set, the data directory otherwise.
pub fn breadcrumb_path() -> PathBuf {
    #[cfg(unix)]
    {
        if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
            return PathBuf::from(runtime_dir).join(BREADCRUMB_FILENAME);
        }
    }
    paths::portico_data_dir().join(BREADCRUMB_FILENAME)
}

/// Write the daemon endpoint to the breadcrumb file.
pub fn write_breadcrumb(endpoint: &str) {
    write_breadcrumb_at(&breadcrumb_path(), endpoint);
}

pub fn write_breadcrumb_at(path: &Path, endpoint: &str) {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    match std::fs::write(path, endpoint) {
        Ok(()) => tracing::debug!(path = %path.display(), "Breadcrumb written"),
        Err(e) => tracing::warn!(error = %e, path = %path.display(), "Failed to write breadcrumb"),
    }
}

/// Delete the breadcrumb file.
pub fn delete_breadcrumb() {
    delete_breadcrumb_at(&breadcrumb_path());
}

pub fn delete_breadcrumb_at(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Breadcrumb deleted"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(error = %e, path = %path.display(), "Failed to delete breadcrumb"),
    }
}

/// Read the daemon endpoint from the breadcrumb file.
pub fn read_breadcrumb() -> Option<String> {
    read_breadcrumb_at(&breadcrumb_path())
}

pub fn read_breadcrumb_at(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
