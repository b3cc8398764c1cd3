use std::path::PathBuf;

/// Environment override for the data directory (tests, packaging).
pub const DATA_DIR_ENV: &str = "PORTICO_DATA_DIR";

/// Root data directory for Portico.
///
/// All data is machine-local (CA keys, device records, certs, logs).
///
/// - `$PORTICO_DATA_DIR` when set
/// - Linux: `~/.portico/`
/// - macOS: `~/Library/Application Support/portico/`
/// - Windows: `%LOCALAPPDATA%\portico\`
pub fn portico_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("portico");
        }
    }

    #[cfg(windows)]
    {
        if let Some(local) = std::env::var_os("LOCALAPPDATA") {
            return PathBuf::from(local).join("portico");
        }
    }

    #[cfg(not(any(target_os = "macos", windows)))]
    {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(".portico");
        }
    }

    PathBuf::from(".portico")
}
