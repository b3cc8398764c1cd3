//! Portico data directory initialization.
//!
//! Ensures the data directory structure exists and contains a default
//! `config.toml` if not already present. Called once during daemon
//! startup.

use std::path::Path;

use crate::settings::CONFIG_FILENAME;

/// Default content for a freshly created config.toml.
pub const DEFAULT_CONFIG_TOML: &str = "\
# Portico configuration
# Every key is optional. Durations are in seconds.

# [daemon]
# canonical_domain = \"myhost.local\"
# aliases = []
# api_listen = \"127.0.0.1:8443\"
# admin_listen = \"127.0.0.1:5721\"
# public_port = 443
# mdns = true

# [router]
# listen = \"0.0.0.0:443\"
# sni_timeout_secs = 5
# max_client_hello_bytes = 16384
# connect_timeout_secs = 3
# max_connections = 1024
# route_cache_capacity = 256
# route_cache_ttl_secs = 30
# linger_secs = 5
# probe_interval_secs = 30

# [router.passthrough]
# default = \"192.168.1.20:443\"
# probe = [\"192.168.1.20:443\", \"192.168.1.21:443\"]
# routes = { \"nas.lan\" = \"192.168.1.30:443\" }

# [pairing]
# token_ttl_secs = 600
# approval_timeout_secs = 600
# sweep_interval_secs = 5

# [auth]
# skew_secs = 300
# replay_capacity = 10000
# max_body_bytes = 1048576

# [ca]
# leaf_lifetime_days = 7
# root_lifetime_days = 3650
# leaf_cache_capacity = 128
# leaf_cache_ttl_secs = 1800
";

/// Ensure the data directory structure exists.
///
/// Creates `data_dir` with `ca/`, `certs/`, `state/` and `logs/`, plus a
/// commented `config.toml` if absent.
///
/// Errors are logged but not fatal: the CA falls back to memory-only
/// operation and an ephemeral device store still works.
pub fn ensure_data_dir(data_dir: &Path) {
    if let Err(e) = std::fs::create_dir_all(data_dir) {
        tracing::warn!(
            path = %data_dir.display(),
            error = %e,
            "Could not create data directory"
        );
        return;
    }

    for subdir in &["ca", "certs", "state", "logs"] {
        let path = data_dir.join(subdir);
        if let Err(e) = std::fs::create_dir_all(&path) {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not create subdirectory"
            );
        }
    }

    let config_path = data_dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        match std::fs::write(&config_path, DEFAULT_CONFIG_TOML) {
            Ok(()) => tracing::debug!(path = %config_path.display(), "Created default config"),
            Err(e) => tracing::warn!(
                path = %config_path.display(),
                error = %e,
                "Could not write default config"
            ),
        }
    }

    tracing::debug!(path = %data_dir.display(), "Data directory ready");
}
