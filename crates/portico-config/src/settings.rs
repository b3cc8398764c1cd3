//! `config.toml` settings.
//!
//! Every key is optional; a missing file is the same as an empty one.
//! Durations are whole seconds. Unknown keys are rejected so a typo does
//! not silently fall back to a default.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Config filename inside the data directory.
pub const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub daemon: DaemonSettings,
    pub router: RouterSettings,
    pub pairing: PairingSettings,
    pub auth: AuthSettings,
    pub ca: CaSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSettings {
    /// Canonical domain; `<hostname>.local` when unset.
    pub canonical_domain: Option<String>,
    /// Extra names served by the internal API.
    pub aliases: Vec<String>,
    /// TLS API listener the router forwards the canonical domain to.
    pub api_listen: SocketAddr,
    /// Loopback-only admin listener.
    pub admin_listen: SocketAddr,
    /// Port advertised in the pairing payload (the router's public port).
    pub public_port: u16,
    pub mdns: bool,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            canonical_domain: None,
            aliases: Vec::new(),
            api_listen: SocketAddr::from(([127, 0, 0, 1], 8443)),
            admin_listen: SocketAddr::from(([127, 0, 0, 1], 5721)),
            public_port: 443,
            mdns: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RouterSettings {
    pub listen: SocketAddr,
    pub sni_timeout_secs: u64,
    pub max_client_hello_bytes: usize,
    pub connect_timeout_secs: u64,
    pub max_connections: usize,
    pub route_cache_capacity: usize,
    pub route_cache_ttl_secs: u64,
    pub linger_secs: u64,
    pub probe_interval_secs: u64,
    pub passthrough: PassthroughSettings,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 443)),
            sni_timeout_secs: 5,
            max_client_hello_bytes: 16 * 1024,
            connect_timeout_secs: 3,
            max_connections: 1024,
            route_cache_capacity: 256,
            route_cache_ttl_secs: 30,
            linger_secs: 5,
            probe_interval_secs: 30,
            passthrough: PassthroughSettings::default(),
        }
    }
}

/// Where non-canonical SNI names are forwarded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PassthroughSettings {
    /// Exact SNI name to upstream address.
    pub routes: BTreeMap<String, SocketAddr>,
    /// Upstream for names without a route, and for hellos without SNI.
    pub default: Option<SocketAddr>,
    /// Candidate upstreams, TCP-probed; the first live one takes the rest.
    pub probe: Vec<SocketAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PairingSettings {
    pub token_ttl_secs: u64,
    /// How long a pairing request waits for approval; the token TTL when unset.
    pub approval_timeout_secs: Option<u64>,
    pub sweep_interval_secs: u64,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            token_ttl_secs: 600,
            approval_timeout_secs: None,
            sweep_interval_secs: 5,
        }
    }
}

impl PairingSettings {
    pub fn approval_timeout_secs(&self) -> u64 {
        self.approval_timeout_secs.unwrap_or(self.token_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSettings {
    pub skew_secs: u64,
    pub replay_capacity: usize,
    pub max_body_bytes: usize,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            skew_secs: 300,
            replay_capacity: 10_000,
            max_body_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaSettings {
    pub leaf_lifetime_days: u32,
    pub root_lifetime_days: u32,
    pub leaf_cache_capacity: usize,
    pub leaf_cache_ttl_secs: u64,
}

impl Default for CaSettings {
    fn default() -> Self {
        Self {
            leaf_lifetime_days: 7,
            root_lifetime_days: 3650,
            leaf_cache_capacity: 128,
            leaf_cache_ttl_secs: 30 * 60,
        }
    }
}

impl Settings {
    /// Path of `config.toml` under `data_dir`.
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join(CONFIG_FILENAME)
    }

    /// Load and validate `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let settings: Settings = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn nonzero(key: &'static str, value: u64) -> Result<(), ConfigError> {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".into(),
                });
            }
            Ok(())
        }

        nonzero("router.sni_timeout_secs", self.router.sni_timeout_secs)?;
        nonzero("router.connect_timeout_secs", self.router.connect_timeout_secs)?;
        nonzero("router.max_connections", self.router.max_connections as u64)?;
        nonzero("router.probe_interval_secs", self.router.probe_interval_secs)?;
        nonzero("pairing.token_ttl_secs", self.pairing.token_ttl_secs)?;
        nonzero("pairing.approval_timeout_secs", self.pairing.approval_timeout_secs())?;
        nonzero("pairing.sweep_interval_secs", self.pairing.sweep_interval_secs)?;
        nonzero("auth.skew_secs", self.auth.skew_secs)?;
        nonzero("auth.replay_capacity", self.auth.replay_capacity as u64)?;
        nonzero("ca.leaf_lifetime_days", u64::from(self.ca.leaf_lifetime_days))?;
        nonzero("ca.leaf_cache_capacity", self.ca.leaf_cache_capacity as u64)?;

        // A hello must fit a full TLS record header plus a handshake header.
        if self.router.max_client_hello_bytes < 512 {
            return Err(ConfigError::Invalid {
                key: "router.max_client_hello_bytes",
                reason: "must be at least 512".into(),
            });
        }
        if self.ca.root_lifetime_days <= self.ca.leaf_lifetime_days {
            return Err(ConfigError::Invalid {
                key: "ca.root_lifetime_days",
                reason: "must exceed ca.leaf_lifetime_days".into(),
            });
        }
        if let Some(domain) = &self.daemon.canonical_domain {
            if domain.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    key: "daemon.canonical_domain",
                    reason: "must not be empty".into(),
                });
            }
        }
        if !self.daemon.admin_listen.ip().is_loopback() {
            return Err(ConfigError::Invalid {
                key: "daemon.admin_listen",
                reason: "admin listener must bind a loopback address".into(),
            });
        }
        Ok(())
    }

    /// Canonical domain: configured, or `<hostname>.local`.
    pub fn canonical_domain(&self) -> String {
        match &self.daemon.canonical_domain {
            Some(domain) => domain.trim().trim_end_matches('.').to_ascii_lowercase(),
            None => default_canonical_domain(),
        }
    }
}

fn default_canonical_domain() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "portico".to_string());
    let label = host.split('.').next().unwrap_or("portico").to_ascii_lowercase();
    format!("{label}.local")
}
