//! Portico CA: local certificate authority.
//!
//! Creates one root CA per data directory and issues short-lived leaf
//! certificates on demand. Leaves are cached in memory (bounded, fixed
//! TTL independent of certificate validity) and mirrored to disk.
//! Concurrent first requests for the same domain produce one certificate.

pub mod error;
pub mod http;
pub mod leaf;
pub mod mirror;
pub mod resolver;
pub mod root;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use portico_common::cache::BoundedCache;
use portico_common::capability::{Capability, CapabilityStatus};

pub use error::CaError;
pub use leaf::CertificateBundle;
pub use resolver::CaResolver;
pub use root::RootOrigin;

use mirror::LeafMirror;
use root::RootCa;

const DEFAULT_ROOT_LIFETIME_DAYS: i64 = 3650;
const DEFAULT_LEAF_LIFETIME_DAYS: i64 = 7;
const DEFAULT_CACHE_CAPACITY: usize = 128;
const DEFAULT_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(30 * 60);
const DEFAULT_COMMON_NAME: &str = "Portico Local Root CA";

/// Certificate authority configuration.
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Holds `root.pem` and `root-key.pem`.
    pub ca_dir: PathBuf,
    /// Leaf mirror root. `None` keeps leaves in memory only.
    pub certs_dir: Option<PathBuf>,
    pub common_name: String,
    pub root_lifetime: Duration,
    pub leaf_lifetime: Duration,
    pub cache_capacity: usize,
    pub cache_ttl: std::time::Duration,
}

impl CaConfig {
    /// Defaults rooted at `data_dir` (`ca/` and `certs/` beneath it).
    pub fn new(data_dir: &Path) -> Self {
        Self {
            ca_dir: data_dir.join("ca"),
            certs_dir: Some(data_dir.join("certs")),
            common_name: DEFAULT_COMMON_NAME.to_string(),
            root_lifetime: Duration::days(DEFAULT_ROOT_LIFETIME_DAYS),
            leaf_lifetime: Duration::days(DEFAULT_LEAF_LIFETIME_DAYS),
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }
}

/// A cached leaf plus its ready-to-serve rustls key.
pub struct IssuedLeaf {
    pub bundle: CertificateBundle,
    pub(crate) certified: Arc<rustls::sign::CertifiedKey>,
}

/// Certificate health for `/v1/status`.
#[derive(Debug, Clone, Serialize)]
pub struct CaHealth {
    pub root_fingerprint: String,
    pub root_expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canonical_leaf_expires_at: Option<DateTime<Utc>>,
    pub cached_leaves: usize,
    pub leaves_issued: u64,
    /// Disk mirror writes are failing; leaves live in memory only.
    pub mirror_degraded: bool,
}

/// Domain facade for the certificate authority.
pub struct CaCore {
    root: RootCa,
    origin: RootOrigin,
    leaf_lifetime: Duration,
    cache: BoundedCache<String, Arc<IssuedLeaf>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    mirror: Option<LeafMirror>,
    mirror_degraded: AtomicBool,
    leaves_issued: AtomicU64,
}

impl CaCore {
    /// Load or create the root (`ensureRoot`) and set up the leaf cache.
    pub fn open(config: CaConfig) -> Result<Self, CaError> {
        let (root, origin) =
            root::ensure_root(&config.ca_dir, &config.common_name, config.root_lifetime)?;
        Ok(Self {
            root,
            origin,
            leaf_lifetime: config.leaf_lifetime,
            cache: BoundedCache::new(config.cache_capacity, config.cache_ttl),
            inflight: Mutex::new(HashMap::new()),
            mirror: config.certs_dir.map(LeafMirror::new),
            mirror_degraded: AtomicBool::new(false),
            leaves_issued: AtomicU64::new(0),
        })
    }

    pub fn root_origin(&self) -> RootOrigin {
        self.origin
    }

    /// Root certificate PEM, safe to hand to anyone.
    pub fn root_pem(&self) -> &str {
        &self.root.cert_pem
    }

    pub fn root_der(&self) -> &[u8] {
        &self.root.cert_der
    }

    pub fn root_fingerprint(&self) -> &str {
        &self.root.fingerprint
    }

    pub fn root_expires_at(&self) -> DateTime<Utc> {
        self.root.not_after
    }

    pub fn issue(&self, domain: &str) -> Result<Arc<IssuedLeaf>, CaError> {
        self.issue_at(domain, Utc::now())
    }

    /// Return a still-valid leaf for `domain`, minting one if needed.
    pub fn issue_at(&self, domain: &str, now: DateTime<Utc>) -> Result<Arc<IssuedLeaf>, CaError> {
        let domain = leaf::normalize_domain(domain)?;

        if let Some(hit) = self.cached(&domain, now) {
            return Ok(hit);
        }

        let slot = self.inflight_slot(&domain);
        let result = {
            let _guard = slot.lock().unwrap_or_else(|e| e.into_inner());
            // Another caller may have finished while we waited.
            match self.cached(&domain, now) {
                Some(hit) => Ok(hit),
                None => self.load_or_mint(&domain, now),
            }
        };
        self.release_inflight(&domain, slot);
        result
    }

    fn cached(&self, domain: &str, now: DateTime<Utc>) -> Option<Arc<IssuedLeaf>> {
        let hit = self.cache.get(domain)?;
        if hit.bundle.is_valid_at(now) {
            Some(hit)
        } else {
            self.cache.remove(domain);
            None
        }
    }

    fn load_or_mint(&self, domain: &str, now: DateTime<Utc>) -> Result<Arc<IssuedLeaf>, CaError> {
        if let Some(bundle) = self.mirror.as_ref().and_then(|m| {
            m.load(domain, &self.root.fingerprint, &self.root.cert_pem, now)
        }) {
            match resolver::certified_key(&bundle) {
                Ok(certified) => {
                    tracing::debug!(domain, serial = %bundle.serial, "Leaf certificate reloaded from disk");
                    return Ok(self.remember(domain, IssuedLeaf { bundle, certified }));
                }
                Err(e) => {
                    tracing::warn!(domain, error = %e, "Mirrored leaf unusable, minting a new one");
                }
            }
        }

        let leaf = match self.mint(domain, now) {
            Ok(leaf) => leaf,
            Err(e) => {
                tracing::warn!(domain, error = %e, "Leaf issuance failed, retrying once");
                self.mint(domain, now)?
            }
        };

        if let Some(mirror) = &self.mirror {
            match mirror.write(&leaf.bundle, &self.root.fingerprint) {
                Ok(_) => {
                    self.mirror_degraded.store(false, Ordering::Relaxed);
                }
                Err(e) => {
                    if !self.mirror_degraded.swap(true, Ordering::Relaxed) {
                        tracing::warn!(
                            domain,
                            error = %e,
                            "Cannot write leaf certificate to disk, continuing in memory only"
                        );
                    }
                }
            }
        }

        self.leaves_issued.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            domain,
            serial = %leaf.bundle.serial,
            expires = %leaf.bundle.expires_at,
            "Leaf certificate issued"
        );
        Ok(self.remember(domain, leaf))
    }

    fn mint(&self, domain: &str, now: DateTime<Utc>) -> Result<IssuedLeaf, CaError> {
        let bundle = leaf::issue_leaf(&self.root, domain, self.leaf_lifetime, now)?;
        let certified = resolver::certified_key(&bundle)?;
        Ok(IssuedLeaf { bundle, certified })
    }

    fn remember(&self, domain: &str, leaf: IssuedLeaf) -> Arc<IssuedLeaf> {
        let leaf = Arc::new(leaf);
        self.cache.insert(domain.to_string(), leaf.clone());
        leaf
    }

    fn inflight_slot(&self, domain: &str) -> Arc<Mutex<()>> {
        let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(domain.to_string()).or_default().clone()
    }

    fn release_inflight(&self, domain: &str, slot: Arc<Mutex<()>>) {
        let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
        // Map + our handle: nobody else is waiting on this domain.
        if Arc::strong_count(&slot) <= 2 {
            map.remove(domain);
        }
    }

    pub fn health(&self, canonical_domain: Option<&str>) -> CaHealth {
        let canonical_leaf_expires_at = canonical_domain
            .and_then(|d| leaf::normalize_domain(d).ok())
            .and_then(|d| self.cache.get(&d))
            .map(|leaf| leaf.bundle.expires_at);
        CaHealth {
            root_fingerprint: self.root.fingerprint.clone(),
            root_expires_at: self.root.not_after,
            canonical_leaf_expires_at,
            cached_leaves: self.cache.len(),
            leaves_issued: self.leaves_issued.load(Ordering::Relaxed),
            mirror_degraded: self.mirror_degraded.load(Ordering::Relaxed),
        }
    }
}

impl Capability for CaCore {
    fn name(&self) -> &str {
        "ca"
    }

    fn status(&self) -> CapabilityStatus {
        let health = self.health(None);
        let expired = health.root_expires_at <= Utc::now();
        let summary = format!(
            "root {} ({} cached leaves, {} issued)",
            &health.root_fingerprint[..16.min(health.root_fingerprint.len())],
            health.cached_leaves,
            health.leaves_issued
        );
        CapabilityStatus::new(self.name(), summary)
            .warn_if(health.mirror_degraded, "disk mirror degraded, leaves held in memory")
            .warn_if(expired, "root expired")
    }
}
