//! Portico Auth: per-request proof of possession of a device secret.
//!
//! Every privileged REST call and WebSocket upgrade carries a device id, an
//! RFC 3339 timestamp and an HMAC-SHA256 signature over the canonical
//! string (see `portico_crypto::signing`). The guard keeps no session
//! state: each request is checked against the device store, so revocation
//! applies to the very next request.

pub mod error;
pub mod http;
pub mod replay;
pub mod ws;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use portico_common::capability::{Capability, CapabilityStatus};
use portico_common::device::DeviceStore;
use portico_crypto::secret::signing_key_from_hash;
use portico_crypto::signing::{canonical_string, verify};

pub use error::AuthError;
pub use replay::ReplayCache;

const DEFAULT_SKEW_SECS: i64 = 300;
const DEFAULT_REPLAY_CAPACITY: usize = 10_000;
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Accepted distance between the request timestamp and the clock.
    pub skew: chrono::Duration,
    pub replay_capacity: usize,
    /// Largest body the middleware buffers for signing.
    pub max_body_bytes: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            skew: chrono::Duration::seconds(DEFAULT_SKEW_SECS),
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl AuthConfig {
    /// A timestamp is acceptable for at most twice the skew of wall time,
    /// so the replay window covers that span.
    pub fn replay_window(&self) -> Duration {
        let secs = self.skew.num_seconds().max(1) as u64;
        Duration::from_secs(secs * 2)
    }
}

/// The pieces of a request that take part in verification.
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    pub device_id: &'a str,
    /// HTTP method, or `WEBSOCKET` for upgrades.
    pub method: &'a str,
    /// Path with query for REST, bare path for WebSocket.
    pub path: &'a str,
    pub body: &'a [u8],
    pub timestamp: &'a str,
    pub signature: &'a str,
}

/// Identity attached to a request that passed verification.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthenticatedDevice {
    pub device_id: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

pub struct AuthGuard {
    config: AuthConfig,
    store: Arc<dyn DeviceStore>,
    replay: ReplayCache,
    accepted: AtomicU64,
    rejected: AtomicU64,
}

impl AuthGuard {
    pub fn new(config: AuthConfig, store: Arc<dyn DeviceStore>) -> Self {
        let replay = ReplayCache::new(config.replay_capacity, config.replay_window());
        Self {
            config,
            store,
            replay,
            accepted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    pub fn verify(&self, request: &SignedRequest<'_>) -> Result<AuthenticatedDevice, AuthError> {
        self.verify_at(request, Utc::now(), Instant::now())
    }

    /// Verify against the given wall clock (`now`) and monotonic clock
    /// (`tick`, for the replay window).
    pub fn verify_at(
        &self,
        request: &SignedRequest<'_>,
        now: DateTime<Utc>,
        tick: Instant,
    ) -> Result<AuthenticatedDevice, AuthError> {
        let result = self.check(request, now, tick);
        match &result {
            Ok(device) => {
                self.accepted.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(device = %device.device_id, path = request.path, "Request authenticated");
            }
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    device = request.device_id,
                    path = request.path,
                    reason = %e,
                    "Request authentication failed"
                );
            }
        }
        result
    }

    fn check(
        &self,
        request: &SignedRequest<'_>,
        now: DateTime<Utc>,
        tick: Instant,
    ) -> Result<AuthenticatedDevice, AuthError> {
        if request.device_id.is_empty() || request.signature.is_empty() {
            return Err(AuthError::MissingCredentials);
        }

        let timestamp = DateTime::parse_from_rfc3339(request.timestamp)
            .map_err(|_| AuthError::MalformedTimestamp)?
            .with_timezone(&Utc);
        let skew_secs = self.config.skew.num_seconds();
        if (now - timestamp).num_seconds().abs() > skew_secs {
            return Err(AuthError::StaleTimestamp { skew_secs });
        }

        let device = self
            .store
            .find_device(request.device_id)?
            .ok_or(AuthError::UnknownDevice)?;
        if device.is_revoked {
            return Err(AuthError::Revoked);
        }

        let key = signing_key_from_hash(&device.secret_hash).ok_or(AuthError::BadSignature)?;
        let canonical = canonical_string(
            request.method,
            request.path,
            request.body,
            request.timestamp,
        );
        if !verify(&key[..], &canonical, request.signature) {
            return Err(AuthError::BadSignature);
        }

        // Only verified signatures enter the cache.
        if !self.replay.check_and_record_at(
            request.device_id,
            request.signature,
            request.timestamp,
            tick,
        ) {
            return Err(AuthError::Replayed);
        }

        if let Err(e) = self.store.touch_last_seen(&device.id, now) {
            tracing::warn!(device = %device.id, error = %e, "Failed to record last seen");
        }

        Ok(AuthenticatedDevice {
            device_id: device.id,
            name: device.name,
            timestamp,
        })
    }
}

impl Capability for AuthGuard {
    fn name(&self) -> &str {
        "auth"
    }

    fn status(&self) -> CapabilityStatus {
        let summary = format!(
            "{} accepted, {} rejected, {} replay entries",
            self.accepted.load(Ordering::Relaxed),
            self.rejected.load(Ordering::Relaxed),
            self.replay.len()
        );
        CapabilityStatus::new(self.name(), summary)
    }
}

/// Test helpers shared with the middleware tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use portico_common::device::{Device, MemoryDeviceStore};
    use portico_crypto::secret::{generate_device_secret, DeviceSecret};
    use portico_crypto::signing::sign;

    pub(crate) struct Fixture {
        pub guard: Arc<AuthGuard>,
        pub store: Arc<MemoryDeviceStore>,
        pub secret: DeviceSecret,
    }

    pub(crate) const DEVICE_ID: &str = "d1";

    pub(crate) fn fixture() -> Fixture {
        let store = Arc::new(MemoryDeviceStore::new());
        let secret = generate_device_secret();
        store
            .create_device(Device {
                id: DEVICE_ID.to_string(),
                name: "laptop".to_string(),
                secret_hash: secret.hash_hex(),
                paired_at: Utc::now(),
                last_seen_at: None,
                is_revoked: false,
                revoked_at: None,
                device_info: None,
            })
            .unwrap();
        let guard = Arc::new(AuthGuard::new(AuthConfig::default(), store.clone()));
        Fixture {
            guard,
            store,
            secret,
        }
    }

    pub(crate) fn signature(
        secret: &DeviceSecret,
        method: &str,
        path: &str,
        body: &[u8],
        timestamp: &str,
    ) -> String {
        let key = secret.signing_key();
        sign(&key[..], &canonical_string(method, path, body, timestamp))
    }

    pub(crate) fn rfc3339(at: DateTime<Utc>) -> String {
        at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    }
}
