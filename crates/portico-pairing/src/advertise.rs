//! Discovery advertisement interface.
//!
//! While the daemon is discoverable an advertiser publishes an identity
//! record (name, host, port, root fingerprint). The pairing token is never
//! part of it; only the QR payload carries the token.

use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAdvert {
    pub instance_name: String,
    pub host: String,
    pub port: u16,
    pub root_fingerprint: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct AdvertiseError(pub String);

/// Publishes and withdraws discovery signals.
///
/// Calls are serialized and made outside the pairing state lock.
pub trait Advertiser: Send + Sync {
    fn advertise(&self, advert: &ServiceAdvert) -> Result<(), AdvertiseError>;
    fn withdraw(&self);
}

/// Advertiser that does nothing (discovery disabled).
#[derive(Debug, Default)]
pub struct NoopAdvertiser;

impl Advertiser for NoopAdvertiser {
    fn advertise(&self, _advert: &ServiceAdvert) -> Result<(), AdvertiseError> {
        Ok(())
    }

    fn withdraw(&self) {}
}

/// Records calls so tests can observe discovery toggling.
#[derive(Debug, Default)]
pub struct RecordingAdvertiser {
    active: Mutex<Option<ServiceAdvert>>,
    toggles: Mutex<Vec<bool>>,
}

impl RecordingAdvertiser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<ServiceAdvert> {
        self.active.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// `true` per advertise, `false` per withdraw, in call order.
    pub fn toggles(&self) -> Vec<bool> {
        self.toggles.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Advertiser for RecordingAdvertiser {
    fn advertise(&self, advert: &ServiceAdvert) -> Result<(), AdvertiseError> {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(advert.clone());
        self.toggles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(true);
        Ok(())
    }

    fn withdraw(&self) {
        *self.active.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.toggles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(false);
    }
}
