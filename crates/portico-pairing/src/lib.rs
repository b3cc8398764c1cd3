//! Portico Pairing: trust bootstrap for new devices.
//!
//! A single coordinating lock guards the one active [`PairingSession`];
//! the phase is derived from it and from the device store. A client
//! presenting the session token parks on a oneshot channel until a human
//! approves or rejects the request, the session expires, or a newer
//! session replaces it. Approval mints a
//! [`Device`] whose secret is returned to that client exactly once.

pub mod advertise;
pub mod error;
pub mod http;
pub mod qr;
pub mod session;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;

use portico_common::capability::{Capability, CapabilityStatus};
use portico_common::device::{Device, DeviceStore, DeviceSummary};
use portico_common::id::{generate_device_id, generate_short_id};
use portico_crypto::secret::{generate_device_secret, generate_pairing_token, tokens_match};

pub use advertise::{AdvertiseError, Advertiser, NoopAdvertiser, ServiceAdvert};
pub use error::PairingError;
pub use qr::DiscoveryPayload;
pub use session::{
    ClientInfo, DeviceCredentials, PairingEvent, PairingPhase, PairingSession, PairingStatus,
    PendingApproval, SessionState,
};

/// Capacity for the pairing event broadcast channel.
const BROADCAST_CHANNEL_CAPACITY: usize = 64;

const DEFAULT_TOKEN_TTL_SECS: i64 = 600;
const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const MAX_CLIENT_NAME_LEN: usize = 128;
const UNNAMED_DEVICE: &str = "Unnamed device";

#[derive(Debug, Clone)]
pub struct PairingConfig {
    /// Host clients should connect to (the canonical domain).
    pub host: String,
    pub port: u16,
    /// Discovery instance name.
    pub instance_name: String,
    /// Root fingerprint, advertised and embedded in the QR payload.
    pub root_fingerprint: String,
    pub token_ttl: chrono::Duration,
    /// How long a client waits for a human decision.
    pub approval_timeout: Duration,
    pub sweep_interval: Duration,
}

impl PairingConfig {
    pub fn new(host: impl Into<String>, port: u16, root_fingerprint: impl Into<String>) -> Self {
        let host = host.into();
        let instance_name = host.split('.').next().unwrap_or(&host).to_string();
        let token_ttl = chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS);
        Self {
            host,
            port,
            instance_name,
            root_fingerprint: root_fingerprint.into(),
            token_ttl,
            approval_timeout: Duration::from_secs(DEFAULT_TOKEN_TTL_SECS as u64),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Result of an operator decision.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Approved { device: DeviceSummary },
    Rejected { session_id: String },
}

/// Delivered to the parked client.
enum Decision {
    Approved(DeviceCredentials),
    Rejected,
    Expired,
    Superseded,
}

struct Active {
    session: PairingSession,
    waiter: Option<oneshot::Sender<Decision>>,
    /// An approval is writing the device record.
    resolving: bool,
}

struct Inner {
    active: Option<Active>,
}

impl Inner {
    /// The active session if it is the pending request `session_id`.
    fn pending_mut(&mut self, session_id: &str) -> Result<&mut Active, PairingError> {
        self.active
            .as_mut()
            .filter(|a| {
                a.session.id == session_id
                    && a.session.state == SessionState::Requested
                    && !a.resolving
            })
            .ok_or_else(|| PairingError::SessionNotFound(session_id.to_string()))
    }

    fn active_phase(&self) -> Option<PairingPhase> {
        self.active.as_ref().map(|a| match a.session.state {
            SessionState::Requested => PairingPhase::PairingPending,
            _ => PairingPhase::Discoverable,
        })
    }
}

/// Domain facade for device pairing.
///
/// The state lock never covers device-store or advertiser calls; both run
/// after it is released.
pub struct PairingCore {
    config: PairingConfig,
    inner: Mutex<Inner>,
    /// Whether the advertiser currently publishes. Serializes advertiser calls.
    advertised: Mutex<bool>,
    store: Arc<dyn DeviceStore>,
    advertiser: Arc<dyn Advertiser>,
    event_tx: broadcast::Sender<PairingEvent>,
}

impl PairingCore {
    pub fn new(
        config: PairingConfig,
        store: Arc<dyn DeviceStore>,
        advertiser: Arc<dyn Advertiser>,
    ) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner { active: None }),
            advertised: Mutex::new(false),
            store,
            advertiser,
            event_tx: broadcast::channel(BROADCAST_CHANNEL_CAPACITY).0,
        }
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DeviceStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingEvent> {
        self.event_tx.subscribe()
    }

    pub fn phase(&self) -> PairingPhase {
        let active = self.lock().active_phase();
        active.unwrap_or_else(|| self.settled_phase())
    }

    pub fn status(&self) -> PairingStatus {
        let (active, session) = {
            let inner = self.lock();
            (
                inner.active_phase(),
                inner.active.as_ref().map(|a| a.session.view()),
            )
        };
        let active_devices = self.active_device_count();
        let phase = active.unwrap_or(if active_devices > 0 {
            PairingPhase::Paired
        } else {
            PairingPhase::Unpaired
        });
        PairingStatus {
            phase,
            session,
            active_devices,
        }
    }

    // ── Discoverable ────────────────────────────────────────────────

    pub fn enter_discoverable(&self) -> DiscoveryPayload {
        self.enter_discoverable_at(Utc::now())
    }

    /// Issue a fresh session and start advertising. Any previous session,
    /// pending or not, is invalidated.
    pub fn enter_discoverable_at(&self, now: DateTime<Utc>) -> DiscoveryPayload {
        self.start_session(generate_pairing_token(), now)
    }

    pub(crate) fn start_session(&self, token: String, now: DateTime<Utc>) -> DiscoveryPayload {
        let session = PairingSession {
            id: generate_short_id(),
            token,
            issued_at: now,
            expires_at: now + self.config.token_ttl,
            client: None,
            requested_at: None,
            state: SessionState::Issued,
        };
        let payload = self.payload_for(&session);

        {
            let mut inner = self.lock();
            if let Some(prev) = inner.active.take() {
                tracing::info!(session = %prev.session.id, "Pairing session superseded");
                if let Some(waiter) = prev.waiter {
                    let _ = waiter.send(Decision::Superseded);
                }
                self.emit(PairingEvent::PairingExpired {
                    session_id: prev.session.id,
                });
            }

            tracing::info!(session = %session.id, expires = %session.expires_at, "Discoverable");
            self.emit(PairingEvent::Discoverable {
                session_id: session.id.clone(),
                expires_at: session.expires_at,
            });
            inner.active = Some(Active {
                session,
                waiter: None,
                resolving: false,
            });
        }

        self.sync_advertiser();
        payload
    }

    /// Payload for the current unused session, for re-displaying the QR.
    pub fn current_payload(&self) -> Option<DiscoveryPayload> {
        let inner = self.lock();
        inner
            .active
            .as_ref()
            .filter(|a| a.session.state == SessionState::Issued)
            .map(|a| self.payload_for(&a.session))
    }

    /// Stop being discoverable. A pending request is rejected.
    pub fn exit_discoverable(&self) -> bool {
        {
            let mut inner = self.lock();
            let Some(active) = inner.active.take() else {
                return false;
            };
            if let Some(waiter) = active.waiter {
                let _ = waiter.send(Decision::Rejected);
                self.emit(PairingEvent::PairingRejected {
                    session_id: active.session.id.clone(),
                });
            } else {
                self.emit(PairingEvent::PairingExpired {
                    session_id: active.session.id.clone(),
                });
            }
            tracing::info!(session = %active.session.id, "Discovery turned off");
        }
        self.sync_advertiser();
        true
    }

    // ── Client request ──────────────────────────────────────────────

    pub async fn handle_pairing_request(
        &self,
        token: &str,
        client: ClientInfo,
    ) -> Result<DeviceCredentials, PairingError> {
        self.handle_pairing_request_at(token, client, Utc::now())
            .await
    }

    /// Present `token` and wait for a human decision.
    pub async fn handle_pairing_request_at(
        &self,
        token: &str,
        client: ClientInfo,
        now: DateTime<Utc>,
    ) -> Result<DeviceCredentials, PairingError> {
        let (session_id, decision) = {
            let mut inner = self.lock();

            let checked = match inner.active.as_ref() {
                None => Err(PairingError::TokenInvalid),
                Some(active) => check_token(&active.session, token, now),
            };
            if let Err(e) = checked {
                let expired = matches!(e, PairingError::TokenExpired);
                if expired {
                    self.expire_locked(&mut inner);
                }
                drop(inner);
                if expired {
                    self.sync_advertiser();
                }
                return Err(e);
            }
            let client = normalize_client(client)?;

            let (tx, rx) = oneshot::channel();
            let Some(active) = inner.active.as_mut() else {
                return Err(PairingError::TokenInvalid);
            };
            active.session.state = SessionState::Requested;
            active.session.requested_at = Some(now);
            active.session.client = Some(client.clone());
            active.waiter = Some(tx);
            let session_id = active.session.id.clone();

            tracing::info!(session = %session_id, client = %client.name, "Pairing request awaiting approval");
            self.emit(PairingEvent::ApprovalRequested {
                session_id: session_id.clone(),
                client_name: client.name,
            });
            (session_id, rx)
        };

        match tokio::time::timeout(self.config.approval_timeout, decision).await {
            Ok(Ok(Decision::Approved(credentials))) => Ok(credentials),
            Ok(Ok(Decision::Rejected)) => Err(PairingError::ApprovalDenied),
            Ok(Ok(Decision::Expired)) => Err(PairingError::TokenExpired),
            Ok(Ok(Decision::Superseded)) => Err(PairingError::Superseded),
            Ok(Err(_)) => Err(PairingError::Cancelled),
            Err(_) => {
                self.expire_if_pending(&session_id);
                Err(PairingError::ApprovalTimeout)
            }
        }
    }

    // ── Operator decision ───────────────────────────────────────────

    pub fn pending(&self) -> Vec<PendingApproval> {
        let inner = self.lock();
        inner
            .active
            .as_ref()
            .filter(|a| a.session.state == SessionState::Requested)
            .map(|a| {
                let client = a.session.client.clone();
                PendingApproval {
                    session_id: a.session.id.clone(),
                    client_name: client
                        .as_ref()
                        .map(|c| c.name.clone())
                        .unwrap_or_else(|| UNNAMED_DEVICE.to_string()),
                    device_info: client.and_then(|c| c.device_info),
                    requested_at: a.session.requested_at.unwrap_or(a.session.issued_at),
                    expires_at: a.session.expires_at,
                }
            })
            .into_iter()
            .collect()
    }

    /// Approve or reject the pending request of `session_id`.
    pub fn resolve_approval(
        &self,
        session_id: &str,
        approve: bool,
    ) -> Result<ApprovalOutcome, PairingError> {
        if !approve {
            return self.reject(session_id);
        }

        let client = {
            let mut inner = self.lock();
            let active = inner.pending_mut(session_id)?;
            if active.waiter.as_ref().map_or(true, |w| w.is_closed()) {
                self.abandon_locked(&mut inner, session_id);
                drop(inner);
                self.sync_advertiser();
                return Err(PairingError::ClientGone);
            }
            active.resolving = true;
            active.session.client.clone().unwrap_or(ClientInfo {
                name: UNNAMED_DEVICE.to_string(),
                device_info: None,
            })
        };

        let secret = generate_device_secret();
        let device = Device {
            id: generate_device_id(),
            name: client.name,
            secret_hash: secret.hash_hex(),
            paired_at: Utc::now(),
            last_seen_at: None,
            is_revoked: false,
            revoked_at: None,
            device_info: client.device_info,
        };
        let created = self.store.create_device(device.clone());

        let delivered = {
            let mut inner = self.lock();
            let still_pending = inner
                .active
                .as_ref()
                .is_some_and(|a| a.session.id == session_id);

            if let Err(e) = created {
                // Leave the request pending so the operator can retry.
                if let Some(active) = inner.active.as_mut().filter(|_| still_pending) {
                    active.resolving = false;
                }
                tracing::error!(session = %session_id, error = %e, "Failed to record paired device");
                return Err(e.into());
            }

            let credentials = DeviceCredentials {
                device_id: device.id.clone(),
                device_secret: secret.expose().to_string(),
            };
            let sent = still_pending
                && inner
                    .active
                    .as_mut()
                    .and_then(|a| a.waiter.take())
                    .is_some_and(|w| w.send(Decision::Approved(credentials)).is_ok());
            if sent {
                inner.active = None;
            } else if still_pending {
                self.abandon_locked(&mut inner, session_id);
            }
            sent
        };
        self.sync_advertiser();

        if !delivered {
            if let Err(e) = self.store.revoke_device(&device.id) {
                tracing::warn!(device = %device.id, error = %e, "Failed to revoke undelivered device");
            }
            return Err(PairingError::ClientGone);
        }

        tracing::info!(session = %session_id, device = %device.id, name = %device.name, "Device paired");
        self.emit(PairingEvent::DevicePaired {
            device_id: device.id.clone(),
            name: device.name.clone(),
        });
        Ok(ApprovalOutcome::Approved {
            device: device.summary(),
        })
    }

    fn reject(&self, session_id: &str) -> Result<ApprovalOutcome, PairingError> {
        {
            let mut inner = self.lock();
            inner.pending_mut(session_id)?;
            if let Some(waiter) = inner.active.take().and_then(|a| a.waiter) {
                let _ = waiter.send(Decision::Rejected);
            }
            tracing::info!(session = %session_id, "Pairing request rejected");
            self.emit(PairingEvent::PairingRejected {
                session_id: session_id.to_string(),
            });
        }
        self.sync_advertiser();
        Ok(ApprovalOutcome::Rejected {
            session_id: session_id.to_string(),
        })
    }

    // ── Devices ─────────────────────────────────────────────────────

    pub fn list_devices(&self) -> Result<Vec<DeviceSummary>, PairingError> {
        Ok(self
            .store
            .list_devices()?
            .iter()
            .map(Device::summary)
            .collect())
    }

    /// Soft-revoke a device. Takes effect on its next request.
    pub fn revoke_device(&self, device_id: &str) -> Result<DeviceSummary, PairingError> {
        let device = self.store.revoke_device(device_id)?;
        tracing::info!(device = %device.id, "Device revoked");
        self.emit(PairingEvent::DeviceRevoked {
            device_id: device.id.clone(),
        });
        Ok(device.summary())
    }

    // ── Expiry ──────────────────────────────────────────────────────

    /// Expire the active session if its TTL has passed. Returns the number
    /// of sessions expired (0 or 1).
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired = {
            let mut inner = self.lock();
            let due = inner
                .active
                .as_ref()
                .map(|a| !a.session.state.is_terminal() && a.session.is_expired_at(now))
                .unwrap_or(false);
            if due {
                self.expire_locked(&mut inner);
            }
            due
        };
        if expired {
            self.sync_advertiser();
            1
        } else {
            0
        }
    }

    /// Background sweep on `sweep_interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(core.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Pairing sweeper stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        core.sweep_expired_at(Utc::now());
                    }
                }
            }
        })
    }

    /// Drop any active session and withdraw discovery. Waiting clients see
    /// `Cancelled`.
    pub fn shutdown(&self) {
        self.lock().active = None;
        self.sync_advertiser();
    }

    // ── Internals ───────────────────────────────────────────────────

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: PairingEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    /// Bring the advertiser in line with the current session.
    ///
    /// Must be called without the state lock held. Reading the state under
    /// the advertiser lock means the last caller always publishes the
    /// latest state.
    fn sync_advertiser(&self) {
        let mut advertised = self.advertised.lock().unwrap_or_else(|e| e.into_inner());
        let wanted = self.lock().active.is_some();
        if wanted == *advertised {
            return;
        }
        if wanted {
            match self.advertiser.advertise(&self.advert()) {
                Ok(()) => *advertised = true,
                Err(e) => {
                    tracing::warn!(error = %e, "Discovery advertisement failed, QR pairing still available");
                }
            }
        } else {
            self.advertiser.withdraw();
            *advertised = false;
        }
    }

    fn expire_locked(&self, inner: &mut Inner) {
        let Some(active) = inner.active.take() else {
            return;
        };
        let mut session = active.session;
        session.state = SessionState::Expired;
        if let Some(waiter) = active.waiter {
            let _ = waiter.send(Decision::Expired);
        }
        tracing::info!(session = %session.id, "Pairing session expired");
        self.emit(PairingEvent::PairingExpired {
            session_id: session.id,
        });
    }

    fn expire_if_pending(&self, session_id: &str) {
        {
            let mut inner = self.lock();
            let current = inner
                .active
                .as_ref()
                .map(|a| a.session.id == session_id && a.session.state == SessionState::Requested)
                .unwrap_or(false);
            if !current {
                return;
            }
            self.expire_locked(&mut inner);
        }
        self.sync_advertiser();
    }

    /// The requesting client left; discard the session.
    fn abandon_locked(&self, inner: &mut Inner, session_id: &str) {
        inner.active = None;
        tracing::warn!(session = %session_id, "Pairing client disconnected before approval");
        self.emit(PairingEvent::PairingExpired {
            session_id: session_id.to_string(),
        });
    }

    fn active_device_count(&self) -> usize {
        match self.store.list_devices() {
            Ok(devices) => devices.iter().filter(|d| !d.is_revoked).count(),
            Err(e) => {
                tracing::warn!(error = %e, "Cannot list devices");
                0
            }
        }
    }

    fn settled_phase(&self) -> PairingPhase {
        if self.active_device_count() > 0 {
            PairingPhase::Paired
        } else {
            PairingPhase::Unpaired
        }
    }

    fn advert(&self) -> ServiceAdvert {
        ServiceAdvert {
            instance_name: self.config.instance_name.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            root_fingerprint: self.config.root_fingerprint.clone(),
        }
    }

    fn payload_for(&self, session: &PairingSession) -> DiscoveryPayload {
        DiscoveryPayload {
            host: self.config.host.clone(),
            port: self.config.port,
            token: session.token.clone(),
            root_fingerprint: self.config.root_fingerprint.clone(),
        }
    }
}

fn check_token(session: &PairingSession, token: &str, now: DateTime<Utc>) -> Result<(), PairingError> {
    if !tokens_match(token, &session.token) {
        return Err(PairingError::TokenInvalid);
    }
    match session.state {
        SessionState::Issued => {}
        SessionState::Requested => return Err(PairingError::Conflict),
        _ => return Err(PairingError::TokenInvalid),
    }
    if session.is_expired_at(now) {
        return Err(PairingError::TokenExpired);
    }
    Ok(())
}

fn normalize_client(client: ClientInfo) -> Result<ClientInfo, PairingError> {
    let name = client.name.trim();
    if name.chars().count() > MAX_CLIENT_NAME_LEN {
        return Err(PairingError::InvalidRequest(format!(
            "client name longer than {MAX_CLIENT_NAME_LEN} characters"
        )));
    }
    let name = if name.is_empty() {
        UNNAMED_DEVICE.to_string()
    } else {
        name.to_string()
    };
    Ok(ClientInfo {
        name,
        device_info: client.device_info,
    })
}

impl Capability for PairingCore {
    fn name(&self) -> &str {
        "pairing"
    }

    fn status(&self) -> CapabilityStatus {
        let status = PairingCore::status(self);
        let phase = serde_json::to_value(status.phase)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        CapabilityStatus::new(
            self.name(),
            format!("{phase} ({} active devices)", status.active_devices),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::advertise::RecordingAdvertiser;
    use portico_common::device::{DeviceStoreError, MemoryDeviceStore};
    use portico_crypto::secret::hash_secret;

    struct Harness {
        core: Arc<PairingCore>,
        store: Arc<MemoryDeviceStore>,
        advertiser: Arc<RecordingAdvertiser>,
    }

    fn harness_with(approval_timeout: Duration) -> Harness {
        let store = Arc::new(MemoryDeviceStore::new());
        let advertiser = Arc::new(RecordingAdvertiser::new());
        let mut config = PairingConfig::new("mybox.local", 443, "ab".repeat(32));
        config.approval_timeout = approval_timeout;
        let core = Arc::new(PairingCore::new(
            config,
            store.clone(),
            advertiser.clone(),
        ));
        Harness {
            core,
            store,
            advertiser,
        }
    }

    fn harness() -> Harness {
        harness_with(Duration::from_secs(30))
    }

    fn phone() -> ClientInfo {
        ClientInfo {
            name: "Pixel 8".to_string(),
            device_info: Some(serde_json::json!({"os": "android"})),
        }
    }

    async fn wait_for_pending(core: &PairingCore) -> String {
        for _ in 0..500 {
            if let Some(p) = core.pending().into_iter().next() {
                return p.session_id;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("request never became pending");
    }

    fn spawn_request(
        core: &Arc<PairingCore>,
        token: &str,
        now: DateTime<Utc>,
    ) -> tokio::task::JoinHandle<Result<DeviceCredentials, PairingError>> {
        let core = core.clone();
        let token = token.to_string();
        tokio::spawn(async move { core.handle_pairing_request_at(&token, phone(), now).await })
    }

    #[tokio::test]
    async fn starts_unpaired_and_becomes_discoverable() {
        let h = harness();
        assert_eq!(h.core.phase(), PairingPhase::Unpaired);

        let payload = h.core.enter_discoverable();
        assert_eq!(h.core.phase(), PairingPhase::Discoverable);
        assert!(payload.token.starts_with("tok_"));
        assert_eq!(payload.host, "mybox.local");

        let advert = h.advertiser.active().unwrap();
        assert_eq!(advert.host, "mybox.local");
        assert_eq!(advert.root_fingerprint, "ab".repeat(32));
        assert_eq!(h.core.current_payload(), Some(payload));
    }

    #[tokio::test]
    async fn token_presented_after_ttl_is_expired() {
        let h = harness();
        let t = Utc::now();
        h.core.start_session("tok_abc".to_string(), t);

        let err = h
            .core
            .handle_pairing_request_at("tok_abc", phone(), t + chrono::Duration::minutes(11))
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::TokenExpired));
        assert_eq!(h.core.phase(), PairingPhase::Unpaired);
        assert!(h.advertiser.active().is_none());
    }

    #[tokio::test]
    async fn token_within_ttl_enters_pending_and_approval_returns_secret_once() {
        let h = harness();
        let t = Utc::now();
        h.core.start_session("tok_abc".to_string(), t);

        let request = spawn_request(&h.core, "tok_abc", t + chrono::Duration::minutes(5));
        let session_id = wait_for_pending(&h.core).await;
        assert_eq!(h.core.phase(), PairingPhase::PairingPending);
        assert!(h.advertiser.active().is_some(), "still advertising while pending");

        let outcome = h.core.resolve_approval(&session_id, true).unwrap();
        let ApprovalOutcome::Approved { device } = outcome else {
            panic!("expected approval");
        };
        let creds = request.await.unwrap().unwrap();
        assert_eq!(creds.device_id, device.id);

        let stored = h.store.find_device(&creds.device_id).unwrap().unwrap();
        assert_eq!(stored.secret_hash, hash_secret(&creds.device_secret));
        assert_ne!(stored.secret_hash, creds.device_secret);
        assert_eq!(stored.name, "Pixel 8");

        assert_eq!(h.core.phase(), PairingPhase::Paired);
        assert!(h.advertiser.active().is_none(), "discovery off after approval");

        // Token is single-use.
        let err = h
            .core
            .handle_pairing_request_at("tok_abc", phone(), t + chrono::Duration::minutes(6))
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::TokenInvalid));
    }

    #[tokio::test]
    async fn second_request_while_pending_is_a_conflict() {
        let h = harness();
        let payload = h.core.enter_discoverable();
        let first = spawn_request(&h.core, &payload.token, Utc::now());
        let session_id = wait_for_pending(&h.core).await;

        let err = h
            .core
            .handle_pairing_request(&payload.token, phone())
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::Conflict));
        assert_eq!(h.core.pending().len(), 1);

        h.core.resolve_approval(&session_id, false).unwrap();
        assert!(matches!(
            first.await.unwrap(),
            Err(PairingError::ApprovalDenied)
        ));
    }

    #[tokio::test]
    async fn rejection_creates_no_device() {
        let h = harness();
        let payload = h.core.enter_discoverable();
        let request = spawn_request(&h.core, &payload.token, Utc::now());
        let session_id = wait_for_pending(&h.core).await;

        let outcome = h.core.resolve_approval(&session_id, false).unwrap();
        assert!(matches!(outcome, ApprovalOutcome::Rejected { .. }));
        assert!(matches!(
            request.await.unwrap(),
            Err(PairingError::ApprovalDenied)
        ));
        assert!(h.store.list_devices().unwrap().is_empty());
        assert_eq!(h.core.phase(), PairingPhase::Unpaired);
        assert!(h.core.current_payload().is_none());
    }

    #[tokio::test]
    async fn wrong_token_is_invalid() {
        let h = harness();
        h.core.enter_discoverable();
        let err = h
            .core
            .handle_pairing_request("tok_wrong", phone())
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::TokenInvalid));
        assert_eq!(h.core.phase(), PairingPhase::Discoverable);
    }

    #[tokio::test]
    async fn no_session_means_invalid_token() {
        let h = harness();
        let err = h
            .core
            .handle_pairing_request("tok_abc", phone())
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::TokenInvalid));
    }

    #[tokio::test]
    async fn sweep_expires_pending_session_and_wakes_client() {
        let h = harness();
        let t = Utc::now();
        h.core.start_session("tok_abc".to_string(), t);
        let request = spawn_request(&h.core, "tok_abc", t);
        wait_for_pending(&h.core).await;

        assert_eq!(h.core.sweep_expired_at(t + chrono::Duration::minutes(9)), 0);
        assert_eq!(h.core.sweep_expired_at(t + chrono::Duration::minutes(10)), 1);

        assert!(matches!(
            request.await.unwrap(),
            Err(PairingError::TokenExpired)
        ));
        assert_eq!(h.core.phase(), PairingPhase::Unpaired);
        assert!(h.core.status().session.is_none());
    }

    #[tokio::test]
    async fn sweep_expires_unused_session() {
        let h = harness();
        let t = Utc::now();
        h.core.enter_discoverable_at(t);
        assert_eq!(h.core.sweep_expired_at(t + chrono::Duration::minutes(11)), 1);
        assert_eq!(h.advertiser.toggles(), vec![true, false]);
    }

    #[tokio::test]
    async fn approval_timeout_releases_client_and_session() {
        let h = harness_with(Duration::from_millis(50));
        let payload = h.core.enter_discoverable();

        let err = h
            .core
            .handle_pairing_request(&payload.token, phone())
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::ApprovalTimeout));
        assert!(h.core.pending().is_empty());
        assert_eq!(h.core.phase(), PairingPhase::Unpaired);
    }

    #[tokio::test]
    async fn approving_after_client_left_creates_no_device() {
        let h = harness();
        let payload = h.core.enter_discoverable();
        let request = spawn_request(&h.core, &payload.token, Utc::now());
        let session_id = wait_for_pending(&h.core).await;

        request.abort();
        let _ = request.await;

        let err = h.core.resolve_approval(&session_id, true).unwrap_err();
        assert!(matches!(err, PairingError::ClientGone));
        assert!(h.store.list_devices().unwrap().is_empty());
        assert!(h.core.pending().is_empty());
    }

    #[tokio::test]
    async fn re_entering_discoverable_supersedes_pending_request() {
        let h = harness();
        let old = h.core.enter_discoverable();
        let request = spawn_request(&h.core, &old.token, Utc::now());
        let old_session = wait_for_pending(&h.core).await;

        let new = h.core.enter_discoverable();
        assert_ne!(old.token, new.token);
        assert!(matches!(
            request.await.unwrap(),
            Err(PairingError::Superseded)
        ));
        assert!(matches!(
            h.core.resolve_approval(&old_session, true),
            Err(PairingError::SessionNotFound(_))
        ));
        let err = h
            .core
            .handle_pairing_request(&old.token, phone())
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::TokenInvalid));
    }

    #[tokio::test]
    async fn events_follow_the_lifecycle() {
        let h = harness();
        let mut events = h.core.subscribe();

        let payload = h.core.enter_discoverable();
        let request = spawn_request(&h.core, &payload.token, Utc::now());
        let session_id = wait_for_pending(&h.core).await;
        h.core.resolve_approval(&session_id, true).unwrap();
        let creds = request.await.unwrap().unwrap();
        h.core.revoke_device(&creds.device_id).unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(serde_json::to_value(&event).unwrap()["type"].clone());
        }
        assert_eq!(
            kinds,
            vec![
                "discoverable",
                "approval_requested",
                "device_paired",
                "device_revoked"
            ]
        );
        assert_eq!(h.core.phase(), PairingPhase::Unpaired);
    }

    #[tokio::test]
    async fn resolve_unknown_session_is_not_found() {
        let h = harness();
        h.core.enter_discoverable();
        assert!(matches!(
            h.core.resolve_approval("nope", true),
            Err(PairingError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn overlong_client_name_is_rejected_without_consuming_token() {
        let h = harness();
        let payload = h.core.enter_discoverable();
        let client = ClientInfo {
            name: "x".repeat(200),
            device_info: None,
        };
        let err = h
            .core
            .handle_pairing_request(&payload.token, client)
            .await
            .unwrap_err();
        assert!(matches!(err, PairingError::InvalidRequest(_)));
        assert!(h.core.current_payload().is_some());
    }

    #[tokio::test]
    async fn exit_discoverable_withdraws() {
        let h = harness();
        h.core.enter_discoverable();
        assert!(h.core.exit_discoverable());
        assert!(!h.core.exit_discoverable());
        assert_eq!(h.advertiser.toggles(), vec![true, false]);
        assert_eq!(h.core.phase(), PairingPhase::Unpaired);
    }

    /// Parks `create_device` until the test lets it through.
    struct GatedStore {
        devices: MemoryDeviceStore,
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl DeviceStore for GatedStore {
        fn find_device(&self, id: &str) -> Result<Option<Device>, DeviceStoreError> {
            self.devices.find_device(id)
        }
        fn create_device(&self, device: Device) -> Result<(), DeviceStoreError> {
            let _ = self.entered.lock().unwrap().send(());
            let _ = self
                .release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5));
            self.devices.create_device(device)
        }
        fn revoke_device(&self, id: &str) -> Result<Device, DeviceStoreError> {
            self.devices.revoke_device(id)
        }
        fn touch_last_seen(&self, id: &str, at: DateTime<Utc>) -> Result<(), DeviceStoreError> {
            self.devices.touch_last_seen(id, at)
        }
        fn list_devices(&self) -> Result<Vec<Device>, DeviceStoreError> {
            self.devices.list_devices()
        }
    }

    /// Fails the first `create_device` with an I/O error.
    #[derive(Default)]
    struct FlakyStore {
        devices: MemoryDeviceStore,
        failed: std::sync::atomic::AtomicBool,
    }

    impl DeviceStore for FlakyStore {
        fn find_device(&self, id: &str) -> Result<Option<Device>, DeviceStoreError> {
            self.devices.find_device(id)
        }
        fn create_device(&self, device: Device) -> Result<(), DeviceStoreError> {
            if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(DeviceStoreError::Io(std::io::Error::other("disk full")));
            }
            self.devices.create_device(device)
        }
        fn revoke_device(&self, id: &str) -> Result<Device, DeviceStoreError> {
            self.devices.revoke_device(id)
        }
        fn touch_last_seen(&self, id: &str, at: DateTime<Utc>) -> Result<(), DeviceStoreError> {
            self.devices.touch_last_seen(id, at)
        }
        fn list_devices(&self) -> Result<Vec<Device>, DeviceStoreError> {
            self.devices.list_devices()
        }
    }

    fn core_with(store: Arc<dyn DeviceStore>) -> Arc<PairingCore> {
        Arc::new(PairingCore::new(
            PairingConfig::new("mybox.local", 443, "ab".repeat(32)),
            store,
            Arc::new(NoopAdvertiser),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_device_write_does_not_block_status_or_polls() {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let core = core_with(Arc::new(GatedStore {
            devices: MemoryDeviceStore::new(),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        }));

        let payload = core.enter_discoverable();
        let request = spawn_request(&core, &payload.token, Utc::now());
        let session_id = wait_for_pending(&core).await;

        let approver = {
            let core = core.clone();
            let id = session_id.clone();
            tokio::task::spawn_blocking(move || core.resolve_approval(&id, true))
        };
        tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .unwrap()
            .unwrap();

        // The device write is parked; reads must not queue behind it.
        let polled = {
            let core = core.clone();
            tokio::task::spawn_blocking(move || (core.status(), core.pending()))
        };
        let (status, pending) = tokio::time::timeout(Duration::from_secs(1), polled)
            .await
            .expect("status waited on the device write")
            .unwrap();
        assert_eq!(status.phase, PairingPhase::PairingPending);
        assert_eq!(pending.len(), 1);
        assert!(matches!(
            core.resolve_approval(&session_id, true),
            Err(PairingError::SessionNotFound(_))
        ));

        release_tx.send(()).unwrap();
        assert!(matches!(
            approver.await.unwrap(),
            Ok(ApprovalOutcome::Approved { .. })
        ));
        assert!(request.await.unwrap().is_ok());
        assert_eq!(core.phase(), PairingPhase::Paired);
    }

    #[tokio::test]
    async fn failed_device_write_keeps_request_pending_for_retry() {
        let core = core_with(Arc::new(FlakyStore::default()));
        let payload = core.enter_discoverable();
        let request = spawn_request(&core, &payload.token, Utc::now());
        let session_id = wait_for_pending(&core).await;

        assert!(matches!(
            core.resolve_approval(&session_id, true),
            Err(PairingError::Store(_))
        ));
        assert_eq!(core.pending().len(), 1);
        assert_eq!(core.phase(), PairingPhase::PairingPending);

        core.resolve_approval(&session_id, true).unwrap();
        let creds = request.await.unwrap().unwrap();
        assert!(core.store().find_device(&creds.device_id).unwrap().is_some());
    }

    #[tokio::test]
    async fn sweeper_task_stops_on_cancel() {
        let h = harness();
        let cancel = CancellationToken::new();
        let handle = h.core.spawn_sweeper(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
