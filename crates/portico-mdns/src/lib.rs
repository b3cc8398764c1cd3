//! Portico mDNS: publishes the pairing service record while discoverable.
//!
//! The record is identity only: instance name, host, port and the root
//! certificate fingerprint in TXT. The pairing token never goes on the
//! network this way.

use std::sync::Mutex;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tokio::sync::oneshot;

use portico_common::error::ErrorCode;
use portico_pairing::advertise::{AdvertiseError, Advertiser, ServiceAdvert};

/// DNS-SD service type for portico pairing.
pub const SERVICE_TYPE: &str = "_portico._tcp.local.";

/// TXT record schema version.
const TXT_VERSION: &str = "1";

#[derive(Debug, thiserror::Error)]
pub enum MdnsError {
    #[error("mDNS daemon error: {0}")]
    Daemon(String),

    #[error("invalid service record: {0}")]
    InvalidRecord(String),
}

impl From<&MdnsError> for ErrorCode {
    fn from(e: &MdnsError) -> Self {
        match e {
            MdnsError::Daemon(_) => ErrorCode::CapabilityDisabled,
            MdnsError::InvalidRecord(_) => ErrorCode::InvalidPayload,
        }
    }
}

// ── Worker operations ─────────────────────────────────────────────

/// `ServiceDaemon` calls go through one worker thread so its bounded
/// internal channel never blocks the caller, which may hold the pairing
/// lock.
enum MdnsOp {
    Register(Box<ServiceInfo>),
    Unregister(String),
    Shutdown {
        reply: oneshot::Sender<Result<(), String>>,
    },
}

// ── MdnsAdvertiser ────────────────────────────────────────────────

pub struct MdnsAdvertiser {
    op_tx: Mutex<std::sync::mpsc::Sender<MdnsOp>>,
    /// Advert currently published, with its DNS-SD full name.
    current: Mutex<Option<(ServiceAdvert, String)>>,
}

impl MdnsAdvertiser {
    pub fn new() -> Result<Self, MdnsError> {
        let daemon = ServiceDaemon::new().map_err(|e| MdnsError::Daemon(e.to_string()))?;
        let (op_tx, op_rx) = std::sync::mpsc::channel();

        std::thread::Builder::new()
            .name("portico-mdns".into())
            .spawn(move || worker_loop(daemon, op_rx))
            .map_err(|e| MdnsError::Daemon(format!("Failed to spawn mDNS worker: {e}")))?;

        Ok(Self {
            op_tx: Mutex::new(op_tx),
            current: Mutex::new(None),
        })
    }

    fn send(&self, op: MdnsOp) -> Result<(), MdnsError> {
        self.op_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(op)
            .map_err(|_| MdnsError::Daemon("mDNS worker stopped".into()))
    }

    /// Withdraw the record and stop the daemon.
    pub async fn shutdown(&self) -> Result<(), MdnsError> {
        self.withdraw();
        let (tx, rx) = oneshot::channel();
        self.send(MdnsOp::Shutdown { reply: tx })?;
        rx.await
            .map_err(|_| MdnsError::Daemon("mDNS worker dropped reply".into()))?
            .map_err(MdnsError::Daemon)
    }
}

impl Advertiser for MdnsAdvertiser {
    fn advertise(&self, advert: &ServiceAdvert) -> Result<(), AdvertiseError> {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((published, _)) = current.as_ref() {
            if published == advert {
                return Ok(());
            }
        }

        let info = service_info(advert).map_err(|e| AdvertiseError(e.to_string()))?;
        let fullname = info.get_fullname().to_string();
        if let Some((_, old)) = current.take() {
            let _ = self.send(MdnsOp::Unregister(old));
        }
        self.send(MdnsOp::Register(Box::new(info)))
            .map_err(|e| AdvertiseError(e.to_string()))?;
        tracing::info!(fullname, host = %advert.host, port = advert.port, "mDNS pairing record published");
        *current = Some((advert.clone(), fullname));
        Ok(())
    }

    fn withdraw(&self) {
        let taken = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some((_, fullname)) = taken {
            if let Err(e) = self.send(MdnsOp::Unregister(fullname.clone())) {
                tracing::warn!(fullname, error = %e, "mDNS withdraw failed");
            } else {
                tracing::info!(fullname, "mDNS pairing record withdrawn");
            }
        }
    }
}

/// Build the DNS-SD record for `advert`.
pub fn service_info(advert: &ServiceAdvert) -> Result<ServiceInfo, MdnsError> {
    let host = mdns_host(&advert.host);
    let properties = [
        ("v", TXT_VERSION),
        ("host", advert.host.as_str()),
        ("fp", advert.root_fingerprint.as_str()),
    ];
    let info = ServiceInfo::new(
        SERVICE_TYPE,
        &advert.instance_name,
        &host,
        "",
        advert.port,
        &properties[..],
    )
    .map_err(|e| MdnsError::InvalidRecord(e.to_string()))?;
    Ok(info.enable_addr_auto())
}

/// mDNS host name: the canonical domain when it is a `.local` name,
/// otherwise the machine host name under `.local`.
fn mdns_host(canonical: &str) -> String {
    let canonical = canonical.trim_end_matches('.');
    if canonical.ends_with(".local") {
        return format!("{canonical}.");
    }
    let hostname = hostname::get()
        .unwrap_or_else(|_| "localhost".into())
        .to_string_lossy()
        .to_string();
    format!("{hostname}.local.")
}

// ── Worker thread ─────────────────────────────────────────────────

fn worker_loop(daemon: ServiceDaemon, rx: std::sync::mpsc::Receiver<MdnsOp>) {
    tracing::debug!("mDNS worker thread started");

    while let Ok(op) = rx.recv() {
        match op {
            MdnsOp::Register(info) => {
                let fullname = info.get_fullname().to_string();
                if let Err(e) = daemon.register(*info) {
                    tracing::warn!(fullname, error = %e, "mDNS register failed");
                }
            }
            MdnsOp::Unregister(fullname) => {
                if let Err(e) = daemon.unregister(&fullname) {
                    tracing::warn!(fullname, error = %e, "mDNS unregister failed");
                }
            }
            MdnsOp::Shutdown { reply } => {
                let result = daemon.shutdown().map(|_| ()).map_err(|e| e.to_string());
                let _ = reply.send(result);
                break;
            }
        }
    }

    tracing::debug!("mDNS worker thread stopped");
}
