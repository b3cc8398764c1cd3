//! Paired device records and the device-store collaborator.
//!
//! Devices are created once, when a pairing approval resolves, and are
//! never deleted. The only mutations are the `last_seen_at` refresh and
//! soft revocation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;
use crate::persist;

/// Minimum interval between persisted `last_seen_at` refreshes.
const LAST_SEEN_PERSIST_INTERVAL_SECS: i64 = 60;

const DEVICE_FILE_VERSION: u32 = 1;

/// A paired client. Holds the hash of the device secret, never the secret.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: String,
    pub name: String,
    /// Lowercase hex SHA-256 of the device secret.
    pub secret_hash: String,
    pub paired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<serde_json::Value>,
}

/// Device as shown to API clients (no secret material).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSummary {
    pub id: String,
    pub name: String,
    pub paired_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub is_revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Device {
    pub fn summary(&self) -> DeviceSummary {
        DeviceSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            paired_at: self.paired_at,
            last_seen_at: self.last_seen_at,
            is_revoked: self.is_revoked,
            revoked_at: self.revoked_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceStoreError {
    #[error("device not found: {0}")]
    NotFound(String),

    #[error("device already exists: {0}")]
    AlreadyExists(String),

    #[error("device store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&DeviceStoreError> for ErrorCode {
    fn from(e: &DeviceStoreError) -> Self {
        match e {
            DeviceStoreError::NotFound(_) => ErrorCode::NotFound,
            DeviceStoreError::AlreadyExists(_) => ErrorCode::Conflict,
            DeviceStoreError::Io(_) => ErrorCode::IoError,
        }
    }
}

/// Persistence collaborator for device records.
///
/// Implementations own their storage format; callers only see records.
pub trait DeviceStore: Send + Sync {
    fn find_device(&self, id: &str) -> Result<Option<Device>, DeviceStoreError>;
    fn create_device(&self, device: Device) -> Result<(), DeviceStoreError>;
    /// Mark a device revoked. Revoking twice keeps the first `revoked_at`.
    fn revoke_device(&self, id: &str) -> Result<Device, DeviceStoreError>;
    fn touch_last_seen(&self, id: &str, at: DateTime<Utc>) -> Result<(), DeviceStoreError>;
    /// All devices, revoked included, ordered by id.
    fn list_devices(&self) -> Result<Vec<Device>, DeviceStoreError>;
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn revoke_in(devices: &mut BTreeMap<String, Device>, id: &str) -> Result<Device, DeviceStoreError> {
    let device = devices
        .get_mut(id)
        .ok_or_else(|| DeviceStoreError::NotFound(id.to_string()))?;
    if !device.is_revoked {
        device.is_revoked = true;
        device.revoked_at = Some(Utc::now());
    }
    Ok(device.clone())
}

// ── In-memory store ─────────────────────────────────────────────────

/// Process-local store. Used by tests and `portico daemon --ephemeral`.
#[derive(Default)]
pub struct MemoryDeviceStore {
    devices: Mutex<BTreeMap<String, Device>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeviceStore for MemoryDeviceStore {
    fn find_device(&self, id: &str) -> Result<Option<Device>, DeviceStoreError> {
        Ok(lock(&self.devices).get(id).cloned())
    }

    fn create_device(&self, device: Device) -> Result<(), DeviceStoreError> {
        let mut devices = lock(&self.devices);
        if devices.contains_key(&device.id) {
            return Err(DeviceStoreError::AlreadyExists(device.id));
        }
        devices.insert(device.id.clone(), device);
        Ok(())
    }

    fn revoke_device(&self, id: &str) -> Result<Device, DeviceStoreError> {
        revoke_in(&mut lock(&self.devices), id)
    }

    fn touch_last_seen(&self, id: &str, at: DateTime<Utc>) -> Result<(), DeviceStoreError> {
        let mut devices = lock(&self.devices);
        let device = devices
            .get_mut(id)
            .ok_or_else(|| DeviceStoreError::NotFound(id.to_string()))?;
        device.last_seen_at = Some(at);
        Ok(())
    }

    fn list_devices(&self) -> Result<Vec<Device>, DeviceStoreError> {
        Ok(lock(&self.devices).values().cloned().collect())
    }
}

// ── JSON file store ─────────────────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct DeviceFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    devices: Vec<Device>,
}

/// Store backed by a single JSON file, rewritten atomically on change.
///
/// `last_seen_at` refreshes are kept in memory and written at most once
/// a minute per device, so authenticated traffic does not rewrite the
/// file on every request.
pub struct JsonDeviceStore {
    path: PathBuf,
    devices: Mutex<BTreeMap<String, Device>>,
}

impl JsonDeviceStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DeviceStoreError> {
        let path = path.into();
        let file: DeviceFile = persist::read_json_or_default(&path)?;
        let devices = file
            .devices
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect::<BTreeMap<_, _>>();
        tracing::debug!(path = %path.display(), count = devices.len(), "Device store loaded");
        Ok(Self {
            path,
            devices: Mutex::new(devices),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, devices: &BTreeMap<String, Device>) -> Result<(), DeviceStoreError> {
        let file = DeviceFile {
            version: DEVICE_FILE_VERSION,
            devices: devices.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        persist::write_private(&self.path, &json)?;
        Ok(())
    }
}

impl DeviceStore for JsonDeviceStore {
    fn find_device(&self, id: &str) -> Result<Option<Device>, DeviceStoreError> {
        Ok(lock(&self.devices).get(id).cloned())
    }

    fn create_device(&self, device: Device) -> Result<(), DeviceStoreError> {
        let mut devices = lock(&self.devices);
        if devices.contains_key(&device.id) {
            return Err(DeviceStoreError::AlreadyExists(device.id));
        }
        let id = device.id.clone();
        devices.insert(id.clone(), device);
        if let Err(e) = self.save(&devices) {
            devices.remove(&id);
            return Err(e);
        }
        Ok(())
    }

    fn revoke_device(&self, id: &str) -> Result<Device, DeviceStoreError> {
        let mut devices = lock(&self.devices);
        let device = revoke_in(&mut devices, id)?;
        self.save(&devices)?;
        Ok(device)
    }

    fn touch_last_seen(&self, id: &str, at: DateTime<Utc>) -> Result<(), DeviceStoreError> {
        let mut devices = lock(&self.devices);
        let device = devices
            .get_mut(id)
            .ok_or_else(|| DeviceStoreError::NotFound(id.to_string()))?;
        let stale = device
            .last_seen_at
            .map(|prev| at - prev >= Duration::seconds(LAST_SEEN_PERSIST_INTERVAL_SECS))
            .unwrap_or(true);
        device.last_seen_at = Some(at);
        if stale {
            if let Err(e) = self.save(&devices) {
                tracing::warn!(error = %e, "Failed to persist last-seen time");
            }
        }
        Ok(())
    }

    fn list_devices(&self) -> Result<Vec<Device>, DeviceStoreError> {
        Ok(lock(&self.devices).values().cloned().collect())
    }
}
