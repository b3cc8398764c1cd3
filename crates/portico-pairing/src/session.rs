//! Pairing data types: phases, sessions, events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Daemon-wide pairing phase.
///
/// ```text
/// UNPAIRED → DISCOVERABLE → PAIRING_PENDING → PAIRED
/// ```
/// `DISCOVERABLE` can be re-entered from any phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingPhase {
    Unpaired,
    Discoverable,
    PairingPending,
    Paired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Issued,
    Requested,
    Approved,
    Rejected,
    Expired,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Expired)
    }
}

/// What the client says about itself when presenting a token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_info: Option<serde_json::Value>,
}

/// An in-flight trust negotiation. At most one exists at a time.
#[derive(Debug, Clone)]
pub struct PairingSession {
    pub id: String,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub client: Option<ClientInfo>,
    pub requested_at: Option<DateTime<Utc>>,
    pub state: SessionState,
}

impl PairingSession {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Public view, without the token.
    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            state: self.state,
            issued_at: self.issued_at,
            expires_at: self.expires_at,
            client_name: self.client.as_ref().map(|c| c.name.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionView {
    pub id: String,
    pub state: SessionState,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
}

/// A request waiting for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingApproval {
    pub session_id: String,
    pub client_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_info: Option<serde_json::Value>,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Handed to the approved client exactly once.
#[derive(Clone, Serialize, Deserialize)]
pub struct DeviceCredentials {
    pub device_id: String,
    pub device_secret: String,
}

impl std::fmt::Debug for DeviceCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCredentials")
            .field("device_id", &self.device_id)
            .field("device_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairingStatus {
    pub phase: PairingPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionView>,
    pub active_devices: usize,
}

/// Streamed to `/v1/events` subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PairingEvent {
    Discoverable {
        session_id: String,
        expires_at: DateTime<Utc>,
    },
    ApprovalRequested {
        session_id: String,
        client_name: String,
    },
    DevicePaired {
        device_id: String,
        name: String,
    },
    PairingRejected {
        session_id: String,
    },
    PairingExpired {
        session_id: String,
    },
    DeviceRevoked {
        device_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(PairingEvent::DeviceRevoked {
            device_id: "dev_1".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "device_revoked");
        assert_eq!(json["device_id"], "dev_1");
    }

    #[test]
    fn phase_uses_snake_case() {
        assert_eq!(
            serde_json::to_value(PairingPhase::PairingPending).unwrap(),
            "pairing_pending"
        );
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = DeviceCredentials {
            device_id: "dev_1".into(),
            device_secret: "s3cr3t".into(),
        };
        assert!(!format!("{creds:?}").contains("s3cr3t"));
    }
}
