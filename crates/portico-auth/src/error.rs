use portico_common::device::DeviceStoreError;
use portico_common::error::ErrorCode;

/// Why a signed request was refused.
///
/// The variants exist for logs only. Every credential failure reaches the
/// client as the same `unauthorized` response.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing authentication credentials")]
    MissingCredentials,

    #[error("timestamp is not RFC 3339")]
    MalformedTimestamp,

    #[error("timestamp outside the {skew_secs}s skew window")]
    StaleTimestamp { skew_secs: i64 },

    #[error("unknown device")]
    UnknownDevice,

    #[error("device is revoked")]
    Revoked,

    #[error("signature mismatch")]
    BadSignature,

    #[error("replayed request")]
    Replayed,

    #[error("device store error: {0}")]
    Store(#[from] DeviceStoreError),
}

impl AuthError {
    /// Whether the failure says something about the caller's credentials
    /// rather than about the daemon.
    pub fn is_credential_failure(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

impl From<&AuthError> for ErrorCode {
    fn from(e: &AuthError) -> Self {
        match e {
            AuthError::Store(_) => ErrorCode::IoError,
            _ => ErrorCode::Unauthorized,
        }
    }
}
