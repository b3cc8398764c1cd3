//! Pairing error types.
//!
//! Pairing callers are a trusted onboarding flow, so every failure maps to
//! a specific, actionable code.

use portico_common::device::DeviceStoreError;
use portico_common::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("pairing token is not valid")]
    TokenInvalid,

    #[error("pairing token has expired, start pairing again")]
    TokenExpired,

    #[error("another pairing request is already awaiting approval")]
    Conflict,

    #[error("pairing session was replaced by a newer one")]
    Superseded,

    #[error("pairing request was rejected")]
    ApprovalDenied,

    #[error("no decision was made before the approval timeout")]
    ApprovalTimeout,

    #[error("the requesting client is no longer waiting")]
    ClientGone,

    #[error("no pending pairing session with id {0}")]
    SessionNotFound(String),

    #[error("invalid pairing request: {0}")]
    InvalidRequest(String),

    #[error("pairing is shutting down")]
    Cancelled,

    #[error("device store error: {0}")]
    Store(#[from] DeviceStoreError),
}

impl From<&PairingError> for ErrorCode {
    fn from(e: &PairingError) -> Self {
        match e {
            PairingError::TokenInvalid => ErrorCode::TokenInvalid,
            PairingError::TokenExpired => ErrorCode::TokenExpired,
            PairingError::Conflict | PairingError::Superseded => ErrorCode::PairingConflict,
            PairingError::ApprovalDenied => ErrorCode::ApprovalDenied,
            PairingError::ApprovalTimeout => ErrorCode::ApprovalTimeout,
            PairingError::ClientGone => ErrorCode::ClientGone,
            PairingError::SessionNotFound(_) => ErrorCode::NotFound,
            PairingError::InvalidRequest(_) => ErrorCode::InvalidPayload,
            PairingError::Cancelled => ErrorCode::ShuttingDown,
            PairingError::Store(e) => ErrorCode::from(e),
        }
    }
}
