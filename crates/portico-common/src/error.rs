use serde::{Deserialize, Serialize};

/// Machine-readable error codes for the wire protocol.
/// Shared by all transports and domains.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidPayload,
    NotFound,
    Conflict,
    IoError,
    Internal,
    ShuttingDown,
    CapabilityDisabled,
    // Authentication
    Unauthorized,
    // Pairing
    PairingConflict,
    TokenInvalid,
    TokenExpired,
    ApprovalDenied,
    ApprovalTimeout,
    ClientGone,
    // Certificates
    CertificateError,
}

impl ErrorCode {
    /// Suggested HTTP status code for this error.
    /// Transport-agnostic (returns u16, not an axum type).
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidPayload => 400,
            Self::Unauthorized => 401,
            Self::ApprovalDenied => 403,
            Self::NotFound | Self::TokenInvalid => 404,
            Self::Conflict | Self::PairingConflict => 409,
            Self::TokenExpired | Self::ClientGone => 410,
            Self::IoError | Self::Internal => 500,
            Self::ShuttingDown | Self::CapabilityDisabled | Self::CertificateError => 503,
            Self::ApprovalTimeout => 504,
        }
    }

    /// Whether a client may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CertificateError | Self::ShuttingDown | Self::IoError
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Adding a new ErrorCode variant forces an update here.
    #[test]
    fn all_error_code_variants_map_to_expected_http_status() {
        let cases: Vec<(ErrorCode, u16)> = vec![
            (ErrorCode::InvalidPayload, 400),
            (ErrorCode::Unauthorized, 401),
            (ErrorCode::ApprovalDenied, 403),
            (ErrorCode::NotFound, 404),
            (ErrorCode::TokenInvalid, 404),
            (ErrorCode::Conflict, 409),
            (ErrorCode::PairingConflict, 409),
            (ErrorCode::TokenExpired, 410),
            (ErrorCode::ClientGone, 410),
            (ErrorCode::IoError, 500),
            (ErrorCode::Internal, 500),
            (ErrorCode::ShuttingDown, 503),
            (ErrorCode::CapabilityDisabled, 503),
            (ErrorCode::CertificateError, 503),
            (ErrorCode::ApprovalTimeout, 504),
        ];
        for (code, expected_status) in &cases {
            assert_eq!(
                code.http_status(),
                *expected_status,
                "{code:?} should map to HTTP {expected_status}"
            );
        }
    }

    #[test]
    fn error_code_serializes_to_snake_case() {
        assert_eq!(
            serde_json::to_value(ErrorCode::PairingConflict).unwrap(),
            "pairing_conflict"
        );
        assert_eq!(
            serde_json::to_value(ErrorCode::CertificateError).unwrap(),
            "certificate_error"
        );
    }

    #[test]
    fn only_certificate_and_transient_errors_are_retryable() {
        assert!(ErrorCode::CertificateError.is_retryable());
        assert!(!ErrorCode::Unauthorized.is_retryable());
        assert!(!ErrorCode::PairingConflict.is_retryable());
    }
}
