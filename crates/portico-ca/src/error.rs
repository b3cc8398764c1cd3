//! Certificate authority error types.

use portico_common::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("invalid domain name: {0}")]
    InvalidDomain(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error("root CA on disk is unreadable: {0}")]
    RootCorrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rcgen::Error> for CaError {
    fn from(e: rcgen::Error) -> Self {
        Self::Certificate(e.to_string())
    }
}

impl From<&CaError> for ErrorCode {
    fn from(e: &CaError) -> Self {
        match e {
            CaError::InvalidDomain(_) => ErrorCode::InvalidPayload,
            CaError::KeyGeneration(_) | CaError::Certificate(_) | CaError::RootCorrupt(_) => {
                ErrorCode::CertificateError
            }
            CaError::Io(_) => ErrorCode::IoError,
        }
    }
}
