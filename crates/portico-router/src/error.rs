use std::net::SocketAddr;

use portico_common::error::ErrorCode;

use crate::sni::SniError;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("cannot bind router listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid router config: {0}")]
    InvalidConfig(String),

    #[error("ClientHello not received within {0:?}")]
    SniTimeout(std::time::Duration),

    #[error("client closed before sending a complete ClientHello")]
    ClosedEarly,

    #[error(transparent)]
    Sni(#[from] SniError),

    #[error("upstream {addr} unreachable: {reason}")]
    Upstream { addr: SocketAddr, reason: String },

    #[error("router io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<&RouterError> for ErrorCode {
    fn from(e: &RouterError) -> Self {
        match e {
            RouterError::InvalidConfig(_) => ErrorCode::InvalidPayload,
            RouterError::Bind { .. } | RouterError::Io(_) => ErrorCode::IoError,
            _ => ErrorCode::Internal,
        }
    }
}
