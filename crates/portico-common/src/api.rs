use serde::{Deserialize, Serialize};

use crate::error::ErrorCode;

/// Standard error body for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

pub fn error_body(code: ErrorCode, message: impl Into<String>) -> ErrorBody {
    ErrorBody {
        error: code,
        message: message.into(),
        retryable: code.is_retryable(),
    }
}
