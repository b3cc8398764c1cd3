use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;

use crate::api::{error_body, ErrorBody};
use crate::error::ErrorCode;

pub fn error_response(code: ErrorCode, message: impl Into<String>) -> axum::response::Response {
    let status =
        StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body: ErrorBody = error_body(code, message);
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_response_carries_status_and_code() {
        let resp = error_response(ErrorCode::PairingConflict, "a pairing is already pending");
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "pairing_conflict");
        assert!(json.get("retryable").is_none());
    }

    #[tokio::test]
    async fn retryable_errors_say_so() {
        let resp = error_response(ErrorCode::CertificateError, "signing failed");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["retryable"], true);
    }
}
