//! axum middleware that gates privileged routes on a signed request.
//!
//! Mount with `route_layer(middleware::from_fn_with_state(guard, require_device))`.
//! Handlers read the caller from `Extension<AuthenticatedDevice>`.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{OriginalUri, Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;

use portico_common::error::ErrorCode;
use portico_common::http::error_response;

use crate::{AuthError, AuthGuard, SignedRequest};

pub const DEVICE_HEADER: &str = "x-portico-device";
pub const TIMESTAMP_HEADER: &str = "x-portico-timestamp";
pub const SIGNATURE_HEADER: &str = "x-portico-signature";

/// The fixed client-facing message for every credential failure.
pub const UNAUTHORIZED_MESSAGE: &str = "unauthorized";

/// Credential triple as it arrived on the wire.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub device_id: String,
    pub timestamp: String,
    pub signature: String,
}

impl Credentials {
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Some(Self {
            device_id: get(DEVICE_HEADER)?,
            timestamp: get(TIMESTAMP_HEADER)?,
            signature: get(SIGNATURE_HEADER)?,
        })
    }
}

/// Response for a rejected request. Credential failures never say why.
pub fn rejection(e: &AuthError) -> Response {
    let code = ErrorCode::from(e);
    if e.is_credential_failure() {
        error_response(code, UNAUTHORIZED_MESSAGE)
    } else {
        tracing::error!(error = %e, "Authentication could not complete");
        error_response(code, "device store unavailable")
    }
}

pub async fn require_device(
    State(guard): State<Arc<AuthGuard>>,
    request: Request,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();

    let Some(credentials) = Credentials::from_headers(&parts.headers) else {
        return rejection(&AuthError::MissingCredentials);
    };

    let bytes = match axum::body::to_bytes(body, guard.config().max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(ErrorCode::InvalidPayload, "request body too large");
        }
    };

    // Nested routers strip their prefix; clients sign the full path.
    let uri = parts
        .extensions
        .get::<OriginalUri>()
        .map(|original| original.0.clone())
        .unwrap_or_else(|| parts.uri.clone());
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| uri.path());

    let signed = SignedRequest {
        device_id: &credentials.device_id,
        method: parts.method.as_str(),
        path,
        body: &bytes,
        timestamp: &credentials.timestamp,
        signature: &credentials.signature,
    };

    match guard.verify(&signed) {
        Ok(device) => {
            parts.extensions.insert(device);
            next.run(Request::from_parts(parts, Body::from(bytes))).await
        }
        Err(e) => rejection(&e),
    }
}
