//! Pairing HTTP routes.
//!
//! Three routers. The binary mounts [`public_routes`] (token-gated, no
//! request signing) and [`admin_routes`] together at `/v1/pairing/`, and
//! [`device_routes`] at `/v1/devices/`. On the TLS API the admin and device
//! routes sit behind device authentication; the loopback admin listener
//! serves them as is.

use std::sync::Arc;

use axum::extract::{Extension, Path};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;

use portico_common::error::ErrorCode;

use crate::qr::qr_code_unicode;
use crate::session::ClientInfo;
use crate::{PairingCore, PairingError};

#[derive(Debug, Deserialize)]
struct PairRequest {
    token: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    device_info: Option<serde_json::Value>,
}

pub fn public_routes(core: Arc<PairingCore>) -> Router {
    Router::new()
        .route("/request", post(request_handler))
        .layer(Extension(core))
}

pub fn admin_routes(core: Arc<PairingCore>) -> Router {
    Router::new()
        .route("/start", post(start_handler))
        .route("/cancel", post(cancel_handler))
        .route("/status", get(status_handler))
        .route("/pending", get(pending_handler))
        .route("/sessions/{id}/approve", post(approve_handler))
        .route("/sessions/{id}/reject", post(reject_handler))
        .layer(Extension(core))
}

pub fn device_routes(core: Arc<PairingCore>) -> Router {
    Router::new()
        .route("/", get(list_devices_handler))
        .route("/{id}/revoke", post(revoke_handler))
        .layer(Extension(core))
}

/// POST /request: present a pairing token and wait for approval.
async fn request_handler(
    Extension(core): Extension<Arc<PairingCore>>,
    Json(payload): Json<PairRequest>,
) -> impl IntoResponse {
    let client = ClientInfo {
        name: payload.name,
        device_info: payload.device_info,
    };
    match core.handle_pairing_request(&payload.token, client).await {
        Ok(credentials) => Json(credentials).into_response(),
        Err(e) => map_error(&e),
    }
}

/// POST /start: become discoverable and return the QR payload.
async fn start_handler(Extension(core): Extension<Arc<PairingCore>>) -> impl IntoResponse {
    let payload = core.enter_discoverable();
    let session = core.status().session;
    Json(serde_json::json!({
        "session": session,
        "uri": payload.to_uri(),
        "qr": qr_code_unicode(&payload),
        "payload": payload,
    }))
}

async fn cancel_handler(Extension(core): Extension<Arc<PairingCore>>) -> impl IntoResponse {
    let cancelled = core.exit_discoverable();
    Json(serde_json::json!({ "cancelled": cancelled }))
}

async fn status_handler(Extension(core): Extension<Arc<PairingCore>>) -> impl IntoResponse {
    Json(core.status())
}

async fn pending_handler(Extension(core): Extension<Arc<PairingCore>>) -> impl IntoResponse {
    Json(serde_json::json!({ "pending": core.pending() }))
}

async fn approve_handler(
    Extension(core): Extension<Arc<PairingCore>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    resolve(&core, &id, true)
}

async fn reject_handler(
    Extension(core): Extension<Arc<PairingCore>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    resolve(&core, &id, false)
}

fn resolve(core: &PairingCore, id: &str, approve: bool) -> axum::response::Response {
    match core.resolve_approval(id, approve) {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => map_error(&e),
    }
}

async fn list_devices_handler(Extension(core): Extension<Arc<PairingCore>>) -> impl IntoResponse {
    match core.list_devices() {
        Ok(devices) => Json(serde_json::json!({ "devices": devices })).into_response(),
        Err(e) => map_error(&e),
    }
}

/// POST /{id}/revoke: idempotent.
async fn revoke_handler(
    Extension(core): Extension<Arc<PairingCore>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match core.revoke_device(&id) {
        Ok(device) => Json(device).into_response(),
        Err(e) => map_error(&e),
    }
}

fn map_error(e: &PairingError) -> axum::response::Response {
    let code = ErrorCode::from(e);
    if matches!(code, ErrorCode::IoError | ErrorCode::Internal) {
        tracing::error!(error = %e, "Pairing request failed");
    }
    portico_common::http::error_response(code, e.to_string())
}
