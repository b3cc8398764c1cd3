//! CA HTTP routes. The binary mounts these, unauthenticated, at `/v1/ca/`.

use std::sync::Arc;

use axum::extract::Extension;
use axum::http::header;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;

use crate::CaCore;

pub fn routes(core: Arc<CaCore>) -> Router {
    Router::new()
        .route("/root.pem", get(root_pem_handler))
        .route("/fingerprint", get(fingerprint_handler))
        .layer(Extension(core))
}

/// GET /root.pem: root certificate for one-time trust installation.
async fn root_pem_handler(Extension(core): Extension<Arc<CaCore>>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/x-pem-file"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"portico-root.pem\"",
            ),
        ],
        core.root_pem().to_string(),
    )
}

async fn fingerprint_handler(Extension(core): Extension<Arc<CaCore>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "sha256": core.root_fingerprint(),
        "expires_at": core.root_expires_at(),
    }))
}
