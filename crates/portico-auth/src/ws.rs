//! WebSocket upgrade authentication.
//!
//! The client signs `WEBSOCKET\n<path>\n-\n<timestamp>` and sends the
//! credentials as query parameters (`device_id`, `timestamp`, `signature`)
//! or as the usual `X-Portico-*` headers. On failure the upgrade completes
//! and the socket is closed at once with code 4401, before any application
//! frame is sent.

use std::future::Future;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::Query;
use axum::http::{HeaderMap, Uri};
use axum::response::Response;
use serde::Deserialize;

use portico_crypto::signing::WEBSOCKET_METHOD;

use crate::http::{Credentials, UNAUTHORIZED_MESSAGE};
use crate::{AuthError, AuthGuard, AuthenticatedDevice, SignedRequest};

/// Close code sent when upgrade authentication fails.
pub const UNAUTHORIZED_CLOSE_CODE: u16 = 4401;

#[derive(Debug, Default, Deserialize)]
struct QueryCredentials {
    device_id: Option<String>,
    timestamp: Option<String>,
    signature: Option<String>,
}

/// Query parameters win over headers when both are present.
pub fn upgrade_credentials(uri: &Uri, headers: &HeaderMap) -> Option<Credentials> {
    if let Ok(Query(query)) = Query::<QueryCredentials>::try_from_uri(uri) {
        if let (Some(device_id), Some(timestamp), Some(signature)) =
            (query.device_id, query.timestamp, query.signature)
        {
            return Some(Credentials {
                device_id,
                timestamp,
                signature,
            });
        }
    }
    Credentials::from_headers(headers)
}

pub fn authenticate_upgrade(
    guard: &AuthGuard,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<AuthenticatedDevice, AuthError> {
    let credentials = upgrade_credentials(uri, headers).ok_or(AuthError::MissingCredentials)?;
    guard.verify(&SignedRequest {
        device_id: &credentials.device_id,
        method: WEBSOCKET_METHOD,
        path: uri.path(),
        body: &[],
        timestamp: &credentials.timestamp,
        signature: &credentials.signature,
    })
}

/// Complete the upgrade and hand the socket to `handler`, or close it with
/// [`UNAUTHORIZED_CLOSE_CODE`] when `auth` failed.
pub fn guarded_upgrade<F, Fut>(
    ws: WebSocketUpgrade,
    auth: Result<AuthenticatedDevice, AuthError>,
    handler: F,
) -> Response
where
    F: FnOnce(WebSocket, AuthenticatedDevice) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    match auth {
        Ok(device) => ws.on_upgrade(move |socket| handler(socket, device)),
        Err(e) if e.is_credential_failure() => ws.on_upgrade(close_unauthorized),
        Err(e) => {
            tracing::error!(error = %e, "WebSocket authentication could not complete");
            ws.on_upgrade(|socket| close_with(socket, close_code::ERROR, "internal error"))
        }
    }
}

pub async fn close_unauthorized(socket: WebSocket) {
    close_with(socket, UNAUTHORIZED_CLOSE_CODE, UNAUTHORIZED_MESSAGE).await;
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "Failed to send WebSocket close frame");
    }
}
