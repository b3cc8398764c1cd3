//! `/v1/events`: pairing events as JSON text frames.
//!
//! On the TLS API the upgrade is authenticated; a device whose record is
//! revoked while connected is disconnected with the unauthorized close code.

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{OriginalUri, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use portico_auth::http::UNAUTHORIZED_MESSAGE;
use portico_auth::ws::{authenticate_upgrade, guarded_upgrade, UNAUTHORIZED_CLOSE_CODE};
use portico_auth::AuthenticatedDevice;
use portico_pairing::PairingEvent;

use crate::wiring::DaemonCores;

pub fn api_routes(cores: DaemonCores) -> Router {
    Router::new()
        .route("/v1/events", get(api_events_handler))
        .with_state(cores)
}

pub fn admin_routes(cores: DaemonCores) -> Router {
    Router::new()
        .route("/v1/events", get(admin_events_handler))
        .with_state(cores)
}

async fn api_events_handler(
    ws: WebSocketUpgrade,
    State(cores): State<DaemonCores>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Response {
    let auth = authenticate_upgrade(&cores.guard, &uri, &headers);
    let events = cores.pairing.subscribe();
    let cancel = cores.cancel.clone();
    guarded_upgrade(ws, auth, move |socket, device| {
        tracing::debug!(device = %device.device_id, "Event stream opened");
        stream_events(socket, Some(device), events, cancel)
    })
}

async fn admin_events_handler(ws: WebSocketUpgrade, State(cores): State<DaemonCores>) -> Response {
    let events = cores.pairing.subscribe();
    let cancel = cores.cancel.clone();
    ws.on_upgrade(move |socket| stream_events(socket, None, events, cancel))
}

async fn stream_events(
    socket: WebSocket,
    device: Option<AuthenticatedDevice>,
    mut events: broadcast::Receiver<PairingEvent>,
    cancel: CancellationToken,
) {
    let (mut sender, mut receiver) = socket.split();

    let close = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: "shutting down".into(),
                });
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if revokes(&event, device.as_ref()) {
                        break Some(CloseFrame {
                            code: UNAUTHORIZED_CLOSE_CODE,
                            reason: UNAUTHORIZED_MESSAGE.into(),
                        });
                    }
                    let text = match serde_json::to_string(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!(error = %e, "Could not encode pairing event");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break None;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event stream subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break None,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break None,
                Some(Ok(_)) => {}
            },
        }
    };

    if let Some(frame) = close {
        let _ = sender.send(Message::Close(Some(frame))).await;
    }
    tracing::debug!("Event stream closed");
}

fn revokes(event: &PairingEvent, device: Option<&AuthenticatedDevice>) -> bool {
    match (event, device) {
        (PairingEvent::DeviceRevoked { device_id }, Some(device)) => *device_id == device.device_id,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn device(id: &str) -> AuthenticatedDevice {
        AuthenticatedDevice {
            device_id: id.to_string(),
            name: "phone".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn only_own_revocation_ends_the_stream() {
        let event = PairingEvent::DeviceRevoked {
            device_id: "dev_a".to_string(),
        };
        assert!(revokes(&event, Some(&device("dev_a"))));
        assert!(!revokes(&event, Some(&device("dev_b"))));
        assert!(!revokes(&event, None));
    }

    #[tokio::test]
    async fn admin_stream_delivers_events_and_closes_on_shutdown() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let cancel = CancellationToken::new();
        let config = crate::cli::Config {
            data_dir: portico_common::test::unique_temp_dir("ws"),
            settings: portico_config::Settings::default(),
            canonical_domain: "mybox.local".to_string(),
            ephemeral: true,
            with_router: false,
        };
        let cores = crate::wiring::build_cores(
            &config,
            std::sync::Arc::new(portico_pairing::NoopAdvertiser),
            cancel.clone(),
        )
        .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = admin_routes(cores.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET /v1/events HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        assert!(String::from_utf8_lossy(&head).starts_with("HTTP/1.1 101"));

        // Subscribed before the 101 went out.
        cores.pairing.enter_discoverable();

        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x81, "text frame");
        let len = (header[1] & 0x7f) as usize;
        assert!(len < 126);
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["type"], "discoverable");

        cancel.cancel();
        stream.read_exact(&mut header).await.unwrap();
        assert_eq!(header[0], 0x88, "close frame");
        let mut code = [0u8; 2];
        stream.read_exact(&mut code).await.unwrap();
        assert_eq!(u16::from_be_bytes(code), close_code::AWAY);

        let _ = std::fs::remove_dir_all(&config.data_dir);
    }
}
