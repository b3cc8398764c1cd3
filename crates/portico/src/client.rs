//! HTTP client for the daemon's loopback admin listener.
//!
//! Uses blocking `ureq`; admin commands run without an async runtime.

use std::time::Duration;

use serde::Deserialize;

use portico_common::device::DeviceSummary;
use portico_pairing::{DiscoveryPayload, PendingApproval};

/// TCP connection timeout for general API requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout for general API requests.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for the fast health check probe.
const HEALTH_TIMEOUT: Duration = Duration::from_millis(200);

// ── Error types ───────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Daemon not reachable: {0}")]
    Unreachable(String),

    #[error("{error}: {message}")]
    Api { error: String, message: String },

    #[error("Invalid response: {0}")]
    Decode(String),
}

pub type Result<T> = std::result::Result<T, ClientError>;

/// Response of `POST /v1/pairing/start`.
#[derive(Debug, Deserialize)]
pub struct PairStart {
    pub uri: String,
    pub qr: String,
    pub payload: DiscoveryPayload,
}

// ── Client ────────────────────────────────────────────────────────

pub struct PorticoClient {
    endpoint: String,
    agent: ureq::Agent,
}

impl PorticoClient {
    pub fn new(endpoint: &str) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(READ_TIMEOUT)
            .build();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    /// Quick health check with a 200ms timeout.
    pub fn health(&self) -> Result<()> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(HEALTH_TIMEOUT)
            .timeout_read(HEALTH_TIMEOUT)
            .build();
        agent.get(&self.url("/healthz")).call().map_err(map_error)?;
        Ok(())
    }

    pub fn status(&self) -> Result<serde_json::Value> {
        self.get_json("/v1/status")
    }

    // ── Pairing ───────────────────────────────────────────────────

    pub fn pair_start(&self) -> Result<PairStart> {
        let json = self.post_json("/v1/pairing/start")?;
        serde_json::from_value(json).map_err(|e| ClientError::Decode(e.to_string()))
    }

    pub fn pair_cancel(&self) -> Result<bool> {
        let json = self.post_json("/v1/pairing/cancel")?;
        extract(&json, "cancelled")
    }

    pub fn pending(&self) -> Result<Vec<PendingApproval>> {
        let json = self.get_json("/v1/pairing/pending")?;
        extract(&json, "pending")
    }

    pub fn approve(&self, session_id: &str) -> Result<serde_json::Value> {
        self.post_json(&format!("/v1/pairing/sessions/{session_id}/approve"))
    }

    pub fn reject(&self, session_id: &str) -> Result<serde_json::Value> {
        self.post_json(&format!("/v1/pairing/sessions/{session_id}/reject"))
    }

    // ── Devices ───────────────────────────────────────────────────

    pub fn devices(&self) -> Result<Vec<DeviceSummary>> {
        let json = self.get_json("/v1/devices")?;
        extract(&json, "devices")
    }

    pub fn revoke(&self, device_id: &str) -> Result<DeviceSummary> {
        let json = self.post_json(&format!("/v1/devices/{device_id}/revoke"))?;
        serde_json::from_value(json).map_err(|e| ClientError::Decode(e.to_string()))
    }

    // ── CA ────────────────────────────────────────────────────────

    pub fn root_pem(&self) -> Result<String> {
        let resp = self
            .agent
            .get(&self.url("/v1/ca/root.pem"))
            .call()
            .map_err(map_error)?;
        resp.into_string()
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    // ── Internals ─────────────────────────────────────────────────

    fn get_json(&self, path: &str) -> Result<serde_json::Value> {
        let resp = self.agent.get(&self.url(path)).call().map_err(map_error)?;
        resp.into_json()
            .map_err(|e| ClientError::Decode(e.to_string()))
    }

    fn post_json(&self, path: &str) -> Result<serde_json::Value> {
        let resp = self
            .agent
            .post(&self.url(path))
            .send_bytes(&[])
            .map_err(map_error)?;
        resp.into_json()
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}

fn map_error(e: ureq::Error) -> ClientError {
    match e {
        ureq::Error::Status(_status, resp) => {
            let body = resp.into_string().unwrap_or_default();
            match serde_json::from_str::<serde_json::Value>(&body) {
                Ok(json) => api_error(&json).unwrap_or(ClientError::Api {
                    error: "http_error".into(),
                    message: body,
                }),
                Err(_) => ClientError::Api {
                    error: "http_error".into(),
                    message: body,
                },
            }
        }
        ureq::Error::Transport(t) => ClientError::Unreachable(t.to_string()),
    }
}

fn api_error(json: &serde_json::Value) -> Option<ClientError> {
    let error = json.get("error")?;
    let message = json
        .get("message")
        .and_then(|m| m.as_str())
        .unwrap_or("Unknown error")
        .to_string();
    Some(ClientError::Api {
        error: error.as_str().unwrap_or("unknown").to_string(),
        message,
    })
}

fn extract<T: serde::de::DeserializeOwned>(json: &serde_json::Value, key: &str) -> Result<T> {
    if let Some(err) = api_error(json) {
        return Err(err);
    }
    json.get(key)
        .ok_or_else(|| ClientError::Decode(format!("Missing '{key}' in response")))
        .and_then(|v| {
            serde_json::from_value(v.clone()).map_err(|e| ClientError::Decode(e.to_string()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_returns_value_at_key() {
        let json = serde_json::json!({ "cancelled": true });
        let cancelled: bool = extract(&json, "cancelled").unwrap();
        assert!(cancelled);
    }

    #[test]
    fn extract_missing_key_returns_decode_error() {
        let json = serde_json::json!({ "other": 42 });
        match extract::<serde_json::Value>(&json, "devices") {
            Err(ClientError::Decode(msg)) => assert!(msg.contains("devices"), "msg: {msg}"),
            other => panic!("Expected Decode error, got: {other:?}"),
        }
    }

    #[test]
    fn extract_error_key_returns_api_error() {
        let json = serde_json::json!({ "error": "not_found", "message": "no such device" });
        match extract::<serde_json::Value>(&json, "devices") {
            Err(ClientError::Api { error, message }) => {
                assert_eq!(error, "not_found");
                assert_eq!(message, "no such device");
            }
            other => panic!("Expected Api error, got: {other:?}"),
        }
    }

    #[test]
    fn client_new_strips_trailing_slashes() {
        let client = PorticoClient::new("http://127.0.0.1:5721//");
        assert_eq!(client.endpoint, "http://127.0.0.1:5721");
    }

    #[test]
    fn unreachable_daemon_is_reported_as_such() {
        // Port 9 (discard) on loopback is almost never listening.
        let client = PorticoClient::new("http://127.0.0.1:9");
        assert!(matches!(client.health(), Err(ClientError::Unreachable(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn talks_to_a_live_admin_listener() {
        let config = crate::cli::Config {
            data_dir: portico_common::test::unique_temp_dir("client"),
            settings: portico_config::Settings::default(),
            canonical_domain: "mybox.local".to_string(),
            ephemeral: true,
            with_router: false,
        };
        let cores = crate::wiring::build_cores(
            &config,
            std::sync::Arc::new(portico_pairing::NoopAdvertiser),
            tokio_util::sync::CancellationToken::new(),
        )
        .unwrap();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let app = crate::adapters::http::admin_router(&cores);
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let result = tokio::task::spawn_blocking(move || {
            let client = PorticoClient::new(&endpoint);
            client.health()?;
            let start = client.pair_start()?;
            let pending = client.pending()?;
            let missing = client.revoke("dev_missing");
            let cancelled = client.pair_cancel()?;
            Ok::<_, ClientError>((start, pending, missing, cancelled))
        })
        .await
        .unwrap();

        let (start, pending, missing, cancelled) = result.unwrap();
        assert!(start.uri.starts_with("portico://pair?"));
        assert_eq!(start.payload.host, "mybox.local");
        assert!(pending.is_empty());
        assert!(matches!(missing, Err(ClientError::Api { ref error, .. }) if error == "not_found"));
        assert!(cancelled);

        let _ = std::fs::remove_dir_all(&config.data_dir);
    }
}
