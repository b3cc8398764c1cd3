//! HTTP adapters: the TLS API and the loopback admin listener.
//!
//! Both serve the same domain routes. On the TLS API, pairing
//! administration and device management require a signed request from a
//! paired device; on the admin listener they are open to local processes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{Json, Response};
use axum::routing::get;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use portico_auth::http::require_device;
use portico_common::capability::{all_healthy, Capability, CapabilityStatus};
use portico_common::error::ErrorCode;
use portico_common::http::error_response;
use portico_pairing::http as pairing_http;

use crate::adapters::ws;
use crate::wiring::DaemonCores;

/// Time allowed for in-flight requests once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ── Routers ─────────────────────────────────────────────────────────

/// Router for the TLS API (reached through the router on port 443).
///
/// Pairing administration (start, cancel, status, pending, approve,
/// reject) and the device list require a signed request from a paired
/// device here. The first device is paired from the loopback admin
/// listener instead. `/v1/pairing/request` stays public: the one-time
/// token is its credential.
pub fn api_router(cores: &DaemonCores) -> Router {
    let auth = middleware::from_fn_with_state(Arc::clone(&cores.guard), require_device);
    let pairing = Arc::clone(&cores.pairing);

    common_routes(cores)
        .nest(
            "/v1/pairing",
            pairing_http::public_routes(Arc::clone(&pairing))
                .merge(pairing_http::admin_routes(Arc::clone(&pairing)).route_layer(auth.clone())),
        )
        .nest(
            "/v1/devices",
            pairing_http::device_routes(pairing).route_layer(auth),
        )
        .merge(ws::api_routes(cores.clone()))
        .layer(CorsLayer::permissive())
}

/// Router for the loopback admin listener. No device authentication.
pub fn admin_router(cores: &DaemonCores) -> Router {
    let pairing = Arc::clone(&cores.pairing);

    common_routes(cores)
        .nest(
            "/v1/pairing",
            pairing_http::public_routes(Arc::clone(&pairing))
                .merge(pairing_http::admin_routes(Arc::clone(&pairing))),
        )
        .nest("/v1/devices", pairing_http::device_routes(pairing))
        .merge(ws::admin_routes(cores.clone()))
        .layer(middleware::from_fn(reject_browser_requests))
}

fn common_routes(cores: &DaemonCores) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/status", get(status_handler))
        .with_state(cores.clone())
        .nest("/v1/ca", portico_ca::http::routes(Arc::clone(&cores.ca)))
}

// ── Servers ─────────────────────────────────────────────────────────

/// Serve the TLS API until `cancel` fires.
pub async fn serve_api(
    app: Router,
    addr: SocketAddr,
    tls: rustls::ServerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let handle = axum_server::Handle::new();
    let shutdown = handle.clone();
    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    tracing::info!(listen = %addr, "TLS API listening");
    axum_server::bind_rustls(addr, RustlsConfig::from_config(Arc::new(tls)))
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    tracing::debug!("TLS API stopped");
    Ok(())
}

/// Serve the admin listener until `cancel` fires.
pub async fn serve_admin(
    app: Router,
    listener: TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    tracing::info!(listen = %listener.local_addr()?, "Admin listener ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await?;

    tracing::debug!("Admin listener stopped");
    Ok(())
}

/// Bind the admin listener, refusing anything but loopback.
pub async fn bind_admin(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    if !addr.ip().is_loopback() {
        anyhow::bail!("admin listener must bind a loopback address, got {addr}");
    }
    TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Could not bind admin listener on {addr}: {e}"))
}

// ── Handlers ────────────────────────────────────────────────────────

async fn health() -> &'static str {
    "OK"
}

async fn status_handler(State(cores): State<DaemonCores>) -> Json<serde_json::Value> {
    // Fully qualified: the pairing and router cores have inherent `status`.
    let mut capabilities: Vec<CapabilityStatus> = vec![
        Capability::status(cores.ca.as_ref()),
        Capability::status(cores.pairing.as_ref()),
        Capability::status(cores.guard.as_ref()),
    ];
    match &cores.router {
        Some(router) => capabilities.push(Capability::status(router.as_ref())),
        None => capabilities.push(CapabilityStatus::new("router", "separate process")),
    }

    Json(serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "platform": std::env::consts::OS,
        "uptime_secs": cores.started_at.elapsed().as_secs(),
        "canonical_domain": cores.canonical_domain,
        "healthy": all_healthy(&capabilities),
        "pairing": cores.pairing.status(),
        "ca": cores.ca.health(Some(&cores.canonical_domain)),
        "router": cores.router.as_ref().map(|r| r.status()),
        "capabilities": capabilities,
    }))
}

/// Browsers attach `Origin` to cross-site requests; local tools do not.
async fn reject_browser_requests(request: Request, next: Next) -> Response {
    if request.headers().contains_key(header::ORIGIN) {
        tracing::debug!(path = %request.uri().path(), "Admin request with Origin header refused");
        return error_response(
            ErrorCode::Unauthorized,
            "the admin listener does not accept browser requests",
        );
    }
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use chrono::Utc;
    use portico_common::device::Device;
    use portico_crypto::secret::{generate_device_secret, DeviceSecret};
    use portico_crypto::signing::{canonical_string, sign};
    use portico_pairing::NoopAdvertiser;
    use tower::ServiceExt;

    use crate::cli::Config;
    use crate::wiring::build_cores;

    fn cores() -> DaemonCores {
        let config = Config {
            data_dir: portico_common::test::unique_temp_dir("http"),
            settings: portico_config::Settings::default(),
            canonical_domain: "mybox.local".to_string(),
            ephemeral: true,
            with_router: false,
        };
        build_cores(&config, Arc::new(NoopAdvertiser), CancellationToken::new()).unwrap()
    }

    fn paired_device(cores: &DaemonCores) -> (String, DeviceSecret) {
        let secret = generate_device_secret();
        cores
            .pairing
            .store()
            .create_device(Device {
                id: "dev_test".to_string(),
                name: "phone".to_string(),
                secret_hash: secret.hash_hex(),
                paired_at: Utc::now(),
                last_seen_at: None,
                is_revoked: false,
                revoked_at: None,
                device_info: None,
            })
            .unwrap();
        ("dev_test".to_string(), secret)
    }

    fn signed(method: Method, path: &str, device: &str, secret: &DeviceSecret) -> Request<Body> {
        let timestamp = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let canonical = canonical_string(method.as_str(), path, b"", &timestamp);
        let signature = sign(secret.signing_key().as_slice(), &canonical);
        Request::builder()
            .method(method)
            .uri(path)
            .header("x-portico-device", device)
            .header("x-portico-timestamp", timestamp)
            .header("x-portico-signature", signature)
            .body(Body::empty())
            .unwrap()
    }

    async fn json_body(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn status_is_public_and_reports_every_capability() {
        let cores = cores();
        let resp = api_router(&cores)
            .oneshot(Request::get("/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        assert_eq!(json["canonical_domain"], "mybox.local");
        assert_eq!(json["pairing"]["phase"], "unpaired");
        assert_eq!(json["ca"]["root_fingerprint"], cores.ca.root_fingerprint());
        let names: Vec<&str> = json["capabilities"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|c| c["name"].as_str())
            .collect();
        assert_eq!(names, vec!["ca", "pairing", "auth", "router"]);
        assert_eq!(json["healthy"], true);
    }

    #[tokio::test]
    async fn tls_api_requires_a_device_for_administration() {
        let cores = cores();
        let resp = api_router(&cores)
            .oneshot(
                Request::post("/v1/pairing/start")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(resp).await["error"], "unauthorized");
        assert_eq!(cores.pairing.phase(), portico_pairing::PairingPhase::Unpaired);

        let app = api_router(&cores);
        for (method, path) in [
            (Method::POST, "/v1/pairing/cancel"),
            (Method::GET, "/v1/pairing/status"),
            (Method::GET, "/v1/pairing/pending"),
            (Method::POST, "/v1/pairing/sessions/s1/approve"),
            (Method::POST, "/v1/pairing/sessions/s1/reject"),
            (Method::GET, "/v1/devices"),
        ] {
            let resp = app
                .clone()
                .oneshot(Request::builder().method(method).uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{path}");
        }
    }

    #[tokio::test]
    async fn pairing_request_stays_public_on_the_tls_api() {
        let cores = cores();
        let resp = api_router(&cores)
            .oneshot(
                Request::post("/v1/pairing/request")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"token":"tok_nope","name":"x"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        // Reaches the pairing core: no session, so the token is unknown.
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(resp).await["error"], "token_invalid");
    }

    #[tokio::test]
    async fn signed_device_can_list_devices_and_start_pairing() {
        let cores = cores();
        let (device, secret) = paired_device(&cores);
        let app = api_router(&cores);

        let resp = app
            .clone()
            .oneshot(signed(Method::GET, "/v1/devices", &device, &secret))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(json_body(resp).await["devices"][0]["id"], "dev_test");

        let resp = app
            .oneshot(signed(Method::POST, "/v1/pairing/start", &device, &secret))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            cores.pairing.phase(),
            portico_pairing::PairingPhase::Discoverable
        );
    }

    #[tokio::test]
    async fn admin_listener_serves_administration_without_signing() {
        let cores = cores();
        let resp = admin_router(&cores)
            .oneshot(
                Request::post("/v1/pairing/start")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = json_body(resp).await;
        assert!(json["uri"].as_str().unwrap().starts_with("portico://pair?"));
    }

    #[tokio::test]
    async fn admin_listener_refuses_browser_origins() {
        let cores = cores();
        let resp = admin_router(&cores)
            .oneshot(
                Request::post("/v1/pairing/start")
                    .header(header::ORIGIN, "https://evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(cores.pairing.phase(), portico_pairing::PairingPhase::Unpaired);
    }

    #[tokio::test]
    async fn root_certificate_is_downloadable() {
        let cores = cores();
        let resp = api_router(&cores)
            .oneshot(Request::get("/v1/ca/root.pem").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(bytes.starts_with(b"-----BEGIN CERTIFICATE-----"));
    }

    #[tokio::test]
    async fn admin_bind_refuses_public_addresses() {
        let err = bind_admin("0.0.0.0:0".parse().unwrap()).await.unwrap_err();
        assert!(err.to_string().contains("loopback"));
    }
}
