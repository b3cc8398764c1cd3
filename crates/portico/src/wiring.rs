//! Settings to domain configuration, and core construction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use portico_auth::{AuthConfig, AuthGuard};
use portico_ca::{CaConfig, CaCore};
use portico_common::device::{DeviceStore, JsonDeviceStore, MemoryDeviceStore};
use portico_config::settings::PassthroughSettings;
use portico_mdns::MdnsAdvertiser;
use portico_pairing::{Advertiser, NoopAdvertiser, PairingConfig, PairingCore};
use portico_router::{
    ChainedPassthrough, NoPassthrough, PassthroughStrategy, ProbedPassthrough, RouterConfig,
    StaticPassthrough,
};

use tokio_util::sync::CancellationToken;

use crate::cli::Config;

/// Device records file under the state directory.
const DEVICES_FILENAME: &str = "devices.json";

/// Domain cores shared by the HTTP adapters.
#[derive(Clone)]
pub struct DaemonCores {
    pub ca: Arc<CaCore>,
    pub pairing: Arc<PairingCore>,
    pub guard: Arc<AuthGuard>,
    pub router: Option<Arc<portico_router::RouterCore>>,
    pub canonical_domain: String,
    pub started_at: std::time::Instant,
    /// Fired on daemon shutdown; long-lived streams watch it.
    pub cancel: CancellationToken,
}

// ── Domain configs ──────────────────────────────────────────────────

pub fn ca_config(config: &Config) -> CaConfig {
    let ca = &config.settings.ca;
    let mut ca_config = CaConfig::new(&config.data_dir);
    ca_config.leaf_lifetime = chrono::Duration::days(i64::from(ca.leaf_lifetime_days));
    ca_config.root_lifetime = chrono::Duration::days(i64::from(ca.root_lifetime_days));
    ca_config.cache_capacity = ca.leaf_cache_capacity;
    ca_config.cache_ttl = Duration::from_secs(ca.leaf_cache_ttl_secs);
    ca_config
}

pub fn pairing_config(config: &Config, root_fingerprint: &str) -> PairingConfig {
    let pairing = &config.settings.pairing;
    let mut pairing_config = PairingConfig::new(
        &config.canonical_domain,
        config.settings.daemon.public_port,
        root_fingerprint,
    );
    pairing_config.token_ttl = chrono::Duration::seconds(pairing.token_ttl_secs as i64);
    pairing_config.approval_timeout = Duration::from_secs(pairing.approval_timeout_secs());
    pairing_config.sweep_interval = Duration::from_secs(pairing.sweep_interval_secs);
    pairing_config
}

pub fn auth_config(config: &Config) -> AuthConfig {
    let auth = &config.settings.auth;
    AuthConfig {
        skew: chrono::Duration::seconds(auth.skew_secs as i64),
        replay_capacity: auth.replay_capacity,
        max_body_bytes: auth.max_body_bytes,
    }
}

pub fn router_config(config: &Config) -> RouterConfig {
    let router = &config.settings.router;
    let mut router_config =
        RouterConfig::new(&config.canonical_domain, config.settings.daemon.api_listen);
    router_config.listen = router.listen;
    router_config.aliases = config.settings.daemon.aliases.clone();
    router_config.sni_timeout = Duration::from_secs(router.sni_timeout_secs);
    router_config.max_client_hello_bytes = router.max_client_hello_bytes;
    router_config.connect_timeout = Duration::from_secs(router.connect_timeout_secs);
    router_config.max_connections = router.max_connections;
    router_config.route_cache_capacity = router.route_cache_capacity;
    router_config.route_cache_ttl = Duration::from_secs(router.route_cache_ttl_secs);
    router_config.linger = Duration::from_secs(router.linger_secs);
    router_config.probe_interval = Duration::from_secs(router.probe_interval_secs);
    router_config
}

/// Explicit routes first, then probed candidates; none when nothing is configured.
pub fn passthrough_strategy(
    settings: &PassthroughSettings,
    probe_timeout: Duration,
) -> Arc<dyn PassthroughStrategy> {
    let mut strategies: Vec<Arc<dyn PassthroughStrategy>> = Vec::new();

    if !settings.routes.is_empty() || settings.default.is_some() {
        let routes: HashMap<_, _> = settings
            .routes
            .iter()
            .map(|(name, addr)| (name.clone(), *addr))
            .collect();
        strategies.push(Arc::new(StaticPassthrough::new(routes, settings.default)));
    }
    if !settings.probe.is_empty() {
        strategies.push(Arc::new(ProbedPassthrough::new(
            settings.probe.clone(),
            probe_timeout,
        )));
    }

    match strategies.len() {
        0 => Arc::new(NoPassthrough),
        1 => strategies.remove(0),
        _ => Arc::new(ChainedPassthrough::new(strategies)),
    }
}

// ── Cores ───────────────────────────────────────────────────────────

pub fn device_store(config: &Config) -> anyhow::Result<Arc<dyn DeviceStore>> {
    if config.ephemeral {
        tracing::warn!("Ephemeral device store: paired devices are forgotten on exit");
        return Ok(Arc::new(MemoryDeviceStore::new()));
    }
    let path = config.data_dir.join("state").join(DEVICES_FILENAME);
    let store = JsonDeviceStore::open(&path)
        .map_err(|e| anyhow::anyhow!("Could not open device store {}: {e}", path.display()))?;
    Ok(Arc::new(store))
}

/// mDNS advertiser, unless disabled or unavailable.
pub fn mdns_advertiser(config: &Config) -> Option<Arc<MdnsAdvertiser>> {
    if !config.settings.daemon.mdns {
        tracing::info!("mDNS discovery: disabled");
        return None;
    }
    match MdnsAdvertiser::new() {
        Ok(advertiser) => Some(Arc::new(advertiser)),
        Err(e) => {
            tracing::warn!(error = %e, "mDNS unavailable, pairing continues with QR codes only");
            None
        }
    }
}

pub fn advertiser(mdns: Option<&Arc<MdnsAdvertiser>>) -> Arc<dyn Advertiser> {
    match mdns {
        Some(mdns) => Arc::clone(mdns) as Arc<dyn Advertiser>,
        None => Arc::new(NoopAdvertiser),
    }
}

pub fn build_cores(
    config: &Config,
    advertiser: Arc<dyn Advertiser>,
    cancel: CancellationToken,
) -> anyhow::Result<DaemonCores> {
    let ca = Arc::new(CaCore::open(ca_config(config))?);
    tracing::info!(
        fingerprint = ca.root_fingerprint(),
        origin = ?ca.root_origin(),
        "Root CA ready"
    );
    // First handshake should not wait on key generation.
    if let Err(e) = ca.issue(&config.canonical_domain) {
        tracing::warn!(domain = %config.canonical_domain, error = %e, "Could not pre-issue canonical certificate");
    }

    let store = device_store(config)?;
    let pairing = Arc::new(PairingCore::new(
        pairing_config(config, ca.root_fingerprint()),
        Arc::clone(&store),
        advertiser,
    ));
    let guard = Arc::new(AuthGuard::new(auth_config(config), store));

    Ok(DaemonCores {
        ca,
        pairing,
        guard,
        router: None,
        canonical_domain: config.canonical_domain.clone(),
        started_at: std::time::Instant::now(),
        cancel,
    })
}
