//! Portico Router: shares port 443 between portico and other local
//! HTTPS services.
//!
//! Each accepted connection gets its own task: read the ClientHello, route
//! on its SNI, then relay raw bytes to the internal daemon listener or to a
//! pass-through target. TLS is never terminated here.
//!
//! Follows the Core/Runtime split used across portico: [`RouterCore`] holds
//! the routing state, [`RouterRuntime`] owns the listener and tasks and is
//! the start/stop entrypoint for service managers.

mod error;
pub mod passthrough;
pub mod relay;
pub mod route;
pub mod sni;
mod throttle;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use portico_common::capability::{Capability, CapabilityStatus};

pub use error::RouterError;
pub use passthrough::{
    ChainedPassthrough, NoPassthrough, PassthroughStrategy, ProbedPassthrough, StaticPassthrough,
};
pub use route::{RouteEntry, RouteTable, RouteTarget};
pub use throttle::LogThrottle;

use relay::{ALERT_INTERNAL_ERROR, ALERT_UNRECOGNIZED_NAME};

const UPSTREAM_LOG_INTERVAL: Duration = Duration::from_secs(60);
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub listen: SocketAddr,
    pub canonical_domain: String,
    /// Extra names routed to the internal daemon.
    pub aliases: Vec<String>,
    /// Internal daemon TLS listener.
    pub internal_addr: SocketAddr,
    pub sni_timeout: Duration,
    pub max_client_hello_bytes: usize,
    pub connect_timeout: Duration,
    pub max_connections: usize,
    pub route_cache_capacity: usize,
    pub route_cache_ttl: Duration,
    /// How long the second direction may drain after the first closes.
    pub linger: Duration,
    /// How often the pass-through strategy re-verifies its targets.
    pub probe_interval: Duration,
}

impl RouterConfig {
    pub fn new(canonical_domain: impl Into<String>, internal_addr: SocketAddr) -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 443)),
            canonical_domain: canonical_domain.into(),
            aliases: Vec::new(),
            internal_addr,
            sni_timeout: Duration::from_secs(5),
            max_client_hello_bytes: 16 * 1024,
            connect_timeout: Duration::from_secs(3),
            max_connections: 1024,
            route_cache_capacity: 256,
            route_cache_ttl: Duration::from_secs(30),
            linger: Duration::from_secs(5),
            probe_interval: Duration::from_secs(30),
        }
    }

    pub fn validate(&self) -> Result<(), RouterError> {
        if self.canonical_domain.trim().is_empty() {
            return Err(RouterError::InvalidConfig(
                "canonical domain must not be empty".to_string(),
            ));
        }
        if self.internal_addr == self.listen {
            return Err(RouterError::InvalidConfig(format!(
                "internal address {} is the router's own listen address",
                self.internal_addr
            )));
        }
        if self.max_connections == 0 {
            return Err(RouterError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    relayed_internal: AtomicU64,
    relayed_passthrough: AtomicU64,
    rejected: AtomicU64,
    upstream_failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouterStatus {
    pub listen: SocketAddr,
    pub canonical_domain: String,
    pub internal_addr: SocketAddr,
    pub passthrough: String,
    pub active_connections: usize,
    pub accepted: u64,
    pub relayed_internal: u64,
    pub relayed_passthrough: u64,
    pub rejected: u64,
    pub upstream_failures: u64,
    pub cached_routes: usize,
}

/// Routing state shared by every connection task.
pub struct RouterCore {
    config: RouterConfig,
    table: RouteTable,
    connections: Arc<Semaphore>,
    throttle: LogThrottle,
    counters: Counters,
}

impl RouterCore {
    pub fn new(config: RouterConfig, strategy: Arc<dyn PassthroughStrategy>) -> Self {
        let table = RouteTable::new(
            &config.canonical_domain,
            &config.aliases,
            config.internal_addr,
            config.listen,
            strategy,
            config.route_cache_capacity,
            config.route_cache_ttl,
        );
        Self {
            connections: Arc::new(Semaphore::new(config.max_connections)),
            throttle: LogThrottle::new(UPSTREAM_LOG_INTERVAL),
            counters: Counters::default(),
            table,
            config,
        }
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    pub fn status(&self) -> RouterStatus {
        let c = &self.counters;
        RouterStatus {
            listen: self.config.listen,
            canonical_domain: self.table.canonical().to_string(),
            internal_addr: self.config.internal_addr,
            passthrough: self.table.strategy_name().to_string(),
            active_connections: self.config.max_connections
                - self.connections.available_permits(),
            accepted: c.accepted.load(Ordering::Relaxed),
            relayed_internal: c.relayed_internal.load(Ordering::Relaxed),
            relayed_passthrough: c.relayed_passthrough.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            upstream_failures: c.upstream_failures.load(Ordering::Relaxed),
            cached_routes: self.table.cached_routes(),
        }
    }

    /// Route and relay one accepted connection. Never fails the listener.
    pub async fn handle_connection(
        &self,
        mut client: TcpStream,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) {
        let hello = match sni::read_client_hello(
            &mut client,
            self.config.sni_timeout,
            self.config.max_client_hello_bytes,
        )
        .await
        {
            Ok(hello) => hello,
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(peer = %peer, error = %e, "Dropping connection before routing");
                return;
            }
        };
        let server_name = hello.server_name.as_deref();

        let Some(route) = self.table.resolve(server_name) else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(peer = %peer, sni = ?server_name, "No route for server name");
            relay::reject(client, ALERT_UNRECOGNIZED_NAME).await;
            return;
        };
        let upstream_addr = route.target.addr();

        let upstream = match self.connect(upstream_addr).await {
            Ok(stream) => stream,
            Err(e) => {
                self.counters.upstream_failures.fetch_add(1, Ordering::Relaxed);
                if !route.target.is_internal() {
                    self.table.invalidate(server_name);
                }
                if self.throttle.should_log(&upstream_addr.to_string()) {
                    tracing::warn!(
                        upstream = %upstream_addr,
                        sni = ?server_name,
                        error = %e,
                        "Upstream unreachable"
                    );
                }
                relay::reject(client, ALERT_INTERNAL_ERROR).await;
                return;
            }
        };
        self.table.mark_alive(upstream_addr);

        let counter = if route.target.is_internal() {
            &self.counters.relayed_internal
        } else {
            &self.counters.relayed_passthrough
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let _ = client.set_nodelay(true);
        let _ = upstream.set_nodelay(true);
        match relay::relay(client, upstream, &hello.buffered, self.config.linger, cancel).await {
            Ok(stats) => tracing::trace!(
                peer = %peer,
                upstream = %upstream_addr,
                sent = stats.to_upstream,
                received = stats.to_client,
                "Relay finished"
            ),
            Err(e) => {
                if !route.target.is_internal() {
                    self.table.invalidate(server_name);
                }
                tracing::debug!(peer = %peer, upstream = %upstream_addr, error = %e, "Relay ended with error");
            }
        }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, RouterError> {
        match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(RouterError::Upstream {
                addr,
                reason: e.to_string(),
            }),
            Err(_) => Err(RouterError::Upstream {
                addr,
                reason: "connect timeout".to_string(),
            }),
        }
    }
}

impl Capability for RouterCore {
    fn name(&self) -> &str {
        "router"
    }

    fn status(&self) -> CapabilityStatus {
        let status = RouterCore::status(self);
        let summary = format!(
            "{} → {} ({} active, pass-through: {})",
            status.canonical_domain,
            status.internal_addr,
            status.active_connections,
            status.passthrough
        );
        CapabilityStatus::new(self.name(), summary)
    }
}

/// Owns the listener and background tasks.
pub struct RouterRuntime {
    core: Arc<RouterCore>,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_handle: tokio::task::JoinHandle<()>,
    refresh_handle: tokio::task::JoinHandle<()>,
}

impl RouterRuntime {
    /// Bind the listener and start accepting. Stops when `cancel` fires or
    /// [`stop`](Self::stop) is called.
    pub async fn start(
        config: RouterConfig,
        strategy: Arc<dyn PassthroughStrategy>,
        cancel: CancellationToken,
    ) -> Result<Self, RouterError> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| RouterError::Bind {
                addr: config.listen,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let probe_interval = config.probe_interval;
        let core = Arc::new(RouterCore::new(config, strategy));

        tracing::info!(
            listen = %local_addr,
            canonical = core.table.canonical(),
            internal = %core.config.internal_addr,
            passthrough = core.table.strategy_name(),
            "Router listening"
        );

        let accept_handle = tokio::spawn(accept_loop(listener, core.clone(), cancel.clone()));
        let refresh_handle = tokio::spawn(refresh_loop(core.clone(), probe_interval, cancel.clone()));

        Ok(Self {
            core,
            local_addr,
            cancel,
            accept_handle,
            refresh_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn core(&self) -> Arc<RouterCore> {
        Arc::clone(&self.core)
    }

    /// Stop accepting, cut live relays and wait for the background tasks.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.accept_handle.await {
            tracing::warn!(error = %e, "Router accept task ended abnormally");
        }
        let _ = self.refresh_handle.await;
        tracing::info!("Router stopped");
    }
}

async fn accept_loop(listener: TcpListener, core: Arc<RouterCore>, cancel: CancellationToken) {
    loop {
        let permit = tokio::select! {
            _ = cancel.cancelled() => break,
            permit = core.connections.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    core.counters.accepted.fetch_add(1, Ordering::Relaxed);
                    let core = core.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        core.handle_connection(stream, peer, &cancel).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Router accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
        }
    }
    tracing::debug!("Router accept loop stopped");
}

async fn refresh_loop(core: Arc<RouterCore>, interval: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                core.table.strategy().refresh().await;
            }
        }
    }
}
