//! Pass-through target discovery.
//!
//! Connections whose SNI is not ours go to another local service. Which
//! one is a pluggable decision: [`PassthroughStrategy::resolve`] answers
//! per connection from in-memory state and must not block, while
//! [`PassthroughStrategy::refresh`] runs on the router's probe interval
//! and may do network I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait PassthroughStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Target for `server_name` (`None` when the client sent no SNI).
    fn resolve(&self, server_name: Option<&str>) -> Option<SocketAddr>;

    /// Re-verify targets. Best-effort.
    async fn refresh(&self) {}
}

/// No pass-through: foreign names are rejected.
#[derive(Debug, Default)]
pub struct NoPassthrough;

#[async_trait]
impl PassthroughStrategy for NoPassthrough {
    fn name(&self) -> &str {
        "none"
    }

    fn resolve(&self, _server_name: Option<&str>) -> Option<SocketAddr> {
        None
    }
}

/// Configured name → address map, plus an optional default target.
#[derive(Debug, Default)]
pub struct StaticPassthrough {
    routes: HashMap<String, SocketAddr>,
    default: Option<SocketAddr>,
}

impl StaticPassthrough {
    pub fn new(routes: HashMap<String, SocketAddr>, default: Option<SocketAddr>) -> Self {
        let routes = routes
            .into_iter()
            .map(|(name, addr)| (name.trim_end_matches('.').to_ascii_lowercase(), addr))
            .collect();
        Self { routes, default }
    }
}

#[async_trait]
impl PassthroughStrategy for StaticPassthrough {
    fn name(&self) -> &str {
        "static"
    }

    fn resolve(&self, server_name: Option<&str>) -> Option<SocketAddr> {
        server_name
            .and_then(|name| self.routes.get(name).copied())
            .or(self.default)
    }
}

/// Candidate addresses, TCP-probed on each refresh. Resolves every name to
/// the first candidate that answered the last probe.
pub struct ProbedPassthrough {
    candidates: Vec<SocketAddr>,
    probe_timeout: Duration,
    alive: RwLock<Vec<SocketAddr>>,
}

impl ProbedPassthrough {
    pub fn new(candidates: Vec<SocketAddr>, probe_timeout: Duration) -> Self {
        Self {
            candidates,
            probe_timeout,
            alive: RwLock::new(Vec::new()),
        }
    }

    async fn probe(&self, addr: SocketAddr) -> bool {
        let connect = tokio::net::TcpStream::connect(addr);
        matches!(
            tokio::time::timeout(self.probe_timeout, connect).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl PassthroughStrategy for ProbedPassthrough {
    fn name(&self) -> &str {
        "probed"
    }

    fn resolve(&self, _server_name: Option<&str>) -> Option<SocketAddr> {
        self.alive
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .first()
            .copied()
    }

    async fn refresh(&self) {
        let mut alive = Vec::new();
        for addr in &self.candidates {
            if self.probe(*addr).await {
                alive.push(*addr);
            }
        }
        let mut guard = self.alive.write().unwrap_or_else(|e| e.into_inner());
        if *guard != alive {
            tracing::info!(alive = ?alive, "Pass-through candidates changed");
            *guard = alive;
        }
    }
}

/// First strategy with an answer wins.
pub struct ChainedPassthrough {
    strategies: Vec<Arc<dyn PassthroughStrategy>>,
}

impl ChainedPassthrough {
    pub fn new(strategies: Vec<Arc<dyn PassthroughStrategy>>) -> Self {
        Self { strategies }
    }
}

#[async_trait]
impl PassthroughStrategy for ChainedPassthrough {
    fn name(&self) -> &str {
        "chained"
    }

    fn resolve(&self, server_name: Option<&str>) -> Option<SocketAddr> {
        self.strategies
            .iter()
            .find_map(|s| s.resolve(server_name))
    }

    async fn refresh(&self) {
        for strategy in &self.strategies {
            strategy.refresh().await;
        }
    }
}
