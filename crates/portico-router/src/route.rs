//! SNI → target routing table.
//!
//! The canonical domain (and its aliases) always maps to the internal
//! daemon and is never cached. Every other name is resolved through the
//! pass-through strategy and remembered in a small TTL/LRU cache until it
//! expires or a relay to it fails.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use portico_common::cache::BoundedCache;

use crate::passthrough::PassthroughStrategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "addr", rename_all = "snake_case")]
pub enum RouteTarget {
    Internal(SocketAddr),
    Passthrough(SocketAddr),
}

impl RouteTarget {
    pub fn addr(&self) -> SocketAddr {
        match self {
            Self::Internal(addr) | Self::Passthrough(addr) => *addr,
        }
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, Self::Internal(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteEntry {
    /// Exact host name, or empty for connections without SNI.
    pub sni_pattern: String,
    pub target: RouteTarget,
    pub last_seen_alive: Option<DateTime<Utc>>,
}

pub struct RouteTable {
    internal_names: Vec<String>,
    internal: SocketAddr,
    listen: SocketAddr,
    strategy: Arc<dyn PassthroughStrategy>,
    cache: BoundedCache<String, RouteEntry>,
    last_alive: Mutex<HashMap<SocketAddr, DateTime<Utc>>>,
}

impl RouteTable {
    pub fn new(
        canonical: &str,
        aliases: &[String],
        internal: SocketAddr,
        listen: SocketAddr,
        strategy: Arc<dyn PassthroughStrategy>,
        cache_capacity: usize,
        cache_ttl: Duration,
    ) -> Self {
        let internal_names = std::iter::once(canonical)
            .chain(aliases.iter().map(String::as_str))
            .map(normalize)
            .collect();
        Self {
            internal_names,
            internal,
            listen,
            strategy,
            cache: BoundedCache::new(cache_capacity, cache_ttl),
            last_alive: Mutex::new(HashMap::new()),
        }
    }

    pub fn canonical(&self) -> &str {
        &self.internal_names[0]
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn strategy(&self) -> &Arc<dyn PassthroughStrategy> {
        &self.strategy
    }

    pub fn cached_routes(&self) -> usize {
        self.cache.len()
    }

    pub fn is_internal_name(&self, name: &str) -> bool {
        self.internal_names.iter().any(|n| n == name)
    }

    /// Route for a connection. `None` means reject.
    pub fn resolve(&self, server_name: Option<&str>) -> Option<RouteEntry> {
        if let Some(name) = server_name {
            if self.is_internal_name(name) {
                return Some(RouteEntry {
                    sni_pattern: name.to_string(),
                    target: RouteTarget::Internal(self.internal),
                    last_seen_alive: self.last_alive(self.internal),
                });
            }
        }

        let key = server_name.unwrap_or_default().to_string();
        if let Some(mut entry) = self.cache.get(&key) {
            entry.last_seen_alive = self.last_alive(entry.target.addr());
            return Some(entry);
        }

        let addr = self.strategy.resolve(server_name)?;
        if self.is_self(addr) {
            tracing::warn!(upstream = %addr, "Pass-through target is the router itself, ignoring");
            return None;
        }
        let entry = RouteEntry {
            sni_pattern: key.clone(),
            target: RouteTarget::Passthrough(addr),
            last_seen_alive: self.last_alive(addr),
        };
        self.cache.insert(key, entry.clone());
        Some(entry)
    }

    /// Forget a cached route after a failed relay.
    pub fn invalidate(&self, server_name: Option<&str>) {
        let key = server_name.unwrap_or_default();
        if self.cache.remove(key).is_some() {
            tracing::debug!(sni = key, "Route invalidated");
        }
    }

    pub fn mark_alive(&self, addr: SocketAddr) {
        self.alive_map().insert(addr, Utc::now());
    }

    pub fn last_alive(&self, addr: SocketAddr) -> Option<DateTime<Utc>> {
        self.alive_map().get(&addr).copied()
    }

    /// A pass-through to our own listener would loop forever.
    fn is_self(&self, addr: SocketAddr) -> bool {
        if addr == self.listen {
            return true;
        }
        addr.port() == self.listen.port()
            && self.listen.ip().is_unspecified()
            && (addr.ip().is_loopback() || addr.ip().is_unspecified())
    }

    fn alive_map(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, DateTime<Utc>>> {
        self.last_alive.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}
