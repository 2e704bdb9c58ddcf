//! Routing-daemon adapters
//!
//! The mesh monitor needs the current neighbour list and per-destination
//! routes, but must not care whether the node runs olsrd or babeld. The
//! [`RoutingAdapter`] trait is that seam: one implementation per daemon
//! plus a null adapter for nodes running neither, selected (or probed
//! for, with `auto`) from configuration at startup.

pub mod babel;
pub mod olsr;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{MeshMonitorConfig, RoutingDaemon};
use crate::Result;

pub use babel::BabelAdapter;
pub use olsr::OlsrAdapter;

/// Physical flavour of a mesh link, judged from the interface name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Rf,
    Tunnel,
    Ethernet,
    Bridge,
    Unknown,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rf => "RF",
            Self::Tunnel => "tunnel",
            Self::Ethernet => "ethernet",
            Self::Bridge => "bridge",
            Self::Unknown => "unknown",
        }
    }
}

/// Interface-name prefix classification shared by all adapters.
pub fn classify_interface(interface: &str) -> LinkType {
    let name = interface.trim().to_ascii_lowercase();
    if name.starts_with("wlan") || name.starts_with("wifi") || name.starts_with("ath") {
        LinkType::Rf
    } else if name.starts_with("tun") || name.starts_with("wg") || name.starts_with("vtun") {
        LinkType::Tunnel
    } else if name.starts_with("br") {
        LinkType::Bridge
    } else if name.starts_with("eth") || name.starts_with("lan") {
        LinkType::Ethernet
    } else {
        LinkType::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub ip: Ipv4Addr,
    pub name: Option<String>,
    pub interface: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub interface: String,
}

/// One element of the forwarding path toward a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hop {
    pub ip: Ipv4Addr,
}

#[async_trait]
pub trait RoutingAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get_neighbors(&self) -> Result<Vec<Neighbor>>;

    async fn get_route(&self, dst: Ipv4Addr) -> Result<Option<Route>>;

    /// Best-effort forwarding path toward `dst`, nearest hop first.
    async fn get_path_hops(&self, dst: Ipv4Addr) -> Result<Vec<Hop>> {
        match self.get_route(dst).await? {
            Some(route) if route.gateway != dst => {
                Ok(vec![Hop { ip: route.gateway }, Hop { ip: dst }])
            }
            Some(_) => Ok(vec![Hop { ip: dst }]),
            None => Ok(Vec::new()),
        }
    }

    fn classify_link_type(&self, interface: &str) -> LinkType {
        classify_interface(interface)
    }
}

/// Adapter for nodes running no supported routing daemon; the monitor
/// idles gracefully on its empty answers.
pub struct NullAdapter;

#[async_trait]
impl RoutingAdapter for NullAdapter {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn get_neighbors(&self) -> Result<Vec<Neighbor>> {
        Ok(Vec::new())
    }

    async fn get_route(&self, _dst: Ipv4Addr) -> Result<Option<Route>> {
        Ok(None)
    }
}

/// Memoises `get_neighbors` so a chatty monitor does not hammer the
/// daemon's control socket.
pub struct CachedAdapter {
    inner: Arc<dyn RoutingAdapter>,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<Neighbor>)>>,
}

impl CachedAdapter {
    pub fn new(inner: Arc<dyn RoutingAdapter>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RoutingAdapter for CachedAdapter {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn get_neighbors(&self) -> Result<Vec<Neighbor>> {
        {
            let cache = self.cache.lock().await;
            if let Some((when, neighbors)) = cache.as_ref() {
                if when.elapsed() < self.ttl {
                    return Ok(neighbors.clone());
                }
            }
        }
        let neighbors = self.inner.get_neighbors().await?;
        *self.cache.lock().await = Some((Instant::now(), neighbors.clone()));
        Ok(neighbors)
    }

    async fn get_route(&self, dst: Ipv4Addr) -> Result<Option<Route>> {
        self.inner.get_route(dst).await
    }

    async fn get_path_hops(&self, dst: Ipv4Addr) -> Result<Vec<Hop>> {
        self.inner.get_path_hops(dst).await
    }
}

/// Select the adapter named by configuration; `auto` probes olsrd first,
/// then babeld, and settles for the null adapter.
pub async fn select_adapter(config: &MeshMonitorConfig) -> Arc<dyn RoutingAdapter> {
    let adapter: Arc<dyn RoutingAdapter> = match config.routing_daemon {
        RoutingDaemon::Olsr => Arc::new(OlsrAdapter::default()),
        RoutingDaemon::Babel => Arc::new(BabelAdapter::default()),
        RoutingDaemon::Auto => {
            let olsr = OlsrAdapter::default();
            if olsr.get_neighbors().await.is_ok() {
                Arc::new(olsr)
            } else {
                let babel = BabelAdapter::default();
                if babel.get_neighbors().await.is_ok() {
                    Arc::new(babel)
                } else {
                    Arc::new(NullAdapter)
                }
            }
        }
    };
    info!("Routing adapter selected: {}", adapter.name());
    Arc::new(CachedAdapter::new(
        adapter,
        Duration::from_secs(config.routing_cache_s),
    ))
}
