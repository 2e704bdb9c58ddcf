//! Mesh name resolution
//!
//! Every phone and node lives under the synthetic mesh domain
//! (`{name}.local.mesh`), served as A records by the mesh DNS. The
//! trait exists so tests can substitute a static table for the OS
//! resolver.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;

use crate::{Error, Result};

#[async_trait]
pub trait MeshResolver: Send + Sync {
    /// Resolve a bare user id or node name to its mesh IPv4 address.
    async fn resolve(&self, name: &str) -> Result<Ipv4Addr>;
}

/// OS-resolver implementation appending the configured mesh domain.
pub struct DnsResolver {
    domain: String,
}

impl DnsResolver {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
        }
    }
}

#[async_trait]
impl MeshResolver for DnsResolver {
    async fn resolve(&self, name: &str) -> Result<Ipv4Addr> {
        let host = format!("{}.{}:0", name, self.domain);
        let addrs = tokio::net::lookup_host(&host)
            .await
            .map_err(|_| Error::Resolve(host.clone()))?;
        for addr in addrs {
            if let SocketAddr::V4(v4) = addr {
                return Ok(*v4.ip());
            }
        }
        Err(Error::Resolve(host))
    }
}

/// Fixed name table for tests and for the discovery cache warm path.
#[derive(Default)]
pub struct StaticResolver {
    entries: HashMap<String, Ipv4Addr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, ip: Ipv4Addr) -> Self {
        self.entries.insert(name.to_string(), ip);
        self
    }
}

#[async_trait]
impl MeshResolver for StaticResolver {
    async fn resolve(&self, name: &str) -> Result<Ipv4Addr> {
        self.entries
            .get(name)
            .copied()
            .ok_or_else(|| Error::Resolve(name.to_string()))
    }
}

/// Learn the local source address the kernel would pick toward `dst` by
/// connecting a throwaway datagram socket. No traffic is sent.
pub fn discover_source_ip(dst: Ipv4Addr) -> Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect((dst, 9))?;
    match socket.local_addr()? {
        SocketAddr::V4(v4) => Ok(*v4.ip()),
        SocketAddr::V6(_) => Err(Error::network("kernel picked an IPv6 source")),
    }
}
