//! babeld adapter
//!
//! Speaks the babeld local interface: a line protocol over TCP where a
//! `dump` command answers with `add neighbour ...` and `add route ...`
//! lines terminated by `ok`.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::routing::{Neighbor, Route, RoutingAdapter};
use crate::{Error, Result};

pub struct BabelAdapter {
    addr: String,
    timeout: Duration,
}

impl BabelAdapter {
    pub fn new(addr: String) -> Self {
        Self {
            addr,
            timeout: Duration::from_secs(5),
        }
    }

    /// Run `dump` and collect the response lines up to the `ok` marker.
    async fn dump(&self) -> Result<Vec<String>> {
        let io = async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            stream.write_all(b"dump\n").await?;
            let mut reader = BufReader::new(stream);
            let mut lines = Vec::new();
            let mut line = String::new();
            loop {
                line.clear();
                let n = reader.read_line(&mut line).await?;
                if n == 0 {
                    break;
                }
                let trimmed = line.trim();
                if trimmed == "ok" || trimmed == "bad" || trimmed == "no" {
                    break;
                }
                lines.push(trimmed.to_string());
            }
            Ok::<_, std::io::Error>(lines)
        };
        tokio::time::timeout(self.timeout, io)
            .await
            .map_err(|_| Error::routing("babeld local interface timed out"))?
            .map_err(|e| Error::routing(format!("babeld local interface: {}", e)))
    }
}

impl Default for BabelAdapter {
    fn default() -> Self {
        Self::new("127.0.0.1:33123".to_string())
    }
}

#[async_trait]
impl RoutingAdapter for BabelAdapter {
    fn name(&self) -> &'static str {
        "babel"
    }

    async fn get_neighbors(&self) -> Result<Vec<Neighbor>> {
        let lines = self.dump().await?;
        Ok(lines
            .iter()
            .filter_map(|line| parse_neighbour_line(line))
            .collect())
    }

    async fn get_route(&self, dst: Ipv4Addr) -> Result<Option<Route>> {
        let lines = self.dump().await?;
        Ok(lines
            .iter()
            .filter_map(|line| parse_route_line(line))
            .find(|route| route.destination == dst))
    }
}

/// `add neighbour <id> address <ip> if <iface> reach ffff rxcost 96 txcost 96 ...`
fn parse_neighbour_line(line: &str) -> Option<Neighbor> {
    if !line.starts_with("add neighbour") {
        return None;
    }
    let ip: Ipv4Addr = field_after(line, "address")?.parse().ok()?;
    let interface = field_after(line, "if").unwrap_or_default();
    Some(Neighbor {
        ip,
        name: None,
        interface: interface.to_string(),
    })
}

/// `add route <id> prefix <ip>/32 from 0.0.0.0/0 installed yes id <rid> metric 96 via <ip> if <iface>`
fn parse_route_line(line: &str) -> Option<Route> {
    if !line.starts_with("add route") {
        return None;
    }
    let prefix = field_after(line, "prefix")?;
    let destination: Ipv4Addr = prefix.split('/').next()?.parse().ok()?;
    let gateway: Ipv4Addr = field_after(line, "via")?.parse().ok()?;
    let interface = field_after(line, "if").unwrap_or_default();
    Some(Route {
        destination,
        gateway,
        interface: interface.to_string(),
    })
}

/// The token following `key` in a space-separated babeld line.
fn field_after<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == key {
            return tokens.next();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_neighbour_line() {
        let line = "add neighbour 14-ac5f3e address 10.54.2.7 if wlan0 reach ffff rxcost 96 txcost 96 cost 96";
        let neighbor = parse_neighbour_line(line).unwrap();
        assert_eq!(neighbor.ip, "10.54.2.7".parse::<Ipv4Addr>().unwrap());
        assert_eq!(neighbor.interface, "wlan0");
        assert!(parse_neighbour_line("add route x").is_none());
    }

    #[test]
    fn test_parse_route_line() {
        let line = "add route 7f91a2 prefix 10.54.9.9/32 from 0.0.0.0/0 installed yes id 14-ac5f3e metric 96 via 10.54.2.7 if tun50";
        let route = parse_route_line(line).unwrap();
        assert_eq!(route.destination, "10.54.9.9".parse::<Ipv4Addr>().unwrap());
        assert_eq!(route.gateway, "10.54.2.7".parse::<Ipv4Addr>().unwrap());
        assert_eq!(route.interface, "tun50");
    }

    #[test]
    fn test_field_after_missing() {
        assert!(field_after("add neighbour x", "address").is_none());
    }
}
