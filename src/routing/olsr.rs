//! olsrd adapter
//!
//! Talks to the olsrd jsoninfo plugin on its default port. Only string
//! fields are needed from the `/links` and `/routes` documents, so the
//! bounded scanner does the parsing.

use std::net::Ipv4Addr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::routing::{Neighbor, Route, RoutingAdapter};
use crate::utils::scan_string_fields;
use crate::{Error, Result};

/// Field budget for one jsoninfo document; a saturated mesh segment has
/// a few dozen links, each a handful of fields.
const SCAN_BUDGET: usize = 2048;

pub struct OlsrAdapter {
    base_url: String,
    timeout: Duration,
}

impl OlsrAdapter {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            timeout: Duration::from_secs(5),
        }
    }

    async fn fetch(&self, path: &str) -> Result<String> {
        let url = format!("{}{}", self.base_url, path);
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::http(e.to_string()))?;
        let response = client
            .get(&url)
            .header(reqwest::header::CONNECTION, "close")
            .send()
            .await
            .map_err(|e| Error::routing(format!("olsrd jsoninfo unreachable: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::routing(format!(
                "olsrd jsoninfo returned {}",
                response.status()
            )));
        }
        response
            .text()
            .await
            .map_err(|e| Error::routing(e.to_string()))
    }
}

impl Default for OlsrAdapter {
    fn default() -> Self {
        Self::new("http://127.0.0.1:9090".to_string())
    }
}

#[async_trait]
impl RoutingAdapter for OlsrAdapter {
    fn name(&self) -> &'static str {
        "olsr"
    }

    async fn get_neighbors(&self) -> Result<Vec<Neighbor>> {
        let body = self.fetch("/links").await?;
        Ok(parse_links(&body)?)
    }

    async fn get_route(&self, dst: Ipv4Addr) -> Result<Option<Route>> {
        let body = self.fetch("/routes").await?;
        Ok(parse_routes(&body)?
            .into_iter()
            .find(|route| route.destination == dst))
    }
}

/// Extract neighbours from a jsoninfo `/links` document. Entries are
/// delimited by their `remoteIP` field; `olsrInterface` names the local
/// interface the link rides on.
fn parse_links(body: &str) -> Result<Vec<Neighbor>> {
    let pairs = scan_string_fields(body, SCAN_BUDGET)?;
    let mut neighbors: Vec<Neighbor> = Vec::new();
    for (key, value) in pairs {
        match key.as_str() {
            "remoteIP" => match value.parse::<Ipv4Addr>() {
                Ok(ip) => neighbors.push(Neighbor {
                    ip,
                    name: None,
                    interface: String::new(),
                }),
                Err(_) => debug!("Skipping non-IPv4 olsr link: {}", value),
            },
            "olsrInterface" | "ifName" => {
                if let Some(last) = neighbors.last_mut() {
                    if last.interface.is_empty() {
                        last.interface = value;
                    }
                }
            }
            "remoteHostname" => {
                if let Some(last) = neighbors.last_mut() {
                    if last.name.is_none() {
                        last.name = Some(value);
                    }
                }
            }
            _ => {}
        }
    }
    Ok(neighbors)
}

/// Extract routes from a jsoninfo `/routes` document. The destination
/// arrives as `destination` (dotted quad, sometimes with a `/32` genmask
/// in `genmask`), the next hop as `gatewayIP`.
fn parse_routes(body: &str) -> Result<Vec<Route>> {
    let pairs = scan_string_fields(body, SCAN_BUDGET)?;
    let mut routes: Vec<Route> = Vec::new();
    let mut destination: Option<Ipv4Addr> = None;
    for (key, value) in pairs {
        match key.as_str() {
            "destination" => {
                let text = value.split('/').next().unwrap_or(&value);
                destination = text.parse().ok();
            }
            "gatewayIP" | "gateway" => {
                if let (Some(dst), Ok(gateway)) = (destination.take(), value.parse()) {
                    routes.push(Route {
                        destination: dst,
                        gateway,
                        interface: String::new(),
                    });
                }
            }
            "networkInterface" | "interface" => {
                if let Some(last) = routes.last_mut() {
                    if last.interface.is_empty() {
                        last.interface = value;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(routes)
}
