//! Agent discovery
//!
//! Scans the mesh topology endpoint for nodes, tests each unknown node
//! with a single probe, and keeps a small on-disk cache of responders so
//! a restart does not have to re-discover the whole mesh. Purely numeric
//! names are telephones, not agents, and are skipped.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::config::{DiscoveryConfig, TopologySource};
use crate::core::state::unix_now;
use crate::services::health::Heartbeat;
use crate::services::probe_engine::ProbeEngine;
use crate::utils::{read_if_present, scan_string_fields, sleep_or_shutdown, write_atomic};
use crate::{Error, Result};

/// Field budget for one topology document.
const SCAN_BUDGET: usize = 4096;
/// How long to wait for the single discovery probe's echo.
const PROBE_WAIT: Duration = Duration::from_secs(10);

/// A node known to answer probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAgent {
    pub ip: Ipv4Addr,
    pub node: String,
    pub last_seen: u64,
    pub active: bool,
}

/// Extract `(ip, name)` candidates from a topology document.
pub fn parse_topology(source: TopologySource, body: &str) -> Result<Vec<(Ipv4Addr, String)>> {
    let pairs = scan_string_fields(body, SCAN_BUDGET)?;
    let (name_key, ip_key) = match source {
        TopologySource::Sysinfo => ("name", "ip"),
        TopologySource::Olsr => ("remoteHostname", "remoteIP"),
    };

    let mut candidates = Vec::new();
    let mut pending_name: Option<String> = None;
    let mut pending_ip: Option<Ipv4Addr> = None;
    for (key, value) in pairs {
        if key == name_key {
            pending_name = Some(value);
        } else if key == ip_key {
            pending_ip = value.parse().ok();
        } else {
            continue;
        }
        if let (Some(name), Some(ip)) = (pending_name.as_ref(), pending_ip) {
            candidates.push((ip, name.clone()));
            pending_name = None;
            pending_ip = None;
        }
    }
    Ok(candidates)
}

fn is_telephone(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_digit())
}

pub struct AgentDiscovery {
    config: DiscoveryConfig,
    engine: Arc<ProbeEngine>,
    heartbeat: Heartbeat,
    client: reqwest::Client,
    cache: Mutex<HashMap<Ipv4Addr, DiscoveredAgent>>,
    probe_wait: Duration,
}

impl AgentDiscovery {
    pub fn new(config: DiscoveryConfig, engine: Arc<ProbeEngine>, heartbeat: Heartbeat) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            config,
            engine,
            heartbeat,
            client,
            cache: Mutex::new(HashMap::new()),
            probe_wait: PROBE_WAIT,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Agent discovery disabled");
            return;
        }
        if let Err(e) = self.load_cache().await {
            warn!("Agent cache unreadable, starting empty: {}", e);
        }
        info!(
            "Agent discovery started (every {}s from {:?})",
            self.config.scan_interval_s, self.config.source
        );
        loop {
            self.heartbeat.beat();
            match self.scan_once(&mut shutdown).await {
                Ok(count) => debug!("Discovery scan complete, {} agents known", count),
                Err(e) => warn!("Discovery scan failed: {}", e),
            }
            if sleep_or_shutdown(
                Duration::from_secs(self.config.scan_interval_s),
                &mut shutdown,
            )
            .await
            {
                info!("Agent discovery shutting down");
                return;
            }
        }
    }

    async fn scan_once(&self, shutdown: &mut watch::Receiver<bool>) -> Result<usize> {
        let response = self
            .client
            .get(&self.config.topology_url)
            .header(reqwest::header::CONNECTION, "close")
            .send()
            .await
            .map_err(|e| Error::http(format!("topology fetch: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::http(format!(
                "topology endpoint returned {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| Error::http(e.to_string()))?;

        let candidates = parse_topology(self.config.source, &body)?;
        let count = self.process_candidates(candidates, shutdown).await;
        self.save_cache().await?;
        Ok(count)
    }

    /// Refresh cache hits, probe unknowns, admit responders.
    async fn process_candidates(
        &self,
        candidates: Vec<(Ipv4Addr, String)>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> usize {
        for (ip, name) in candidates {
            if *shutdown.borrow() {
                break;
            }
            if is_telephone(&name) {
                continue;
            }
            self.heartbeat.beat();

            {
                let mut cache = self.cache.lock().await;
                if let Some(agent) = cache.get_mut(&ip) {
                    agent.last_seen = unix_now();
                    agent.node = name;
                    continue;
                }
            }

            match self.probe_candidate(ip, shutdown).await {
                Ok(true) => {
                    info!("Discovered probe agent {} at {}", name, ip);
                    self.cache.lock().await.insert(
                        ip,
                        DiscoveredAgent {
                            ip,
                            node: name,
                            last_seen: unix_now(),
                            active: true,
                        },
                    );
                }
                Ok(false) => debug!("Node {} at {} does not answer probes", name, ip),
                Err(e) => debug!("Probe test of {} failed: {}", ip, e),
            }
        }
        self.cache.lock().await.len()
    }

    /// One probe, one wait, one verdict.
    async fn probe_candidate(
        &self,
        ip: Ipv4Addr,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        self.engine.send_probes(ip, 1, Duration::ZERO).await?;
        if sleep_or_shutdown(self.probe_wait, shutdown).await {
            return Ok(false);
        }
        let metrics = self.engine.calculate_metrics(ip).await;
        Ok(metrics.loss_pct < 100.0)
    }

    pub async fn load_cache(&self) -> Result<usize> {
        let Some(text) = read_if_present(&self.config.cache_path)? else {
            return Ok(0);
        };
        let mut cache = self.cache.lock().await;
        for line in text.lines() {
            if let Some(agent) = parse_cache_line(line) {
                cache.insert(agent.ip, agent);
            }
        }
        Ok(cache.len())
    }

    /// Persist the whole cache as `ip,node,unix_time` lines.
    pub async fn save_cache(&self) -> Result<()> {
        let cache = self.cache.lock().await;
        let mut agents: Vec<&DiscoveredAgent> = cache.values().collect();
        agents.sort_by_key(|a| a.ip);
        let mut out = String::new();
        for agent in agents {
            out.push_str(&format!("{},{},{}\n", agent.ip, agent.node, agent.last_seen));
        }
        drop(cache);
        write_atomic(&self.config.cache_path, out.as_bytes())
    }

    pub async fn known_agents(&self) -> Vec<DiscoveredAgent> {
        self.cache.lock().await.values().cloned().collect()
    }
}

fn parse_cache_line(line: &str) -> Option<DiscoveredAgent> {
    let mut parts = line.trim().splitn(3, ',');
    let ip: Ipv4Addr = parts.next()?.trim().parse().ok()?;
    let node = parts.next()?.trim().to_string();
    let last_seen: u64 = parts.next()?.trim().parse().ok()?;
    Some(DiscoveredAgent {
        ip,
        node,
        last_seen,
        active: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::services::probe_engine::ProbeResponder;

    #[test]
    fn test_parse_topology_sysinfo() {
        let body = r#"{"hosts":[
            {"name":"KD7ABC-hilltop","ip":"10.54.1.2"},
            {"name":"5012","ip":"10.54.1.3"},
            {"name":"ridge-node","ip":"10.54.1.4"}
        ]}"#;
        let candidates = parse_topology(TopologySource::Sysinfo, body).unwrap();
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].1, "KD7ABC-hilltop");
        assert_eq!(candidates[0].0, "10.54.1.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn test_parse_topology_olsr() {
        let body = r#"{"links":[
            {"remoteIP":"10.54.2.1","remoteHostname":"far-node","olsrInterface":"wlan0"}
        ]}"#;
        let candidates = parse_topology(TopologySource::Olsr, body).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].1, "far-node");
    }

    #[test]
    fn test_is_telephone() {
        assert!(is_telephone("5012"));
        assert!(!is_telephone("hilltop-5012"));
        assert!(!is_telephone(""));
    }

    #[test]
    fn test_parse_cache_line() {
        let agent = parse_cache_line("10.54.1.2,hilltop,1700000000").unwrap();
        assert_eq!(agent.node, "hilltop");
        assert_eq!(agent.last_seen, 1_700_000_000);
        assert!(parse_cache_line("garbage").is_none());
        assert!(parse_cache_line("10.54.1.2,missing-time").is_none());
    }

    fn discovery_fixture(dir: &std::path::Path, target_port: u16) -> AgentDiscovery {
        let config = AgentConfig::default_config();
        let mut discovery_config = config.discovery.clone();
        discovery_config.cache_path = dir.join("aredn_agent_cache.txt");
        let engine = Arc::new(ProbeEngine::new("disco", target_port, false).unwrap());
        let mut discovery = AgentDiscovery::new(
            discovery_config,
            engine,
            Heartbeat::new("discovery"),
        );
        discovery.probe_wait = Duration::from_millis(100);
        discovery
    }

    #[tokio::test]
    async fn test_candidates_admitted_and_cached() {
        let dir = tempfile::tempdir().unwrap();
        let responder = ProbeResponder::bind(0, false).unwrap();
        let port = responder.local_port().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(responder.run(shutdown_rx));

        let discovery = discovery_fixture(dir.path(), port);
        let (_tx, mut rx) = watch::channel(false);
        let candidates = vec![
            (Ipv4Addr::LOCALHOST, "loop-node".to_string()),
            (Ipv4Addr::LOCALHOST, "5012".to_string()),
        ];
        let count = discovery.process_candidates(candidates, &mut rx).await;
        assert_eq!(count, 1);

        discovery.save_cache().await.unwrap();
        let text = std::fs::read_to_string(dir.path().join("aredn_agent_cache.txt")).unwrap();
        assert!(text.starts_with("127.0.0.1,loop-node,"));

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_cache_hit_refreshed_not_reprobed() {
        let dir = tempfile::tempdir().unwrap();
        // No responder: a re-probe would fail to admit anything.
        let blackhole = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let discovery =
            discovery_fixture(dir.path(), blackhole.local_addr().unwrap().port());

        discovery.cache.lock().await.insert(
            Ipv4Addr::LOCALHOST,
            DiscoveredAgent {
                ip: Ipv4Addr::LOCALHOST,
                node: "old-name".to_string(),
                last_seen: 1,
                active: true,
            },
        );

        let (_tx, mut rx) = watch::channel(false);
        let candidates = vec![(Ipv4Addr::LOCALHOST, "new-name".to_string())];
        let count = discovery.process_candidates(candidates, &mut rx).await;
        assert_eq!(count, 1);
        let agents = discovery.known_agents().await;
        assert_eq!(agents[0].node, "new-name");
        assert!(agents[0].last_seen > 1);
    }

    #[tokio::test]
    async fn test_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = discovery_fixture(dir.path(), 1);
        discovery.cache.lock().await.insert(
            "10.54.1.9".parse().unwrap(),
            DiscoveredAgent {
                ip: "10.54.1.9".parse().unwrap(),
                node: "ridge".to_string(),
                last_seen: 1_700_000_000,
                active: true,
            },
        );
        discovery.save_cache().await.unwrap();

        let reloaded = discovery_fixture(dir.path(), 1);
        assert_eq!(reloaded.load_cache().await.unwrap(), 1);
        let agents = reloaded.known_agents().await;
        assert_eq!(agents[0].node, "ridge");
    }

    #[tokio::test]
    async fn test_missing_cache_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let discovery = discovery_fixture(dir.path(), 1);
        assert_eq!(discovery.load_cache().await.unwrap(), 0);
    }
}
