//! Mesh monitor driver
//!
//! Periodically asks the routing adapter for the current neighbours,
//! drives probe bursts at a rotating subset of them, folds the computed
//! metrics into the probe-history ring, and publishes the network status
//! document.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{MeshMonitorConfig, MonitorMode};
use crate::core::state::{unix_now, ProbeResult, SharedState};
use crate::routing::{Neighbor, RoutingAdapter};
use crate::services::health::Heartbeat;
use crate::services::probe_engine::ProbeEngine;
use crate::utils::{sleep_or_shutdown, write_atomic};
use crate::Result;

/// Burst shape: 10 probes at 100 ms spacing per selected neighbour.
pub const PROBES_PER_BURST: u32 = 10;
pub const PROBE_SPACING: Duration = Duration::from_millis(100);

/// Document published to `meshmon_network.json` each cycle.
#[derive(Serialize)]
struct NetworkDocument<'a> {
    schema: &'static str,
    node: &'a str,
    generated_at: u64,
    generated_at_iso: String,
    results: &'a [ProbeResult],
}

pub struct MeshMonitor {
    config: MeshMonitorConfig,
    node_name: String,
    state: Arc<SharedState>,
    engine: Arc<ProbeEngine>,
    adapter: Arc<dyn RoutingAdapter>,
    heartbeat: Heartbeat,
    rotation: AtomicUsize,
}

impl MeshMonitor {
    pub fn new(
        config: MeshMonitorConfig,
        node_name: &str,
        state: Arc<SharedState>,
        engine: Arc<ProbeEngine>,
        adapter: Arc<dyn RoutingAdapter>,
        heartbeat: Heartbeat,
    ) -> Self {
        Self {
            config,
            node_name: node_name.to_string(),
            state,
            engine,
            adapter,
            heartbeat,
            rotation: AtomicUsize::new(0),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled || self.config.mode == MonitorMode::Disabled {
            info!("Mesh monitor disabled");
            return;
        }
        info!(
            "Mesh monitor started (mode {:?}, every {}s)",
            self.config.mode, self.config.network_status_interval_s
        );
        loop {
            self.heartbeat.beat();
            if let Err(e) = self.cycle(&mut shutdown).await {
                warn!("Mesh monitor cycle failed: {}", e);
            }
            if *shutdown.borrow() {
                info!("Mesh monitor shutting down");
                return;
            }
            if let Err(e) = self.publish().await {
                warn!("Failed to publish network status: {}", e);
            }
            if sleep_or_shutdown(
                Duration::from_secs(self.config.network_status_interval_s),
                &mut shutdown,
            )
            .await
            {
                info!("Mesh monitor shutting down");
                return;
            }
        }
    }

    /// One probe cycle over the selected neighbours.
    async fn cycle(&self, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        let neighbors = match self.adapter.get_neighbors().await {
            Ok(neighbors) => neighbors,
            Err(e) => {
                debug!("Neighbour enumeration failed: {}", e);
                return Ok(());
            }
        };
        if neighbors.is_empty() {
            debug!("No mesh neighbours to probe");
            return Ok(());
        }

        let targets = self.select_targets(&neighbors);
        if self.over_probe_budget(targets.len()) {
            warn!(
                "Probe burst would exceed max_probe_kbps={}; skipping this cycle",
                self.config.max_probe_kbps
            );
            return Ok(());
        }

        for neighbor in targets {
            if *shutdown.borrow() {
                return Ok(());
            }
            self.heartbeat.beat();
            self.probe_neighbor(&neighbor, shutdown).await?;
        }
        Ok(())
    }

    async fn probe_neighbor(
        &self,
        neighbor: &Neighbor,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        self.engine
            .send_probes(neighbor.ip, PROBES_PER_BURST, PROBE_SPACING)
            .await?;
        if sleep_or_shutdown(Duration::from_secs(self.config.probe_window_s), shutdown).await {
            return Ok(());
        }
        let metrics = self.engine.calculate_metrics(neighbor.ip).await;

        let hops = if self.config.mode == MonitorMode::Full {
            match self.adapter.get_path_hops(neighbor.ip).await {
                Ok(hops) => hops.into_iter().map(|h| h.ip.to_string()).collect(),
                Err(e) => {
                    debug!("Path enumeration for {} failed: {}", neighbor.ip, e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let result = ProbeResult {
            dst_ip: neighbor.ip.to_string(),
            dst_node: neighbor.name.clone().unwrap_or_default(),
            timestamp: unix_now(),
            rtt_ms_avg: metrics.rtt_ms_avg,
            jitter_ms: metrics.jitter_ms,
            loss_pct: metrics.loss_pct,
            hop_count: hops.len() as u32,
            hops,
            link_type: self
                .adapter
                .classify_link_type(&neighbor.interface)
                .as_str()
                .to_string(),
        };
        debug!(
            "Probe {}: rtt {:.1} ms, jitter {:.1} ms, loss {:.0}%",
            result.dst_ip, result.rtt_ms_avg, result.jitter_ms, result.loss_pct
        );
        self.state.probe_history.push(result).await;
        Ok(())
    }

    /// Pick up to `neighbor_targets` neighbours, walking the list across
    /// cycles when peer rotation is on so every link gets measured.
    fn select_targets(&self, neighbors: &[Neighbor]) -> Vec<Neighbor> {
        let want = self.config.neighbor_targets.min(neighbors.len());
        if !self.config.rotating_peer {
            return neighbors[..want].to_vec();
        }
        let start = self.rotation.fetch_add(want, Ordering::Relaxed);
        (0..want)
            .map(|i| neighbors[(start + i) % neighbors.len()].clone())
            .collect()
    }

    /// Probe traffic over one status interval, in kbit/s, against the
    /// configured cap.
    fn over_probe_budget(&self, target_count: usize) -> bool {
        if self.config.max_probe_kbps == 0 {
            return false;
        }
        let bytes = target_count as u64
            * PROBES_PER_BURST as u64
            * crate::protocols::probe::PROBE_PACKET_SIZE as u64;
        let interval = self.config.network_status_interval_s.max(1);
        let kbps = bytes * 8 / 1000 / interval;
        kbps > self.config.max_probe_kbps as u64
    }

    async fn publish(&self) -> Result<()> {
        let results = self.state.probe_history.snapshot().await;
        let document = NetworkDocument {
            schema: "meshmon.v1",
            node: &self.node_name,
            generated_at: unix_now(),
            generated_at_iso: chrono::Utc::now().to_rfc3339(),
            results: &results,
        };
        let json = serde_json::to_vec_pretty(&document)?;
        write_atomic(&self.config.network_json_path, &json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::routing::{Hop, Route};
    use crate::services::probe_engine::ProbeResponder;
    use async_trait::async_trait;

    struct StubAdapter {
        neighbors: Vec<Neighbor>,
    }

    #[async_trait]
    impl RoutingAdapter for StubAdapter {
        fn name(&self) -> &'static str {
            "stub"
        }
        async fn get_neighbors(&self) -> Result<Vec<Neighbor>> {
            Ok(self.neighbors.clone())
        }
        async fn get_route(&self, dst: Ipv4Addr) -> Result<Option<Route>> {
            Ok(Some(Route {
                destination: dst,
                gateway: dst,
                interface: "wlan0".to_string(),
            }))
        }
        async fn get_path_hops(&self, dst: Ipv4Addr) -> Result<Vec<Hop>> {
            Ok(vec![Hop { ip: dst }])
        }
    }

    fn neighbor(last: u8) -> Neighbor {
        Neighbor {
            ip: Ipv4Addr::new(127, 0, 0, last),
            name: Some(format!("node-{}", last)),
            interface: "wlan0".to_string(),
        }
    }

    fn monitor_fixture(
        config_fn: impl FnOnce(&mut MeshMonitorConfig),
        neighbors: Vec<Neighbor>,
        target_port: u16,
    ) -> (MeshMonitor, Arc<SharedState>) {
        let agent_config = AgentConfig::default_config();
        let state = SharedState::new(&agent_config);
        let mut config = agent_config.mesh_monitor.clone();
        config.probe_window_s = 0;
        config_fn(&mut config);
        let engine = Arc::new(ProbeEngine::new("test-node", target_port, false).unwrap());
        let monitor = MeshMonitor::new(
            config,
            "test-node",
            Arc::clone(&state),
            engine,
            Arc::new(StubAdapter { neighbors }),
            Heartbeat::new("mesh_monitor"),
        );
        (monitor, state)
    }

    #[tokio::test]
    async fn test_select_targets_rotates() {
        let (monitor, _) = monitor_fixture(
            |c| {
                c.neighbor_targets = 2;
                c.rotating_peer = true;
            },
            vec![],
            1,
        );
        let neighbors = vec![neighbor(1), neighbor(2), neighbor(3)];
        let first = monitor.select_targets(&neighbors);
        let second = monitor.select_targets(&neighbors);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].ip, neighbors[0].ip);
        assert_eq!(first[1].ip, neighbors[1].ip);
        // The next cycle continues where the last one stopped.
        assert_eq!(second[0].ip, neighbors[2].ip);
        assert_eq!(second[1].ip, neighbors[0].ip);
    }

    #[tokio::test]
    async fn test_select_targets_without_rotation() {
        let (monitor, _) = monitor_fixture(
            |c| {
                c.neighbor_targets = 2;
                c.rotating_peer = false;
            },
            vec![],
            1,
        );
        let neighbors = vec![neighbor(1), neighbor(2), neighbor(3)];
        for _ in 0..3 {
            let targets = monitor.select_targets(&neighbors);
            assert_eq!(targets[0].ip, neighbors[0].ip);
            assert_eq!(targets[1].ip, neighbors[1].ip);
        }
    }

    #[tokio::test]
    async fn test_probe_budget() {
        let (monitor, _) = monitor_fixture(
            |c| {
                c.max_probe_kbps = 8;
                c.network_status_interval_s = 1;
            },
            vec![],
            1,
        );
        // One burst is 10 * 94 bytes, about 7 kbit/s over one second.
        assert!(!monitor.over_probe_budget(1));
        assert!(monitor.over_probe_budget(2000));
    }

    #[tokio::test]
    async fn test_cycle_appends_history() {
        let responder = ProbeResponder::bind(0, false).unwrap();
        let port = responder.local_port().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(responder.run(shutdown_rx));

        let (monitor, state) = monitor_fixture(
            |c| {
                c.neighbor_targets = 1;
                c.max_probe_kbps = 0;
            },
            vec![neighbor(1)],
            port,
        );

        let (_tx, mut rx) = watch::channel(false);
        monitor.cycle(&mut rx).await.unwrap();

        let history = state.probe_history.snapshot().await;
        assert_eq!(history.len(), 1);
        let result = &history[0];
        assert_eq!(result.dst_ip, "127.0.0.1");
        assert_eq!(result.dst_node, "node-1");
        assert_eq!(result.loss_pct, 0.0);
        assert_eq!(result.link_type, "RF");
        assert_eq!(result.hop_count, 1);

        shutdown_tx.send(true).unwrap();
    }

    #[tokio::test]
    async fn test_publish_network_document() {
        let dir = tempfile::tempdir().unwrap();
        let (mut monitor, state) = monitor_fixture(|_| {}, vec![], 1);
        monitor.config.network_json_path = dir.path().join("meshmon_network.json");

        state
            .probe_history
            .push(ProbeResult {
                dst_ip: "10.0.0.9".to_string(),
                dst_node: "far-node".to_string(),
                timestamp: unix_now(),
                rtt_ms_avg: 12.0,
                jitter_ms: 1.5,
                loss_pct: 10.0,
                hop_count: 2,
                hops: vec!["10.0.0.5".to_string(), "10.0.0.9".to_string()],
                link_type: "tunnel".to_string(),
            })
            .await;
        monitor.publish().await.unwrap();

        let text =
            std::fs::read_to_string(dir.path().join("meshmon_network.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["schema"], "meshmon.v1");
        assert_eq!(value["node"], "test-node");
        assert_eq!(value["results"][0]["dst_node"], "far-node");
        assert_eq!(value["results"][0]["hop_count"], 2);
    }
}
