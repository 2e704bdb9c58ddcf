//! Health monitoring
//!
//! Every long-running component carries a heartbeat handle and beats it
//! at the top of its loop. The watchdog snapshots heartbeat ages, proxy
//! counters and table occupancy into the health document, and flags
//! components whose heartbeat has gone stale. Component crashes are
//! appended to a bounded crash log.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::HealthConfig;
use crate::core::state::{unix_now, ProxyStats, SharedState};
use crate::utils::{read_if_present, sleep_or_shutdown, write_atomic};
use crate::Result;

/// Crash log retains the most recent entries only.
pub const CRASH_LOG_CAPACITY: usize = 20;

struct HeartbeatInner {
    name: String,
    /// Expected loop period; stall detection allows for it on top of
    /// the configured threshold.
    period_s: u64,
    last_beat: AtomicU64,
    beats: AtomicU64,
}

/// Cheap cloneable heartbeat handle.
#[derive(Clone)]
pub struct Heartbeat {
    inner: Arc<HeartbeatInner>,
}

impl Heartbeat {
    pub fn new(name: &str) -> Self {
        Self::with_period(name, 0)
    }

    pub fn with_period(name: &str, period_s: u64) -> Self {
        Self {
            inner: Arc::new(HeartbeatInner {
                name: name.to_string(),
                period_s,
                last_beat: AtomicU64::new(unix_now()),
                beats: AtomicU64::new(0),
            }),
        }
    }

    pub fn beat(&self) {
        self.inner.last_beat.store(unix_now(), Ordering::Relaxed);
        self.inner.beats.fetch_add(1, Ordering::Relaxed);
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn age_secs(&self) -> u64 {
        unix_now().saturating_sub(self.inner.last_beat.load(Ordering::Relaxed))
    }

    pub fn beats(&self) -> u64 {
        self.inner.beats.load(Ordering::Relaxed)
    }

    pub fn period_s(&self) -> u64 {
        self.inner.period_s
    }
}

#[derive(Serialize)]
struct ComponentHealth<'a> {
    name: &'a str,
    last_beat_age_s: u64,
    beats: u64,
    stalled: bool,
}

#[derive(Serialize)]
struct ProxyCounters {
    datagrams_received: u64,
    oversize_dropped: u64,
    parse_failures: u64,
    requests_forwarded: u64,
    responses_forwarded: u64,
    rejects: u64,
}

#[derive(Serialize)]
struct HealthDocument<'a> {
    schema: &'static str,
    generated_at: u64,
    generated_at_iso: String,
    uptime_s: u64,
    memory_used_kb: u64,
    memory_total_kb: u64,
    users_total: usize,
    calls_active: usize,
    probe_results: usize,
    proxy: ProxyCounters,
    components: Vec<ComponentHealth<'a>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CrashRecord {
    component: String,
    message: String,
    timestamp: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CrashDocument {
    schema: String,
    crashes: Vec<CrashRecord>,
}

/// Append a crash record, keeping the log bounded. Readers tolerate a
/// missing or mangled previous document.
pub fn record_crash(path: &Path, component: &str, message: &str) -> Result<()> {
    let mut document = read_if_present(path)?
        .and_then(|text| serde_json::from_str::<CrashDocument>(&text).ok())
        .unwrap_or_else(|| CrashDocument {
            schema: "meshmon.v1".to_string(),
            crashes: Vec::new(),
        });
    document.crashes.push(CrashRecord {
        component: component.to_string(),
        message: message.to_string(),
        timestamp: unix_now(),
    });
    let overflow = document.crashes.len().saturating_sub(CRASH_LOG_CAPACITY);
    if overflow > 0 {
        document.crashes.drain(..overflow);
    }
    write_atomic(path, &serde_json::to_vec_pretty(&document)?)?;
    Ok(())
}

pub struct HealthMonitor {
    config: HealthConfig,
    state: Arc<SharedState>,
    heartbeats: Vec<Heartbeat>,
    /// Names already reported stalled, so the ERROR fires once per
    /// transition.
    reported_stalled: std::sync::Mutex<std::collections::HashSet<String>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, state: Arc<SharedState>) -> Self {
        Self {
            config,
            state,
            heartbeats: Vec::new(),
            reported_stalled: std::sync::Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Create and track a heartbeat for a named component. `period_s`
    /// is the component's natural loop period; the stall threshold is
    /// measured past it.
    pub fn register(&mut self, name: &str, period_s: u64) -> Heartbeat {
        let heartbeat = Heartbeat::with_period(name, period_s);
        self.heartbeats.push(heartbeat.clone());
        heartbeat
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Health monitoring disabled");
            return;
        }
        info!(
            "Health watchdog started (every {}s, stall threshold {}s)",
            self.config.check_interval_seconds, self.config.thread_stall_seconds
        );
        loop {
            if let Err(e) = self.write_health().await {
                warn!("Failed to publish health document: {}", e);
            }
            if sleep_or_shutdown(
                Duration::from_secs(self.config.check_interval_seconds),
                &mut shutdown,
            )
            .await
            {
                info!("Health watchdog shutting down");
                return;
            }
        }
    }

    async fn write_health(&self) -> Result<()> {
        let mut system = System::new();
        system.refresh_memory();

        let components: Vec<ComponentHealth> = self
            .heartbeats
            .iter()
            .map(|hb| {
                let age = hb.age_secs();
                let stalled = age > hb.period_s() + self.config.thread_stall_seconds;
                ComponentHealth {
                    name: hb.name(),
                    last_beat_age_s: age,
                    beats: hb.beats(),
                    stalled,
                }
            })
            .collect();

        self.report_stalls(&components);

        let stats = &self.state.proxy_stats;
        let document = HealthDocument {
            schema: "meshmon.v1",
            generated_at: unix_now(),
            generated_at_iso: chrono::Utc::now().to_rfc3339(),
            uptime_s: self
                .state
                .started_at
                .elapsed()
                .unwrap_or_default()
                .as_secs(),
            memory_used_kb: system.used_memory() / 1024,
            memory_total_kb: system.total_memory() / 1024,
            users_total: self.state.users.len().await,
            calls_active: self.state.calls.len().await,
            probe_results: self.state.probe_history.len().await,
            proxy: ProxyCounters {
                datagrams_received: ProxyStats::read(&stats.datagrams_received),
                oversize_dropped: ProxyStats::read(&stats.oversize_dropped),
                parse_failures: ProxyStats::read(&stats.parse_failures),
                requests_forwarded: ProxyStats::read(&stats.requests_forwarded),
                responses_forwarded: ProxyStats::read(&stats.responses_forwarded),
                rejects: ProxyStats::read(&stats.rejects),
            },
            components,
        };
        write_atomic(&self.config.health_json_path, &serde_json::to_vec_pretty(&document)?)?;
        Ok(())
    }

    fn report_stalls(&self, components: &[ComponentHealth<'_>]) {
        let mut reported = self
            .reported_stalled
            .lock()
            .expect("stall set poisoned");
        for component in components {
            if component.stalled {
                if reported.insert(component.name.to_string()) {
                    error!(
                        "Component {} heartbeat is {}s old; flagging as stalled",
                        component.name, component.last_beat_age_s
                    );
                }
            } else {
                reported.remove(component.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    #[test]
    fn test_heartbeat_ages_and_counts() {
        let heartbeat = Heartbeat::new("probe");
        assert_eq!(heartbeat.beats(), 0);
        heartbeat.beat();
        heartbeat.beat();
        assert_eq!(heartbeat.beats(), 2);
        assert!(heartbeat.age_secs() <= 1);
        assert_eq!(heartbeat.name(), "probe");
    }

    #[tokio::test]
    async fn test_health_document_written() {
        let dir = tempfile::tempdir().unwrap();
        let agent_config = AgentConfig::default_config();
        let state = SharedState::new(&agent_config);
        let mut config = agent_config.health.clone();
        config.health_json_path = dir.path().join("meshmon_health.json");

        let mut monitor = HealthMonitor::new(config, state);
        let heartbeat = monitor.register("phonebook", 3600);
        heartbeat.beat();
        monitor.write_health().await.unwrap();

        let text =
            std::fs::read_to_string(dir.path().join("meshmon_health.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["schema"], "meshmon.v1");
        assert_eq!(value["components"][0]["name"], "phonebook");
        assert_eq!(value["components"][0]["stalled"], false);
        assert_eq!(value["proxy"]["datagrams_received"], 0);
    }

    #[tokio::test]
    async fn test_stalled_component_flagged() {
        let dir = tempfile::tempdir().unwrap();
        let agent_config = AgentConfig::default_config();
        let state = SharedState::new(&agent_config);
        let mut config = agent_config.health.clone();
        config.health_json_path = dir.path().join("health.json");
        config.thread_stall_seconds = 0;

        let mut monitor = HealthMonitor::new(config, state);
        let heartbeat = monitor.register("stuck", 0);
        // Age the heartbeat past the (zero) threshold.
        heartbeat
            .inner
            .last_beat
            .store(unix_now() - 10, Ordering::Relaxed);
        monitor.write_health().await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("health.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["components"][0]["stalled"], true);
    }

    #[test]
    fn test_crash_log_appends_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meshmon_crashes.json");

        for i in 0..(CRASH_LOG_CAPACITY + 5) {
            record_crash(&path, "mesh_monitor", &format!("failure {}", i)).unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let document: CrashDocument = serde_json::from_str(&text).unwrap();
        assert_eq!(document.crashes.len(), CRASH_LOG_CAPACITY);
        // Oldest entries were dropped.
        assert_eq!(document.crashes[0].message, "failure 5");
        assert_eq!(document.schema, "meshmon.v1");
    }

    #[test]
    fn test_crash_log_tolerates_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crashes.json");
        std::fs::write(&path, "not json at all").unwrap();
        record_crash(&path, "reporter", "boom").unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let document: CrashDocument = serde_json::from_str(&text).unwrap();
        assert_eq!(document.crashes.len(), 1);
    }
}
