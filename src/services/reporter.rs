//! Remote reporter
//!
//! Ships the latest health and network documents to a collector. Fire
//! and forget: the body is whatever the file currently holds, a missing
//! file skips the report, and a failed POST waits for the next cycle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{HealthConfig, MeshMonitorConfig};
use crate::services::health::Heartbeat;
use crate::utils::{read_if_present, sleep_or_shutdown};
use crate::{Error, Result};

/// Health documents go out on a fixed minute cadence.
const HEALTH_REPORT_INTERVAL: Duration = Duration::from_secs(60);

pub struct RemoteReporter {
    collector_url: String,
    health_json_path: PathBuf,
    network_json_path: PathBuf,
    network_report_interval: Duration,
    client: reqwest::Client,
    heartbeat: Heartbeat,
}

impl RemoteReporter {
    /// Returns `None` when no collector is configured.
    pub fn new(
        mesh_config: &MeshMonitorConfig,
        health_config: &HealthConfig,
        heartbeat: Heartbeat,
    ) -> Option<Self> {
        let collector_url = mesh_config.collector_url.clone()?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Some(Self {
            collector_url,
            health_json_path: health_config.health_json_path.clone(),
            network_json_path: mesh_config.network_json_path.clone(),
            network_report_interval: Duration::from_secs(mesh_config.network_status_report_s),
            client,
            heartbeat,
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Remote reporter started toward {}", self.collector_url);
        let mut last_network_report: Option<Instant> = None;
        loop {
            self.heartbeat.beat();

            if let Err(e) = self.post_file(&self.health_json_path, "health").await {
                warn!("Health report failed: {}", e);
            }

            let network_due = last_network_report
                .map(|at| at.elapsed() >= self.network_report_interval)
                .unwrap_or(true);
            if network_due {
                match self.post_file(&self.network_json_path, "network").await {
                    Ok(()) => {
                        last_network_report = Some(Instant::now());
                    }
                    Err(e) => warn!("Network report failed: {}", e),
                }
            }

            if sleep_or_shutdown(HEALTH_REPORT_INTERVAL, &mut shutdown).await {
                info!("Remote reporter shutting down");
                return;
            }
        }
    }

    /// POST one document verbatim. Absent files skip quietly; non-2xx
    /// answers are logged and forgotten.
    async fn post_file(&self, path: &std::path::Path, label: &str) -> Result<()> {
        let Some(body) = read_if_present(path)? else {
            debug!("No {} document to report yet", label);
            return Ok(());
        };
        let response = self
            .client
            .post(&self.collector_url)
            .header(reqwest::header::CONNECTION, "close")
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::http(format!("{} POST: {}", label, e)))?;
        if !response.status().is_success() {
            warn!(
                "Collector answered {} for the {} report; ignored",
                response.status(),
                label
            );
        }
        Ok(())
    }
}

/// Spawn helper used by the orchestrator: reporter tasks only exist when
/// a collector is configured.
pub fn spawn_if_configured(
    mesh_config: &MeshMonitorConfig,
    health_config: &HealthConfig,
    heartbeat: Heartbeat,
    shutdown: watch::Receiver<bool>,
) -> Option<tokio::task::JoinHandle<()>> {
    let reporter = RemoteReporter::new(mesh_config, health_config, heartbeat)?;
    Some(tokio::spawn(reporter.run(shutdown)))
}
