//! Agent orchestrator
//!
//! Composes the shared state, binds the sockets (fatal on failure),
//! spawns one task per component, and tears everything down
//! cooperatively on shutdown. Components never own each other; they
//! share `Arc`s handed out here.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::core::state::SharedState;
use crate::routing;
use crate::services::{
    health::record_crash, reporter, AgentDiscovery, DirectoryReconciler, HealthMonitor,
    MeshMonitor, PhoneMonitor, PhonebookIngestor, ProbeEngine, ProbeResponder, ResponseQueue,
    SipProxy,
};
use crate::utils::DnsResolver;
use crate::Result;

/// How long `stop` waits for each component before aborting it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Started,
    Stopped,
    ComponentFailed { component: String, message: String },
}

pub struct MeshPhoneAgent {
    config: AgentConfig,
    state: Arc<SharedState>,
    event_tx: mpsc::UnboundedSender<AgentEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<AgentEvent>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
    running: bool,
}

impl MeshPhoneAgent {
    pub fn new(config: AgentConfig) -> Result<Self> {
        config.validate()?;
        let state = SharedState::new(&config);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            config,
            state,
            event_tx,
            event_rx: Some(event_rx),
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
            running: false,
        })
    }

    pub fn take_event_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<AgentEvent>> {
        self.event_rx.take()
    }

    pub fn shared_state(&self) -> Arc<SharedState> {
        Arc::clone(&self.state)
    }

    pub async fn start(&mut self) -> Result<()> {
        info!("Starting MeshPhone agent");

        let mut health = HealthMonitor::new(self.config.health.clone(), self.shared_state());
        let queue = Arc::new(ResponseQueue::new());
        let resolver = Arc::new(DnsResolver::new(&self.config.general.mesh_domain));
        let signal = Arc::new(Notify::new());

        // Socket binds are the only fatal startup steps.
        let proxy = Arc::new(
            SipProxy::bind(
                &self.config,
                self.shared_state(),
                Arc::clone(&queue),
                resolver.clone(),
            )
            .await?,
        );
        let sip_socket = proxy.socket();

        let mesh_enabled = self.config.mesh_monitor.enabled
            && self.config.mesh_monitor.mode != crate::config::MonitorMode::Disabled;

        let engine = Arc::new(ProbeEngine::new(
            &self.config.general.node_name,
            self.config.mesh_monitor.probe_port,
            self.config.mesh_monitor.dscp_ef,
        )?);

        self.spawn(
            "sip_proxy",
            Arc::clone(&proxy).run(self.shutdown_rx.clone()),
        );

        if !self.config.phonebook.sources.is_empty() {
            let ingestor = PhonebookIngestor::new(
                self.config.phonebook.clone(),
                self.shared_state(),
                Arc::clone(&signal),
                health.register("phonebook", self.config.phonebook.interval_seconds),
            );
            self.spawn("phonebook", ingestor.run(self.shutdown_rx.clone()));
        } else {
            warn!("No phonebook sources configured; directory ingestion idle");
        }

        let reconciler = DirectoryReconciler::new(
            self.config.phonebook.clone(),
            self.shared_state(),
            Arc::clone(&signal),
            health.register(
                "directory",
                self.config.phonebook.status_update_interval_seconds,
            ),
        );
        self.spawn("directory", reconciler.run(self.shutdown_rx.clone()));

        if mesh_enabled {
            let responder = ProbeResponder::bind(
                self.config.mesh_monitor.probe_port,
                self.config.mesh_monitor.dscp_ef,
            )?;
            self.spawn("probe_responder", responder.run(self.shutdown_rx.clone()));

            let adapter = routing::select_adapter(&self.config.mesh_monitor).await;
            let monitor = MeshMonitor::new(
                self.config.mesh_monitor.clone(),
                &self.config.general.node_name,
                self.shared_state(),
                Arc::clone(&engine),
                adapter,
                health.register(
                    "mesh_monitor",
                    self.config.mesh_monitor.network_status_interval_s,
                ),
            );
            self.spawn("mesh_monitor", monitor.run(self.shutdown_rx.clone()));
        }

        if self.config.phone_monitor.enabled {
            let monitor = PhoneMonitor::new(
                self.config.phone_monitor.clone(),
                &self.config.sip,
                self.shared_state(),
                sip_socket,
                Arc::clone(&queue),
                resolver.clone(),
                health.register("phone_monitor", self.config.phone_monitor.interval_s),
            );
            self.spawn("phone_monitor", monitor.run(self.shutdown_rx.clone()));
        }

        if self.config.discovery.enabled {
            let discovery = AgentDiscovery::new(
                self.config.discovery.clone(),
                Arc::clone(&engine),
                health.register("discovery", self.config.discovery.scan_interval_s),
            );
            self.spawn("discovery", discovery.run(self.shutdown_rx.clone()));
        }

        if let Some(handle) = reporter::spawn_if_configured(
            &self.config.mesh_monitor,
            &self.config.health,
            health.register("reporter", 60),
            self.shutdown_rx.clone(),
        ) {
            self.tasks.push(("reporter".to_string(), handle));
        }

        self.spawn("health", health.run(self.shutdown_rx.clone()));

        self.running = true;
        let _ = self.event_tx.send(AgentEvent::Started);
        info!("MeshPhone agent started with {} components", self.tasks.len());
        Ok(())
    }

    fn spawn<F>(&mut self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name.to_string(), tokio::spawn(future)));
    }

    /// Signal shutdown and join every component. Panicked components are
    /// recorded in the crash log.
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping MeshPhone agent");
        let _ = self.shutdown_tx.send(true);

        for (name, handle) in self.tasks.drain(..) {
            match tokio::time::timeout(JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => {
                    let message = join_error.to_string();
                    error!("Component {} failed: {}", name, message);
                    if self.config.health.crash_reporting {
                        if let Err(e) = record_crash(
                            &self.config.health.crashes_json_path,
                            &name,
                            &message,
                        ) {
                            warn!("Cannot record crash for {}: {}", name, e);
                        }
                    }
                    let _ = self.event_tx.send(AgentEvent::ComponentFailed {
                        component: name,
                        message,
                    });
                }
                Err(_) => {
                    warn!("Component {} did not stop in time; aborting", name);
                }
            }
        }

        self.running = false;
        let _ = self.event_tx.send(AgentEvent::Stopped);
        info!("MeshPhone agent stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

impl Drop for MeshPhoneAgent {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for (_, handle) in self.tasks.drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sandboxed_config(dir: &std::path::Path) -> AgentConfig {
        let mut config = AgentConfig::default_config();
        config.sip.listen_port = 45061;
        config.mesh_monitor.probe_port = 45050;
        config.mesh_monitor.routing_daemon = crate::config::RoutingDaemon::Olsr;
        config.discovery.enabled = false;
        config.phonebook.xml_path = dir.join("phonebook.xml");
        config.phonebook.fingerprint_path = dir.join("phonebook.fingerprint");
        config.phone_monitor.quality_json_path = dir.join("phone_quality.json");
        config.mesh_monitor.network_json_path = dir.join("meshmon_network.json");
        config.health.health_json_path = dir.join("meshmon_health.json");
        config.health.crashes_json_path = dir.join("meshmon_crashes.json");
        config
    }

    #[tokio::test]
    async fn test_agent_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = MeshPhoneAgent::new(sandboxed_config(dir.path())).unwrap();
        let mut events = agent.take_event_receiver().unwrap();

        agent.start().await.unwrap();
        assert!(agent.is_running());
        assert!(matches!(events.recv().await, Some(AgentEvent::Started)));

        agent.stop().await.unwrap();
        assert!(!agent.is_running());
        // Drain to the Stopped event.
        loop {
            match events.recv().await {
                Some(AgentEvent::Stopped) => break,
                Some(_) => continue,
                None => panic!("event channel closed before Stopped"),
            }
        }
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = AgentConfig::default_config();
        config.sip.listen_port = 0;
        assert!(MeshPhoneAgent::new(config).is_err());
    }
}
