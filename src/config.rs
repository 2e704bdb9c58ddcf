//! Configuration management for the MeshPhone agent
//!
//! The on-disk format is the line-oriented `key=value` file the agent has
//! always shipped with: `#` comments, uppercase top-level keys, and
//! bracketed sections for the monitoring subsystems. Unknown keys are
//! logged and ignored; malformed lines are skipped.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Upper bound on configured phonebook sources.
pub const MAX_PHONEBOOK_SOURCES: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub general: GeneralConfig,
    pub sip: SipConfig,
    pub phonebook: PhonebookConfig,
    pub mesh_monitor: MeshMonitorConfig,
    pub phone_monitor: PhoneMonitorConfig,
    pub discovery: DiscoveryConfig,
    pub health: HealthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Node name advertised in probe packets, truncated to 63 bytes on the wire.
    pub node_name: String,
    /// Synthetic DNS suffix of the mesh.
    pub mesh_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipConfig {
    pub listen_port: u16,
    /// Registration lifetime granted to phones.
    pub register_expires: u32,
    /// Fixed capacity of the call-session table.
    pub max_sessions: usize,
    /// Fixed capacity of the user table.
    pub max_users: usize,
    /// Datagrams above this size are dropped.
    pub max_message_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhonebookSource {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl PhonebookSource {
    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("http://{}:{}{}", self.host, self.port, path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhonebookConfig {
    /// Ingestor period (PB_INTERVAL_SECONDS).
    pub interval_seconds: u64,
    /// Reconciler wake interval (STATUS_UPDATE_INTERVAL_SECONDS).
    pub status_update_interval_seconds: u64,
    pub sources: Vec<PhonebookSource>,
    /// Published XML artifact path.
    pub xml_path: PathBuf,
    /// Last-good CSV fingerprint path.
    pub fingerprint_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorMode {
    #[serde(rename = "disabled")]
    Disabled,
    #[serde(rename = "lightweight")]
    Lightweight,
    #[serde(rename = "full")]
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingDaemon {
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "olsr")]
    Olsr,
    #[serde(rename = "babel")]
    Babel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshMonitorConfig {
    pub enabled: bool,
    pub mode: MonitorMode,
    pub network_status_interval_s: u64,
    pub probe_window_s: u64,
    pub neighbor_targets: usize,
    pub rotating_peer: bool,
    pub max_probe_kbps: u32,
    pub probe_port: u16,
    pub dscp_ef: bool,
    pub routing_daemon: RoutingDaemon,
    pub routing_cache_s: u64,
    pub network_status_report_s: u64,
    pub collector_url: Option<String>,
    pub network_json_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhoneMonitorConfig {
    pub enabled: bool,
    /// Full INVITE/RTP/RTCP media test instead of OPTIONS-only probing.
    pub media_test: bool,
    pub invite_timeout_ms: u64,
    pub cycle_delay_sec: u64,
    /// Delay between full test cycles.
    pub interval_s: u64,
    pub quality_json_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologySource {
    #[serde(rename = "sysinfo")]
    Sysinfo,
    #[serde(rename = "olsr")]
    Olsr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub source: TopologySource,
    pub topology_url: String,
    pub scan_interval_s: u64,
    pub cache_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub enabled: bool,
    pub check_interval_seconds: u64,
    /// A component heartbeat older than this is reported as stalled.
    pub thread_stall_seconds: u64,
    pub crash_reporting: bool,
    pub health_json_path: PathBuf,
    pub crashes_json_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of ERROR, WARNING, INFO, DEBUG, NONE.
    pub level: String,
    pub file: Option<String>,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "full")]
    Full,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "json")]
    Json,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_name: "meshphone".to_string(),
            mesh_domain: "local.mesh".to_string(),
        }
    }
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            listen_port: 5060,
            register_expires: 3600,
            max_sessions: 32,
            max_users: 512,
            max_message_bytes: 2048,
        }
    }
}

impl Default for PhonebookConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 3600,
            status_update_interval_seconds: 600,
            sources: Vec::new(),
            xml_path: PathBuf::from("/tmp/phonebook.xml"),
            fingerprint_path: PathBuf::from("/tmp/phonebook.fingerprint"),
        }
    }
}

impl Default for MeshMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mode: MonitorMode::Full,
            network_status_interval_s: 40,
            probe_window_s: 10,
            neighbor_targets: 2,
            rotating_peer: true,
            max_probe_kbps: 50,
            probe_port: 40050,
            dscp_ef: false,
            routing_daemon: RoutingDaemon::Auto,
            routing_cache_s: 30,
            network_status_report_s: 300,
            collector_url: None,
            network_json_path: PathBuf::from("/tmp/meshmon_network.json"),
        }
    }
}

impl Default for PhoneMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            media_test: false,
            invite_timeout_ms: 5000,
            cycle_delay_sec: 2,
            interval_s: 300,
            quality_json_path: PathBuf::from("/tmp/phone_quality.json"),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            source: TopologySource::Sysinfo,
            topology_url: "http://localnode.local.mesh:8080/cgi-bin/sysinfo.json?hosts=1"
                .to_string(),
            scan_interval_s: 3600,
            cache_path: PathBuf::from("/tmp/aredn_agent_cache.txt"),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_seconds: 60,
            thread_stall_seconds: 300,
            crash_reporting: true,
            health_json_path: PathBuf::from("/tmp/meshmon_health.json"),
            crashes_json_path: PathBuf::from("/tmp/meshmon_crashes.json"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            file: None,
            format: LogFormat::Compact,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            sip: SipConfig::default(),
            phonebook: PhonebookConfig::default(),
            mesh_monitor: MeshMonitorConfig::default(),
            phone_monitor: PhoneMonitorConfig::default(),
            discovery: DiscoveryConfig::default(),
            health: HealthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn default_config() -> Self {
        Self::default()
    }

    /// Load configuration from a key=value file, applying recognised keys
    /// over the defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!(
                "cannot read {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config = Self::default();
        config.apply_str(&content);
        Ok(config)
    }

    /// Apply configuration text over the current values. Malformed lines
    /// are skipped, unknown keys are logged and ignored.
    pub fn apply_str(&mut self, content: &str) {
        let mut section = String::new();
        for raw_line in content.lines() {
            let line = match raw_line.find('#') {
                Some(pos) => &raw_line[..pos],
                None => raw_line,
            }
            .trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('[') {
                if let Some(end) = line.find(']') {
                    section = line[1..end].trim().to_ascii_lowercase();
                } else {
                    warn!("Skipping malformed section header: {}", raw_line.trim());
                }
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("Skipping malformed configuration line: {}", line);
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            self.apply_key(&section, key, value);
        }
    }

    fn apply_key(&mut self, section: &str, key: &str, value: &str) {
        match section {
            "" => self.apply_global_key(key, value),
            "mesh_monitor" => self.apply_mesh_monitor_key(key, value),
            "phone_monitor" => self.apply_phone_monitor_key(key, value),
            "discovery" => self.apply_discovery_key(key, value),
            other => {
                warn!("Ignoring key {} in unknown section [{}]", key, other);
            }
        }
    }

    fn apply_global_key(&mut self, key: &str, value: &str) {
        match key {
            "NODE_NAME" => self.general.node_name = value.to_string(),
            "PB_INTERVAL_SECONDS" => {
                set_u64(&mut self.phonebook.interval_seconds, key, value)
            }
            "STATUS_UPDATE_INTERVAL_SECONDS" => set_u64(
                &mut self.phonebook.status_update_interval_seconds,
                key,
                value,
            ),
            "PHONEBOOK_SERVER" => {
                if self.phonebook.sources.len() >= MAX_PHONEBOOK_SOURCES {
                    warn!(
                        "Ignoring PHONEBOOK_SERVER beyond the {} source limit",
                        MAX_PHONEBOOK_SOURCES
                    );
                    return;
                }
                match parse_phonebook_source(value) {
                    Some(source) => self.phonebook.sources.push(source),
                    None => warn!("Skipping malformed PHONEBOOK_SERVER value: {}", value),
                }
            }
            "PHONEBOOK_XML_PATH" => self.phonebook.xml_path = PathBuf::from(value),
            "PHONEBOOK_FINGERPRINT_PATH" => {
                self.phonebook.fingerprint_path = PathBuf::from(value)
            }
            "LOG_LEVEL" => match value.to_ascii_uppercase().as_str() {
                "ERROR" | "WARNING" | "INFO" | "DEBUG" | "NONE" => {
                    self.logging.level = value.to_ascii_uppercase();
                }
                _ => warn!("Ignoring unknown LOG_LEVEL value: {}", value),
            },
            "LOG_FILE" => self.logging.file = Some(value.to_string()),
            "HEALTH_ENABLED" => set_bool(&mut self.health.enabled, key, value),
            "HEALTH_CHECK_INTERVAL_SECONDS" => {
                set_u64(&mut self.health.check_interval_seconds, key, value)
            }
            "HEALTH_THREAD_STALL_SECONDS" => {
                set_u64(&mut self.health.thread_stall_seconds, key, value)
            }
            "HEALTH_CRASH_REPORTING" => {
                set_bool(&mut self.health.crash_reporting, key, value)
            }
            _ => warn!("Ignoring unknown configuration key: {}", key),
        }
    }

    fn apply_mesh_monitor_key(&mut self, key: &str, value: &str) {
        let m = &mut self.mesh_monitor;
        match key {
            "enabled" => set_bool(&mut m.enabled, key, value),
            "mode" => match value.to_ascii_lowercase().as_str() {
                "disabled" => m.mode = MonitorMode::Disabled,
                "lightweight" => m.mode = MonitorMode::Lightweight,
                "full" => m.mode = MonitorMode::Full,
                _ => warn!("Ignoring unknown mesh_monitor mode: {}", value),
            },
            "network_status_interval_s" => {
                set_u64(&mut m.network_status_interval_s, key, value)
            }
            "probe_window_s" => set_u64(&mut m.probe_window_s, key, value),
            "neighbor_targets" => set_usize(&mut m.neighbor_targets, key, value),
            "rotating_peer" => set_bool(&mut m.rotating_peer, key, value),
            "max_probe_kbps" => set_u32(&mut m.max_probe_kbps, key, value),
            "probe_port" => set_u16(&mut m.probe_port, key, value),
            "dscp_ef" => set_bool(&mut m.dscp_ef, key, value),
            "routing_daemon" => match value.to_ascii_lowercase().as_str() {
                "auto" => m.routing_daemon = RoutingDaemon::Auto,
                "olsr" => m.routing_daemon = RoutingDaemon::Olsr,
                "babel" => m.routing_daemon = RoutingDaemon::Babel,
                _ => warn!("Ignoring unknown routing_daemon value: {}", value),
            },
            "routing_cache_s" => set_u64(&mut m.routing_cache_s, key, value),
            "network_status_report_s" => {
                set_u64(&mut m.network_status_report_s, key, value)
            }
            "collector_url" => m.collector_url = Some(value.to_string()),
            "network_json_path" => m.network_json_path = PathBuf::from(value),
            _ => warn!("Ignoring unknown [mesh_monitor] key: {}", key),
        }
    }

    fn apply_phone_monitor_key(&mut self, key: &str, value: &str) {
        let p = &mut self.phone_monitor;
        match key {
            "enabled" => set_bool(&mut p.enabled, key, value),
            "media_test" => set_bool(&mut p.media_test, key, value),
            "invite_timeout_ms" => set_u64(&mut p.invite_timeout_ms, key, value),
            "cycle_delay_sec" => set_u64(&mut p.cycle_delay_sec, key, value),
            "interval_s" => set_u64(&mut p.interval_s, key, value),
            "quality_json_path" => p.quality_json_path = PathBuf::from(value),
            _ => warn!("Ignoring unknown [phone_monitor] key: {}", key),
        }
    }

    fn apply_discovery_key(&mut self, key: &str, value: &str) {
        let d = &mut self.discovery;
        match key {
            "enabled" => set_bool(&mut d.enabled, key, value),
            "source" => match value.to_ascii_lowercase().as_str() {
                "sysinfo" => d.source = TopologySource::Sysinfo,
                "olsr" => d.source = TopologySource::Olsr,
                _ => warn!("Ignoring unknown discovery source: {}", value),
            },
            "topology_url" => d.topology_url = value.to_string(),
            "scan_interval_s" => set_u64(&mut d.scan_interval_s, key, value),
            "cache_path" => d.cache_path = PathBuf::from(value),
            _ => warn!("Ignoring unknown [discovery] key: {}", key),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.sip.listen_port == 0 {
            return Err(Error::config("SIP listen port must be non-zero"));
        }
        if self.sip.max_sessions == 0 || self.sip.max_users == 0 {
            return Err(Error::config("SIP table capacities must be non-zero"));
        }
        if self.phonebook.interval_seconds == 0 {
            return Err(Error::config("PB_INTERVAL_SECONDS must be positive"));
        }
        if self.phonebook.status_update_interval_seconds == 0 {
            return Err(Error::config(
                "STATUS_UPDATE_INTERVAL_SECONDS must be positive",
            ));
        }
        if self.mesh_monitor.probe_port == 0 {
            return Err(Error::config("probe_port must be non-zero"));
        }
        if self.mesh_monitor.network_status_interval_s == 0 {
            return Err(Error::config("network_status_interval_s must be positive"));
        }
        if self.mesh_monitor.neighbor_targets == 0 {
            return Err(Error::config("neighbor_targets must be positive"));
        }
        if self.phone_monitor.invite_timeout_ms == 0 {
            return Err(Error::config("invite_timeout_ms must be positive"));
        }
        match self.logging.level.as_str() {
            "ERROR" | "WARNING" | "INFO" | "DEBUG" | "NONE" => {}
            other => {
                return Err(Error::config(format!("unknown LOG_LEVEL: {}", other)));
            }
        }
        for source in &self.phonebook.sources {
            if source.host.is_empty() || source.port == 0 {
                return Err(Error::config("PHONEBOOK_SERVER host/port invalid"));
            }
        }
        Ok(())
    }
}

fn parse_phonebook_source(value: &str) -> Option<PhonebookSource> {
    let mut parts = value.splitn(3, ',');
    let host = parts.next()?.trim();
    let port: u16 = parts.next()?.trim().parse().ok()?;
    let path = parts.next()?.trim();
    if host.is_empty() || path.is_empty() {
        return None;
    }
    Some(PhonebookSource {
        host: host.to_string(),
        port,
        path: path.to_string(),
    })
}

fn set_bool(slot: &mut bool, key: &str, value: &str) {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => *slot = true,
        "0" | "false" | "no" | "off" => *slot = false,
        _ => warn!("Ignoring non-boolean value for {}: {}", key, value),
    }
}

fn set_u64(slot: &mut u64, key: &str, value: &str) {
    match value.parse::<u64>() {
        Ok(v) => *slot = v,
        Err(_) => warn!("Ignoring non-numeric value for {}: {}", key, value),
    }
}

fn set_u32(slot: &mut u32, key: &str, value: &str) {
    match value.parse::<u32>() {
        Ok(v) => *slot = v,
        Err(_) => warn!("Ignoring non-numeric value for {}: {}", key, value),
    }
}

fn set_u16(slot: &mut u16, key: &str, value: &str) {
    match value.parse::<u16>() {
        Ok(v) => *slot = v,
        Err(_) => warn!("Ignoring non-numeric value for {}: {}", key, value),
    }
}

fn set_usize(slot: &mut usize, key: &str, value: &str) {
    match value.parse::<usize>() {
        Ok(v) => *slot = v,
        Err(_) => warn!("Ignoring non-numeric value for {}: {}", key, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = AgentConfig::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.sip.listen_port, 5060);
        assert_eq!(config.mesh_monitor.probe_port, 40050);
        assert_eq!(config.phonebook.interval_seconds, 3600);
        assert_eq!(config.phonebook.status_update_interval_seconds, 600);
    }

    #[test]
    fn test_apply_global_keys() {
        let mut config = AgentConfig::default();
        config.apply_str(
            "# agent config\n\
             NODE_NAME=KD7ABC-hilltop\n\
             PB_INTERVAL_SECONDS=1800\n\
             STATUS_UPDATE_INTERVAL_SECONDS=120\n\
             PHONEBOOK_SERVER=pbserver.local.mesh,80,/phonebook.csv\n\
             PHONEBOOK_SERVER=backup.local.mesh,8080,phonebook.csv\n\
             LOG_LEVEL=DEBUG\n",
        );
        assert_eq!(config.general.node_name, "KD7ABC-hilltop");
        assert_eq!(config.phonebook.interval_seconds, 1800);
        assert_eq!(config.phonebook.status_update_interval_seconds, 120);
        assert_eq!(config.phonebook.sources.len(), 2);
        assert_eq!(config.phonebook.sources[0].host, "pbserver.local.mesh");
        assert_eq!(
            config.phonebook.sources[1].url(),
            "http://backup.local.mesh:8080/phonebook.csv"
        );
        assert_eq!(config.logging.level, "DEBUG");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_section_keys() {
        let mut config = AgentConfig::default();
        config.apply_str(
            "[mesh_monitor]\n\
             enabled=true\n\
             mode=lightweight\n\
             network_status_interval_s=60\n\
             neighbor_targets=3\n\
             probe_port=40051\n\
             dscp_ef=1\n\
             routing_daemon=olsr\n\
             collector_url=http://collector.local.mesh/report\n\
             [phone_monitor]\n\
             media_test=true\n\
             invite_timeout_ms=2500\n\
             [discovery]\n\
             source=olsr\n",
        );
        assert_eq!(config.mesh_monitor.mode, MonitorMode::Lightweight);
        assert_eq!(config.mesh_monitor.network_status_interval_s, 60);
        assert_eq!(config.mesh_monitor.neighbor_targets, 3);
        assert_eq!(config.mesh_monitor.probe_port, 40051);
        assert!(config.mesh_monitor.dscp_ef);
        assert_eq!(config.mesh_monitor.routing_daemon, RoutingDaemon::Olsr);
        assert_eq!(
            config.mesh_monitor.collector_url.as_deref(),
            Some("http://collector.local.mesh/report")
        );
        assert!(config.phone_monitor.media_test);
        assert_eq!(config.phone_monitor.invite_timeout_ms, 2500);
        assert_eq!(config.discovery.source, TopologySource::Olsr);
    }

    #[test]
    fn test_unknown_and_malformed_lines_skipped() {
        let mut config = AgentConfig::default();
        config.apply_str(
            "SOME_FUTURE_KEY=whatever\n\
             this line has no equals sign\n\
             PB_INTERVAL_SECONDS=not-a-number\n\
             LOG_LEVEL=LOUD\n",
        );
        // Nothing recognised changed.
        assert_eq!(config.phonebook.interval_seconds, 3600);
        assert_eq!(config.logging.level, "INFO");
    }

    #[test]
    fn test_phonebook_source_cap() {
        let mut config = AgentConfig::default();
        let mut text = String::new();
        for i in 0..(MAX_PHONEBOOK_SOURCES + 3) {
            text.push_str(&format!("PHONEBOOK_SERVER=host{},80,/pb.csv\n", i));
        }
        config.apply_str(&text);
        assert_eq!(config.phonebook.sources.len(), MAX_PHONEBOOK_SOURCES);
    }

    #[test]
    fn test_validate_rejects_zero_intervals() {
        let mut config = AgentConfig::default();
        config.phonebook.interval_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.mesh_monitor.neighbor_targets = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sipserver.conf");
        std::fs::write(
            &path,
            "PB_INTERVAL_SECONDS=900  # hourly is too slow for testing\n\
             [mesh_monitor]\n\
             probe_window_s=5\n",
        )
        .unwrap();
        let config = AgentConfig::load_from_file(&path).unwrap();
        assert_eq!(config.phonebook.interval_seconds, 900);
        assert_eq!(config.mesh_monitor.probe_window_s, 5);
    }

    #[test]
    fn test_comment_stripping_inside_line() {
        let mut config = AgentConfig::default();
        config.apply_str("NODE_NAME=alpha # my node\n");
        assert_eq!(config.general.node_name, "alpha");
    }
}
