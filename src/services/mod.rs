//! Long-running services of the MeshPhone agent

pub mod directory;
pub mod discovery;
pub mod health;
pub mod mesh_monitor;
pub mod phone_monitor;
pub mod phonebook;
pub mod probe_engine;
pub mod reporter;
pub mod sip_proxy;

pub use directory::DirectoryReconciler;
pub use discovery::AgentDiscovery;
pub use health::{Heartbeat, HealthMonitor};
pub use mesh_monitor::MeshMonitor;
pub use phone_monitor::{PhoneMonitor, ResponseQueue};
pub use phonebook::PhonebookIngestor;
pub use probe_engine::{ProbeEngine, ProbeResponder};
pub use reporter::RemoteReporter;
pub use sip_proxy::SipProxy;
