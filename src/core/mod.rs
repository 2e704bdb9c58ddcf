//! Core orchestration and shared state

pub mod agent;
pub mod state;

pub use agent::{AgentEvent, MeshPhoneAgent};
pub use state::SharedState;
