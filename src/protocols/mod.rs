//! Wire protocol implementations for the MeshPhone agent

pub mod probe;
pub mod rtp;
pub mod sip;

pub use probe::{ProbePacket, PROBE_PACKET_SIZE};
pub use sip::{SipMessage, SipMethod, StartLine};
