//! MeshPhone - SIP proxy and mesh monitoring agent
//!
//! A single-process agent for AREDN-style amateur radio mesh routers. It
//! proxies SIP/UDP calls between mesh-resident IP phones, keeps a user
//! directory synchronised from HTTP-fetched CSV phonebooks, and
//! continuously measures per-link and per-phone network quality.

pub mod config;
pub mod core;
pub mod protocols;
pub mod routing;
pub mod services;
pub mod error;
pub mod utils;

pub use error::{Error, Result};

/// Agent version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
