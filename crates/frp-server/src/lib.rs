//! Relay-side core of frp.
//!
//! A frozen [`ProxyRegistry`] maps proxy names to [`ProxyServer`]s. The
//! [`ControlService`] accepts sockets on the control plane, authenticates
//! them, and either activates a proxy (the socket becomes its long-lived
//! control channel) or hands the socket to the pairing queue as a work
//! connection.

pub mod config;
pub mod control;
pub mod heartbeat;
pub mod proxy;
pub mod registry;

pub use config::{ConfigError, ProxyDefinition, ServerConfig};
pub use control::ControlService;
pub use proxy::{ProxyError, ProxyServer, ProxyStatus};
pub use registry::ProxyRegistry;
