//! Client-side core of frp.
//!
//! One [`ProxyClient`] per configured proxy keeps a control connection to
//! the relay, emits heartbeats, and answers every work request by dialling a
//! fresh work connection plus the local service and splicing the two.

pub mod config;
pub mod control;
pub mod proxy;

pub use config::{ClientConfig, ClientProxy, ConfigError};
pub use control::run_proxy;
pub use proxy::ProxyClient;

use frp_connection::ConnError;
use frp_proto::CodecError;
use thiserror::Error;

/// Client-side errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection error: {0}")]
    Conn(#[from] ConnError),

    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("proxy [{name}] rejected by server: {msg}")]
    Rejected { name: String, msg: String },
}
