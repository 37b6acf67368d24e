//! Connection layer shared by all frp components.
//!
//! Control, work, user, and local-service sockets all go through [`Conn`]:
//! a TCP stream with line-oriented reads on one half and whole-line writes
//! on the other, so one task can pump outbound records while another reads
//! inbound ones. [`join`] splices two established conns into a tunnel.

mod conn;
mod join;

pub use conn::{Conn, Listener};
pub use join::join;

use thiserror::Error;

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("connection closed")]
    Closed,

    #[error("invalid address: {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
