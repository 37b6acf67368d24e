//! Wire protocol for the frp control channel.
//!
//! Every message is a single UTF-8 line carrying a JSON object. Two record
//! shapes exist: requests (`Type`/`ProxyName`/`Passwd`) flowing in both
//! directions, and responses (`Code`/`Msg`) flowing server to client.

pub mod codec;
pub mod messages;

pub use codec::{decode, encode, CodecError};
pub use messages::{
    CtlMessage, CtlRequest, CtlResponse, CTL_CONN, HEARTBEAT_REQ, HEARTBEAT_RES, WORK_CONN,
};
