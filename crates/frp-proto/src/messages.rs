//! Protocol record types

use serde::{Deserialize, Serialize};

/// Activate a proxy; the sending socket becomes its control channel.
pub const CTL_CONN: u8 = 1;
/// Work-connection handshake (client to server), and the work request the
/// server writes on the control channel to ask for one.
pub const WORK_CONN: u8 = 2;
/// Liveness ping from the client.
pub const HEARTBEAT_REQ: u8 = 3;
/// `Code` value of the response answering a heartbeat.
pub const HEARTBEAT_RES: u8 = 4;

/// Request record, sent by the client on every new connection and by the
/// server as a work request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtlRequest {
    #[serde(rename = "Type")]
    pub msg_type: u8,
    #[serde(rename = "ProxyName")]
    pub proxy_name: String,
    #[serde(rename = "Passwd")]
    pub passwd: String,
}

impl CtlRequest {
    pub fn new(msg_type: u8, proxy_name: &str, passwd: &str) -> Self {
        Self {
            msg_type,
            proxy_name: proxy_name.to_string(),
            passwd: passwd.to_string(),
        }
    }

    pub fn heartbeat(proxy_name: &str) -> Self {
        Self::new(HEARTBEAT_REQ, proxy_name, "")
    }
}

/// Response record. `Code` is zero on success; error responses carry a
/// human-readable `Msg`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtlResponse {
    #[serde(rename = "Code")]
    pub code: i64,
    #[serde(rename = "Msg")]
    pub msg: String,
}

impl CtlResponse {
    pub fn ok() -> Self {
        Self {
            code: 0,
            msg: String::new(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            code: 1,
            msg: msg.into(),
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            code: HEARTBEAT_RES as i64,
            msg: String::new(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Either record shape, for readers that see both on one channel. The two
/// shapes share no field names, so untagged deserialization is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum CtlMessage {
    Request(CtlRequest),
    Response(CtlResponse),
}
