//! Client liveness watchdog
//!
//! One per control session. Owns the read side of the control connection
//! after activation: answers each heartbeat, and closes the proxy when the
//! client stays silent past the timeout or the connection dies. Glitches on
//! the heartbeat path are soft errors; only silence and EOF are fatal.

use std::sync::Arc;
use std::time::Duration;

use frp_connection::{Conn, ConnError};
use frp_proto::{codec, CtlRequest, CtlResponse, HEARTBEAT_REQ};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::control::reply;
use crate::proxy::ProxyServer;

pub async fn watch(conn: Arc<Conn>, proxy: Arc<ProxyServer>, timeout: Duration) {
    let mut deadline = Instant::now() + timeout;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                error!("proxy [{}] client heartbeat timeout", proxy.name());
                proxy.close().await;
                break;
            }
            res = conn.read_line() => match res {
                Ok(line) => {
                    let req: CtlRequest = match codec::decode(&line) {
                        Ok(req) => req,
                        Err(e) => {
                            warn!("proxy [{}] unparsable control record: {}", proxy.name(), e);
                            continue;
                        }
                    };
                    if req.msg_type == HEARTBEAT_REQ {
                        debug!("proxy [{}] heartbeat", proxy.name());
                        deadline = Instant::now() + timeout;
                        if !reply(&conn, &CtlResponse::heartbeat()).await {
                            warn!("proxy [{}] failed to answer heartbeat", proxy.name());
                        }
                    }
                    // any other record type on this path is ignored
                }
                Err(ConnError::Closed) => {
                    warn!("proxy [{}] client is gone", proxy.name());
                    proxy.close().await;
                    break;
                }
                Err(e) => {
                    if conn.is_closed() {
                        proxy.close().await;
                        break;
                    }
                    error!("proxy [{}] control read error: {}", proxy.name(), e);
                }
            }
        }
    }
}
