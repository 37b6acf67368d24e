//! Control-plane connection handling
//!
//! Every socket accepted on the control plane carries exactly one request
//! record up front. `CTL_CONN` turns the socket into the proxy's long-lived
//! control channel; `WORK_CONN` hands the socket over to the pairing queue
//! and must not be answered.

use std::sync::Arc;
use std::time::Duration;

use frp_connection::{Conn, Listener};
use frp_proto::{codec, CtlRequest, CtlResponse, CTL_CONN, WORK_CONN};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::heartbeat;
use crate::proxy::{ProxyServer, ProxyStatus};
use crate::registry::ProxyRegistry;

/// Accepts and dispatches control-plane connections.
pub struct ControlService {
    registry: Arc<ProxyRegistry>,
    heartbeat_timeout: Duration,
}

impl ControlService {
    pub fn new(registry: Arc<ProxyRegistry>, heartbeat_timeout: Duration) -> Self {
        Self {
            registry,
            heartbeat_timeout,
        }
    }

    /// Accept loop for the control plane. Runs until the process exits.
    pub async fn run(self: Arc<Self>, listener: Listener) {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    debug!("new control-plane connection from {}", conn.peer_addr());
                    let service = Arc::clone(&self);
                    tokio::spawn(async move { service.handle_conn(conn).await });
                }
                Err(e) => {
                    warn!("control-plane accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle one accepted control-plane socket to completion.
    pub async fn handle_conn(&self, conn: Conn) {
        let line = match conn.read_line().await {
            Ok(line) => line,
            Err(e) => {
                warn!("control read error from {}: {}", conn.peer_addr(), e);
                return;
            }
        };
        let req: CtlRequest = match codec::decode(&line) {
            Ok(req) => req,
            Err(e) => {
                warn!("malformed control request from {}: {}", conn.peer_addr(), e);
                conn.close().await;
                return;
            }
        };

        let Some(proxy) = self.registry.get(&req.proxy_name) else {
            let msg = format!("ProxyName [{}] does not exist", req.proxy_name);
            warn!("{}", msg);
            reply(&conn, &CtlResponse::error(msg)).await;
            conn.close().await;
            return;
        };
        if !proxy.authenticate(&req.passwd) {
            let msg = format!("ProxyName [{}], password is not correct", req.proxy_name);
            warn!("{}", msg);
            reply(&conn, &CtlResponse::error(msg)).await;
            conn.close().await;
            return;
        }

        match req.msg_type {
            CTL_CONN => self.run_control_session(conn, proxy).await,
            WORK_CONN => {
                if proxy.status().await != ProxyStatus::Working {
                    warn!(
                        "proxy [{}] is not working, dropping work connection",
                        proxy.name()
                    );
                    conn.close().await;
                    return;
                }
                // no response: the socket now belongs to the pairing queue
                proxy.get_new_cli_conn(conn).await;
            }
            other => {
                let msg = format!("ProxyName [{}], type [{}] unsupported", req.proxy_name, other);
                warn!("{}", msg);
                reply(&conn, &CtlResponse::error(msg)).await;
                conn.close().await;
            }
        }
    }

    /// Activate the proxy and run its dispatch loop until the proxy closes
    /// or the control channel fails.
    async fn run_control_session(&self, conn: Conn, proxy: Arc<ProxyServer>) {
        if let Err(e) = proxy.start().await {
            warn!("activation failed: {}", e);
            reply(&conn, &CtlResponse::error(e.to_string())).await;
            conn.close().await;
            return;
        }
        if !reply(&conn, &CtlResponse::ok()).await {
            proxy.close().await;
            conn.close().await;
            return;
        }
        info!(
            "proxy [{}] control session established from {}",
            proxy.name(),
            conn.peer_addr()
        );

        let conn = Arc::new(conn);
        let watchdog = tokio::spawn(heartbeat::watch(
            Arc::clone(&conn),
            Arc::clone(&proxy),
            self.heartbeat_timeout,
        ));

        let work_request = CtlRequest::new(WORK_CONN, proxy.name(), proxy.passwd());
        loop {
            if proxy.wait_user_conn().await {
                info!("proxy [{}] shut down, ending control session", proxy.name());
                break;
            }
            if !reply(&conn, &work_request).await {
                warn!(
                    "proxy [{}] failed to write work request, closing",
                    proxy.name()
                );
                proxy.close().await;
                break;
            }
            debug!("proxy [{}] requested a new work connection", proxy.name());
        }

        watchdog.abort();
        conn.close().await;
    }
}

/// Serialize a record onto the control connection; a `false` return means
/// the session is not worth keeping.
pub(crate) async fn reply<T: Serialize>(conn: &Conn, msg: &T) -> bool {
    let line = match codec::encode(msg) {
        Ok(line) => line,
        Err(e) => {
            warn!("failed to encode control record: {}", e);
            return false;
        }
    };
    match conn.write_line(&line).await {
        Ok(()) => true,
        Err(e) => {
            warn!("failed to write control record: {}", e);
            false
        }
    }
}
