//! Client control loop
//!
//! Registers the proxy over a long-lived control connection, emits
//! heartbeats on an interval, and opens a work tunnel for every work request
//! the server pushes down. There is no reconnect: when the control
//! connection dies this proxy is dead until the process restarts.

use std::sync::Arc;
use std::time::Duration;

use frp_connection::Conn;
use frp_proto::{codec, CtlMessage, CtlRequest, CtlResponse, CTL_CONN, HEARTBEAT_RES, WORK_CONN};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::proxy::ProxyClient;
use crate::ClientError;

/// Run one proxy's control session to completion.
pub async fn run_proxy(
    client: Arc<ProxyClient>,
    server_addr: String,
    server_port: u16,
    heartbeat_interval: Duration,
) -> Result<(), ClientError> {
    let conn = Arc::new(Conn::connect(&server_addr, server_port).await?);

    let register = CtlRequest::new(CTL_CONN, &client.name, &client.passwd);
    conn.write_line(&codec::encode(&register)?).await?;

    let response: CtlResponse = codec::decode(&conn.read_line().await?)?;
    if !response.is_ok() {
        conn.close().await;
        return Err(ClientError::Rejected {
            name: client.name.clone(),
            msg: response.msg,
        });
    }
    info!("proxy [{}] registered with server", client.name);

    let heartbeat = tokio::spawn(send_heartbeats(
        Arc::clone(&conn),
        client.name.clone(),
        heartbeat_interval,
    ));

    let result = loop {
        let line = match conn.read_line().await {
            Ok(line) => line,
            Err(e) => {
                error!("proxy [{}] control connection lost: {}", client.name, e);
                break Err(ClientError::Conn(e));
            }
        };
        match codec::decode::<CtlMessage>(&line) {
            Ok(CtlMessage::Request(req)) if req.msg_type == WORK_CONN => {
                debug!("proxy [{}] server requested a work connection", client.name);
                let client = Arc::clone(&client);
                let server_addr = server_addr.clone();
                tokio::spawn(async move {
                    if let Err(e) = client.start_tunnel(&server_addr, server_port).await {
                        error!("proxy [{}] failed to open tunnel: {}", client.name, e);
                    }
                });
            }
            Ok(CtlMessage::Request(req)) => {
                debug!(
                    "proxy [{}] ignoring request type [{}] from server",
                    client.name, req.msg_type
                );
            }
            Ok(CtlMessage::Response(res)) if res.code == HEARTBEAT_RES as i64 => {
                debug!("proxy [{}] heartbeat acknowledged", client.name);
            }
            Ok(CtlMessage::Response(res)) => {
                debug!(
                    "proxy [{}] unexpected response code [{}] from server",
                    client.name, res.code
                );
            }
            Err(e) => {
                warn!("proxy [{}] unparsable record from server: {}", client.name, e);
            }
        }
    };

    heartbeat.abort();
    conn.close().await;
    result
}

async fn send_heartbeats(conn: Arc<Conn>, name: String, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await; // the registration just proved liveness

    loop {
        ticker.tick().await;
        let line = match codec::encode(&CtlRequest::heartbeat(&name)) {
            Ok(line) => line,
            Err(e) => {
                warn!("proxy [{}] failed to encode heartbeat: {}", name, e);
                continue;
            }
        };
        if let Err(e) = conn.write_line(&line).await {
            warn!("proxy [{}] failed to send heartbeat: {}", name, e);
            break;
        }
        debug!("proxy [{}] heartbeat sent", name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frp_connection::Listener;
    use frp_proto::{CTL_CONN, HEARTBEAT_REQ};
    use tokio::time::timeout;

    fn client(local_port: u16) -> Arc<ProxyClient> {
        Arc::new(ProxyClient {
            name: "web".to_string(),
            passwd: "s3cret".to_string(),
            local_port,
        })
    }

    #[tokio::test]
    async fn test_run_proxy_registers_and_errors_on_rejection() {
        let relay = Listener::bind("127.0.0.1", 0).unwrap();
        let port = relay.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let conn = relay.accept().await.unwrap();
            let req: CtlRequest = codec::decode(&conn.read_line().await.unwrap()).unwrap();
            assert_eq!(req.msg_type, CTL_CONN);
            assert_eq!(req.proxy_name, "web");
            conn.write_line(&codec::encode(&CtlResponse::error("no such proxy")).unwrap())
                .await
                .unwrap();
        });

        let err = run_proxy(client(1), "127.0.0.1".to_string(), port, Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Rejected { .. }));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_work_request_opens_work_connection() {
        // local echo service
        let service = Listener::bind("127.0.0.1", 0).unwrap();
        let local_port = service.local_addr().unwrap().port();
        tokio::spawn(async move {
            let conn = service.accept().await.unwrap();
            let line = conn.read_line().await.unwrap();
            conn.write_line(&line).await.unwrap();
        });

        let relay = Listener::bind("127.0.0.1", 0).unwrap();
        let port = relay.local_addr().unwrap().port();

        let proxy = client(local_port);
        tokio::spawn(run_proxy(
            proxy,
            "127.0.0.1".to_string(),
            port,
            Duration::from_secs(60),
        ));

        let ctl = relay.accept().await.unwrap();
        let _register: CtlRequest = codec::decode(&ctl.read_line().await.unwrap()).unwrap();
        ctl.write_line(&codec::encode(&CtlResponse::ok()).unwrap())
            .await
            .unwrap();

        // push a work request; the client must dial back and identify itself
        ctl.write_line(&codec::encode(&CtlRequest::new(WORK_CONN, "web", "s3cret")).unwrap())
            .await
            .unwrap();

        let work = timeout(Duration::from_secs(1), relay.accept())
            .await
            .unwrap()
            .unwrap();
        let handshake: CtlRequest = codec::decode(&work.read_line().await.unwrap()).unwrap();
        assert_eq!(handshake.msg_type, WORK_CONN);
        assert_eq!(handshake.proxy_name, "web");

        // the tunnel behind it reaches the local echo service
        work.write_line("through the tunnel").await.unwrap();
        assert_eq!(work.read_line().await.unwrap(), "through the tunnel");
    }

    #[tokio::test]
    async fn test_heartbeats_are_emitted() {
        let relay = Listener::bind("127.0.0.1", 0).unwrap();
        let port = relay.local_addr().unwrap().port();

        tokio::spawn(run_proxy(
            client(1),
            "127.0.0.1".to_string(),
            port,
            Duration::from_millis(50),
        ));

        let ctl = relay.accept().await.unwrap();
        let _register = ctl.read_line().await.unwrap();
        ctl.write_line(&codec::encode(&CtlResponse::ok()).unwrap())
            .await
            .unwrap();

        let line = timeout(Duration::from_secs(1), ctl.read_line())
            .await
            .unwrap()
            .unwrap();
        let req: CtlRequest = codec::decode(&line).unwrap();
        assert_eq!(req.msg_type, HEARTBEAT_REQ);
        assert_eq!(req.proxy_name, "web");
    }
}
