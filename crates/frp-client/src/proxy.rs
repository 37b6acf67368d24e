//! Work-tunnel opener

use frp_connection::{join, Conn};
use frp_proto::{codec, CtlRequest, WORK_CONN};
use tracing::{debug, error};

use crate::config::ClientProxy;
use crate::ClientError;

/// One proxy on the client host: knows its name, its shared secret, and the
/// local service port the relay's users should reach.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    pub name: String,
    pub passwd: String,
    pub local_port: u16,
}

impl From<ClientProxy> for ProxyClient {
    fn from(p: ClientProxy) -> Self {
        Self {
            name: p.name,
            passwd: p.passwd,
            local_port: p.local_port,
        }
    }
}

impl ProxyClient {
    /// Dial the local service this proxy fronts.
    pub async fn get_local_conn(&self) -> Result<Conn, ClientError> {
        Conn::connect("127.0.0.1", self.local_port).await.map_err(|e| {
            error!(
                "proxy [{}] failed to connect to local port {}: {}",
                self.name, self.local_port, e
            );
            ClientError::Conn(e)
        })
    }

    /// Dial the relay and identify the socket as a work connection.
    pub async fn get_remote_conn(&self, addr: &str, port: u16) -> Result<Conn, ClientError> {
        let conn = Conn::connect(addr, port).await.map_err(|e| {
            error!(
                "proxy [{}] failed to connect to server {}:{}: {}",
                self.name, addr, port, e
            );
            ClientError::Conn(e)
        })?;

        let handshake = CtlRequest::new(WORK_CONN, &self.name, &self.passwd);
        let result = async {
            let line = codec::encode(&handshake)?;
            conn.write_line(&line).await?;
            Ok::<(), ClientError>(())
        }
        .await;
        if let Err(e) = result {
            conn.close().await;
            return Err(e);
        }
        Ok(conn)
    }

    /// Open one tunnel: local service on one side, a fresh work connection
    /// to the relay on the other, byte pump in between.
    pub async fn start_tunnel(&self, server_addr: &str, server_port: u16) -> Result<(), ClientError> {
        let local_conn = self.get_local_conn().await?;
        let remote_conn = match self.get_remote_conn(server_addr, server_port).await {
            Ok(conn) => conn,
            Err(e) => {
                local_conn.close().await;
                return Err(e);
            }
        };

        debug!(
            "proxy [{}] tunnel open, local {} <-> remote {}",
            self.name,
            local_conn.peer_addr(),
            remote_conn.peer_addr()
        );
        tokio::spawn(join(local_conn, remote_conn));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frp_connection::Listener;
    use std::time::Duration;
    use tokio::time::timeout;

    fn client(local_port: u16) -> ProxyClient {
        ProxyClient {
            name: "web".to_string(),
            passwd: "s3cret".to_string(),
            local_port,
        }
    }

    #[tokio::test]
    async fn test_get_remote_conn_sends_work_handshake() {
        let relay = Listener::bind("127.0.0.1", 0).unwrap();
        let port = relay.local_addr().unwrap().port();

        let c = client(1);
        let (accepted, dialed) = tokio::join!(
            relay.accept(),
            c.get_remote_conn("127.0.0.1", port)
        );
        let relay_side = accepted.unwrap();
        dialed.unwrap();

        let line = relay_side.read_line().await.unwrap();
        let req: CtlRequest = codec::decode(&line).unwrap();
        assert_eq!(req.msg_type, WORK_CONN);
        assert_eq!(req.proxy_name, "web");
        assert_eq!(req.passwd, "s3cret");
    }

    #[tokio::test]
    async fn test_start_tunnel_bridges_local_service() {
        // local service answers one line in uppercase
        let service = Listener::bind("127.0.0.1", 0).unwrap();
        let local_port = service.local_addr().unwrap().port();
        tokio::spawn(async move {
            let conn = service.accept().await.unwrap();
            let line = conn.read_line().await.unwrap();
            conn.write_line(&line.to_uppercase()).await.unwrap();
        });

        let relay = Listener::bind("127.0.0.1", 0).unwrap();
        let relay_port = relay.local_addr().unwrap().port();

        client(local_port)
            .start_tunnel("127.0.0.1", relay_port)
            .await
            .unwrap();

        let work = timeout(Duration::from_secs(1), relay.accept())
            .await
            .unwrap()
            .unwrap();
        let handshake: CtlRequest = codec::decode(&work.read_line().await.unwrap()).unwrap();
        assert_eq!(handshake.msg_type, WORK_CONN);

        work.write_line("ping").await.unwrap();
        assert_eq!(work.read_line().await.unwrap(), "PING");
    }

    #[tokio::test]
    async fn test_start_tunnel_fails_without_local_service() {
        // nothing is listening on the reserved port once the holder drops
        let holder = Listener::bind("127.0.0.1", 0).unwrap();
        let dead_port = holder.local_addr().unwrap().port();
        drop(holder);

        let relay = Listener::bind("127.0.0.1", 0).unwrap();
        let relay_port = relay.local_addr().unwrap().port();

        let res = client(dead_port).start_tunnel("127.0.0.1", relay_port).await;
        assert!(res.is_err());
    }
}
