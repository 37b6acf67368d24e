//! Per-proxy public listener and pairing queue

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use frp_connection::{join, Conn, ConnError, Listener};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProxyDefinition;

/// Most user connections that may wait unpaired. When the queue is full the
/// oldest waiter is dropped, so a flood of abandoned connections cannot pin
/// memory or starve fresh users.
pub const USER_QUEUE_LIMIT: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    Idle,
    Working,
    Closed,
}

/// Errors surfaced to the client on the activation response.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("ProxyName [{0}], already in use")]
    AlreadyInUse(String),

    #[error("ProxyName [{0}], proxy is closed")]
    Closed(String),

    #[error("ProxyName [{name}], bind {addr}:{port} error: {source}")]
    Bind {
        name: String,
        addr: String,
        port: u16,
        #[source]
        source: ConnError,
    },
}

struct Inner {
    status: ProxyStatus,
    listen_addr: Option<SocketAddr>,
    user_queue: VecDeque<Conn>,
    acceptor: Option<JoinHandle<()>>,
}

/// State the acceptor task mutates concurrently with the control session.
struct Shared {
    name: String,
    inner: Mutex<Inner>,
    ready_tx: mpsc::Sender<()>,
}

impl Shared {
    async fn push_user_conn(&self, conn: Conn) {
        let (rejected, evicted) = {
            let mut inner = self.inner.lock().await;
            if inner.status != ProxyStatus::Working {
                (Some(conn), None)
            } else if inner.user_queue.len() >= USER_QUEUE_LIMIT {
                let evicted = inner.user_queue.pop_front();
                inner.user_queue.push_back(conn);
                (None, evicted)
            } else {
                inner.user_queue.push_back(conn);
                (None, None)
            }
        };

        if let Some(conn) = rejected {
            conn.close().await;
            return;
        }
        if let Some(old) = evicted {
            warn!(
                "proxy [{}] user queue full, dropping oldest waiter from {}",
                self.name,
                old.peer_addr()
            );
            old.close().await;
            // the evicted waiter's unconsumed ready signal now stands for
            // the connection that replaced it
            return;
        }
        let _ = self.ready_tx.send(()).await;
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    debug!(
                        "proxy [{}] accepted user connection from {}",
                        self.name,
                        conn.peer_addr()
                    );
                    self.push_user_conn(conn).await;
                }
                Err(e) => {
                    warn!("proxy [{}] accept error: {}", self.name, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// One public proxy on the relay.
///
/// Created `Idle` at startup. The first authenticated control connection
/// activates it (`Idle -> Working`, public listener bound); any failure of
/// that control session closes it for good (`Working -> Closed`). While
/// working, accepted user connections queue here until a matching work
/// connection dequeues them.
pub struct ProxyServer {
    def: ProxyDefinition,
    shared: Arc<Shared>,
    ready_rx: Mutex<mpsc::Receiver<()>>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Mutex<mpsc::Receiver<()>>,
}

impl ProxyServer {
    pub fn new(def: ProxyDefinition) -> Arc<Self> {
        // One ready permit per possible queue entry: signals are counted,
        // never coalesced, so no enqueued user can be missed.
        let (ready_tx, ready_rx) = mpsc::channel(USER_QUEUE_LIMIT);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let shared = Arc::new(Shared {
            name: def.name.clone(),
            inner: Mutex::new(Inner {
                status: ProxyStatus::Idle,
                listen_addr: None,
                user_queue: VecDeque::new(),
                acceptor: None,
            }),
            ready_tx,
        });
        Arc::new(Self {
            def,
            shared,
            ready_rx: Mutex::new(ready_rx),
            shutdown_tx,
            shutdown_rx: Mutex::new(shutdown_rx),
        })
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn authenticate(&self, passwd: &str) -> bool {
        self.def.passwd == passwd
    }

    pub(crate) fn passwd(&self) -> &str {
        &self.def.passwd
    }

    pub async fn status(&self) -> ProxyStatus {
        self.shared.inner.lock().await.status
    }

    /// Address the public listener is bound to, while `Working`.
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.shared.inner.lock().await.listen_addr
    }

    /// Bind the public listener and start accepting user connections.
    /// Fails without side effects unless the proxy is `Idle`.
    pub async fn start(&self) -> Result<(), ProxyError> {
        let mut inner = self.shared.inner.lock().await;
        match inner.status {
            ProxyStatus::Working => return Err(ProxyError::AlreadyInUse(self.def.name.clone())),
            ProxyStatus::Closed => return Err(ProxyError::Closed(self.def.name.clone())),
            ProxyStatus::Idle => {}
        }

        let listener =
            Listener::bind(&self.def.bind_addr, self.def.bind_port).map_err(|source| {
                ProxyError::Bind {
                    name: self.def.name.clone(),
                    addr: self.def.bind_addr.clone(),
                    port: self.def.bind_port,
                    source,
                }
            })?;
        let listen_addr = listener.local_addr().ok();

        inner.status = ProxyStatus::Working;
        inner.listen_addr = listen_addr;
        inner.acceptor = Some(tokio::spawn(
            Arc::clone(&self.shared).accept_loop(listener),
        ));

        info!(
            "proxy [{}] listening on {}",
            self.def.name,
            listen_addr
                .map(|a| a.to_string())
                .unwrap_or_else(|| format!("{}:{}", self.def.bind_addr, self.def.bind_port))
        );
        Ok(())
    }

    /// Block until a user connection is waiting or the proxy shuts down.
    /// Returns `true` on shutdown. Must be called from exactly one consumer,
    /// the proxy's control session.
    pub async fn wait_user_conn(&self) -> bool {
        let mut ready = self.ready_rx.lock().await;
        let mut shutdown = self.shutdown_rx.lock().await;
        tokio::select! {
            biased;
            _ = shutdown.recv() => true,
            _ = ready.recv() => false,
        }
    }

    /// Pair an authenticated work connection with the oldest waiting user
    /// connection and hand both to the byte pump. A work connection arriving
    /// with nothing queued is a client protocol violation and is dropped.
    pub async fn get_new_cli_conn(&self, work_conn: Conn) {
        let user_conn = { self.shared.inner.lock().await.user_queue.pop_front() };
        match user_conn {
            Some(user_conn) => {
                debug!(
                    "proxy [{}] pairing user {} with work connection {}",
                    self.def.name,
                    user_conn.peer_addr(),
                    work_conn.peer_addr()
                );
                tokio::spawn(join(user_conn, work_conn));
            }
            None => {
                warn!(
                    "proxy [{}] work connection from {} with no user waiting, dropping",
                    self.def.name,
                    work_conn.peer_addr()
                );
                work_conn.close().await;
            }
        }
    }

    /// Tear the proxy down: stop the listener, drop every queued user
    /// connection, and wake the control session with the shutdown signal.
    /// Idempotent; `Closed` is terminal.
    pub async fn close(&self) {
        let (drained, acceptor) = {
            let mut inner = self.shared.inner.lock().await;
            if inner.status == ProxyStatus::Closed {
                return;
            }
            inner.status = ProxyStatus::Closed;
            inner.listen_addr = None;
            (
                inner.user_queue.drain(..).collect::<Vec<_>>(),
                inner.acceptor.take(),
            )
        };

        if let Some(handle) = acceptor {
            handle.abort();
        }
        for conn in drained {
            conn.close().await;
        }
        // the status guard above makes this first-close-only
        let _ = self.shutdown_tx.try_send(());
        info!("proxy [{}] closed", self.def.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn definition() -> ProxyDefinition {
        ProxyDefinition {
            name: "web".to_string(),
            passwd: "s3cret".to_string(),
            bind_addr: "127.0.0.1".to_string(),
            bind_port: 0,
        }
    }

    async fn conn_pair() -> (Conn, Conn) {
        let listener = Listener::bind("127.0.0.1", 0).unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted, dialed) = tokio::join!(
            listener.accept(),
            Conn::connect("127.0.0.1", addr.port())
        );
        (accepted.unwrap(), dialed.unwrap())
    }

    #[tokio::test]
    async fn test_start_transitions_to_working() {
        let proxy = ProxyServer::new(definition());
        assert_eq!(proxy.status().await, ProxyStatus::Idle);
        assert!(proxy.listen_addr().await.is_none());

        proxy.start().await.unwrap();
        assert_eq!(proxy.status().await, ProxyStatus::Working);
        assert!(proxy.listen_addr().await.is_some());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let proxy = ProxyServer::new(definition());
        proxy.start().await.unwrap();
        let err = proxy.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::AlreadyInUse(_)));
        assert_eq!(proxy.status().await, ProxyStatus::Working);
    }

    #[tokio::test]
    async fn test_closed_is_terminal() {
        let proxy = ProxyServer::new(definition());
        proxy.start().await.unwrap();
        proxy.close().await;
        proxy.close().await;
        assert_eq!(proxy.status().await, ProxyStatus::Closed);

        let err = proxy.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Closed(_)));
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_idle() {
        let proxy = ProxyServer::new(ProxyDefinition {
            bind_addr: "not-an-ip".to_string(),
            ..definition()
        });
        let err = proxy.start().await.unwrap_err();
        assert!(matches!(err, ProxyError::Bind { .. }));
        assert_eq!(proxy.status().await, ProxyStatus::Idle);
    }

    #[tokio::test]
    async fn test_user_conn_signals_ready() {
        let proxy = ProxyServer::new(definition());
        proxy.start().await.unwrap();
        let addr = proxy.listen_addr().await.unwrap();

        let _user = Conn::connect("127.0.0.1", addr.port()).await.unwrap();
        let shutdown = timeout(Duration::from_secs(1), proxy.wait_user_conn())
            .await
            .unwrap();
        assert!(!shutdown);
    }

    #[tokio::test]
    async fn test_pairing_is_fifo() {
        let proxy = ProxyServer::new(definition());
        proxy.start().await.unwrap();
        let addr = proxy.listen_addr().await.unwrap();

        let user1 = Conn::connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(!proxy.wait_user_conn().await);
        let user2 = Conn::connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(!proxy.wait_user_conn().await);

        let (work1_far, work1_near) = conn_pair().await;
        proxy.get_new_cli_conn(work1_near).await;
        user1.write_line("first").await.unwrap();
        assert_eq!(work1_far.read_line().await.unwrap(), "first");

        let (work2_far, work2_near) = conn_pair().await;
        proxy.get_new_cli_conn(work2_near).await;
        user2.write_line("second").await.unwrap();
        assert_eq!(work2_far.read_line().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_work_conn_dropped_when_queue_empty() {
        let proxy = ProxyServer::new(definition());
        proxy.start().await.unwrap();

        let (work_far, work_near) = conn_pair().await;
        proxy.get_new_cli_conn(work_near).await;

        let res = timeout(Duration::from_secs(1), work_far.read_line())
            .await
            .unwrap();
        assert!(matches!(res, Err(ConnError::Closed)));
    }

    #[tokio::test]
    async fn test_close_drains_queued_users() {
        let proxy = ProxyServer::new(definition());
        proxy.start().await.unwrap();
        let addr = proxy.listen_addr().await.unwrap();

        let user = Conn::connect("127.0.0.1", addr.port()).await.unwrap();
        assert!(!proxy.wait_user_conn().await);

        proxy.close().await;
        let res = timeout(Duration::from_secs(1), user.read_line())
            .await
            .unwrap();
        assert!(matches!(res, Err(ConnError::Closed)));
    }

    #[tokio::test]
    async fn test_close_wakes_waiter_with_shutdown() {
        let proxy = ProxyServer::new(definition());
        proxy.start().await.unwrap();

        let waiter = {
            let proxy = Arc::clone(&proxy);
            tokio::spawn(async move { proxy.wait_user_conn().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        proxy.close().await;
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_stops_accepting() {
        let proxy = ProxyServer::new(definition());
        proxy.start().await.unwrap();
        let addr = proxy.listen_addr().await.unwrap();

        proxy.close().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // either refused outright, or accepted by the dying backlog and
        // immediately dropped
        match Conn::connect("127.0.0.1", addr.port()).await {
            Err(_) => {}
            Ok(conn) => {
                let res = timeout(Duration::from_secs(1), conn.read_line())
                    .await
                    .unwrap();
                assert!(matches!(res, Err(ConnError::Closed)));
            }
        }
    }

    #[tokio::test]
    async fn test_queue_overflow_drops_oldest() {
        let proxy = ProxyServer::new(definition());
        proxy.start().await.unwrap();
        let addr = proxy.listen_addr().await.unwrap();

        let oldest = Conn::connect("127.0.0.1", addr.port()).await.unwrap();
        let mut keep = Vec::new();
        for _ in 0..USER_QUEUE_LIMIT {
            keep.push(Conn::connect("127.0.0.1", addr.port()).await.unwrap());
        }

        let res = timeout(Duration::from_secs(2), oldest.read_line())
            .await
            .expect("oldest waiter should be dropped once the queue overflows");
        assert!(matches!(res, Err(ConnError::Closed)));
    }
}
