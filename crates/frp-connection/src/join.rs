//! Bidirectional byte pump

use std::io;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use crate::Conn;

/// Splice two connections together, copying bytes in both directions until
/// each side reaches EOF or errors, then close both. Bytes a connection read
/// ahead of its last handshake line are forwarded first.
///
/// Returns the byte counts copied `a -> b` and `b -> a`.
pub async fn join(a: Conn, b: Conn) -> (u64, u64) {
    let a_peer = a.peer_addr();
    let b_peer = b.peer_addr();

    let (a_pending, mut a_read, mut a_write) = a.into_split();
    let (b_pending, mut b_read, mut b_write) = b.into_split();

    let (forward, backward) = tokio::join!(
        pump(a_pending, &mut a_read, &mut b_write),
        pump(b_pending, &mut b_read, &mut a_write),
    );

    debug!(
        "tunnel {} <-> {} closed, {} bytes forward, {} bytes backward",
        a_peer, b_peer, forward, backward
    );
    (forward, backward)
}

async fn pump(
    pending: Vec<u8>,
    src: &mut BufReader<OwnedReadHalf>,
    dst: &mut OwnedWriteHalf,
) -> u64 {
    let copied: io::Result<u64> = async {
        if !pending.is_empty() {
            dst.write_all(&pending).await?;
        }
        tokio::io::copy(src, dst).await
    }
    .await;

    // Propagate EOF so the far side unblocks even if the reverse direction
    // is still open.
    let _ = dst.shutdown().await;

    match copied {
        Ok(n) => pending.len() as u64 + n,
        Err(e) => {
            debug!("pump finished early: {}", e);
            pending.len() as u64
        }
    }
}
