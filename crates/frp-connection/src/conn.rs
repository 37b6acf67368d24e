//! Line-oriented TCP connection and listener

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::ConnError;

/// Read half plus any bytes of a line consumed before the caller was
/// cancelled. Keeping the partial line here (rather than on the stack of
/// `read_line`) makes `read_line` safe to race against a timeout.
struct LineReader {
    reader: BufReader<OwnedReadHalf>,
    partial: Vec<u8>,
}

/// A bidirectional TCP connection with line-oriented reads and writes.
///
/// The halves are independently locked so one task can write records while
/// another blocks reading. `close` only shuts down the write direction; the
/// socket itself is released when the `Conn` is dropped.
pub struct Conn {
    reader: Mutex<LineReader>,
    writer: Mutex<OwnedWriteHalf>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    closed: AtomicBool,
}

impl Conn {
    pub fn from_stream(stream: TcpStream) -> Result<Self, ConnError> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: Mutex::new(LineReader {
                reader: BufReader::new(read_half),
                partial: Vec::new(),
            }),
            writer: Mutex::new(write_half),
            local_addr,
            peer_addr,
            closed: AtomicBool::new(false),
        })
    }

    /// Dial a remote host. `host` may be a hostname or an IP literal.
    pub async fn connect(host: &str, port: u16) -> Result<Self, ConnError> {
        let stream = TcpStream::connect((host, port)).await?;
        Self::from_stream(stream)
    }

    /// Read one line, without its terminator. EOF yields [`ConnError::Closed`]
    /// and marks the connection closed.
    ///
    /// Cancellation-safe: a line partially received when the future is
    /// dropped is completed by the next call.
    pub async fn read_line(&self) -> Result<String, ConnError> {
        let mut guard = self.reader.lock().await;
        let rd = &mut *guard;
        loop {
            // fill_buf is the only await; everything after it runs in the
            // same poll, so a cancelled call never loses consumed bytes.
            let (consumed, line_complete) = {
                let buf = rd.reader.fill_buf().await?;
                if buf.is_empty() {
                    self.closed.store(true, Ordering::SeqCst);
                    return Err(ConnError::Closed);
                }
                match buf.iter().position(|&b| b == b'\n') {
                    Some(pos) => {
                        rd.partial.extend_from_slice(&buf[..pos]);
                        (pos + 1, true)
                    }
                    None => {
                        rd.partial.extend_from_slice(buf);
                        (buf.len(), false)
                    }
                }
            };
            rd.reader.consume(consumed);
            if line_complete {
                if rd.partial.last() == Some(&b'\r') {
                    rd.partial.pop();
                }
                let raw = std::mem::take(&mut rd.partial);
                return String::from_utf8(raw).map_err(|e| {
                    ConnError::Io(io::Error::new(io::ErrorKind::InvalidData, e))
                });
            }
        }
    }

    /// Write one line, appending the terminator if the caller left it off.
    pub async fn write_line(&self, line: &str) -> Result<(), ConnError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        Ok(())
    }

    /// Shut down the write direction. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn into_split(self) -> (Vec<u8>, BufReader<OwnedReadHalf>, OwnedWriteHalf) {
        let LineReader { reader, partial } = self.reader.into_inner();
        (partial, reader, self.writer.into_inner())
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// TCP listener yielding [`Conn`]s.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Bind with `SO_REUSEADDR` so a restart is not blocked by sockets in
    /// TIME_WAIT.
    pub fn bind(addr: &str, port: u16) -> Result<Self, ConnError> {
        let ip: IpAddr = addr.parse()?;
        let sock_addr = SocketAddr::new(ip, port);

        let socket = Socket::new(Domain::for_address(sock_addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&sock_addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;

        let std_listener: std::net::TcpListener = socket.into();
        Ok(Self {
            inner: TcpListener::from_std(std_listener)?,
        })
    }

    pub async fn accept(&self) -> Result<Conn, ConnError> {
        let (stream, _) = self.inner.accept().await?;
        Conn::from_stream(stream)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ConnError> {
        Ok(self.inner.local_addr()?)
    }
}
