//! Non-blocking TCP connections with bounded waits.
//!
//! Sockets are created through `socket2` in non-blocking mode and handed to the tokio reactor
//! for readiness waits. Each [`Connection`] is released exactly once, either by an explicit
//! [`Connection::close`] or when it is dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::trace;

use crate::error::ProbeError;

/// Size of each read while draining a response.
const READ_CHUNK: usize = 2048;

/// Draining stops once this much has been buffered, so a peer that keeps streaming cannot hold
/// a worker forever.
pub const MAX_RESPONSE_LEN: usize = 2 * 1024 * 1024;

/// Counts of socket handles opened and closed through a [`Connector`].
#[derive(Clone, Debug, Default)]
pub struct ConnectionStats {
    opened: Arc<AtomicU64>,
    closed: Arc<AtomicU64>,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::SeqCst)
    }

    /// Handles currently open.
    pub fn open_now(&self) -> u64 {
        self.opened().saturating_sub(self.closed())
    }
}

/// Opens connections with a fixed per-operation timeout.
#[derive(Clone, Debug)]
pub struct Connector {
    timeout: Duration,
    stats: ConnectionStats,
}

impl Connector {
    pub fn new(timeout: Duration) -> Self {
        Self::with_stats(timeout, ConnectionStats::new())
    }

    pub fn with_stats(timeout: Duration, stats: ConnectionStats) -> Self {
        Self { timeout, stats }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Resolve `host:port` and connect to the first address it yields.
    pub async fn connect(&self, host: &str, port: u16) -> Result<Connection, ProbeError> {
        let addr = self.resolve(host, port).await?;
        self.connect_addr(addr).await
    }

    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, ProbeError> {
        let resolve_err = |source: io::Error| ProbeError::Resolve {
            host: host.to_owned(),
            source,
        };

        let mut addrs = time::timeout(self.timeout, tokio::net::lookup_host((host, port)))
            .await
            .map_err(|_| ProbeError::Timeout(self.timeout))?
            .map_err(resolve_err)?;

        addrs
            .next()
            .ok_or_else(|| resolve_err(io::Error::new(io::ErrorKind::NotFound, "no addresses found")))
    }

    /// Connect to an already resolved address.
    ///
    /// A connect that completes immediately is returned as is. One still in progress is waited
    /// on for writability, bounded by the timeout, and then checked for a pending socket error.
    pub async fn connect_addr(&self, addr: SocketAddr) -> Result<Connection, ProbeError> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(ProbeError::Connect)?;
        socket.set_nonblocking(true).map_err(ProbeError::Connect)?;

        let in_progress = match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => false,
            Err(e) if is_in_progress(&e) => true,
            Err(e) => return Err(ProbeError::Connect(e)),
        };

        let stream = TcpStream::from_std(socket.into()).map_err(ProbeError::Connect)?;
        let conn = Connection::new(stream, self.stats.clone());

        if in_progress {
            trace!(%addr, "connect in progress, waiting for writability");
            let stream = conn.stream().map_err(ProbeError::Connect)?;
            time::timeout(self.timeout, stream.writable())
                .await
                .map_err(|_| ProbeError::Timeout(self.timeout))?
                .map_err(ProbeError::Connect)?;
            if let Some(e) = stream.take_error().map_err(ProbeError::Connect)? {
                return Err(ProbeError::Connect(e));
            }
        }

        Ok(conn)
    }
}

fn is_in_progress(err: &io::Error) -> bool {
    #[cfg(unix)]
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }
    err.kind() == io::ErrorKind::WouldBlock
}

/// An exclusively owned, connected TCP stream.
#[derive(Debug)]
pub struct Connection {
    stream: Option<TcpStream>,
    stats: ConnectionStats,
}

impl Connection {
    fn new(stream: TcpStream, stats: ConnectionStats) -> Self {
        stats.opened.fetch_add(1, Ordering::SeqCst);
        Self {
            stream: Some(stream),
            stats,
        }
    }

    fn stream(&self) -> io::Result<&TcpStream> {
        self.stream
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    }

    fn stream_mut(&mut self) -> io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    }

    /// Write all of `bytes`. A partial write is never reported as success.
    pub async fn send_all(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), ProbeError> {
        let stream = self.stream_mut().map_err(ProbeError::Send)?;
        time::timeout(timeout, stream.write_all(bytes))
            .await
            .map_err(|_| ProbeError::Timeout(timeout))?
            .map_err(ProbeError::Send)
    }

    /// Read until the peer closes, a wait of `timeout` passes with nothing to read, or an I/O
    /// error occurs. Only the last one is an error.
    pub async fn drain_until_close(&mut self, timeout: Duration) -> Result<Vec<u8>, ProbeError> {
        self.drain_until(timeout, |_| false).await
    }

    /// Like [`Connection::drain_until_close`], but also stops as soon as `done` holds for the
    /// bytes received so far.
    pub async fn drain_until<F>(&mut self, timeout: Duration, done: F) -> Result<Vec<u8>, ProbeError>
    where
        F: Fn(&[u8]) -> bool,
    {
        let stream = self.stream_mut().map_err(ProbeError::Read)?;
        let mut buf = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            match time::timeout(timeout, stream.read(&mut chunk)).await {
                Err(_) => {
                    trace!(received = buf.len(), "read wait elapsed, treating as end of data");
                    break;
                }
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if done(&buf) || buf.len() >= MAX_RESPONSE_LEN {
                        break;
                    }
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(ProbeError::Read(e)),
            }
        }

        Ok(buf)
    }

    /// Release the socket. Calling this more than once is a no-op.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn close_is_idempotent_and_counted_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = Connector::new(Duration::from_secs(2));

        let mut conn = connector.connect_addr(addr).await.unwrap();
        assert_eq!(connector.stats().opened(), 1);
        conn.close();
        conn.close();
        assert_eq!(connector.stats().closed(), 1);
        drop(conn);
        assert_eq!(connector.stats().closed(), 1);
        assert_eq!(connector.stats().open_now(), 0);
    }

    #[tokio::test]
    async fn operations_after_close_fail_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connector = Connector::new(Duration::from_secs(2));

        let mut conn = connector.connect_addr(addr).await.unwrap();
        conn.close();
        assert!(matches!(
            conn.send_all(b"x", Duration::from_secs(1)).await,
            Err(ProbeError::Send(_))
        ));
        assert!(matches!(
            conn.drain_until_close(Duration::from_secs(1)).await,
            Err(ProbeError::Read(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let connector = Connector::new(Duration::from_secs(2));

        let err = connector.connect_addr(addr).await.unwrap_err();
        assert!(matches!(err, ProbeError::Connect(_)), "got {err:?}");
        assert_eq!(connector.stats().open_now(), 0);
    }

    #[tokio::test]
    async fn drain_reads_until_peer_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"hello ").await.unwrap();
            sock.write_all(b"world").await.unwrap();
        });

        let connector = Connector::new(Duration::from_secs(2));
        let mut conn = connector.connect_addr(addr).await.unwrap();
        server.await.unwrap();
        let data = conn.drain_until_close(Duration::from_secs(2)).await.unwrap();
        assert_eq!(data, b"hello world");
    }

    #[tokio::test]
    async fn endless_stream_stops_at_read_cap() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            // Announces a frame far larger than the cap, then never completes it.
            let _ = sock.write_all(&[0xFF, 0xFF, 0xFF, 0x7F]).await;
            let filler = vec![0u8; 64 * 1024];
            while sock.write_all(&filler).await.is_ok() {}
        });

        let connector = Connector::new(Duration::from_secs(2));
        let mut conn = connector.connect_addr(addr).await.unwrap();
        let data = time::timeout(
            Duration::from_secs(10),
            conn.drain_until(Duration::from_secs(2), crate::protocol::is_complete_frame),
        )
        .await
        .expect("drain should stop at the cap")
        .unwrap();

        assert!(data.len() >= MAX_RESPONSE_LEN);
        assert!(data.len() < MAX_RESPONSE_LEN + READ_CHUNK);
        assert!(!crate::protocol::is_complete_frame(&data));
    }

    #[tokio::test]
    async fn silent_peer_ends_drain_after_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let connector = Connector::new(Duration::from_millis(150));
        let mut conn = connector.connect_addr(addr).await.unwrap();
        let started = time::Instant::now();
        let data = conn.drain_until_close(Duration::from_millis(150)).await.unwrap();
        assert!(data.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(140));
        drop(listener);
    }
}
