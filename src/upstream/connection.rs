//! Tracked upstream connections.
//!
//! # Responsibilities
//! - Wrap every pooled TCP connection with its peer address and creation time
//! - Know whether a connection is idle in the pool or carrying a request
//! - Let the pool manager close idle connections without touching in-flight ones
//!
//! # Design Decisions
//! - The wrapper sits between hyper's pool and the socket, so no pool
//!   internals are patched; hyper sees a retired connection as closed by peer
//! - Busy/idle is derived from writes: writing a request makes a connection
//!   busy, and the lease handed out with the response makes it idle again once
//!   the body is consumed, unless another request was written in between
//! - Retirement is a compare-and-swap from idle, so a connection that started
//!   a new request can never be retired underneath it

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::http::Uri;
use dashmap::DashMap;
use futures_util::future::BoxFuture;
use futures_util::task::AtomicWaker;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tower::Service;

use crate::upstream::BoxError;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const IDLE: u64 = 0b01;
const RETIRED: u64 = 0b10;
const SEQ_UNIT: u64 = 0b100;

/// First-class bookkeeping for one upstream connection.
#[derive(Debug)]
pub struct ConnectionMeta {
    id: u64,
    peer: SocketAddr,
    created_at: Instant,
    /// Write sequence in the high bits, `IDLE` and `RETIRED` flags in the low two.
    state: AtomicU64,
    read_waker: AtomicWaker,
}

impl ConnectionMeta {
    fn new(peer: SocketAddr) -> Self {
        Self {
            id: CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            peer,
            created_at: Instant::now(),
            // A fresh connection is dialed for a request, so it starts busy.
            state: AtomicU64::new(0),
            read_waker: AtomicWaker::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn is_idle(&self) -> bool {
        self.state.load(Ordering::Acquire) & (IDLE | RETIRED) == IDLE
    }

    pub fn is_retired(&self) -> bool {
        self.state.load(Ordering::Acquire) & RETIRED != 0
    }

    /// Mark the connection busy because request bytes are being written.
    /// Returns false if the connection was already retired.
    fn record_write(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & RETIRED != 0 {
                return false;
            }
            let next = (current & !IDLE).wrapping_add(SEQ_UNIT);
            match self.state.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn write_seq(&self) -> u64 {
        self.state.load(Ordering::Acquire) & !(IDLE | RETIRED)
    }

    /// Return to idle, but only if nothing was written since `seq` was observed.
    fn release(&self, seq: u64) -> bool {
        self.state
            .compare_exchange(seq, seq | IDLE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Retire the connection if it is currently idle.
    pub fn retire_if_idle(&self) -> bool {
        let current = self.state.load(Ordering::Acquire);
        if current & (IDLE | RETIRED) != IDLE {
            return false;
        }
        let retired = self
            .state
            .compare_exchange(current, current | RETIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if retired {
            self.read_waker.wake();
        }
        retired
    }
}

/// Attached to every response through `Connected::extra`, identifying the
/// connection that carried it.
#[derive(Debug, Clone)]
pub struct ConnectionLease(Arc<ConnectionMeta>);

impl ConnectionLease {
    /// Hold the connection as busy until the returned guard is dropped.
    pub fn acquire(&self) -> LeaseGuard {
        LeaseGuard {
            seq: self.0.write_seq(),
            meta: self.0.clone(),
        }
    }
}

/// Marks the carrying connection idle on drop.
#[derive(Debug)]
pub struct LeaseGuard {
    meta: Arc<ConnectionMeta>,
    seq: u64,
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        self.meta.release(self.seq);
    }
}

/// Summary counts for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionCounts {
    pub total: usize,
    pub idle: usize,
}

/// Live connections created by one pooled client.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<u64, Arc<ConnectionMeta>>>,
}

impl ConnectionRegistry {
    fn register(&self, io: TokioIo<TcpStream>, peer: SocketAddr) -> TrackedConnection {
        let meta = Arc::new(ConnectionMeta::new(peer));
        self.connections.insert(meta.id(), meta.clone());
        tracing::trace!(connection_id = meta.id(), peer = %peer, "Upstream connection opened");
        TrackedConnection {
            io,
            meta,
            registry: self.clone(),
        }
    }

    /// Retire every idle connection matching `predicate`. Returns how many
    /// were retired.
    pub fn retire_idle<F>(&self, predicate: F) -> usize
    where
        F: Fn(&ConnectionMeta) -> bool,
    {
        let candidates: Vec<Arc<ConnectionMeta>> = self
            .connections
            .iter()
            .filter(|entry| entry.value().is_idle() && predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();

        candidates.iter().filter(|meta| meta.retire_if_idle()).count()
    }

    pub fn counts(&self) -> ConnectionCounts {
        let mut counts = ConnectionCounts::default();
        for entry in self.connections.iter() {
            counts.total += 1;
            if entry.value().is_idle() {
                counts.idle += 1;
            }
        }
        counts
    }

    fn forget(&self, id: u64) {
        self.connections.remove(&id);
    }
}

/// A pooled upstream socket with its bookkeeping.
#[derive(Debug)]
pub struct TrackedConnection {
    io: TokioIo<TcpStream>,
    meta: Arc<ConnectionMeta>,
    registry: ConnectionRegistry,
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        self.registry.forget(self.meta.id());
        tracing::trace!(connection_id = self.meta.id(), "Upstream connection closed");
    }
}

impl Connection for TrackedConnection {
    fn connected(&self) -> Connected {
        self.io
            .inner()
            .connected()
            .extra(ConnectionLease(self.meta.clone()))
    }
}

impl Read for TrackedConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.meta.read_waker.register(cx.waker());
        if this.meta.is_retired() {
            // Reads as EOF; hyper drops the connection from its pool.
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl Write for TrackedConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.meta.record_write() {
            return Poll::Ready(Err(retired_error()));
        }
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !this.meta.record_write() {
            return Poll::Ready(Err(retired_error()));
        }
        Pin::new(&mut this.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

fn retired_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "upstream connection retired")
}

/// Connector that dials with hyper's `HttpConnector` and registers every
/// connection it opens.
#[derive(Debug, Clone)]
pub struct TrackedConnector {
    inner: HttpConnector,
    registry: ConnectionRegistry,
}

impl TrackedConnector {
    pub fn new(connect_timeout: Duration, registry: ConnectionRegistry) -> Self {
        let mut inner = HttpConnector::new();
        inner.set_connect_timeout(Some(connect_timeout));
        inner.set_nodelay(true);
        Self { inner, registry }
    }
}

impl Service<Uri> for TrackedConnector {
    type Response = TrackedConnection;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<TrackedConnection, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let connecting = self.inner.call(dst);
        let registry = self.registry.clone();
        Box::pin(async move {
            let io = connecting.await?;
            let peer = io.inner().peer_addr()?;
            Ok(registry.register(io, peer))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> Arc<ConnectionMeta> {
        Arc::new(ConnectionMeta::new("127.0.0.1:8545".parse().unwrap()))
    }

    #[test]
    fn test_new_connection_is_busy() {
        let meta = meta();
        assert!(!meta.is_idle());
        assert!(!meta.retire_if_idle());
    }

    #[test]
    fn test_lease_release_makes_idle() {
        let meta = meta();
        assert!(meta.record_write());
        let lease = ConnectionLease(meta.clone()).acquire();
        assert!(!meta.is_idle());
        drop(lease);
        assert!(meta.is_idle());
    }

    #[test]
    fn test_stale_lease_does_not_idle_reused_connection() {
        let meta = meta();
        meta.record_write();
        let first = ConnectionLease(meta.clone()).acquire();
        // Connection went back to hyper's pool and carried a second request
        // before the first lease was dropped.
        meta.record_write();
        drop(first);
        assert!(!meta.is_idle());

        let second = ConnectionLease(meta.clone()).acquire();
        drop(second);
        assert!(meta.is_idle());
    }

    #[test]
    fn test_retire_only_idle() {
        let meta = meta();
        meta.record_write();
        assert!(!meta.retire_if_idle());

        drop(ConnectionLease(meta.clone()).acquire());
        assert!(meta.retire_if_idle());
        assert!(meta.is_retired());
        assert!(!meta.is_idle());
        // Retired connections refuse new requests.
        assert!(!meta.record_write());
        assert!(!meta.retire_if_idle());
    }

    #[test]
    fn test_connection_ids_unique() {
        assert_ne!(meta().id(), meta().id());
    }
}
