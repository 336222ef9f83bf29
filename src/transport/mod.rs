// Transport abstraction
//
// The engine talks to the network through a narrow contract: fire one
// packet at an address, dial a reliable stream, and drain two inbound
// channels. The engine never assumes packets are delivered, ordered,
// unique, or unfragmented; streams are assumed reliable and ordered while
// open.

pub mod mem;
pub mod net;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;

/// One inbound datagram with its receive timestamp.
#[derive(Debug, Clone)]
pub struct Packet {
    pub buf: Bytes,
    pub from: SocketAddr,
    pub timestamp: Instant,
}

/// Reliable bidirectional byte stream.
pub trait MeshStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> MeshStream for T {}

/// An accepted inbound stream with its remote address.
pub type InboundStream = (Box<dyn MeshStream>, SocketAddr);

/// Contract every transport implements.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Best-effort unreliable send. Returns the instant the payload was
    /// handed to the socket, used for RTT accounting.
    async fn write_packet(&self, buf: &[u8], addr: SocketAddr) -> Result<Instant>;

    /// Open a reliable stream to the given address.
    async fn dial_stream(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Box<dyn MeshStream>>;

    /// Surrender the inbound packet channel. Yields `None` after the first
    /// call.
    fn take_packet_rx(&self) -> Option<ChannelRx<Packet>>;

    /// Surrender the inbound stream channel. Yields `None` after the first
    /// call.
    fn take_stream_rx(&self) -> Option<ChannelRx<InboundStream>>;

    /// The address peers should use to reach this transport.
    fn local_addr(&self) -> SocketAddr;

    /// Release sockets and wake every pending receive. Idempotent.
    async fn shutdown(&self) -> Result<()>;
}

/// Bounded inbound queue that sheds the oldest entry on overflow, so a
/// burst cannot wedge the dispatcher behind stale traffic. Dropped entries
/// are counted.
pub struct ChannelTx<T> {
    shared: Arc<ChannelShared<T>>,
}

pub struct ChannelRx<T> {
    shared: Arc<ChannelShared<T>>,
}

struct ChannelShared<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// Create a bounded drop-oldest channel.
pub fn bounded_channel<T>(capacity: usize) -> (ChannelTx<T>, ChannelRx<T>) {
    let shared = Arc::new(ChannelShared {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        capacity: capacity.max(1),
        dropped: AtomicU64::new(0),
        closed: AtomicBool::new(false),
    });
    (
        ChannelTx {
            shared: shared.clone(),
        },
        ChannelRx { shared },
    )
}

impl<T> ChannelTx<T> {
    /// Push an entry, evicting the oldest one when the queue is full.
    pub fn push(&self, value: T) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() == self.shared.capacity {
                queue.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(value);
        }
        self.shared.notify.notify_one();
    }

    /// Number of entries shed due to overflow.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Close the channel and wake any pending receiver.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }
}

impl<T> Clone for ChannelTx<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> ChannelRx<T> {
    /// Receive the next entry, waiting until one is available. Returns
    /// `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if let Some(value) = self.shared.queue.lock().pop_front() {
                return Some(value);
            }
            if self.shared.closed.load(Ordering::Acquire) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }
}
