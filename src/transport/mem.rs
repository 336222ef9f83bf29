// In-memory transport for tests
//
// A process-local switchboard connecting any number of transports by
// synthetic socket address. Packets hop through the hub without touching
// the network; streams are duplex pipes. Individual links can be severed to
// simulate loss and partitions.

use super::{bounded_channel, ChannelRx, ChannelTx, InboundStream, MeshStream, Packet, Transport};
use crate::error::{MeshError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Endpoint {
    packet_tx: ChannelTx<Packet>,
    stream_tx: ChannelTx<InboundStream>,
}

#[derive(Default)]
struct HubState {
    endpoints: HashMap<SocketAddr, Endpoint>,
    /// Directed (from, to) pairs whose traffic is dropped.
    severed: HashSet<(SocketAddr, SocketAddr)>,
}

/// Switchboard connecting in-memory transports.
#[derive(Default)]
pub struct MemHub {
    state: Mutex<HubState>,
}

impl MemHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a transport at the given synthetic address.
    pub fn register(self: &Arc<Self>, addr: SocketAddr, queue_depth: usize) -> Arc<MemTransport> {
        let (packet_tx, packet_rx) = bounded_channel(queue_depth);
        let (stream_tx, stream_rx) = bounded_channel(queue_depth);

        self.state.lock().endpoints.insert(
            addr,
            Endpoint {
                packet_tx: packet_tx.clone(),
                stream_tx: stream_tx.clone(),
            },
        );

        Arc::new(MemTransport {
            hub: self.clone(),
            addr,
            packet_rx: Mutex::new(Some(packet_rx)),
            stream_rx: Mutex::new(Some(stream_rx)),
            packet_tx,
            stream_tx,
            shut: AtomicBool::new(false),
        })
    }

    /// Drop all traffic in both directions between two addresses.
    pub fn sever(&self, a: SocketAddr, b: SocketAddr) {
        let mut state = self.state.lock();
        state.severed.insert((a, b));
        state.severed.insert((b, a));
    }

    /// Restore a previously severed link.
    pub fn heal(&self, a: SocketAddr, b: SocketAddr) {
        let mut state = self.state.lock();
        state.severed.remove(&(a, b));
        state.severed.remove(&(b, a));
    }

    fn deliver_packet(&self, from: SocketAddr, to: SocketAddr, buf: &[u8]) {
        let state = self.state.lock();
        if state.severed.contains(&(from, to)) {
            return;
        }
        if let Some(endpoint) = state.endpoints.get(&to) {
            endpoint.packet_tx.push(Packet {
                buf: Bytes::copy_from_slice(buf),
                from,
                timestamp: Instant::now(),
            });
        }
    }

    fn open_stream(&self, from: SocketAddr, to: SocketAddr) -> Result<Box<dyn MeshStream>> {
        let state = self.state.lock();
        if state.severed.contains(&(from, to)) {
            return Err(MeshError::Transport(format!("{} unreachable", to)));
        }
        let endpoint = state
            .endpoints
            .get(&to)
            .ok_or_else(|| MeshError::Transport(format!("{} unreachable", to)))?;

        let (near, far) = tokio::io::duplex(64 * 1024);
        endpoint.stream_tx.push((Box::new(far), from));
        Ok(Box::new(near))
    }

    fn unregister(&self, addr: SocketAddr) {
        self.state.lock().endpoints.remove(&addr);
    }
}

/// One in-memory transport endpoint.
pub struct MemTransport {
    hub: Arc<MemHub>,
    addr: SocketAddr,
    packet_rx: Mutex<Option<ChannelRx<Packet>>>,
    stream_rx: Mutex<Option<ChannelRx<InboundStream>>>,
    packet_tx: ChannelTx<Packet>,
    stream_tx: ChannelTx<InboundStream>,
    shut: AtomicBool,
}

#[async_trait]
impl Transport for MemTransport {
    async fn write_packet(&self, buf: &[u8], addr: SocketAddr) -> Result<Instant> {
        if self.shut.load(Ordering::Acquire) {
            return Err(MeshError::Shutdown);
        }
        self.hub.deliver_packet(self.addr, addr, buf);
        Ok(Instant::now())
    }

    async fn dial_stream(
        &self,
        addr: SocketAddr,
        _timeout: Duration,
    ) -> Result<Box<dyn MeshStream>> {
        if self.shut.load(Ordering::Acquire) {
            return Err(MeshError::Shutdown);
        }
        self.hub.open_stream(self.addr, addr)
    }

    fn take_packet_rx(&self) -> Option<ChannelRx<Packet>> {
        self.packet_rx.lock().take()
    }

    fn take_stream_rx(&self) -> Option<ChannelRx<InboundStream>> {
        self.stream_rx.lock().take()
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.hub.unregister(self.addr);
        self.packet_tx.close();
        self.stream_tx.close();
        Ok(())
    }
}
