// UDP + TCP transport
//
// One UDP socket for gossip datagrams and one TCP listener for reliable
// streams, both on the same bind address. Reader tasks feed the inbound
// channels until shutdown closes the sockets.

use super::{bounded_channel, ChannelRx, ChannelTx, InboundStream, MeshStream, Packet, Transport};
use crate::error::{MeshError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

const UDP_RECV_BUF: usize = 65536;

/// UDP + TCP transport bound to a single address.
pub struct NetTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    packet_rx: Mutex<Option<ChannelRx<Packet>>>,
    stream_rx: Mutex<Option<ChannelRx<InboundStream>>>,
    packet_tx: ChannelTx<Packet>,
    stream_tx: ChannelTx<InboundStream>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    shut: AtomicBool,
}

impl NetTransport {
    /// Bind the UDP socket and TCP listener and start the reader tasks.
    pub async fn bind(addr: SocketAddr, queue_depth: usize) -> Result<Arc<Self>> {
        let socket = std::net::UdpSocket::bind(addr)
            .map_err(|e| MeshError::Transport(format!("failed to bind {}: {}", addr, e)))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| MeshError::Transport(format!("failed to set nonblocking: {}", e)))?;
        let socket = Arc::new(
            UdpSocket::from_std(socket)
                .map_err(|e| MeshError::Transport(format!("failed to create socket: {}", e)))?,
        );

        let local_addr = socket
            .local_addr()
            .map_err(|e| MeshError::Transport(e.to_string()))?;

        let listener = TcpListener::bind(local_addr)
            .await
            .map_err(|e| MeshError::Transport(format!("failed to listen on {}: {}", addr, e)))?;

        let (packet_tx, packet_rx) = bounded_channel(queue_depth);
        let (stream_tx, stream_rx) = bounded_channel(queue_depth);

        let transport = Arc::new(Self {
            socket: socket.clone(),
            local_addr,
            packet_rx: Mutex::new(Some(packet_rx)),
            stream_rx: Mutex::new(Some(stream_rx)),
            packet_tx: packet_tx.clone(),
            stream_tx: stream_tx.clone(),
            readers: Mutex::new(Vec::new()),
            shut: AtomicBool::new(false),
        });

        let udp_reader = tokio::spawn(udp_read_loop(socket, packet_tx));
        let tcp_reader = tokio::spawn(tcp_accept_loop(listener, stream_tx));
        transport.readers.lock().extend([udp_reader, tcp_reader]);

        Ok(transport)
    }
}

async fn udp_read_loop(socket: Arc<UdpSocket>, packet_tx: ChannelTx<Packet>) {
    let mut buf = vec![0u8; UDP_RECV_BUF];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                packet_tx.push(Packet {
                    buf: Bytes::copy_from_slice(&buf[..len]),
                    from,
                    timestamp: Instant::now(),
                });
            }
            Err(e) => {
                tracing::debug!(error = %e, "udp receive failed, reader exiting");
                return;
            }
        }
    }
}

async fn tcp_accept_loop(listener: TcpListener, stream_tx: ChannelTx<InboundStream>) {
    loop {
        match listener.accept().await {
            Ok((stream, from)) => {
                let _ = stream.set_nodelay(true);
                stream_tx.push((Box::new(stream), from));
            }
            Err(e) => {
                tracing::debug!(error = %e, "tcp accept failed, reader exiting");
                return;
            }
        }
    }
}

#[async_trait]
impl Transport for NetTransport {
    async fn write_packet(&self, buf: &[u8], addr: SocketAddr) -> Result<Instant> {
        if self.shut.load(Ordering::Acquire) {
            return Err(MeshError::Shutdown);
        }
        self.socket
            .send_to(buf, addr)
            .await
            .map_err(|e| MeshError::Transport(format!("send to {} failed: {}", addr, e)))?;
        Ok(Instant::now())
    }

    async fn dial_stream(
        &self,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<Box<dyn MeshStream>> {
        if self.shut.load(Ordering::Acquire) {
            return Err(MeshError::Shutdown);
        }
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MeshError::Timeout(format!("dialing {}", addr)))?
            .map_err(|e| MeshError::Transport(format!("dial {} failed: {}", addr, e)))?;
        let _ = stream.set_nodelay(true);
        Ok(Box::new(stream))
    }

    fn take_packet_rx(&self) -> Option<ChannelRx<Packet>> {
        self.packet_rx.lock().take()
    }

    fn take_stream_rx(&self) -> Option<ChannelRx<InboundStream>> {
        self.stream_rx.lock().take()
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shut.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for reader in self.readers.lock().drain(..) {
            reader.abort();
        }
        self.packet_tx.close();
        self.stream_tx.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_packet_roundtrip_over_loopback() {
        let a = NetTransport::bind("127.0.0.1:0".parse().unwrap(), 16)
            .await
            .unwrap();
        let b = NetTransport::bind("127.0.0.1:0".parse().unwrap(), 16)
            .await
            .unwrap();

        let mut rx = b.take_packet_rx().unwrap();
        a.write_packet(b"hello", b.local_addr()).await.unwrap();

        let pkt = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&pkt.buf[..], b"hello");
        assert_eq!(pkt.from, a.local_addr());

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_dial_and_accept() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let a = NetTransport::bind("127.0.0.1:0".parse().unwrap(), 16)
            .await
            .unwrap();
        let b = NetTransport::bind("127.0.0.1:0".parse().unwrap(), 16)
            .await
            .unwrap();

        let mut rx = b.take_stream_rx().unwrap();
        let mut client = a
            .dial_stream(b.local_addr(), Duration::from_secs(2))
            .await
            .unwrap();

        client.write_all(b"ping over tcp").await.unwrap();
        client.shutdown().await.unwrap();

        let (mut server, _) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let mut got = Vec::new();
        server.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping over tcp");

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_rejects_sends() {
        let a = NetTransport::bind("127.0.0.1:0".parse().unwrap(), 16)
            .await
            .unwrap();
        a.shutdown().await.unwrap();
        a.shutdown().await.unwrap();

        let err = a
            .write_packet(b"x", "127.0.0.1:9".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::Shutdown));
    }
}
