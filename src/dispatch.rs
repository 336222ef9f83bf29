// Message dispatch
//
// Inbound demultiplexer and outbound packet pipeline. Incoming packets are
// peeled in a fixed order (label, encryption, checksum, compression,
// compound) and routed by tag to their handler; outgoing messages walk the
// same envelopes in reverse and piggyback queued gossip wherever there is
// room. A malformed packet is logged with its source address and dropped;
// nothing at this boundary can take the engine down.

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::probe::{AckOutcome, AckTable};
use crate::proto::codec::{
    add_label_header, compress_payload, decompress_payload, pack_compound, remove_label_header,
    split_compound, strip_checksum, wrap_checksum,
};
use crate::proto::crypto::Keyring;
use crate::proto::{
    self, AckResp, Alive, Dead, ErrResp, IndirectPingReq, MessageType, Nack, Ping, Suspect,
};
use crate::registry::Registry;
use crate::transport::{MeshStream, Packet, Transport};
use crate::types::{ip_from_bytes, ip_to_bytes, Node};
use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Largest frame accepted on a reliable stream.
const MAX_STREAM_FRAME: usize = 16 * 1024 * 1024;

/// Protocol version from which checksummed packets are emitted.
const CHECKSUM_PROTOCOL_VERSION: u8 = 5;

/// Shared I/O hub: every outgoing message and every inbound packet or
/// stream passes through here.
pub(crate) struct Dispatcher {
    config: Arc<MeshConfig>,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    acks: Arc<AckTable>,
    keyring: Option<Keyring>,
    user_tx: mpsc::Sender<Vec<u8>>,
    state_delegate: Option<Arc<dyn crate::anti_entropy::StateDelegate>>,
    /// Checksums of recently seen user payloads; an already-seen payload is
    /// neither redelivered nor re-gossiped, which bounds its spread.
    recent_user: parking_lot::Mutex<VecDeque<u32>>,
    seq: AtomicU32,
}

const RECENT_USER_WINDOW: usize = 128;

impl Dispatcher {
    pub fn new(
        config: Arc<MeshConfig>,
        registry: Arc<Registry>,
        transport: Arc<dyn Transport>,
        acks: Arc<AckTable>,
        keyring: Option<Keyring>,
        user_tx: mpsc::Sender<Vec<u8>>,
        state_delegate: Option<Arc<dyn crate::anti_entropy::StateDelegate>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            transport,
            acks,
            keyring,
            user_tx,
            state_delegate,
            recent_user: parking_lot::Mutex::new(VecDeque::with_capacity(RECENT_USER_WINDOW)),
            seq: AtomicU32::new(0),
        })
    }

    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn state_delegate(&self) -> Option<&Arc<dyn crate::anti_entropy::StateDelegate>> {
        self.state_delegate.as_ref()
    }

    fn label_aad(&self) -> &[u8] {
        self.config.label.as_bytes()
    }

    /// Protocol version the destination is believed to speak.
    fn dest_protocol(&self, hint: Option<&Node>, addr: SocketAddr) -> u8 {
        hint.map(|n| n.vsn[2])
            .or_else(|| self.registry.node_by_addr(addr).map(|n| n.vsn[2]))
            .unwrap_or(0)
    }

    // ------------------------------------------------------------------
    // Outbound path
    // ------------------------------------------------------------------

    /// Send one message, piggybacking queued gossip when it fits.
    pub async fn send_message(
        &self,
        addr: SocketAddr,
        hint: Option<&Node>,
        msg: Vec<u8>,
    ) -> Result<()> {
        let budget = self
            .config
            .udp_buffer_size
            .saturating_sub(msg.len() + 4 + envelope_overhead(&self.config));
        let extra = if budget > 0 {
            self.registry.get_broadcasts(2, budget)
        } else {
            Vec::new()
        };

        let payload = if extra.is_empty() {
            msg
        } else {
            let mut parts = Vec::with_capacity(1 + extra.len());
            parts.push(msg);
            parts.extend(extra);
            pack_compound(&parts)?
        };

        self.send_packet(addr, hint, payload).await
    }

    /// Send a fully assembled payload with no piggybacking.
    pub async fn send_packet(
        &self,
        addr: SocketAddr,
        hint: Option<&Node>,
        payload: Vec<u8>,
    ) -> Result<()> {
        let buf = self.encode_packet(payload, self.dest_protocol(hint, addr))?;
        self.transport.write_packet(&buf, addr).await?;
        Ok(())
    }

    /// Walk the outbound envelopes: compress, checksum, encrypt, label.
    fn encode_packet(&self, payload: Vec<u8>, dest_proto: u8) -> Result<Vec<u8>> {
        let mut buf = payload;
        if self.config.enable_compression {
            buf = compress_payload(&buf)?;
        }
        if dest_proto >= CHECKSUM_PROTOCOL_VERSION {
            buf = wrap_checksum(&buf);
        }
        if let Some(keyring) = &self.keyring {
            buf = keyring.encrypt(&buf, self.label_aad())?;
        }
        if !self.config.label.is_empty() {
            buf = add_label_header(&buf, &self.config.label)?;
        }
        Ok(buf)
    }

    // ------------------------------------------------------------------
    // Inbound packet path
    // ------------------------------------------------------------------

    /// Validate, unwrap, and route one inbound packet. Errors are logged
    /// and swallowed here.
    pub async fn ingest_packet(self: &Arc<Self>, pkt: Packet) {
        if let Err(e) = self.ingest_packet_inner(&pkt).await {
            match e {
                MeshError::ChecksumMismatch => {
                    tracing::warn!(addr = %pkt.from, "invalid checksum, dropping packet");
                }
                e => {
                    tracing::warn!(addr = %pkt.from, error = %e, "dropping malformed packet");
                }
            }
        }
    }

    async fn ingest_packet_inner(self: &Arc<Self>, pkt: &Packet) -> Result<()> {
        let (buf, label) = remove_label_header(&pkt.buf)?;
        self.check_label(label.as_deref())?;

        let mut buf = buf;
        if proto::peek_tag(&buf)? == MessageType::Encrypt as u8 {
            let Some(keyring) = &self.keyring else {
                return Err(MeshError::DecryptFailed);
            };
            buf = keyring.decrypt(&buf[1..], self.label_aad())?;
        } else if self.keyring.is_some() {
            return Err(MeshError::Transport(
                "plaintext packet rejected, encryption is required".into(),
            ));
        }

        if proto::peek_tag(&buf)? == MessageType::HasCrc as u8 {
            buf = strip_checksum(&buf[1..])?;
        }

        if proto::peek_tag(&buf)? == MessageType::Compress as u8 {
            buf = decompress_payload(&buf[1..])?;
        }

        // Compounds may nest; walk them iteratively. One bad part must not
        // take down its siblings.
        let mut work: VecDeque<Bytes> = VecDeque::from([Bytes::from(buf)]);
        while let Some(msg) = work.pop_front() {
            if proto::peek_tag(&msg)? == MessageType::Compound as u8 {
                let (truncated, parts) = split_compound(&msg[1..])?;
                if truncated > 0 {
                    tracing::warn!(
                        addr = %pkt.from,
                        truncated,
                        "compound message arrived short"
                    );
                }
                work.extend(parts);
                continue;
            }
            if let Err(e) = self
                .handle_message(&msg, pkt.from, pkt.timestamp.into())
                .await
            {
                tracing::debug!(addr = %pkt.from, error = %e, "message handler rejected part");
            }
        }
        Ok(())
    }

    fn check_label(&self, label: Option<&str>) -> Result<()> {
        match (self.config.label.as_str(), label) {
            ("", None) => Ok(()),
            ("", Some(got)) => Err(MeshError::LabelMismatch {
                expected: String::new(),
                got: got.to_string(),
            }),
            (_, None) if self.config.skip_inbound_label_check => Ok(()),
            (expected, None) => Err(MeshError::LabelMismatch {
                expected: expected.to_string(),
                got: String::new(),
            }),
            (expected, Some(got)) if expected == got => Ok(()),
            (expected, Some(got)) => Err(MeshError::LabelMismatch {
                expected: expected.to_string(),
                got: got.to_string(),
            }),
        }
    }

    async fn handle_message(self: &Arc<Self>, msg: &[u8], from: SocketAddr, at: Instant) -> Result<()> {
        let tag = proto::peek_tag(msg)?;
        let body = &msg[1..];
        match MessageType::from_u8(tag) {
            Some(MessageType::Ping) => self.handle_ping(body, from).await,
            Some(MessageType::IndirectPing) => self.handle_indirect_ping(body).await,
            Some(MessageType::AckResp) => self.handle_ack(body, at),
            Some(MessageType::Nack) => self.handle_nack(body),
            Some(MessageType::Suspect) => {
                let suspect: Suspect = proto::decode_body(body)?;
                self.registry.suspect_node(suspect);
                Ok(())
            }
            Some(MessageType::Alive) => {
                let alive: Alive = proto::decode_body(body)?;
                self.registry.alive_node(alive, false);
                Ok(())
            }
            Some(MessageType::Dead) => {
                let dead: Dead = proto::decode_body(body)?;
                self.registry.dead_node(dead);
                Ok(())
            }
            Some(MessageType::User) => self.handle_user(body),
            Some(MessageType::Err) => {
                let err: ErrResp = proto::decode_body(body)?;
                tracing::warn!(addr = %from, error = %err.error, "remote reported an error");
                Ok(())
            }
            Some(MessageType::PushPull) => Err(MeshError::Transport(
                "push/pull received on the packet path".into(),
            )),
            _ => {
                tracing::warn!(addr = %from, tag, "unknown message type, dropping");
                Err(MeshError::UnknownMessage(tag))
            }
        }
    }

    async fn handle_ping(&self, body: &[u8], from: SocketAddr) -> Result<()> {
        let ping: Ping = proto::decode_body(body)?;
        if let Some(node) = &ping.node {
            if *node != self.config.name {
                tracing::warn!(addr = %from, node = %node, "ping for wrong node, ignoring");
                return Err(MeshError::WrongNode(node.clone()));
            }
        }
        let ack = AckResp {
            seq_no: ping.seq_no,
            payload: Vec::new(),
        };
        let encoded = proto::encode(MessageType::AckResp, &ack)?;
        self.send_message(from, None, encoded).await
    }

    async fn handle_indirect_ping(self: &Arc<Self>, body: &[u8]) -> Result<()> {
        let req: IndirectPingReq = proto::decode_body(body)?;
        let Some(target_ip) = ip_from_bytes(&req.target) else {
            return Err(MeshError::Truncated);
        };
        let target = SocketAddr::new(target_ip, req.port);
        let Some(origin_ip) = ip_from_bytes(&req.source_addr) else {
            return Err(MeshError::Truncated);
        };
        let origin = SocketAddr::new(origin_ip, req.source_port);

        let local = self.registry.local_node();
        let relay_seq = self.next_seq();
        let mut rx = self.acks.register(relay_seq, 2);

        let ping = Ping {
            seq_no: relay_seq,
            node: Some(req.node.clone()),
            source_addr: ip_to_bytes(local.addr),
            source_port: local.port,
            source_node: local.name,
        };
        let encoded = proto::encode(MessageType::Ping, &ping)?;
        self.send_message(target, None, encoded).await?;

        let this = self.clone_handle();
        let timeout = this.config.probe_timeout;
        tokio::spawn(async move {
            let outcome = tokio::time::timeout(timeout, rx.recv()).await;
            this.acks.unregister(relay_seq);
            match outcome {
                Ok(Some(AckOutcome::Ack { .. })) => {
                    let ack = AckResp {
                        seq_no: req.seq_no,
                        payload: Vec::new(),
                    };
                    if let Ok(buf) = proto::encode(MessageType::AckResp, &ack) {
                        let _ = this.send_message(origin, None, buf).await;
                    }
                }
                _ if req.nack => {
                    let nack = Nack { seq_no: req.seq_no };
                    if let Ok(buf) = proto::encode(MessageType::Nack, &nack) {
                        let _ = this.send_message(origin, None, buf).await;
                    }
                }
                _ => {}
            }
        });
        Ok(())
    }

    fn handle_ack(&self, body: &[u8], at: Instant) -> Result<()> {
        let ack: AckResp = proto::decode_body(body)?;
        if !self.acks.deliver_ack(ack.seq_no, at) {
            tracing::debug!(seq = ack.seq_no, "ack for unknown sequence");
            return Err(MeshError::SequenceMismatch(ack.seq_no));
        }
        Ok(())
    }

    fn handle_nack(&self, body: &[u8]) -> Result<()> {
        let nack: Nack = proto::decode_body(body)?;
        if !self.acks.deliver_nack(nack.seq_no) {
            tracing::debug!(seq = nack.seq_no, "nack for unknown sequence");
        }
        Ok(())
    }

    fn handle_user(&self, body: &[u8]) -> Result<()> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(body);
        let digest = hasher.finalize();

        {
            let mut recent = self.recent_user.lock();
            if recent.contains(&digest) {
                return Ok(());
            }
            if recent.len() == RECENT_USER_WINDOW {
                recent.pop_front();
            }
            recent.push_back(digest);
        }

        if self.user_tx.try_send(body.to_vec()).is_err() {
            tracing::debug!("user message queue full, dropping");
        }
        // Re-gossip so the payload keeps spreading beyond the sender's
        // fanout.
        let key = format!("user-{:08x}", digest);
        let mut msg = vec![MessageType::User as u8];
        msg.extend_from_slice(body);
        self.registry.enqueue_broadcast(key, msg, None);
        Ok(())
    }

    fn clone_handle(self: &Arc<Self>) -> Arc<Self> {
        Arc::clone(self)
    }

    // ------------------------------------------------------------------
    // Stream path
    // ------------------------------------------------------------------

    /// Serve one accepted stream: optional label prefix, then a single
    /// push/pull exchange or a stream ping.
    pub async fn handle_stream(self: &Arc<Self>, mut stream: Box<dyn MeshStream>, from: SocketAddr) {
        let result = tokio::time::timeout(
            self.config.stream_timeout,
            self.handle_stream_inner(&mut stream, from),
        )
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(addr = %from, error = %e, "stream handling failed");
                let err = ErrResp {
                    error: e.to_string(),
                };
                if let Ok(body) = rmp_serde::to_vec_named(&err) {
                    let _ = self.write_frame(&mut stream, MessageType::Err, &body).await;
                }
            }
            Err(_) => {
                tracing::warn!(addr = %from, "stream timed out");
            }
        }
    }

    async fn handle_stream_inner(
        self: &Arc<Self>,
        stream: &mut Box<dyn MeshStream>,
        from: SocketAddr,
    ) -> Result<()> {
        let mut first = [0u8; 1];
        stream.read_exact(&mut first).await?;

        let tag = if first[0] == MessageType::Label as u8 {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut label = vec![0u8; len[0] as usize];
            stream.read_exact(&mut label).await?;
            let label = String::from_utf8_lossy(&label).into_owned();
            self.check_label(Some(&label))?;

            stream.read_exact(&mut first).await?;
            first[0]
        } else {
            self.check_label(None)?;
            first[0]
        };

        let (tag, payload) = self.read_frame_body(stream, tag).await?;
        match MessageType::from_u8(tag) {
            Some(MessageType::PushPull) => {
                crate::anti_entropy::serve(self, stream, &payload, from).await
            }
            Some(MessageType::Ping) => {
                let ping: Ping = proto::decode_body(&payload)?;
                if let Some(node) = &ping.node {
                    if *node != self.config.name {
                        return Err(MeshError::WrongNode(node.clone()));
                    }
                }
                let ack = AckResp {
                    seq_no: ping.seq_no,
                    payload: Vec::new(),
                };
                let body = rmp_serde::to_vec_named(&ack)
                    .map_err(|e| MeshError::Serialization(e.to_string()))?;
                self.write_frame(stream, MessageType::AckResp, &body).await
            }
            _ => Err(MeshError::UnknownMessage(tag)),
        }
    }

    /// Ping a peer over a reliable stream; used when the packet path seems
    /// one-way. Returns whether the peer acked.
    pub async fn stream_ping(self: &Arc<Self>, target: &Node, budget: Duration) -> bool {
        match self.stream_ping_inner(target, budget).await {
            Ok(acked) => acked,
            Err(e) => {
                tracing::debug!(node = %target.name, error = %e, "stream ping failed");
                false
            }
        }
    }

    async fn stream_ping_inner(self: &Arc<Self>, target: &Node, budget: Duration) -> Result<bool> {
        let dial_timeout = budget.min(self.config.stream_timeout);
        let mut stream = self
            .transport
            .dial_stream(target.socket_addr(), dial_timeout)
            .await?;

        let exchange = async {
            self.write_stream_preamble(&mut stream).await?;

            let local = self.registry.local_node();
            let seq = self.next_seq();
            let ping = Ping {
                seq_no: seq,
                node: Some(target.name.clone()),
                source_addr: ip_to_bytes(local.addr),
                source_port: local.port,
                source_node: local.name,
            };
            let body = rmp_serde::to_vec_named(&ping)
                .map_err(|e| MeshError::Serialization(e.to_string()))?;
            self.write_frame(&mut stream, MessageType::Ping, &body).await?;

            let (tag, payload) = self.read_frame(&mut stream).await?;
            if MessageType::from_u8(tag) != Some(MessageType::AckResp) {
                return Err(MeshError::UnknownMessage(tag));
            }
            let ack: AckResp = proto::decode_body(&payload)?;
            if ack.seq_no != seq {
                return Err(MeshError::SequenceMismatch(ack.seq_no));
            }
            Ok(true)
        };

        tokio::time::timeout(budget, exchange)
            .await
            .map_err(|_| MeshError::Timeout(format!("stream ping to {}", target.name)))?
    }

    /// Write the optional label prefix that starts every dialed stream.
    pub async fn write_stream_preamble(&self, stream: &mut Box<dyn MeshStream>) -> Result<()> {
        if self.config.label.is_empty() {
            return Ok(());
        }
        let mut preamble = Vec::with_capacity(2 + self.config.label.len());
        preamble.push(MessageType::Label as u8);
        preamble.push(self.config.label.len() as u8);
        preamble.extend_from_slice(self.config.label.as_bytes());
        stream.write_all(&preamble).await?;
        Ok(())
    }

    /// Write one stream frame: tag, u32 big-endian length, payload.
    /// Push/pull frames are compressed when configured; everything is
    /// wrapped in the encryption envelope when a keyring is installed.
    pub async fn write_frame(
        &self,
        stream: &mut Box<dyn MeshStream>,
        ty: MessageType,
        payload: &[u8],
    ) -> Result<()> {
        let mut frame = raw_frame(ty as u8, payload);

        if self.config.enable_compression && ty == MessageType::PushPull {
            let compressed = compress_payload(&frame)?;
            // compress_payload already leads with the compress tag.
            frame = raw_frame_prebuilt(compressed);
        }
        if let Some(keyring) = &self.keyring {
            let sealed = keyring.encrypt(&frame, self.label_aad())?;
            frame = raw_frame_prebuilt(sealed);
        }

        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one stream frame, peeling encryption and compression.
    pub async fn read_frame(&self, stream: &mut Box<dyn MeshStream>) -> Result<(u8, Vec<u8>)> {
        let mut tag = [0u8; 1];
        stream.read_exact(&mut tag).await?;
        self.read_frame_body(stream, tag[0]).await
    }

    async fn read_frame_body(
        &self,
        stream: &mut Box<dyn MeshStream>,
        mut tag: u8,
    ) -> Result<(u8, Vec<u8>)> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > MAX_STREAM_FRAME {
            return Err(MeshError::Transport(format!("stream frame of {} bytes", len)));
        }
        let mut payload = vec![0u8; len];
        stream.read_exact(&mut payload).await?;

        if tag == MessageType::Encrypt as u8 {
            let Some(keyring) = &self.keyring else {
                return Err(MeshError::DecryptFailed);
            };
            let inner = keyring.decrypt(&payload, self.label_aad())?;
            (tag, payload) = parse_frame(&inner)?;
        } else if self.keyring.is_some() {
            return Err(MeshError::Transport(
                "plaintext stream rejected, encryption is required".into(),
            ));
        }

        if tag == MessageType::Compress as u8 {
            let inner = decompress_payload(&payload)?;
            (tag, payload) = parse_frame(&inner)?;
        }

        Ok((tag, payload))
    }
}

fn envelope_overhead(config: &MeshConfig) -> usize {
    let mut overhead = 0;
    if !config.label.is_empty() {
        overhead += 2 + config.label.len();
    }
    if config.secret_key.is_some() {
        overhead += Keyring::overhead();
    }
    // Checksum envelope, worst case.
    overhead + 5
}

fn raw_frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(5 + payload.len());
    frame.push(tag);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Re-frame bytes that already begin with their tag.
fn raw_frame_prebuilt(tagged: Vec<u8>) -> Vec<u8> {
    let mut frame = Vec::with_capacity(4 + tagged.len());
    frame.push(tagged[0]);
    frame.extend_from_slice(&((tagged.len() - 1) as u32).to_be_bytes());
    frame.extend_from_slice(&tagged[1..]);
    frame
}

/// Split a complete in-memory frame into tag and payload.
fn parse_frame(buf: &[u8]) -> Result<(u8, Vec<u8>)> {
    if buf.len() < 5 {
        return Err(MeshError::Truncated);
    }
    let tag = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if buf.len() < 5 + len {
        return Err(MeshError::Truncated);
    }
    Ok((tag, buf[5..5 + len].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::Awareness;
    use crate::types::MemberEvent;
    use tokio::sync::mpsc::error::TryRecvError;

    struct Fixture {
        dispatcher: Arc<Dispatcher>,
        registry: Arc<Registry>,
        transport: Arc<crate::transport::mem::MemTransport>,
        _events: mpsc::UnboundedReceiver<MemberEvent>,
        user_rx: mpsc::Receiver<Vec<u8>>,
    }

    /// Retire everything in the broadcast queue so replies under test are
    /// not wrapped in piggyback compounds.
    fn drain_broadcasts(fx: &Fixture) {
        while fx.registry.broadcast_queue_len() > 0 {
            let _ = fx.registry.get_broadcasts(0, 1 << 20);
        }
    }

    fn fixture_with(config: MeshConfig, hub: &Arc<crate::transport::mem::MemHub>) -> Fixture {
        let config = Arc::new(config);
        let transport = hub.register(config.bind_addr, 64);
        let awareness = Arc::new(Awareness::new(config.awareness_max_multiplier));
        let (event_tx, events) = mpsc::unbounded_channel();
        let registry = Registry::new(config.clone(), awareness, event_tx);
        registry.start_local();

        let keyring = config
            .secret_key
            .clone()
            .map(|k| Keyring::new(k, config.extra_keys.clone()).unwrap());
        let (user_tx, user_rx) = mpsc::channel(16);
        let acks = AckTable::new();
        let dispatcher = Dispatcher::new(
            config,
            registry.clone(),
            transport.clone(),
            acks,
            keyring,
            user_tx,
            None,
        );
        Fixture {
            dispatcher,
            registry,
            transport,
            _events: events,
            user_rx,
        }
    }

    fn fixture(name: &str, port: u16) -> (Fixture, Arc<crate::transport::mem::MemHub>) {
        let hub = crate::transport::mem::MemHub::new();
        let mut config = MeshConfig::local(name);
        config.bind_addr = SocketAddr::from(([127, 0, 0, 1], port));
        let fx = fixture_with(config, &hub);
        (fx, hub)
    }

    fn packet(buf: Vec<u8>, from: SocketAddr) -> Packet {
        Packet {
            buf: Bytes::from(buf),
            from,
            timestamp: std::time::Instant::now(),
        }
    }

    fn attacker_addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 4444))
    }

    fn ping_msg(seq: u32, node: Option<&str>) -> Vec<u8> {
        proto::encode(
            MessageType::Ping,
            &Ping {
                seq_no: seq,
                node: node.map(|s| s.to_string()),
                source_addr: vec![127, 0, 0, 1],
                source_port: 4444,
                source_node: "attacker".to_string(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_compound_ping_reflection() {
        let (fx, hub) = fixture("m", 7001);
        drain_broadcasts(&fx);
        let sink = hub.register(attacker_addr(), 16);
        let mut sink_rx = sink.take_packet_rx().unwrap();

        let pings = vec![
            ping_msg(42, Some("m")),
            ping_msg(42, Some("m")),
            ping_msg(42, Some("m")),
        ];
        let compound = pack_compound(&pings).unwrap();
        fx.dispatcher
            .ingest_packet(packet(compound, attacker_addr()))
            .await;

        // Three separate acks come back, all for sequence 42.
        for _ in 0..3 {
            let pkt = tokio::time::timeout(Duration::from_secs(1), sink_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(pkt.buf[0], MessageType::AckResp as u8);
            let ack: AckResp = proto::decode_body(&pkt.buf[1..]).unwrap();
            assert_eq!(ack.seq_no, 42);
        }
    }

    #[tokio::test]
    async fn test_wrong_node_ping_gets_no_reply() {
        let (fx, hub) = fixture("m", 7002);
        let sink = hub.register(attacker_addr(), 16);
        let mut sink_rx = sink.take_packet_rx().unwrap();

        fx.dispatcher
            .ingest_packet(packet(ping_msg(42, Some("m-bad")), attacker_addr()))
            .await;

        let reply = tokio::time::timeout(Duration::from_millis(50), sink_rx.recv()).await;
        assert!(reply.is_err(), "expected silence for a wrong-node ping");
    }

    #[tokio::test]
    async fn test_corrupted_checksum_is_dropped() {
        let (fx, hub) = fixture("m", 7003);
        let sink = hub.register(attacker_addr(), 16);
        let mut sink_rx = sink.take_packet_rx().unwrap();

        let mut wrapped = wrap_checksum(&ping_msg(42, Some("m")));
        let last = wrapped.len() - 1;
        wrapped[last] ^= 0x01;

        let members_before = fx.registry.snapshot().len();
        fx.dispatcher
            .ingest_packet(packet(wrapped, attacker_addr()))
            .await;

        assert!(
            tokio::time::timeout(Duration::from_millis(50), sink_rx.recv())
                .await
                .is_err()
        );
        assert_eq!(fx.registry.snapshot().len(), members_before);
    }

    #[tokio::test]
    async fn test_intact_checksum_is_accepted() {
        let (fx, hub) = fixture("m", 7004);
        drain_broadcasts(&fx);
        let sink = hub.register(attacker_addr(), 16);
        let mut sink_rx = sink.take_packet_rx().unwrap();

        let wrapped = wrap_checksum(&ping_msg(7, Some("m")));
        fx.dispatcher
            .ingest_packet(packet(wrapped, attacker_addr()))
            .await;

        let pkt = tokio::time::timeout(Duration::from_secs(1), sink_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pkt.buf[0], MessageType::AckResp as u8);
    }

    #[tokio::test]
    async fn test_label_mismatch_is_dropped() {
        let hub = crate::transport::mem::MemHub::new();
        let mut config = MeshConfig::local("m");
        config.bind_addr = SocketAddr::from(([127, 0, 0, 1], 7005));
        config.label = "tenant-a".to_string();
        let fx = fixture_with(config, &hub);

        let sink = hub.register(attacker_addr(), 16);
        let mut sink_rx = sink.take_packet_rx().unwrap();

        let labelled = add_label_header(&ping_msg(1, Some("m")), "tenant-b").unwrap();
        fx.dispatcher
            .ingest_packet(packet(labelled, attacker_addr()))
            .await;
        // Unlabelled traffic is rejected too when a label is required.
        fx.dispatcher
            .ingest_packet(packet(ping_msg(1, Some("m")), attacker_addr()))
            .await;

        assert!(
            tokio::time::timeout(Duration::from_millis(50), sink_rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_alive_message_updates_registry() {
        let (fx, _hub) = fixture("m", 7006);
        let alive = proto::encode(
            MessageType::Alive,
            &Alive {
                incarnation: 3,
                node: "q".to_string(),
                addr: vec![127, 0, 0, 1],
                port: 9100,
                meta: Vec::new(),
                vsn: [1, 5, 5, 0, 0, 0],
            },
        )
        .unwrap();

        fx.dispatcher
            .ingest_packet(packet(alive, attacker_addr()))
            .await;

        let q = fx
            .registry
            .members()
            .into_iter()
            .find(|n| n.name == "q")
            .unwrap();
        assert_eq!(q.incarnation, 3);
    }

    #[tokio::test]
    async fn test_user_message_delivered_and_requeued() {
        let (mut fx, _hub) = fixture("m", 7007);
        let mut msg = vec![MessageType::User as u8];
        msg.extend_from_slice(b"application gossip");

        fx.dispatcher
            .ingest_packet(packet(msg, attacker_addr()))
            .await;

        assert_eq!(fx.user_rx.try_recv().unwrap(), b"application gossip");
        assert!(fx.registry.broadcast_queue_len() >= 1);
    }

    #[tokio::test]
    async fn test_unknown_tag_is_dropped_quietly() {
        let (mut fx, _hub) = fixture("m", 7008);
        fx.dispatcher
            .ingest_packet(packet(vec![200, 1, 2, 3], attacker_addr()))
            .await;
        // Engine unaffected.
        assert!(matches!(fx.user_rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(fx.registry.members().len(), 1);
    }

    #[tokio::test]
    async fn test_encrypted_roundtrip_between_dispatchers() {
        let hub = crate::transport::mem::MemHub::new();
        let key = vec![42u8; 32];

        let mut config_a = MeshConfig::local("a");
        config_a.bind_addr = SocketAddr::from(([127, 0, 0, 1], 7009));
        config_a.secret_key = Some(key.clone());
        let fx_a = fixture_with(config_a, &hub);

        let mut config_b = MeshConfig::local("b");
        config_b.bind_addr = SocketAddr::from(([127, 0, 0, 1], 7010));
        config_b.secret_key = Some(key);
        let fx_b = fixture_with(config_b, &hub);

        let mut b_rx = fx_b.transport.take_packet_rx().unwrap();

        // a pings b through the full encode path.
        let ping = ping_msg(5, Some("b"));
        fx_a.dispatcher
            .send_message(fx_b.transport.local_addr(), None, ping)
            .await
            .unwrap();

        let pkt = tokio::time::timeout(Duration::from_secs(1), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pkt.buf[0], MessageType::Encrypt as u8);

        // b's dispatcher decrypts and acks toward the synthetic source.
        let sink = hub.register(attacker_addr(), 16);
        let mut sink_rx = sink.take_packet_rx().unwrap();
        fx_b.dispatcher
            .ingest_packet(packet(pkt.buf.to_vec(), attacker_addr()))
            .await;

        let reply = tokio::time::timeout(Duration::from_secs(1), sink_rx.recv())
            .await
            .unwrap()
            .unwrap();
        // The ack is encrypted on the way out as well.
        assert_eq!(reply.buf[0], MessageType::Encrypt as u8);
    }

    #[tokio::test]
    async fn test_plaintext_rejected_when_keyring_installed() {
        let hub = crate::transport::mem::MemHub::new();
        let mut config = MeshConfig::local("m");
        config.bind_addr = SocketAddr::from(([127, 0, 0, 1], 7011));
        config.secret_key = Some(vec![1u8; 32]);
        let fx = fixture_with(config, &hub);

        let sink = hub.register(attacker_addr(), 16);
        let mut sink_rx = sink.take_packet_rx().unwrap();

        fx.dispatcher
            .ingest_packet(packet(ping_msg(1, Some("m")), attacker_addr()))
            .await;
        assert!(
            tokio::time::timeout(Duration::from_millis(50), sink_rx.recv())
                .await
                .is_err()
        );
    }
}
