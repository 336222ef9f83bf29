// Engine handle and background loops
//
// `Cluster` owns everything: the registry, the dispatcher, the failure
// detector, and the four periodic loops (probe, gossip, push/pull, inbound
// dispatch). All state is threaded through this handle; there are no
// process-wide singletons. Shutdown is a watch flag every loop selects on.

use crate::anti_entropy::{self, StateDelegate};
use crate::awareness::Awareness;
use crate::config::MeshConfig;
use crate::dispatch::Dispatcher;
use crate::error::{MeshError, Result};
use crate::probe::{AckTable, FailureDetector};
use crate::proto::codec::pack_compound;
use crate::proto::crypto::Keyring;
use crate::proto::{self, Dead, MessageType};
use crate::registry::Registry;
use crate::transport::Transport;
use crate::types::{MemberEvent, Node};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Event channels handed to the embedding application at startup.
pub struct ClusterEvents {
    /// Membership changes: joins, leaves, metadata updates.
    pub members: mpsc::UnboundedReceiver<MemberEvent>,

    /// User payloads received via gossip.
    pub user_messages: mpsc::Receiver<Vec<u8>>,
}

struct Core {
    config: Arc<MeshConfig>,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
    detector: Arc<FailureDetector>,
    awareness: Arc<Awareness>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running membership engine.
pub struct Cluster {
    core: Arc<Core>,
}

impl Cluster {
    /// Start the engine on the given transport.
    pub fn start(
        config: MeshConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, ClusterEvents)> {
        Self::start_with_delegate(config, transport, None)
    }

    /// Start the engine with an application state delegate for push/pull
    /// exchanges.
    pub fn start_with_delegate(
        config: MeshConfig,
        transport: Arc<dyn Transport>,
        state_delegate: Option<Arc<dyn StateDelegate>>,
    ) -> Result<(Self, ClusterEvents)> {
        config.validate()?;
        let config = Arc::new(config);

        let keyring = match &config.secret_key {
            Some(primary) => Some(Keyring::new(primary.clone(), config.extra_keys.clone())?),
            None => None,
        };

        let awareness = Arc::new(Awareness::new(config.awareness_max_multiplier));
        let (event_tx, member_events) = mpsc::unbounded_channel();
        let (user_tx, user_messages) = mpsc::channel(config.handoff_queue_depth);

        let registry = Registry::new(config.clone(), awareness.clone(), event_tx);
        let acks = AckTable::new();
        let dispatcher = Dispatcher::new(
            config.clone(),
            registry.clone(),
            transport.clone(),
            acks.clone(),
            keyring,
            user_tx,
            state_delegate,
        );
        let detector = Arc::new(FailureDetector::new(
            config.clone(),
            registry.clone(),
            dispatcher.clone(),
            acks,
            awareness.clone(),
        ));

        registry.start_local();

        let (shutdown_tx, _) = watch::channel(false);
        let core = Arc::new(Core {
            config,
            registry,
            transport,
            dispatcher,
            detector,
            awareness,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });
        core.spawn_loops()?;

        tracing::info!(
            name = %core.config.name,
            addr = %core.transport.local_addr(),
            "membership engine started"
        );
        Ok((
            Self { core },
            ClusterEvents {
                members: member_events,
                user_messages,
            },
        ))
    }

    /// Contact seed peers and pull their member lists. Partial success is
    /// success; the error aggregates every per-peer failure.
    pub async fn join(&self, seeds: &[SocketAddr]) -> Result<usize> {
        self.ensure_running()?;

        let mut contacted = 0;
        let mut errors = Vec::new();
        for &addr in seeds {
            match self.push_pull_to(addr, true).await {
                Ok(()) => contacted += 1,
                Err(e) => {
                    tracing::warn!(addr = %addr, error = %e, "failed to join via seed");
                    errors.push(format!("{}: {}", addr, e));
                }
            }
        }

        if contacted > 0 {
            tracing::info!(contacted, "joined cluster");
            Ok(contacted)
        } else {
            Err(MeshError::JoinFailed(errors.join("; ")))
        }
    }

    /// Announce a graceful departure and wait until the announcement has
    /// been gossiped out, or `timeout` elapses.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        self.ensure_running()?;
        if self.core.registry.is_leaving() {
            return Ok(());
        }
        self.core.registry.set_leaving();

        // Nobody to tell.
        if self.core.registry.members().len() <= 1 {
            return Ok(());
        }

        let name = self.core.config.name.clone();
        let dead = Dead {
            incarnation: self.core.registry.incarnation(),
            node: name.clone(),
            from: name.clone(),
        };
        let msg = proto::encode(MessageType::Dead, &dead)?;
        let (tx, rx) = oneshot::channel();
        self.core.registry.enqueue_broadcast(name, msg, Some(tx));

        match tokio::time::timeout(timeout, rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(MeshError::Timeout(
                "leave broadcast still pending".to_string(),
            )),
        }
    }

    /// Stop every loop, cancel timers, and release the transport.
    /// Idempotent; all other operations fail with `Shutdown` afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        if *self.core.shutdown_tx.borrow() {
            return Ok(());
        }
        let _ = self.core.shutdown_tx.send(true);
        self.core.transport.shutdown().await?;
        self.core.registry.reset();
        for task in self.core.tasks.lock().drain(..) {
            task.abort();
        }
        tracing::info!(name = %self.core.config.name, "membership engine stopped");
        Ok(())
    }

    /// Queue a user payload for gossip. Payloads sharing a key supersede
    /// each other.
    pub fn broadcast(&self, key: &str, payload: &[u8]) -> Result<()> {
        self.ensure_running()?;
        let mut msg = vec![MessageType::User as u8];
        msg.extend_from_slice(payload);
        self.core
            .registry
            .enqueue_broadcast(key.to_string(), msg, None);
        Ok(())
    }

    /// Re-advertise this node with new metadata.
    pub fn set_meta(&self, meta: Vec<u8>) -> Result<()> {
        self.ensure_running()?;
        self.core.registry.update_local_meta(meta);
        Ok(())
    }

    /// Members currently considered part of the cluster.
    pub fn members(&self) -> Result<Vec<Node>> {
        self.ensure_running()?;
        Ok(self.core.registry.members())
    }

    /// Number of members currently considered part of the cluster.
    pub fn num_members(&self) -> usize {
        self.core.registry.num_members()
    }

    /// Our own record.
    pub fn local_node(&self) -> Node {
        self.core.registry.local_node()
    }

    /// Current self-health score; zero is healthy.
    pub fn health_score(&self) -> u8 {
        self.core.awareness.score()
    }

    fn ensure_running(&self) -> Result<()> {
        if *self.core.shutdown_tx.borrow() {
            return Err(MeshError::Shutdown);
        }
        Ok(())
    }

    async fn push_pull_to(&self, addr: SocketAddr, join: bool) -> Result<()> {
        let mut stream = self
            .core
            .transport
            .dial_stream(addr, self.core.config.stream_timeout)
            .await?;
        tokio::time::timeout(
            self.core.config.stream_timeout,
            anti_entropy::initiate(&self.core.dispatcher, &mut stream, join),
        )
        .await
        .map_err(|_| MeshError::Timeout(format!("push/pull with {}", addr)))?
    }
}

impl Core {
    fn spawn_loops(self: &Arc<Self>) -> Result<()> {
        let packet_rx = self
            .transport
            .take_packet_rx()
            .ok_or_else(|| MeshError::Transport("packet channel already taken".into()))?;
        let stream_rx = self
            .transport
            .take_stream_rx()
            .ok_or_else(|| MeshError::Transport("stream channel already taken".into()))?;

        let mut tasks = self.tasks.lock();

        // Inbound packets.
        {
            let dispatcher = self.dispatcher.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let mut rx = packet_rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        pkt = rx.recv() => match pkt {
                            Some(pkt) => dispatcher.ingest_packet(pkt).await,
                            None => break,
                        },
                    }
                }
            }));
        }

        // Inbound streams, one task per accepted stream.
        {
            let dispatcher = self.dispatcher.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let mut rx = stream_rx;
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        inbound = rx.recv() => match inbound {
                            Some((stream, from)) => {
                                let dispatcher = dispatcher.clone();
                                tokio::spawn(async move {
                                    dispatcher.handle_stream(stream, from).await;
                                });
                            }
                            None => break,
                        },
                    }
                }
            }));
        }

        // Probe loop; cadence stretches with the health score.
        {
            let detector = self.detector.clone();
            let awareness = self.awareness.clone();
            let interval = self.config.probe_interval;
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    let tick = awareness.scale(interval);
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(tick) => detector.probe_round().await,
                    }
                }
            }));
        }

        // Gossip loop.
        {
            let core = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let mut ticker = tokio::time::interval(self.config.gossip_interval);
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => core.gossip_once().await,
                    }
                }
            }));
        }

        // Push/pull loop; interval grows with cluster size.
        {
            let core = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    let tick = core
                        .config
                        .scaled_push_pull_interval(core.registry.num_members());
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(tick) => core.push_pull_once().await,
                    }
                }
            }));
        }

        Ok(())
    }

    /// One gossip tick: fan queued broadcasts out to a few random peers.
    async fn gossip_once(&self) {
        let targets = self.registry.gossip_targets(self.config.gossip_nodes);
        if targets.is_empty() {
            return;
        }

        let budget = self.config.udp_buffer_size.saturating_sub(64);
        for target in targets {
            let msgs = self.registry.get_broadcasts(2, budget);
            if msgs.is_empty() {
                return;
            }
            let payload = if msgs.len() == 1 {
                msgs.into_iter().next().expect("one message")
            } else {
                match pack_compound(&msgs) {
                    Ok(buf) => buf,
                    Err(e) => {
                        tracing::error!(error = %e, "failed to pack gossip compound");
                        return;
                    }
                }
            };
            if let Err(e) = self
                .dispatcher
                .send_packet(target.socket_addr(), Some(&target), payload)
                .await
            {
                tracing::debug!(node = %target.name, error = %e, "gossip send failed");
            }
        }
    }

    /// One push/pull tick: full-state exchange with a single random peer.
    async fn push_pull_once(&self) {
        let Some(peer) = self
            .registry
            .random_live_nodes(1, &[])
            .into_iter()
            .next()
        else {
            return;
        };

        let result = async {
            let mut stream = self
                .transport
                .dial_stream(peer.socket_addr(), self.config.stream_timeout)
                .await?;
            tokio::time::timeout(
                self.config.stream_timeout,
                anti_entropy::initiate(&self.dispatcher, &mut stream, false),
            )
            .await
            .map_err(|_| MeshError::Timeout(format!("push/pull with {}", peer.name)))?
        }
        .await;

        if let Err(e) = result {
            tracing::debug!(node = %peer.name, error = %e, "push/pull exchange failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mem::MemHub;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn start_node(
        hub: &Arc<MemHub>,
        name: &str,
        port: u16,
    ) -> (Cluster, ClusterEvents) {
        let mut config = MeshConfig::local(name);
        config.bind_addr = addr(port);
        let transport = hub.register(addr(port), config.handoff_queue_depth);
        Cluster::start(config, transport).unwrap()
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let hub = MemHub::new();
        let (cluster, _events) = start_node(&hub, "solo", 9000);

        assert_eq!(cluster.num_members(), 1);
        assert_eq!(cluster.local_node().name, "solo");
        assert_eq!(cluster.health_score(), 0);

        cluster.shutdown().await.unwrap();
        cluster.shutdown().await.unwrap();
        assert!(matches!(cluster.members(), Err(MeshError::Shutdown)));
        assert!(matches!(
            cluster.join(&[addr(9001)]).await,
            Err(MeshError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_join_via_push_pull() {
        let hub = MemHub::new();
        let (a, _ea) = start_node(&hub, "a", 9100);
        let (b, _eb) = start_node(&hub, "b", 9101);

        let contacted = b.join(&[addr(9100)]).await.unwrap();
        assert_eq!(contacted, 1);
        assert_eq!(b.num_members(), 2);

        // The serving side merges just after replying; give it a beat.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(a.num_members(), 2);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_unreachable_seed_fails() {
        let hub = MemHub::new();
        let (a, _events) = start_node(&hub, "a", 9200);

        let err = a.join(&[addr(9999)]).await.unwrap_err();
        assert!(matches!(err, MeshError::JoinFailed(_)));

        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_partial_success_is_success() {
        let hub = MemHub::new();
        let (a, _ea) = start_node(&hub, "a", 9300);
        let (b, _eb) = start_node(&hub, "b", 9301);

        let contacted = b.join(&[addr(9999), addr(9300)]).await.unwrap();
        assert_eq!(contacted, 1);

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_requires_running_engine() {
        let hub = MemHub::new();
        let (a, _events) = start_node(&hub, "a", 9400);

        a.broadcast("k1", b"payload").unwrap();
        a.shutdown().await.unwrap();
        assert!(matches!(
            a.broadcast("k2", b"payload"),
            Err(MeshError::Shutdown)
        ));
    }

    #[tokio::test]
    async fn test_leave_with_no_peers_returns_immediately() {
        let hub = MemHub::new();
        let (a, _events) = start_node(&hub, "a", 9500);

        a.leave(Duration::from_secs(5)).await.unwrap();
        a.leave(Duration::from_secs(5)).await.unwrap();

        a.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_key_mismatch_join_fails_closed() {
        let hub = MemHub::new();

        let mut config_a = MeshConfig::local("a");
        config_a.bind_addr = addr(9600);
        config_a.secret_key = Some(vec![1u8; 32]);
        let ta = hub.register(addr(9600), 64);
        let (a, _ea) = Cluster::start(config_a, ta).unwrap();

        let mut config_b = MeshConfig::local("b");
        config_b.bind_addr = addr(9601);
        config_b.secret_key = Some(vec![2u8; 32]);
        let tb = hub.register(addr(9601), 64);
        let (b, _eb) = Cluster::start(config_b, tb).unwrap();

        let err = b.join(&[addr(9600)]).await.unwrap_err();
        let text = err.to_string();
        assert!(
            text.contains("no installed keys could decrypt the message")
                || text.contains("timed out"),
            "unexpected join error: {}",
            text
        );

        a.shutdown().await.unwrap();
        b.shutdown().await.unwrap();
    }
}
