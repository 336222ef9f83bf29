// Member registry
//
// The authoritative local view of every known peer. All mutations funnel
// through one mutex that also guards the broadcast queue, so a state
// transition and the gossip announcing it are enqueued atomically: any
// reader that observes the new state will also see the outgoing broadcast.
// Incarnation numbers order liveness claims per peer; claims about ourself
// are refuted, never applied.

use crate::awareness::Awareness;
use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::proto::{self, Alive, Dead, MessageType, PushNodeState, Suspect};
use crate::queue::TransmitQueue;
use crate::suspicion::SuspicionTimer;
use crate::types::{
    ip_from_bytes, ip_to_bytes, MemberEvent, Node, NodeId, NodeState, PROTOCOL_VERSION_MAX,
    PROTOCOL_VERSION_MIN,
};
use parking_lot::Mutex;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// One tracked peer.
struct MemberInfo {
    node: Node,
    /// When the peer last changed liveness state.
    state_change: Instant,
    /// Active timer while the peer is suspect.
    suspicion: Option<SuspicionTimer>,
}

struct Inner {
    members: HashMap<NodeId, MemberInfo>,
    /// Shuffled probe rotation; every non-left peer appears once per pass.
    probe_order: Vec<NodeId>,
    probe_idx: usize,
    /// Outgoing gossip, guarded by the same mutex as the member map.
    queue: TransmitQueue,
    /// Our own incarnation number.
    incarnation: u64,
    /// Metadata override set after startup; `None` means the configured
    /// metadata still stands.
    local_meta: Option<Vec<u8>>,
    leaving: bool,
}

/// Serialized membership state machine plus the broadcast queue.
pub struct Registry {
    config: Arc<MeshConfig>,
    awareness: Arc<Awareness>,
    event_tx: mpsc::UnboundedSender<MemberEvent>,
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new(
        config: Arc<MeshConfig>,
        awareness: Arc<Awareness>,
        event_tx: mpsc::UnboundedSender<MemberEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            awareness,
            event_tx,
            inner: Mutex::new(Inner {
                members: HashMap::new(),
                probe_order: Vec::new(),
                probe_idx: 0,
                queue: TransmitQueue::new(),
                incarnation: 0,
                local_meta: None,
                leaving: false,
            }),
        })
    }

    /// Register ourselves as alive and broadcast the claim. Called once at
    /// engine startup.
    pub fn start_local(self: &Arc<Self>) {
        let msg = {
            let mut inner = self.inner.lock();
            inner.incarnation = 1;
            self.local_alive_msg(&inner)
        };
        self.alive_node(msg, true);
    }

    fn local_alive_msg(&self, inner: &Inner) -> Alive {
        let advertised = self.config.advertised();
        Alive {
            incarnation: inner.incarnation,
            node: self.config.name.clone(),
            addr: ip_to_bytes(advertised.ip()),
            port: advertised.port(),
            meta: inner
                .local_meta
                .clone()
                .unwrap_or_else(|| self.config.meta.clone()),
            vsn: self.config.version_vector(),
        }
    }

    /// Re-advertise ourselves with fresh metadata and a bumped incarnation.
    pub fn update_local_meta(self: &Arc<Self>, meta: Vec<u8>) {
        let msg = {
            let mut inner = self.inner.lock();
            inner.local_meta = Some(meta.clone());
            inner.incarnation += 1;
            let incarnation = inner.incarnation;
            let name = self.config.name.clone();
            if let Some(local) = inner.members.get_mut(&name) {
                local.node.incarnation = incarnation;
                local.node.meta = meta;
            }
            self.local_alive_msg(&inner)
        };
        let name = self.config.name.clone();
        match proto::encode(MessageType::Alive, &msg) {
            Ok(buf) => self.enqueue_broadcast(name, buf, None),
            Err(e) => tracing::error!(error = %e, "failed to encode alive broadcast"),
        }
    }

    /// Our current incarnation number.
    pub fn incarnation(&self) -> u64 {
        self.inner.lock().incarnation
    }

    pub fn set_leaving(&self) {
        self.inner.lock().leaving = true;
    }

    pub fn is_leaving(&self) -> bool {
        self.inner.lock().leaving
    }

    /// Apply an `alive` claim. `bootstrap` marks our own startup claim.
    pub fn alive_node(self: &Arc<Self>, msg: Alive, bootstrap: bool) {
        let Some(addr) = ip_from_bytes(&msg.addr) else {
            tracing::warn!(node = %msg.node, "alive claim with malformed address, dropping");
            return;
        };

        let mut inner = self.inner.lock();
        let is_local = msg.node == self.config.name;

        if is_local && !bootstrap {
            self.handle_local_alive(&mut inner, &msg);
            return;
        }

        match inner.members.get(&msg.node) {
            None => {
                let node = Node {
                    name: msg.node.clone(),
                    addr,
                    port: msg.port,
                    meta: msg.meta.clone(),
                    state: NodeState::Alive,
                    incarnation: msg.incarnation,
                    vsn: msg.vsn,
                };
                let info = MemberInfo {
                    node: node.clone(),
                    state_change: Instant::now(),
                    suspicion: None,
                };
                inner.members.insert(msg.node.clone(), info);

                // Random offset keeps fresh joiners from clustering at the
                // tail of every probe rotation.
                let end = inner.probe_order.len();
                let at = if end == 0 {
                    0
                } else {
                    rand::rng().random_range(0..=end)
                };
                inner.probe_order.insert(at, msg.node.clone());

                self.enqueue_message(&mut inner, &msg.node, MessageType::Alive, &msg, None);
                let _ = self.event_tx.send(MemberEvent::Join(node));
            }
            Some(member) => {
                let endpoint_changed = member.node.addr != addr || member.node.port != msg.port;
                let can_reclaim = matches!(member.node.state, NodeState::Dead | NodeState::Left)
                    && member.state_change.elapsed() > self.config.dead_node_reclaim_time;

                if endpoint_changed && !can_reclaim && msg.incarnation < member.node.incarnation {
                    tracing::warn!(
                        node = %msg.node,
                        old = %member.node.socket_addr(),
                        new = %addr,
                        "conflicting endpoint claim with stale incarnation, dropping"
                    );
                    return;
                }

                let supersedes = msg.incarnation > member.node.incarnation
                    || (endpoint_changed
                        && (msg.incarnation == member.node.incarnation || can_reclaim));
                if !supersedes {
                    return;
                }

                let member = inner.members.get_mut(&msg.node).expect("member present");
                let old_state = member.node.state;
                let meta_changed = member.node.meta != msg.meta;

                member.node.addr = addr;
                member.node.port = msg.port;
                member.node.meta = msg.meta.clone();
                member.node.incarnation = msg.incarnation;
                member.node.vsn = msg.vsn;
                if old_state != NodeState::Alive {
                    member.node.state = NodeState::Alive;
                    member.state_change = Instant::now();
                    member.suspicion = None;
                }
                let node = member.node.clone();

                self.enqueue_message(&mut inner, &msg.node, MessageType::Alive, &msg, None);

                match old_state {
                    NodeState::Dead | NodeState::Left => {
                        let _ = self.event_tx.send(MemberEvent::Join(node));
                    }
                    NodeState::Alive if meta_changed || endpoint_changed => {
                        let _ = self.event_tx.send(MemberEvent::Update(node));
                    }
                    _ => {}
                }
            }
        }
    }

    fn handle_local_alive(self: &Arc<Self>, inner: &mut Inner, msg: &Alive) {
        let advertised = self.config.advertised();
        let local_meta = inner.local_meta.as_ref().unwrap_or(&self.config.meta);
        let unchanged = ip_from_bytes(&msg.addr) == Some(advertised.ip())
            && msg.port == advertised.port()
            && msg.meta == *local_meta;

        if msg.incarnation < inner.incarnation || (unchanged && msg.incarnation == inner.incarnation)
        {
            return;
        }
        tracing::warn!(
            claimed_incarnation = msg.incarnation,
            "conflicting alive claim about ourself, refuting"
        );
        self.refute_locked(inner, msg.incarnation);
    }

    /// Apply a `suspect` claim.
    pub fn suspect_node(self: &Arc<Self>, msg: Suspect) {
        let mut inner = self.inner.lock();

        if msg.node == self.config.name {
            if msg.incarnation >= inner.incarnation {
                tracing::warn!(from = %msg.from, "we are suspected, refuting");
                self.refute_locked(&mut inner, msg.incarnation);
            }
            return;
        }

        let Some(member) = inner.members.get_mut(&msg.node) else {
            return;
        };
        if msg.incarnation < member.node.incarnation {
            return;
        }

        match member.node.state {
            NodeState::Suspect => {
                let newly = member
                    .suspicion
                    .as_ref()
                    .map(|timer| timer.confirm(&msg.from))
                    .unwrap_or(false);
                if newly {
                    self.enqueue_message(&mut inner, &msg.node, MessageType::Suspect, &msg, None);
                }
            }
            NodeState::Alive => {
                member.node.state = NodeState::Suspect;
                member.node.incarnation = msg.incarnation;
                member.state_change = Instant::now();

                let n = inner.members.len();
                let (min, max) = self.config.suspicion_timeouts(n);
                let min = self.awareness.scale(min);
                let max = self.awareness.scale(max);
                let k = self.config.suspicion_confirmations(n);

                let registry = Arc::downgrade(self);
                let node = msg.node.clone();
                let incarnation = msg.incarnation;
                let member = inner.members.get_mut(&msg.node).expect("member present");
                member.suspicion = Some(SuspicionTimer::spawn(
                    min,
                    max,
                    k,
                    msg.from.clone(),
                    move || suspicion_expired(registry, node, incarnation),
                ));

                tracing::info!(node = %msg.node, from = %msg.from, "peer marked suspect");
                self.enqueue_message(&mut inner, &msg.node, MessageType::Suspect, &msg, None);
            }
            NodeState::Dead | NodeState::Left => {}
        }
    }

    /// Apply a `dead` claim. A claim the subject makes about itself is a
    /// graceful leave.
    pub fn dead_node(self: &Arc<Self>, msg: Dead) {
        let mut inner = self.inner.lock();

        if msg.node == self.config.name {
            if inner.leaving {
                return;
            }
            if msg.incarnation >= inner.incarnation {
                tracing::warn!(from = %msg.from, "we are declared dead, refuting");
                self.refute_locked(&mut inner, msg.incarnation);
            }
            return;
        }

        let Some(member) = inner.members.get_mut(&msg.node) else {
            return;
        };
        if msg.incarnation < member.node.incarnation {
            return;
        }
        if matches!(member.node.state, NodeState::Dead | NodeState::Left) {
            return;
        }

        member.suspicion = None;
        member.node.state = if msg.from == msg.node {
            NodeState::Left
        } else {
            NodeState::Dead
        };
        member.node.incarnation = msg.incarnation;
        member.state_change = Instant::now();
        let node = member.node.clone();

        tracing::info!(node = %msg.node, state = %node.state, "peer removed from live set");
        self.enqueue_message(&mut inner, &msg.node, MessageType::Dead, &msg, None);
        let _ = self.event_tx.send(MemberEvent::Leave(node));
    }

    /// Feed one remote node record through the state machine, as received
    /// in a push/pull exchange.
    pub fn merge_remote_state(self: &Arc<Self>, remote: Vec<PushNodeState>) -> Result<()> {
        for state in remote {
            verify_protocol(&state)?;
            match NodeState::from_u8(state.state) {
                Some(NodeState::Alive) => {
                    self.alive_node(
                        Alive {
                            incarnation: state.incarnation,
                            node: state.name,
                            addr: state.addr,
                            port: state.port,
                            meta: state.meta,
                            vsn: state.vsn,
                        },
                        false,
                    );
                }
                Some(NodeState::Left) => {
                    self.dead_node(Dead {
                        incarnation: state.incarnation,
                        node: state.name.clone(),
                        from: state.name,
                    });
                }
                // A remote dead claim merges as a suspicion so the subject
                // gets a refutation window instead of being executed on
                // second-hand information.
                Some(NodeState::Dead) | Some(NodeState::Suspect) => {
                    self.suspect_node(Suspect {
                        incarnation: state.incarnation,
                        node: state.name,
                        from: self.config.name.clone(),
                    });
                }
                None => {
                    tracing::warn!(node = %state.name, state = state.state, "unknown node state in merge");
                }
            }
        }
        Ok(())
    }

    /// Bump our incarnation above `claim` and broadcast a fresh alive about
    /// ourself.
    fn refute_locked(self: &Arc<Self>, inner: &mut Inner, claim: u64) {
        inner.incarnation = inner.incarnation.max(claim) + 1;
        let incarnation = inner.incarnation;
        let name = self.config.name.clone();
        if let Some(local) = inner.members.get_mut(&name) {
            local.node.incarnation = incarnation;
        }
        let msg = self.local_alive_msg(inner);
        self.enqueue_message(inner, &name, MessageType::Alive, &msg, None);
        self.awareness.apply_delta(1);
    }

    fn enqueue_message(
        &self,
        inner: &mut Inner,
        key: &str,
        ty: MessageType,
        body: &impl serde::Serialize,
        notify: Option<oneshot::Sender<()>>,
    ) {
        match proto::encode(ty, body) {
            Ok(buf) => inner.queue.enqueue(key.to_string(), buf, notify),
            Err(e) => tracing::error!(error = %e, "failed to encode broadcast"),
        }
    }

    /// Queue a pre-encoded broadcast, optionally with a drain hook.
    pub fn enqueue_broadcast(&self, key: String, msg: Vec<u8>, notify: Option<oneshot::Sender<()>>) {
        self.inner.lock().queue.enqueue(key, msg, notify);
    }

    /// Pull up to `limit` bytes of queued gossip.
    pub fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut inner = self.inner.lock();
        let n = alive_count(&inner);
        inner
            .queue
            .get_broadcasts(overhead, limit, n, self.config.retransmit_mult)
    }

    pub fn broadcast_queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Members currently considered part of the cluster (alive or suspect).
    pub fn members(&self) -> Vec<Node> {
        self.inner
            .lock()
            .members
            .values()
            .filter(|m| matches!(m.node.state, NodeState::Alive | NodeState::Suspect))
            .map(|m| m.node.clone())
            .collect()
    }

    /// Every known member, including dead and departed ones.
    pub fn snapshot(&self) -> Vec<Node> {
        self.inner
            .lock()
            .members
            .values()
            .map(|m| m.node.clone())
            .collect()
    }

    /// Number of members counted as part of the cluster.
    pub fn num_members(&self) -> usize {
        alive_count(&self.inner.lock())
    }

    /// Wire records for a push/pull exchange, covering every known member.
    pub fn push_states(&self) -> Vec<PushNodeState> {
        self.inner
            .lock()
            .members
            .values()
            .map(|m| PushNodeState {
                name: m.node.name.clone(),
                addr: ip_to_bytes(m.node.addr),
                port: m.node.port,
                meta: m.node.meta.clone(),
                incarnation: m.node.incarnation,
                state: m.node.state.as_u8(),
                vsn: m.node.vsn,
            })
            .collect()
    }

    /// Look up a member by its gossip endpoint.
    pub fn node_by_addr(&self, addr: std::net::SocketAddr) -> Option<Node> {
        self.inner
            .lock()
            .members
            .values()
            .find(|m| m.node.socket_addr() == addr)
            .map(|m| m.node.clone())
    }

    /// Our own snapshot record.
    pub fn local_node(&self) -> Node {
        let inner = self.inner.lock();
        let advertised = self.config.advertised();
        inner
            .members
            .get(&self.config.name)
            .map(|m| m.node.clone())
            .unwrap_or_else(|| Node {
                name: self.config.name.clone(),
                addr: advertised.ip(),
                port: advertised.port(),
                meta: self.config.meta.clone(),
                state: NodeState::Alive,
                incarnation: inner.incarnation,
                vsn: self.config.version_vector(),
            })
    }

    /// Next peer in the shuffled probe rotation. Skips ourselves, departed
    /// peers, and dead peers past the rejoin window; reshuffles at rotation
    /// boundaries.
    pub fn next_probe_target(&self) -> Option<Node> {
        let mut inner = self.inner.lock();

        for _ in 0..2 {
            while inner.probe_idx < inner.probe_order.len() {
                let name = inner.probe_order[inner.probe_idx].clone();
                inner.probe_idx += 1;

                if name == self.config.name {
                    continue;
                }
                if let Some(member) = inner.members.get(&name) {
                    if matches!(member.node.state, NodeState::Alive | NodeState::Suspect) {
                        return Some(member.node.clone());
                    }
                }
            }
            self.reshuffle_probe_order(&mut inner);
            if inner.probe_order.is_empty() {
                return None;
            }
        }
        None
    }

    fn reshuffle_probe_order(&self, inner: &mut Inner) {
        let dead_window = self.config.gossip_to_the_dead;
        let mut order: Vec<NodeId> = inner
            .members
            .values()
            .filter(|m| match m.node.state {
                NodeState::Alive | NodeState::Suspect => true,
                // Dead peers ride the rotation briefly so a rejoin is
                // noticed; departed peers are gone for good.
                NodeState::Dead => m.state_change.elapsed() <= dead_window,
                NodeState::Left => false,
            })
            .filter(|m| m.node.name != self.config.name)
            .map(|m| m.node.name.clone())
            .collect();
        order.shuffle(&mut rand::rng());
        inner.probe_order = order;
        inner.probe_idx = 0;
    }

    /// Up to `k` distinct random alive peers, excluding `exclude` and
    /// ourselves. Used to pick indirect-ping relays and push/pull partners.
    pub fn random_live_nodes(&self, k: usize, exclude: &[&str]) -> Vec<Node> {
        let inner = self.inner.lock();
        let candidates: Vec<&MemberInfo> = inner
            .members
            .values()
            .filter(|m| m.node.state == NodeState::Alive)
            .filter(|m| m.node.name != self.config.name)
            .filter(|m| !exclude.contains(&m.node.name.as_str()))
            .collect();
        candidates
            .choose_multiple(&mut rand::rng(), k)
            .map(|m| m.node.clone())
            .collect()
    }

    /// Gossip fanout targets: live peers plus dead ones still within the
    /// gossip-to-the-dead window, measured from their last state change.
    pub fn gossip_targets(&self, k: usize) -> Vec<Node> {
        let dead_window = self.config.gossip_to_the_dead;
        let inner = self.inner.lock();
        let candidates: Vec<&MemberInfo> = inner
            .members
            .values()
            .filter(|m| m.node.name != self.config.name)
            .filter(|m| match m.node.state {
                NodeState::Alive | NodeState::Suspect => true,
                NodeState::Dead => m.state_change.elapsed() <= dead_window,
                NodeState::Left => false,
            })
            .collect();
        candidates
            .choose_multiple(&mut rand::rng(), k)
            .map(|m| m.node.clone())
            .collect()
    }

    /// Cancel every suspicion timer and drain the queue. Called at
    /// shutdown.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        for member in inner.members.values_mut() {
            member.suspicion = None;
        }
        inner.queue.reset();
    }
}

fn alive_count(inner: &Inner) -> usize {
    inner
        .members
        .values()
        .filter(|m| matches!(m.node.state, NodeState::Alive | NodeState::Suspect))
        .count()
}

fn verify_protocol(state: &PushNodeState) -> Result<()> {
    let [min, max, cur, ..] = state.vsn;
    if min > PROTOCOL_VERSION_MAX || max < PROTOCOL_VERSION_MIN || cur < min || cur > max {
        return Err(MeshError::VersionIncompatible(cur));
    }
    Ok(())
}

fn suspicion_expired(registry: Weak<Registry>, node: NodeId, incarnation: u64) {
    let Some(registry) = registry.upgrade() else {
        return;
    };
    let still_suspect = {
        let inner = registry.inner.lock();
        inner
            .members
            .get(&node)
            .map(|m| m.node.state == NodeState::Suspect && m.node.incarnation == incarnation)
            .unwrap_or(false)
    };
    if !still_suspect {
        return;
    }
    tracing::warn!(node = %node, "suspicion timeout expired, declaring dead");
    let from = registry.config.name.clone();
    registry.dead_node(Dead {
        incarnation,
        node,
        from,
    });
}
