// Failure detector
//
// The periodic probe: direct ping over the packet transport, then indirect
// pings through randomly chosen relays plus a reliable-stream fallback for
// the asymmetric-UDP case, and finally local suspicion if nothing answers
// by the round deadline. Round-trip times of successful probes feed a
// bounded meter whose 99th percentile can drive adaptive timeouts.

use crate::awareness::Awareness;
use crate::config::MeshConfig;
use crate::dispatch::Dispatcher;
use crate::proto::{self, IndirectPingReq, MessageType, Ping, Suspect};
use crate::registry::Registry;
use crate::types::{ip_to_bytes, Node};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// What came back for an outstanding probe sequence number.
#[derive(Debug)]
pub(crate) enum AckOutcome {
    Ack { at: Instant },
    Nack,
}

/// Outstanding probe sequence numbers and where to deliver their replies.
#[derive(Default)]
pub(crate) struct AckTable {
    pending: Mutex<HashMap<u32, mpsc::Sender<AckOutcome>>>,
}

impl AckTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register interest in a sequence number. The channel holds room for
    /// the direct ack plus every possible relay reply.
    pub fn register(&self, seq: u32, capacity: usize) -> mpsc::Receiver<AckOutcome> {
        let (tx, rx) = mpsc::channel(capacity.max(2));
        self.pending.lock().insert(seq, tx);
        rx
    }

    pub fn unregister(&self, seq: u32) {
        self.pending.lock().remove(&seq);
    }

    /// Route an ack to its waiter. Returns false for unknown sequences.
    pub fn deliver_ack(&self, seq: u32, at: Instant) -> bool {
        let tx = self.pending.lock().get(&seq).cloned();
        match tx {
            Some(tx) => tx.try_send(AckOutcome::Ack { at }).is_ok(),
            None => false,
        }
    }

    /// Route a nack to its waiter. Returns false for unknown sequences.
    pub fn deliver_nack(&self, seq: u32) -> bool {
        let tx = self.pending.lock().get(&seq).cloned();
        match tx {
            Some(tx) => tx.try_send(AckOutcome::Nack).is_ok(),
            None => false,
        }
    }
}

/// Bounded window of recent probe round-trip times.
pub(crate) struct RttMeter {
    samples: Mutex<VecDeque<Duration>>,
    window: usize,
}

impl RttMeter {
    pub fn new(window: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::with_capacity(window)),
            window: window.max(1),
        }
    }

    pub fn record(&self, rtt: Duration) {
        let mut samples = self.samples.lock();
        if samples.len() == self.window {
            samples.pop_front();
        }
        samples.push_back(rtt);
    }

    /// 99th percentile of the recorded window.
    pub fn p99(&self) -> Option<Duration> {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<Duration> = samples.iter().copied().collect();
        sorted.sort();
        let idx = ((sorted.len() as f64) * 0.99).ceil() as usize;
        Some(sorted[idx.saturating_sub(1).min(sorted.len() - 1)])
    }
}

/// Drives one probe round per tick of the probe loop.
pub(crate) struct FailureDetector {
    config: Arc<MeshConfig>,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    acks: Arc<AckTable>,
    awareness: Arc<Awareness>,
    rtt: RttMeter,
    seq: AtomicU32,
}

impl FailureDetector {
    pub fn new(
        config: Arc<MeshConfig>,
        registry: Arc<Registry>,
        dispatcher: Arc<Dispatcher>,
        acks: Arc<AckTable>,
        awareness: Arc<Awareness>,
    ) -> Self {
        Self {
            config,
            registry,
            dispatcher,
            acks,
            awareness,
            rtt: RttMeter::new(64),
            seq: AtomicU32::new(0),
        }
    }

    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Effective direct-ping timeout, taking the RTT meter and the health
    /// score into account.
    fn ping_timeout(&self) -> Duration {
        let base = if self.config.adaptive_timeouts {
            self.rtt.p99().map_or(self.config.probe_timeout, |p99| {
                p99.max(self.config.probe_timeout)
            })
        } else {
            self.config.probe_timeout
        };
        self.awareness.scale(base)
    }

    /// Probe the next peer in the rotation, if any.
    pub async fn probe_round(&self) {
        let Some(target) = self.registry.next_probe_target() else {
            return;
        };
        self.probe(target).await;
    }

    async fn probe(&self, target: Node) {
        let seq = self.next_seq();
        let local = self.registry.local_node();
        let ping = Ping {
            seq_no: seq,
            node: Some(target.name.clone()),
            source_addr: ip_to_bytes(local.addr),
            source_port: local.port,
            source_node: local.name.clone(),
        };

        let relay_budget = self.config.indirect_checks;
        let mut rx = self.acks.register(seq, relay_budget + 2);

        let encoded = match proto::encode(MessageType::Ping, &ping) {
            Ok(buf) => buf,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode ping");
                self.acks.unregister(seq);
                return;
            }
        };

        let sent_at = Instant::now();
        if let Err(e) = self
            .dispatcher
            .send_message(target.socket_addr(), Some(&target), encoded)
            .await
        {
            tracing::warn!(node = %target.name, error = %e, "failed to send ping");
        }

        // Phase one: wait for the direct ack.
        let direct = tokio::time::timeout(self.ping_timeout(), rx.recv()).await;
        if let Ok(Some(AckOutcome::Ack { at })) = direct {
            self.rtt.record(at.saturating_duration_since(sent_at));
            self.awareness.apply_delta(-1);
            self.acks.unregister(seq);
            return;
        }

        // Phase two: fan out through relays and open the stream fallback.
        tracing::debug!(node = %target.name, seq, "direct ping timed out, going indirect");
        let relays = self
            .registry
            .random_live_nodes(relay_budget, &[&target.name]);
        let relays_sent = relays.len();

        let indirect = IndirectPingReq {
            seq_no: seq,
            target: ip_to_bytes(target.addr),
            port: target.port,
            node: target.name.clone(),
            nack: true,
            source_addr: ip_to_bytes(local.addr),
            source_port: local.port,
            source_node: local.name.clone(),
        };
        for relay in &relays {
            match proto::encode(MessageType::IndirectPing, &indirect) {
                Ok(buf) => {
                    if let Err(e) = self
                        .dispatcher
                        .send_message(relay.socket_addr(), Some(relay), buf)
                        .await
                    {
                        tracing::debug!(relay = %relay.name, error = %e, "indirect ping send failed");
                    }
                }
                Err(e) => tracing::error!(error = %e, "failed to encode indirect ping"),
            }
        }

        let deadline = sent_at + self.config.probe_interval.saturating_sub(Duration::from_millis(10));
        let fallback = {
            let dispatcher = self.dispatcher.clone();
            let target = target.clone();
            let budget = deadline.saturating_duration_since(Instant::now());
            tokio::spawn(async move { dispatcher.stream_ping(&target, budget).await })
        };

        // Phase three: anything that arrives before the round deadline
        // counts; nacks tell us the relay path worked even if the target
        // did not.
        let mut nacks = 0usize;
        let mut acked = false;
        while let Ok(outcome) = tokio::time::timeout_at(deadline, rx.recv()).await {
            match outcome {
                Some(AckOutcome::Ack { at }) => {
                    self.rtt.record(at.saturating_duration_since(sent_at));
                    acked = true;
                    break;
                }
                Some(AckOutcome::Nack) => nacks += 1,
                None => break,
            }
        }
        self.acks.unregister(seq);

        if !acked {
            acked = matches!(fallback.await, Ok(true));
            if acked {
                tracing::warn!(
                    node = %target.name,
                    "stream fallback reached peer; packet path appears unhealthy"
                );
            }
        } else {
            fallback.abort();
        }

        if acked {
            self.awareness.apply_delta(-1);
            return;
        }

        // Missing nacks means the relay path itself is broken, which points
        // at our own connectivity rather than the target's.
        let mut delta = 1;
        if relays_sent > 0 && nacks < relays_sent {
            delta += 1;
        }
        self.awareness.apply_delta(delta);

        tracing::info!(node = %target.name, seq, "probe failed, marking suspect");
        self.registry.suspect_node(Suspect {
            incarnation: target.incarnation,
            node: target.name.clone(),
            from: local.name,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_table_routes_by_sequence() {
        let table = AckTable::new();
        let mut rx = table.register(7, 4);

        assert!(table.deliver_ack(7, Instant::now()));
        assert!(!table.deliver_ack(8, Instant::now()));

        assert!(matches!(rx.recv().await, Some(AckOutcome::Ack { .. })));

        table.unregister(7);
        assert!(!table.deliver_ack(7, Instant::now()));
    }

    #[tokio::test]
    async fn test_ack_table_delivers_nacks() {
        let table = AckTable::new();
        let mut rx = table.register(9, 4);

        assert!(table.deliver_nack(9));
        assert!(matches!(rx.recv().await, Some(AckOutcome::Nack)));
    }

    #[test]
    fn test_rtt_meter_p99() {
        let meter = RttMeter::new(8);
        assert_eq!(meter.p99(), None);

        for ms in [10, 20, 30, 40] {
            meter.record(Duration::from_millis(ms));
        }
        assert_eq!(meter.p99(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_rtt_meter_window_is_bounded() {
        let meter = RttMeter::new(4);
        meter.record(Duration::from_secs(100));
        for _ in 0..4 {
            meter.record(Duration::from_millis(1));
        }
        // The oversized outlier fell out of the window.
        assert_eq!(meter.p99(), Some(Duration::from_millis(1)));
    }
}
