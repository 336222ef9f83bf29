// Engine configuration
//
// All timing, fanout, and framing knobs in one explicit record. The engine
// never consults process-wide state; everything it needs is threaded through
// this configuration and the handle that owns it.

use crate::error::{MeshError, Result};
use crate::types::{NodeId, PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN};
use std::net::SocketAddr;
use std::time::Duration;

/// Maximum label length accepted in the label envelope.
pub const MAX_LABEL_LEN: usize = 255;

/// Configuration for a membership engine instance.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Cluster-unique node name. Primary key for this node's identity.
    pub name: NodeId,

    /// Address the transport binds to.
    pub bind_addr: SocketAddr,

    /// Address advertised to peers, when it differs from the bind address
    /// (NAT, containers). `None` advertises the bind address.
    pub advertise_addr: Option<SocketAddr>,

    /// Opaque metadata gossiped with our `alive` claims.
    pub meta: Vec<u8>,

    /// Cadence of the failure-detector probe loop. Scaled up by the
    /// awareness score under adverse conditions.
    pub probe_interval: Duration,

    /// Deadline for a direct-ping ack before escalating to indirect probes.
    pub probe_timeout: Duration,

    /// Number of relays used for indirect pings.
    pub indirect_checks: usize,

    /// Retransmit cap multiplier: each broadcast is sent at most
    /// `ceil(retransmit_mult * log2(n + 1))` times.
    pub retransmit_mult: usize,

    /// Multiplier for the minimum suspicion window.
    pub suspicion_mult: u32,

    /// Multiplier applied on top of the minimum to form the maximum
    /// suspicion window.
    pub suspicion_max_timeout_mult: u32,

    /// Cadence of the gossip loop.
    pub gossip_interval: Duration,

    /// Number of peers each gossip tick fans out to.
    pub gossip_nodes: usize,

    /// How long a dead node keeps receiving gossip, measured from its last
    /// state change, so it can learn of its own death and refute or rejoin.
    pub gossip_to_the_dead: Duration,

    /// Cadence of the push/pull anti-entropy loop. Scaled up with cluster
    /// size.
    pub push_pull_interval: Duration,

    /// Maximum UDP payload produced for outgoing gossip.
    pub udp_buffer_size: usize,

    /// Wrap large outgoing gossip in the compression envelope.
    pub enable_compression: bool,

    /// Primary encryption key (16 or 32 bytes). Enables the AEAD envelope on
    /// every packet and stream.
    pub secret_key: Option<Vec<u8>>,

    /// Additional decryption keys for key rotation. Decryption tries the
    /// primary key first, then these in order.
    pub extra_keys: Vec<Vec<u8>>,

    /// Cluster label. When non-empty every outgoing packet carries a label
    /// prefix and inbound packets must carry a matching one.
    pub label: String,

    /// Accept unlabelled inbound packets even when a label is configured.
    pub skip_inbound_label_check: bool,

    /// Protocol version advertised to peers. Checksummed packets are only
    /// emitted toward peers advertising version 5 or newer.
    pub protocol_version: u8,

    /// Upper bound of the awareness score; effective timeouts scale by
    /// `1 + score`.
    pub awareness_max_multiplier: u8,

    /// Scale probe timeouts by the 99th percentile of recently observed
    /// round-trip times instead of the fixed `probe_timeout`.
    pub adaptive_timeouts: bool,

    /// Window after which a dead node's record is reclaimable: an `alive`
    /// claim for it is treated as a brand-new node rather than
    /// conflict-checked against the stale record.
    pub dead_node_reclaim_time: Duration,

    /// Bound on the inbound packet queue; overflow drops the oldest packets.
    pub handoff_queue_depth: usize,

    /// Deadline for opening and exchanging on a reliable stream.
    pub stream_timeout: Duration,
}

impl MeshConfig {
    /// Sensible defaults for a local network: fast probes and gossip.
    pub fn lan(name: impl Into<NodeId>) -> Self {
        Self {
            name: name.into(),
            bind_addr: "0.0.0.0:7946".parse().expect("valid address"),
            advertise_addr: None,
            meta: Vec::new(),
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            retransmit_mult: 4,
            suspicion_mult: 4,
            suspicion_max_timeout_mult: 6,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            gossip_to_the_dead: Duration::from_secs(30),
            push_pull_interval: Duration::from_secs(30),
            udp_buffer_size: 1400,
            enable_compression: false,
            secret_key: None,
            extra_keys: Vec::new(),
            label: String::new(),
            skip_inbound_label_check: false,
            protocol_version: PROTOCOL_VERSION_MAX,
            awareness_max_multiplier: 8,
            adaptive_timeouts: false,
            dead_node_reclaim_time: Duration::from_secs(30),
            handoff_queue_depth: 1024,
            stream_timeout: Duration::from_secs(10),
        }
    }

    /// Defaults for wide-area clusters: slower cadence, larger fanout,
    /// compression on.
    pub fn wan(name: impl Into<NodeId>) -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            suspicion_mult: 6,
            gossip_interval: Duration::from_millis(500),
            gossip_nodes: 4,
            push_pull_interval: Duration::from_secs(60),
            enable_compression: true,
            ..Self::lan(name)
        }
    }

    /// Defaults for loopback test clusters: aggressive timing.
    pub fn local(name: impl Into<NodeId>) -> Self {
        Self {
            probe_interval: Duration::from_millis(200),
            probe_timeout: Duration::from_millis(100),
            suspicion_mult: 3,
            gossip_interval: Duration::from_millis(100),
            gossip_to_the_dead: Duration::from_secs(5),
            push_pull_interval: Duration::from_secs(15),
            ..Self::lan(name)
        }
    }

    /// Set the bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set node metadata.
    pub fn with_meta(mut self, meta: Vec<u8>) -> Self {
        self.meta = meta;
        self
    }

    /// Set the primary encryption key.
    pub fn with_secret_key(mut self, key: Vec<u8>) -> Self {
        self.secret_key = Some(key);
        self
    }

    /// Set the cluster label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// The address advertised to peers.
    pub fn advertised(&self) -> SocketAddr {
        self.advertise_addr.unwrap_or(self.bind_addr)
    }

    /// Protocol version vector gossiped in `alive` messages. The delegate
    /// slots are reserved and currently pinned to zero.
    pub fn version_vector(&self) -> [u8; 6] {
        [
            PROTOCOL_VERSION_MIN,
            PROTOCOL_VERSION_MAX,
            self.protocol_version,
            0,
            0,
            0,
        ]
    }

    /// Minimum and maximum suspicion windows for a cluster of `n` members.
    ///
    /// The minimum scales with log10 of the cluster size so that large
    /// clusters wait long enough for refutations to propagate; the maximum
    /// is a fixed multiple of the minimum.
    pub fn suspicion_timeouts(&self, n: usize) -> (Duration, Duration) {
        let node_scale = (n.max(1) as f64).log10().max(1.0);
        let min = self.probe_interval.mul_f64(self.suspicion_mult as f64 * node_scale);
        let max = min * self.suspicion_max_timeout_mult;
        (min, max)
    }

    /// Number of independent confirmations expected to drive the suspicion
    /// window down to its minimum. Small clusters cannot produce enough
    /// confirmations, so the expectation collapses to zero there.
    pub fn suspicion_confirmations(&self, n: usize) -> u32 {
        let k = self.suspicion_mult.saturating_sub(2);
        if n < (k as usize) + 2 {
            0
        } else {
            k
        }
    }

    /// Push/pull interval scaled up with cluster size to keep the aggregate
    /// full-state traffic bounded.
    pub fn scaled_push_pull_interval(&self, n: usize) -> Duration {
        let base = 32f64;
        let scale = ((n + 1) as f64).log2() / base.log2();
        if scale > 1.0 {
            self.push_pull_interval.mul_f64(scale)
        } else {
            self.push_pull_interval
        }
    }

    /// Validate the configuration before the engine starts.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MeshError::Configuration("node name must not be empty".into()));
        }
        if self.label.len() > MAX_LABEL_LEN {
            return Err(MeshError::Configuration(format!(
                "label must be at most {} bytes, got {}",
                MAX_LABEL_LEN,
                self.label.len()
            )));
        }
        for key in self.secret_key.iter().chain(self.extra_keys.iter()) {
            if key.len() != 16 && key.len() != 32 {
                return Err(MeshError::Configuration(format!(
                    "encryption keys must be 16 or 32 bytes, got {}",
                    key.len()
                )));
            }
        }
        if !self.extra_keys.is_empty() && self.secret_key.is_none() {
            return Err(MeshError::Configuration(
                "extra keys require a primary secret key".into(),
            ));
        }
        if self.protocol_version < PROTOCOL_VERSION_MIN
            || self.protocol_version > PROTOCOL_VERSION_MAX
        {
            return Err(MeshError::VersionIncompatible(self.protocol_version));
        }
        if self.udp_buffer_size < 512 {
            return Err(MeshError::Configuration(
                "udp_buffer_size must be at least 512 bytes".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(MeshConfig::lan("node1").validate().is_ok());
        assert!(MeshConfig::wan("node1").validate().is_ok());
        assert!(MeshConfig::local("node1").validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_key_length() {
        let config = MeshConfig::lan("node1").with_secret_key(vec![0u8; 5]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_name() {
        assert!(MeshConfig::lan("").validate().is_err());
    }

    #[test]
    fn test_suspicion_windows_scale_with_cluster_size() {
        let config = MeshConfig::lan("node1");
        let (min_small, max_small) = config.suspicion_timeouts(3);
        let (min_large, _) = config.suspicion_timeouts(1000);

        assert!(min_large > min_small);
        assert_eq!(max_small, min_small * config.suspicion_max_timeout_mult);
    }

    #[test]
    fn test_suspicion_confirmations_collapse_for_tiny_clusters() {
        let config = MeshConfig::lan("node1");
        assert_eq!(config.suspicion_confirmations(2), 0);
        assert_eq!(config.suspicion_confirmations(100), config.suspicion_mult - 2);
    }

    #[test]
    fn test_push_pull_scaling_is_monotone() {
        let config = MeshConfig::lan("node1");
        assert_eq!(
            config.scaled_push_pull_interval(10),
            config.push_pull_interval
        );
        assert!(config.scaled_push_pull_interval(500) > config.push_pull_interval);
    }
}
