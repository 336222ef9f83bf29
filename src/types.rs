// Shared types for the membership engine
//
// Node identity, per-node liveness state, snapshot records, and the events
// delivered to the embedding application when the member set changes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Unique identifier for a node in the cluster.
///
/// Names are opaque strings, unique per cluster. The name is the primary
/// key; a node's network endpoint may change between incarnations.
pub type NodeId = String;

/// Oldest protocol version this engine can speak.
pub const PROTOCOL_VERSION_MIN: u8 = 1;
/// Newest protocol version this engine can speak. Checksummed packets are
/// emitted toward peers at version 5 or newer.
pub const PROTOCOL_VERSION_MAX: u8 = 5;

/// Liveness state of a node as seen by the local registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Node is alive and responding to probes
    Alive,
    /// Node missed a probe and is awaiting refutation or timeout
    Suspect,
    /// Node is confirmed dead
    Dead,
    /// Node left the cluster gracefully
    Left,
}

impl NodeState {
    /// Wire representation used in push/pull node records.
    pub fn as_u8(self) -> u8 {
        match self {
            NodeState::Alive => 0,
            NodeState::Suspect => 1,
            NodeState::Dead => 2,
            NodeState::Left => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(NodeState::Alive),
            1 => Some(NodeState::Suspect),
            2 => Some(NodeState::Dead),
            3 => Some(NodeState::Left),
            _ => None,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Alive => write!(f, "alive"),
            NodeState::Suspect => write!(f, "suspect"),
            NodeState::Dead => write!(f, "dead"),
            NodeState::Left => write!(f, "left"),
        }
    }
}

/// Protocol version vector advertised by every node:
/// `[proto_min, proto_max, proto_cur, delegate_min, delegate_max, delegate_cur]`.
pub type VersionVector = [u8; 6];

/// Snapshot record for one known node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Cluster-unique name
    pub name: NodeId,

    /// Network address
    pub addr: IpAddr,

    /// Port the node gossips on
    pub port: u16,

    /// Opaque application metadata carried in `alive` messages
    pub meta: Vec<u8>,

    /// Current liveness state
    pub state: NodeState,

    /// Lamport clock ordering liveness claims about this node
    pub incarnation: u64,

    /// Advertised protocol version vector
    pub vsn: VersionVector,
}

impl Node {
    /// The node's gossip endpoint.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.addr, self.port)
    }
}

/// Membership change events delivered to the embedding application.
#[derive(Debug, Clone)]
pub enum MemberEvent {
    /// A node joined the cluster, or rejoined after being declared dead
    Join(Node),

    /// A node was confirmed dead or left gracefully
    Leave(Node),

    /// A node's metadata or endpoint changed
    Update(Node),
}

impl MemberEvent {
    /// Name of the node the event concerns.
    pub fn node_name(&self) -> &str {
        match self {
            MemberEvent::Join(n) => &n.name,
            MemberEvent::Leave(n) => &n.name,
            MemberEvent::Update(n) => &n.name,
        }
    }
}

/// Encode an IP address to its wire form (4 or 16 bytes).
pub fn ip_to_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Decode an IP address from its wire form. Lengths other than 4 or 16 are
/// rejected.
pub fn ip_from_bytes(buf: &[u8]) -> Option<IpAddr> {
    match buf.len() {
        4 => {
            let mut b = [0u8; 4];
            b.copy_from_slice(buf);
            Some(IpAddr::V4(Ipv4Addr::from(b)))
        }
        16 => {
            let mut b = [0u8; 16];
            b.copy_from_slice(buf);
            Some(IpAddr::V6(Ipv6Addr::from(b)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_state_wire_roundtrip() {
        for state in [
            NodeState::Alive,
            NodeState::Suspect,
            NodeState::Dead,
            NodeState::Left,
        ] {
            assert_eq!(NodeState::from_u8(state.as_u8()), Some(state));
        }
        assert_eq!(NodeState::from_u8(4), None);
    }

    #[test]
    fn test_ip_roundtrip() {
        let v4: IpAddr = "192.168.1.10".parse().unwrap();
        assert_eq!(ip_from_bytes(&ip_to_bytes(v4)), Some(v4));

        let v6: IpAddr = "::1".parse().unwrap();
        assert_eq!(ip_from_bytes(&ip_to_bytes(v6)), Some(v6));

        assert_eq!(ip_from_bytes(&[1, 2, 3]), None);
    }
}
