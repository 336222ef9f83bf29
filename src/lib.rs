// rusty-mesh - Gossip-based cluster membership and failure detection
//
// A SWIM-style membership engine: a probe loop detects failures, a
// suspicion state machine with incarnation-based refutation keeps false
// positives survivable, queued broadcasts piggyback on protocol traffic,
// and periodic push/pull exchanges heal whatever the gossip path missed.
// The engine is a library; it speaks to the network only through the
// `Transport` trait and reports membership changes over event channels.

pub mod anti_entropy;
pub mod awareness;
pub mod cluster;
pub mod config;
pub mod error;
pub mod proto;
pub mod queue;
pub mod registry;
pub mod suspicion;
pub mod transport;
pub mod types;

mod dispatch;
mod probe;

pub use anti_entropy::StateDelegate;
pub use cluster::{Cluster, ClusterEvents};
pub use config::MeshConfig;
pub use error::{MeshError, Result};
pub use transport::mem::{MemHub, MemTransport};
pub use transport::net::NetTransport;
pub use transport::{MeshStream, Packet, Transport};
pub use types::{MemberEvent, Node, NodeId, NodeState};
