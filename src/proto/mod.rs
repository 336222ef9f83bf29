// Wire protocol: message tags and bodies
//
// Every packet and stream message begins with a single-byte type tag,
// followed by a self-describing MessagePack body (a map of string keys to
// typed values). Tag values and field names are part of the protocol surface
// and must not change.

pub mod codec;
pub mod crypto;

use crate::error::{MeshError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Wire message tags. The numeric values are fixed for compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Ping = 1,
    IndirectPing = 2,
    AckResp = 3,
    Suspect = 4,
    Alive = 5,
    Dead = 6,
    PushPull = 7,
    Compound = 8,
    User = 9,
    Compress = 10,
    Encrypt = 11,
    Nack = 12,
    HasCrc = 13,
    Err = 14,
    Label = 244,
}

impl MessageType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MessageType::Ping),
            2 => Some(MessageType::IndirectPing),
            3 => Some(MessageType::AckResp),
            4 => Some(MessageType::Suspect),
            5 => Some(MessageType::Alive),
            6 => Some(MessageType::Dead),
            7 => Some(MessageType::PushPull),
            8 => Some(MessageType::Compound),
            9 => Some(MessageType::User),
            10 => Some(MessageType::Compress),
            11 => Some(MessageType::Encrypt),
            12 => Some(MessageType::Nack),
            13 => Some(MessageType::HasCrc),
            14 => Some(MessageType::Err),
            244 => Some(MessageType::Label),
            _ => None,
        }
    }
}

/// Direct liveness probe. `node` carries the intended target name so a
/// mis-delivered ping is dropped instead of acked.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ping {
    pub seq_no: u32,
    pub node: Option<String>,
    pub source_addr: Vec<u8>,
    pub source_port: u16,
    pub source_node: String,
}

/// Request to probe `target` on behalf of `source_node`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IndirectPingReq {
    pub seq_no: u32,
    pub target: Vec<u8>,
    pub port: u16,
    pub node: String,
    pub nack: bool,
    pub source_addr: Vec<u8>,
    pub source_port: u16,
    pub source_node: String,
}

/// Acknowledgement of a direct, relayed, or stream ping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AckResp {
    pub seq_no: u32,
    pub payload: Vec<u8>,
}

/// Negative acknowledgement from an indirect-ping relay: the relay itself
/// could not reach the target.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Nack {
    pub seq_no: u32,
}

/// Claim that `node` may be down, asserted by `from`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Suspect {
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

/// Claim that `node` is alive at the given endpoint and incarnation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Alive {
    pub incarnation: u64,
    pub node: String,
    pub addr: Vec<u8>,
    pub port: u16,
    pub meta: Vec<u8>,
    pub vsn: [u8; 6],
}

/// Claim that `node` is dead. When `from == node` the node announced its own
/// departure and the state becomes `left` instead of `dead`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Dead {
    pub incarnation: u64,
    pub node: String,
    pub from: String,
}

/// Header of a push/pull full-state exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PushPullHeader {
    pub nodes: u32,
    pub user_state_len: u32,
    pub join: bool,
}

/// One node record in a push/pull exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PushNodeState {
    pub name: String,
    pub addr: Vec<u8>,
    pub port: u16,
    pub meta: Vec<u8>,
    pub incarnation: u64,
    pub state: u8,
    pub vsn: [u8; 6],
}

/// Remote-side rejection sent over a stream before it is closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ErrResp {
    pub error: String,
}

/// Encode a tagged message: one tag byte followed by the MessagePack body
/// with string field names.
pub fn encode(ty: MessageType, body: &impl Serialize) -> Result<Vec<u8>> {
    let mut buf = vec![ty as u8];
    let payload = rmp_serde::to_vec_named(body)
        .map_err(|e| MeshError::Serialization(e.to_string()))?;
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a message body. The caller has already consumed the tag byte.
pub fn decode_body<T: DeserializeOwned>(buf: &[u8]) -> Result<T> {
    rmp_serde::from_slice(buf).map_err(|e| MeshError::Serialization(e.to_string()))
}

/// Read the tag of a raw message, rejecting empty buffers.
pub fn peek_tag(buf: &[u8]) -> Result<u8> {
    buf.first().copied().ok_or(MeshError::Truncated)
}
