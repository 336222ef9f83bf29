use thiserror::Error;

/// Errors surfaced by the membership engine.
///
/// Decode, network, and cryptographic failures are caught at the dispatch
/// boundary and logged; they never terminate the engine. Probe-protocol
/// errors are converted into state transitions by the failure detector.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("invalid checksum")]
    ChecksumMismatch,

    #[error("no installed keys could decrypt the message")]
    DecryptFailed,

    #[error("label mismatch: expected {expected:?}, got {got:?}")]
    LabelMismatch { expected: String, got: String },

    #[error("truncated message")]
    Truncated,

    #[error("unknown message type: {0}")]
    UnknownMessage(u8),

    #[error("ping addressed to wrong node: {0}")]
    WrongNode(String),

    #[error("sequence number mismatch: {0}")]
    SequenceMismatch(u32),

    #[error("engine is shut down")]
    Shutdown,

    #[error("join failed: {0}")]
    JoinFailed(String),

    #[error("incompatible protocol version: {0}")]
    VersionIncompatible(u8),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MeshError>;
