// Push/pull anti-entropy
//
// Periodic reliable full-state exchange with one random peer. Both sides
// stream their complete member list plus an opaque application state blob,
// then feed the remote records through the registry state machine. This
// heals any divergence the unreliable gossip path left behind.

use crate::dispatch::Dispatcher;
use crate::error::{MeshError, Result};
use crate::proto::{self, MessageType, PushNodeState, PushPullHeader};
use crate::transport::MeshStream;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;

/// Application hook carrying opaque state in push/pull exchanges.
pub trait StateDelegate: Send + Sync {
    /// State blob to ship with our next exchange.
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Remote blob received in an exchange.
    fn merge_state(&self, buf: &[u8], join: bool);
}

/// Run the initiator side of an exchange over a freshly dialed stream.
pub(crate) async fn initiate(
    dispatcher: &Arc<Dispatcher>,
    stream: &mut Box<dyn MeshStream>,
    join: bool,
) -> Result<()> {
    dispatcher.write_stream_preamble(stream).await?;
    send_local_state(dispatcher, stream, join).await?;

    let (tag, payload) = dispatcher.read_frame(stream).await?;
    match MessageType::from_u8(tag) {
        Some(MessageType::PushPull) => {}
        Some(MessageType::Err) => {
            let err: proto::ErrResp = proto::decode_body(&payload)?;
            return Err(MeshError::Transport(err.error));
        }
        _ => return Err(MeshError::UnknownMessage(tag)),
    }

    apply_remote(dispatcher, &payload, join)
}

/// Run the responder side: the request frame has already been read by the
/// stream demultiplexer.
pub(crate) async fn serve(
    dispatcher: &Arc<Dispatcher>,
    stream: &mut Box<dyn MeshStream>,
    request: &[u8],
    from: SocketAddr,
) -> Result<()> {
    // Reply with our state before merging theirs, so the response reflects
    // what we believed when the exchange started.
    send_local_state(dispatcher, stream, false).await?;

    tracing::debug!(addr = %from, "push/pull exchange served");
    apply_remote(dispatcher, request, false)
}

fn apply_remote(dispatcher: &Arc<Dispatcher>, payload: &[u8], join: bool) -> Result<()> {
    let (remote, user_state, _remote_join) = decode_state(payload)?;
    dispatcher.registry().merge_remote_state(remote)?;
    if !user_state.is_empty() {
        if let Some(delegate) = dispatcher.state_delegate() {
            delegate.merge_state(&user_state, join);
        }
    }
    Ok(())
}

async fn send_local_state(
    dispatcher: &Arc<Dispatcher>,
    stream: &mut Box<dyn MeshStream>,
    join: bool,
) -> Result<()> {
    let states = dispatcher.registry().push_states();
    let user_state = dispatcher
        .state_delegate()
        .map(|d| d.local_state(join))
        .unwrap_or_default();

    let payload = encode_state(&states, &user_state, join)?;
    dispatcher
        .write_frame(stream, MessageType::PushPull, &payload)
        .await
}

/// Header, then `nodes` records, then the raw user-state bytes.
fn encode_state(states: &[PushNodeState], user_state: &[u8], join: bool) -> Result<Vec<u8>> {
    let header = PushPullHeader {
        nodes: states.len() as u32,
        user_state_len: user_state.len() as u32,
        join,
    };
    let mut buf =
        rmp_serde::to_vec_named(&header).map_err(|e| MeshError::Serialization(e.to_string()))?;
    for state in states {
        let encoded =
            rmp_serde::to_vec_named(state).map_err(|e| MeshError::Serialization(e.to_string()))?;
        buf.extend_from_slice(&encoded);
    }
    buf.extend_from_slice(user_state);
    Ok(buf)
}

fn decode_state(buf: &[u8]) -> Result<(Vec<PushNodeState>, Vec<u8>, bool)> {
    let mut cursor = std::io::Cursor::new(buf);
    let header: PushPullHeader = rmp_serde::decode::from_read(&mut cursor)
        .map_err(|e| MeshError::Serialization(e.to_string()))?;

    let mut states = Vec::with_capacity(header.nodes as usize);
    for _ in 0..header.nodes {
        let state: PushNodeState = rmp_serde::decode::from_read(&mut cursor)
            .map_err(|_| MeshError::Truncated)?;
        states.push(state);
    }

    let mut user_state = vec![0u8; header.user_state_len as usize];
    cursor
        .read_exact(&mut user_state)
        .map_err(|_| MeshError::Truncated)?;

    Ok((states, user_state, header.join))
}
