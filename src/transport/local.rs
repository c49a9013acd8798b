// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Unix-domain-socket transport for local clients: each connection is
//! framed as a 4-byte big-endian length prefix followed by a JSON
//! envelope. `spec.md` §6 only requires that clients exchange
//! `Message`s with the broker, not a specific wire format; JSON-over-
//! length-prefix is this crate's concrete pick, the same shape the
//! teacher crate frames its WebSocket JSON messages in
//! `transport/ws_mux.rs`, minus the HTTP upgrade handshake this crate
//! has no use for.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};

use crate::error::ErrorKind;
use crate::message::{Credential, Message, MessageType, MsgFlags, NodeId, RoleMask, RouteStack};

/// Largest single frame this transport accepts, guarding against a
/// misbehaving peer claiming an unbounded length prefix.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

static CONN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A short, process-unique connection id, standing in for the
/// original's 5-character addressable `uuid` strings (`spec.md` §3)
/// without pulling in a UUIDv4 dependency this crate has no other use
/// for.
pub fn generate_uuid() -> String {
    let n = CONN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:05x}", n & 0xF_FFFF)
}

#[derive(Debug, Serialize, Deserialize)]
struct WireNodeId {
    rank: Option<u32>,
    any: bool,
    upstream: bool,
}

impl From<NodeId> for WireNodeId {
    fn from(nodeid: NodeId) -> Self {
        match nodeid {
            NodeId::Rank(r) => WireNodeId { rank: Some(r), any: false, upstream: false },
            NodeId::Any => WireNodeId { rank: None, any: true, upstream: false },
            NodeId::Upstream => WireNodeId { rank: None, any: false, upstream: true },
        }
    }
}

impl From<WireNodeId> for NodeId {
    fn from(w: WireNodeId) -> Self {
        match w.rank {
            Some(r) => NodeId::Rank(r),
            None if w.upstream => NodeId::Upstream,
            None => NodeId::Any,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    kind: MessageType,
    topic: String,
    payload: serde_json::Value,
    matchtag: u32,
    nodeid: WireNodeId,
    flags: u32,
    route_stack: Vec<String>,
    credential_userid: u32,
    credential_rolemask: u32,
}

impl From<&Message> for WireMessage {
    fn from(msg: &Message) -> Self {
        WireMessage {
            kind: msg.kind,
            topic: msg.topic.clone(),
            payload: msg.payload.clone(),
            matchtag: msg.matchtag,
            nodeid: msg.nodeid.into(),
            flags: msg.flags.bits(),
            route_stack: msg.route_stack.iter().map(str::to_string).collect(),
            credential_userid: msg.credential.userid,
            credential_rolemask: msg.credential.rolemask.bits(),
        }
    }
}

impl From<WireMessage> for Message {
    fn from(w: WireMessage) -> Self {
        let mut route_stack = RouteStack::new();
        for hop in w.route_stack {
            route_stack.push(hop);
        }
        Message {
            kind: w.kind,
            topic: w.topic,
            payload: w.payload,
            matchtag: w.matchtag,
            nodeid: w.nodeid.into(),
            flags: MsgFlags::from_bits_truncate(w.flags),
            route_stack,
            credential: Credential {
                userid: w.credential_userid,
                rolemask: RoleMask::from_bits_truncate(w.credential_rolemask),
            },
        }
    }
}

/// Serialize `msg` as a length-prefixed JSON frame.
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, ErrorKind> {
    let wire = WireMessage::from(msg);
    let body = serde_json::to_vec(&wire).map_err(|_| ErrorKind::Invalid)?;
    let len = u32::try_from(body.len()).map_err(|_| ErrorKind::Invalid)?;
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Deserialize one JSON frame body (length prefix already consumed).
pub fn decode_frame(body: &[u8]) -> Result<Message, ErrorKind> {
    let wire: WireMessage = serde_json::from_slice(body).map_err(|_| ErrorKind::Invalid)?;
    Ok(Message::from(wire))
}

/// A single accepted client connection, framed for read/write.
pub struct UnixClientConn {
    stream: UnixStream,
}

impl UnixClientConn {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), ErrorKind> {
        let framed = encode_frame(msg)?;
        self.stream.write_all(&framed).await.map_err(|_| ErrorKind::PeerGone)
    }

    /// Read the next frame, or `None` on a clean peer shutdown.
    pub async fn recv(&mut self) -> Result<Option<Message>, ErrorKind> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(_) => return Err(ErrorKind::PeerGone),
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(ErrorKind::Invalid);
        }
        let mut body = vec![0u8; len as usize];
        self.stream.read_exact(&mut body).await.map_err(|_| ErrorKind::PeerGone)?;
        decode_frame(&body).map(Some)
    }

    /// Split into independent read/write halves, so a broker can run one
    /// task pumping `recv()` into the broker's client channel while the
    /// broker's own Connection `send` closure writes out the other half
    /// from whichever task dispatch happens to run on.
    pub fn into_split(self) -> (UnixClientReader, UnixClientWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (UnixClientReader { half: read_half }, UnixClientWriter { half: write_half })
    }
}

/// The read half of a split [`UnixClientConn`].
pub struct UnixClientReader {
    half: OwnedReadHalf,
}

impl UnixClientReader {
    /// Read the next frame, or `None` on a clean peer shutdown.
    pub async fn recv(&mut self) -> Result<Option<Message>, ErrorKind> {
        let mut len_buf = [0u8; 4];
        match self.half.read_exact(&mut len_buf).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(_) => return Err(ErrorKind::PeerGone),
        }
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_LEN {
            return Err(ErrorKind::Invalid);
        }
        let mut body = vec![0u8; len as usize];
        self.half.read_exact(&mut body).await.map_err(|_| ErrorKind::PeerGone)?;
        decode_frame(&body).map(Some)
    }
}

/// The write half of a split [`UnixClientConn`].
pub struct UnixClientWriter {
    half: OwnedWriteHalf,
}

impl UnixClientWriter {
    pub async fn send(&mut self, msg: &Message) -> Result<(), ErrorKind> {
        let framed = encode_frame(msg)?;
        self.half.write_all(&framed).await.map_err(|_| ErrorKind::PeerGone)
    }
}

/// Listens on a Unix domain socket, handing each accepted connection a
/// freshly generated uuid.
pub struct UnixSocketTransport {
    listener: UnixListener,
}

impl UnixSocketTransport {
    pub fn bind(path: impl AsRef<std::path::Path>) -> Result<Self, ErrorKind> {
        let path = path.as_ref();
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path).map_err(|_| ErrorKind::Invalid)?;
        Ok(Self { listener })
    }

    /// Accept the next client, returning its assigned uuid and framed
    /// connection handle.
    pub async fn accept(&self) -> Result<(String, UnixClientConn), ErrorKind> {
        let (stream, _addr) = self.listener.accept().await.map_err(|_| ErrorKind::HostUnreachable)?;
        Ok((generate_uuid(), UnixClientConn::new(stream)))
    }
}

#[cfg(test)]
#[path = "local_tests.rs"]
mod tests;
