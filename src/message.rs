// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The message type routed between clients, modules, and the overlay.
//!
//! `spec.md` §1 deliberately leaves the wire format unconstrained beyond
//! observable behavior; this module picks a concrete in-memory
//! representation (not a byte-level codec) that the router, service
//! registry, and reduction collector operate on directly.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Maximum topic length in bytes (`spec.md` §3).
pub const MAX_TOPIC_LEN: usize = 256;

/// Correlation id sentinel meaning "no matchtag" (`FLUX_MATCHTAG_NONE`).
pub const MATCHTAG_NONE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    Request,
    Response,
    Event,
    Control,
}

bitflags! {
    /// Message flag bitset. `UPSTREAM`'s numeric value (`16`) matches
    /// the original `FLUX_MSGFLAG_UPSTREAM` because the disconnect
    /// hash-key derivation (`spec.md` §8.5) is specified against that
    /// concrete bit value.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u32 {
        const STREAMING  = 0b0000_0001;
        const NORESPONSE = 0b0000_0010;
        const UPSTREAM   = 0b0001_0000;
        const PRIVATE    = 0b0010_0000;
    }
}

/// Target of a message: a specific rank, any rank, or the parent
/// ("upstream") in the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeId {
    Rank(u32),
    Any,
    Upstream,
}

impl NodeId {
    /// Numeric encoding used in disconnect hash keys (`spec.md` §8.5):
    /// `ANY` prints as `u32::MAX`, matching `FLUX_NODEID_ANY`.
    pub fn hashkey_value(&self) -> u32 {
        match self {
            Self::Rank(r) => *r,
            Self::Any => u32::MAX,
            Self::Upstream => u32::MAX - 1,
        }
    }
}

bitflags! {
    /// Role bitmask, including the synthetic `LOCAL` role granted to
    /// same-node clients (`spec.md` §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoleMask: u32 {
        const OWNER = 0b0001;
        const USER  = 0b0010;
        const LOCAL = 0b0100;
        const ALL   = 0b1111;
    }
}

/// Sender identity and authorization attached to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credential {
    pub userid: u32,
    pub rolemask: RoleMask,
}

impl Credential {
    pub const OWNER: Credential = Credential { userid: 0, rolemask: RoleMask::OWNER };

    pub fn local(userid: u32) -> Self {
        Self { userid, rolemask: RoleMask::USER.union(RoleMask::LOCAL) }
    }
}

/// Ordered sequence of uuid hops a request accumulates as it is
/// forwarded; a response walks it back in reverse (`spec.md` §3,
/// `router.c`'s `flux_msg_route_push`/`flux_msg_route_last`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteStack(Vec<String>);

impl RouteStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, uuid: impl Into<String>) {
        self.0.push(uuid.into());
    }

    /// Last hop pushed, i.e. the next hop to deliver a response to.
    pub fn last(&self) -> Option<&str> {
        self.0.last().map(|s| s.as_str())
    }

    /// First hop pushed, i.e. the originating sender
    /// (`flux_msg_get_route_first`).
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(|s| s.as_str())
    }

    /// Remove and return the last hop (`flux_msg_route_delete_last`).
    pub fn pop(&mut self) -> Option<String> {
        self.0.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Hops in push order, oldest (sender) first.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

/// The unit of transport (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct Message {
    pub kind: MessageType,
    pub topic: String,
    pub payload: serde_json::Value,
    pub matchtag: u32,
    pub nodeid: NodeId,
    pub flags: MsgFlags,
    pub route_stack: RouteStack,
    pub credential: Credential,
}

impl Message {
    pub fn request(topic: impl Into<String>, matchtag: u32) -> Self {
        Self {
            kind: MessageType::Request,
            topic: topic.into(),
            payload: serde_json::Value::Null,
            matchtag,
            nodeid: NodeId::Any,
            flags: MsgFlags::empty(),
            route_stack: RouteStack::new(),
            credential: Credential::local(0),
        }
    }

    pub fn event(topic: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Event,
            topic: topic.into(),
            payload: serde_json::Value::Null,
            matchtag: MATCHTAG_NONE,
            nodeid: NodeId::Any,
            flags: MsgFlags::empty(),
            route_stack: RouteStack::new(),
            credential: Credential::local(0),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_flags(mut self, flags: MsgFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_nodeid(mut self, nodeid: NodeId) -> Self {
        self.nodeid = nodeid;
        self
    }

    /// A response to this request, echoing its topic and matchtag
    /// (`spec.md` §3: "Responses echo the request's matchtag").
    pub fn respond(&self, payload: serde_json::Value) -> Message {
        Message {
            kind: MessageType::Response,
            topic: self.topic.clone(),
            payload,
            matchtag: self.matchtag,
            nodeid: self.nodeid,
            flags: MsgFlags::empty(),
            route_stack: self.route_stack.clone(),
            credential: self.credential,
        }
    }

    /// An error response, payload carrying `{errno, errmsg}` the way
    /// `flux_response_encode_error` does.
    pub fn respond_error(&self, kind: crate::error::ErrorKind, message: &str) -> Message {
        self.respond(serde_json::json!({ "errno": kind.code(), "errmsg": message }))
    }

    pub fn is_noresponse(&self) -> bool {
        self.flags.contains(MsgFlags::NORESPONSE)
    }

    pub fn is_streaming(&self) -> bool {
        self.flags.contains(MsgFlags::STREAMING)
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
