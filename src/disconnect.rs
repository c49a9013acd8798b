// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Synthesizes and fires disconnect messages for every service a
//! client touched before going away.
//!
//! Grounded on `examples/original_source/src/common/librouter/disconnect.c`:
//! `disconnect_topic()`, `disconnect_hashkey()`, `disconnect_arm()` (named
//! `disconnect_msg` there), and `disconnect_fire()` (named `disconnect_destroy`
//! calling `disconnect_fire` in the original, collapsed here into one `fire`).

use indexmap::IndexMap;

use crate::message::{Message, MsgFlags, NodeId};

/// Derive the disconnect topic from a request topic (`spec.md` §6).
pub fn disconnect_topic(topic: &str) -> String {
    match topic.rfind('.') {
        Some(idx) => format!("{}.disconnect", &topic[..idx]),
        None => "disconnect".to_string(),
    }
}

/// Hash key for disconnect de-duplication (`spec.md` §6): only the
/// `UPSTREAM` bit survives into the key, everything else (e.g.
/// `STREAMING`) is filtered out.
pub fn disconnect_hashkey(distopic: &str, nodeid: NodeId, flags: MsgFlags) -> String {
    let upstream_bit = (flags & MsgFlags::UPSTREAM).bits();
    format!("{distopic}:{}:{upstream_bit}", nodeid.hashkey_value())
}

/// Holds at most one synthetic disconnect message per
/// `(service, nodeid, upstream-flag)` key seen.
#[derive(Debug, Default)]
pub struct DisconnectCache {
    armed: IndexMap<String, Message>,
}

impl DisconnectCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a disconnect for `msg`. A no-op for `NORESPONSE`-flagged
    /// messages, since there is no service interaction to unwind.
    pub fn arm(&mut self, msg: &Message) {
        if msg.is_noresponse() {
            return;
        }
        let distopic = disconnect_topic(&msg.topic);
        let key = disconnect_hashkey(&distopic, msg.nodeid, msg.flags);
        self.armed.entry(key).or_insert_with(|| {
            let mut dc = Message::event(distopic);
            dc.nodeid = msg.nodeid;
            dc.flags = msg.flags & MsgFlags::UPSTREAM;
            dc.flags |= MsgFlags::NORESPONSE;
            dc.route_stack = msg.route_stack.clone();
            dc.credential = msg.credential;
            dc
        });
    }

    /// Fire every armed disconnect, in insertion order, through `send`.
    pub fn fire<F: FnMut(Message)>(&mut self, mut send: F) {
        for (_, msg) in self.armed.drain(..) {
            send(msg);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.armed.len()
    }
}

#[cfg(test)]
#[path = "disconnect_tests.rs"]
mod tests;
