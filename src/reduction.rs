// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Topology-aware collective used at cluster wakeup: each rank unions
//! its descendants' rank idsets and forwards exactly one item upstream,
//! either once the running weight reaches a high-water mark or once a
//! timeout elapses, whichever comes first.
//!
//! Grounded on `examples/original_source/src/broker/hello.c`
//! (`r_reduce`/`r_sink`/`r_forward`/`r_itemweight`, `idset_request`/
//! `join_request`/`cancel_request`/`disconnect_request`). The original
//! drives dispatch through a `flux_reduce_t` state machine polled by the
//! reactor; this collector exposes the same `append`/timeout-driven
//! dispatch explicitly so the owning broker loop can `tokio::select!`
//! between inbound messages and a re-armed `tokio::time::Instant`
//! deadline, per `spec.md` §9's preference for explicit state over
//! implicit coroutines.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, warn};

use crate::error::ErrorKind;
use crate::idset::Idset;
use crate::message::{Message, MsgFlags, NodeId, MATCHTAG_NONE};
use crate::registry::Upstream;

/// Response deadline for the upstream `hello.join` RPC (`spec.md` §5).
/// Elapsing is non-fatal: the rank just logs and moves on, since the
/// parent may retry or the collective may complete some other way.
const JOIN_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-rank collector parameterized by `(size, rank, hwm, timeout)`
/// (`spec.md` §4.6). Replies to streaming listeners and forwards to
/// `UPSTREAM` are delivered through `on_reply`/`upstream` rather than a
/// direct Connection reference, so the collector stays decoupled from
/// the Router the way `hello.c` only ever touches `flux_t` handles.
pub struct ReductionCollector<U> {
    rank: u32,
    size: u32,
    hwm: usize,
    timeout: Duration,
    batch: Option<Idset>,
    global: Option<Idset>,
    listeners: Vec<Message>,
    deadline: Option<Instant>,
    upstream: U,
    on_reply: Box<dyn Fn(Message) + Send + Sync>,
}

impl<U: Upstream + Clone + 'static> ReductionCollector<U> {
    pub fn new(
        rank: u32,
        size: u32,
        hwm: usize,
        timeout: Duration,
        upstream: U,
        on_reply: impl Fn(Message) + Send + Sync + 'static,
    ) -> Self {
        Self {
            rank,
            size,
            hwm,
            timeout,
            batch: None,
            global: None,
            listeners: Vec::new(),
            deadline: None,
            upstream,
            on_reply: Box::new(on_reply),
        }
    }

    /// `hello_start`: contribute this rank's own idset and arm the
    /// flush deadline.
    pub fn start(&mut self) {
        self.append(Idset::singleton(self.rank));
    }

    /// `itemweight`: how many original contributions `item` represents.
    fn itemweight(item: &Idset) -> usize {
        item.count()
    }

    /// Add a contribution to the current (always batch 0) collective,
    /// reducing and dispatching immediately if the running weight has
    /// reached `hwm`.
    pub fn append(&mut self, item: Idset) {
        let merged = match self.batch.take() {
            Some(mut existing) => {
                existing.union_from(item);
                existing
            }
            None => item,
        };
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.timeout);
        }
        let weight = Self::itemweight(&merged);
        self.batch = Some(merged);
        if weight >= self.hwm {
            self.reduce_and_dispatch();
        }
    }

    /// Next instant the owning loop should wake the collector via
    /// [`ReductionCollector::on_timeout`], if a batch is pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Called by the owning loop once [`ReductionCollector::deadline`]
    /// has elapsed: flush whatever is pending, even if under `hwm`.
    pub fn on_timeout(&mut self) {
        if self.batch.is_some() {
            self.reduce_and_dispatch();
        } else {
            self.deadline = None;
        }
    }

    /// `r_reduce`: pop everything pending (there is always at most one
    /// merged item, per [`ReductionCollector::append`]'s invariant) and
    /// dispatch to sink or forward.
    fn reduce_and_dispatch(&mut self) {
        let Some(item) = self.batch.take() else { return };
        self.deadline = None;
        if self.rank == 0 {
            self.sink(item);
        } else {
            self.forward(item);
        }
    }

    /// `r_sink` (rank 0 only): union into the cluster-global idset and
    /// reply to every armed streaming listener in FIFO order.
    fn sink(&mut self, item: Idset) {
        match self.global.as_mut() {
            Some(global) => global.union_from(item),
            None => self.global = Some(item),
        }
        let snapshot = self.global.clone().unwrap_or_default();
        for listener in &self.listeners {
            let reply = listener.respond(serde_json::json!({
                "idset": snapshot.encode_bracketed(),
                "size": self.size,
            }));
            (self.on_reply)(reply);
        }
    }

    /// `r_forward` (rank > 0 only): encode the reduced item and RPC it
    /// upstream as `hello.join`, fire-and-forget with a response-timer
    /// continuation instead of blocking dispatch on the reply.
    fn forward(&mut self, item: Idset) {
        let upstream = self.upstream.clone();
        let encoded = item.encode_ranges();
        tokio::spawn(async move {
            let request = Message::request("hello.join", MATCHTAG_NONE)
                .with_payload(serde_json::json!({ "idset": encoded, "batch": 0 }))
                .with_nodeid(NodeId::Upstream)
                .with_flags(MsgFlags::UPSTREAM);
            match tokio::time::timeout(JOIN_RESPONSE_TIMEOUT, upstream.request(request)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "hello.join upstream error"),
                Err(_) => warn!("hello.join response timed out"),
            }
        });
    }

    /// `join_request`: a downstream rank's forwarded contribution,
    /// received at whichever rank is its immediate parent.
    pub fn handle_join(&mut self, request: &Message) -> Message {
        let idset_str = request.payload.get("idset").and_then(|v| v.as_str());
        let batch = request.payload.get("batch").and_then(|v| v.as_i64());
        let (idset_str, batch) = match (idset_str, batch) {
            (Some(s), Some(b)) => (s, b),
            _ => return request.respond_error(ErrorKind::Invalid, "join missing idset/batch"),
        };
        if batch != 0 {
            return request.respond_error(ErrorKind::Invalid, "join contains nonzero batch id");
        }
        let Some(item) = Idset::decode(idset_str) else {
            return request.respond_error(ErrorKind::Invalid, "join failed to decode idset");
        };
        self.append(item);
        request.respond(serde_json::Value::Null)
    }

    /// `idset_request` (rank 0 only): reply once with the current
    /// snapshot, and if `request` carries the `STREAMING` flag, keep it
    /// armed for every subsequent sink invocation until canceled or the
    /// sender disconnects.
    pub fn idset_request(&mut self, request: Message) -> Result<(), ErrorKind> {
        if self.rank > 0 {
            return Err(ErrorKind::Invalid);
        }
        let snapshot = self.global.clone().unwrap_or_default();
        let reply = request.respond(serde_json::json!({
            "idset": snapshot.encode_bracketed(),
            "size": self.size,
        }));
        (self.on_reply)(reply);
        if request.is_streaming() {
            self.listeners.push(request);
        }
        Ok(())
    }

    /// `cancel_request`: drop the one listener whose `(sender,
    /// matchtag)` matches, replying `Canceled` to it.
    pub fn cancel(&mut self, sender: &str, matchtag: u32) {
        if let Some(pos) = self
            .listeners
            .iter()
            .position(|m| m.route_stack.first() == Some(sender) && m.matchtag == matchtag)
        {
            let req = self.listeners.remove(pos);
            (self.on_reply)(req.respond_error(ErrorKind::Canceled, "Request was canceled"));
        }
    }

    /// `disconnect_request`: drop every listener whose first route hop
    /// is `sender`, without replying.
    pub fn disconnect(&mut self, sender: &str) {
        self.listeners.retain(|m| m.route_stack.first() != Some(sender));
    }

    /// `hello_get_count`/`hello_complete`: the number of distinct ranks
    /// observed so far at rank 0.
    pub fn count(&self) -> usize {
        self.global.as_ref().map_or(0, Idset::count)
    }

    /// `hello_complete`: every rank in `0..size` has been observed.
    pub fn is_complete(&self) -> bool {
        self.count() >= self.size as usize
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

#[cfg(test)]
#[path = "reduction_tests.rs"]
mod tests;
