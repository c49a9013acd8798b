// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Async add/remove of named services on behalf of clients, with
//! owner-uuid tracking for auto-cleanup on disconnect.
//!
//! Grounded on `examples/original_source/src/common/librouter/servhash.c`.
//! The original drives service (de)registration as zeromq-future
//! continuations chained off an RPC; this crate models the same
//! request/reply correlation as a plain `async fn` against an
//! [`Upstream`] implementor, the way the teacher crate awaits its own
//! network calls directly rather than chaining callbacks.

use indexmap::IndexMap;

use crate::error::ErrorKind;
use crate::message::Message;

/// Lifecycle state of a [`ServiceEntry`] (`spec.md` §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Registering,
    Live,
    Unregistering,
}

#[derive(Debug, Clone)]
struct ServiceEntry {
    owner: String,
    state: ServiceState,
}

/// The broker's one connection to the overlay (parent/sibling TBON),
/// shared by the [`ServiceRegistry`] and the
/// [`Router`](crate::router::Router) that embeds it.
pub trait Upstream: Send + Sync {
    /// Send `msg` upstream and await the matching response.
    fn request(
        &self,
        msg: Message,
    ) -> impl std::future::Future<Output = Result<Message, ErrorKind>> + Send;

    /// Forward `msg` upstream with no reply expected.
    fn send(&self, msg: Message);

    /// Arm an upstream event subscription.
    fn subscribe(&self, topic: &str) -> Result<(), ErrorKind>;

    /// Release an upstream event subscription.
    fn unsubscribe(&self, topic: &str) -> Result<(), ErrorKind>;
}

/// Tracks exactly one entry per service name, each owned by the uuid of
/// the Connection that registered it.
pub struct ServiceRegistry<U> {
    services: IndexMap<String, ServiceEntry>,
    upstream: U,
}

impl<U: Upstream> ServiceRegistry<U> {
    pub fn new(upstream: U) -> Self {
        Self { services: IndexMap::new(), upstream }
    }

    /// Register `name` on behalf of `owner_uuid`. `req_msg` is the
    /// client's original request, used as the basis for the upstream
    /// `service.add`.
    pub async fn add(
        &mut self,
        name: &str,
        owner_uuid: &str,
        req_msg: &Message,
    ) -> Result<(), ErrorKind> {
        if self.services.contains_key(name) {
            return Err(ErrorKind::ServiceExists);
        }
        self.services.insert(
            name.to_string(),
            ServiceEntry { owner: owner_uuid.to_string(), state: ServiceState::Registering },
        );
        let upstream_req = Message::request("service.add", req_msg.matchtag)
            .with_payload(serde_json::json!({ "service": name }));
        match self.upstream.request(upstream_req).await {
            Ok(_) => {
                if let Some(entry) = self.services.get_mut(name) {
                    entry.state = ServiceState::Live;
                }
                Ok(())
            }
            Err(e) => {
                self.services.shift_remove(name);
                Err(e)
            }
        }
    }

    /// Remove `name`, failing `NotOwner` unless it is `Live` and owned
    /// by `owner_uuid`.
    pub async fn remove(
        &mut self,
        name: &str,
        owner_uuid: &str,
        req_msg: &Message,
    ) -> Result<(), ErrorKind> {
        match self.services.get(name) {
            Some(entry) if entry.state == ServiceState::Live && entry.owner == owner_uuid => {}
            _ => return Err(ErrorKind::NotOwner),
        }
        if let Some(entry) = self.services.get_mut(name) {
            entry.state = ServiceState::Unregistering;
        }
        let upstream_req = Message::request("service.remove", req_msg.matchtag)
            .with_payload(serde_json::json!({ "service": name }));
        let result = self.upstream.request(upstream_req).await;
        self.services.shift_remove(name);
        result.map(|_| ())
    }

    /// Match a request topic against every `Live` service's
    /// `"<name>.*"` pattern, returning the owner uuid.
    pub fn matches(&self, topic: &str) -> Option<&str> {
        self.services.iter().find_map(|(name, entry)| {
            if entry.state == ServiceState::Live && topic_matches_service(topic, name) {
                Some(entry.owner.as_str())
            } else {
                None
            }
        })
    }

    /// Remove every entry owned by `owner_uuid`, best-effort upstream
    /// cleanup for anything not already `Unregistering`. No replies are
    /// sent to the departed owner.
    pub fn disconnect(&mut self, owner_uuid: &str) {
        let departing: Vec<String> = self
            .services
            .iter()
            .filter(|(_, e)| e.owner == owner_uuid)
            .map(|(name, _)| name.clone())
            .collect();
        for name in departing {
            if let Some(entry) = self.services.get(&name) {
                if entry.state != ServiceState::Unregistering {
                    self.upstream.send(Message::request(
                        "service.remove",
                        0,
                    ).with_payload(serde_json::json!({ "service": name })));
                }
            }
            self.services.shift_remove(&name);
        }
    }

    /// Re-issue `service.add` upstream for every `Live` entry,
    /// sequentially, after a transport reconnect.
    pub async fn renew(&mut self) -> Result<(), ErrorKind> {
        let live: Vec<String> = self
            .services
            .iter()
            .filter(|(_, e)| e.state == ServiceState::Live)
            .map(|(name, _)| name.clone())
            .collect();
        for name in live {
            let req = Message::request("service.add", 0)
                .with_payload(serde_json::json!({ "service": name }));
            self.upstream.request(req).await?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn topic_matches_service(topic: &str, name: &str) -> bool {
    topic.strip_prefix(name).is_some_and(|rest| rest.starts_with('.'))
}

/// An [`Upstream`] for a parentless broker (rank 0 of a single-rank
/// overlay, i.e. `size == 1`). `spec.md` §6 leaves the TBON wire format
/// out of scope, so this crate ships no real network dialer; a
/// multi-rank deployment supplies its own [`Upstream`] wired to that
/// transport instead of this one.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandaloneUpstream;

impl Upstream for StandaloneUpstream {
    async fn request(&self, _msg: Message) -> Result<Message, ErrorKind> {
        Err(ErrorKind::HostUnreachable)
    }

    fn send(&self, msg: Message) {
        tracing::warn!(topic = %msg.topic, "no upstream connection, dropping message");
    }

    fn subscribe(&self, _topic: &str) -> Result<(), ErrorKind> {
        Ok(())
    }

    fn unsubscribe(&self, _topic: &str) -> Result<(), ErrorKind> {
        Ok(())
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
