// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Single-node multiplexer: client<->broker message conditioning,
//! service match, event fanout, connection lifecycle.
//!
//! Grounded on `examples/original_source/src/common/librouter/router.c`
//! (`router_entry_recv`, `broker_request_in`/`broker_response_in`/
//! `broker_event_in`, `disconnect_cb`) and the teacher's
//! `crates/cli/src/broker/mux.rs` event-fanout shape (iterate
//! connections in a stable order, log per-peer send failures without
//! aborting the loop).

use indexmap::IndexMap;
use tracing::warn;

use crate::disconnect::DisconnectCache;
use crate::error::ErrorKind;
use crate::message::{Message, MessageType};
use crate::registry::{ServiceRegistry, Upstream};
use crate::subscription::SubscriptionSet;

/// A client peer accepted by the broker.
pub struct Connection {
    pub uuid: String,
    subscriptions: SubscriptionSet,
    disconnects: DisconnectCache,
    send: Box<dyn Fn(Message) + Send + Sync>,
}

impl Connection {
    pub fn new(uuid: impl Into<String>, send: impl Fn(Message) + Send + Sync + 'static) -> Self {
        Self {
            uuid: uuid.into(),
            subscriptions: SubscriptionSet::new(),
            disconnects: DisconnectCache::new(),
            send: Box::new(send),
        }
    }
}

const INTERCEPTED_TOPICS: [&str; 4] =
    ["event.subscribe", "event.unsubscribe", "service.add", "service.remove"];

/// Single-node hub owning the connections map, the router-level
/// subscription set, and the service registry bound to the upstream
/// transport.
pub struct Router<U> {
    connections: IndexMap<String, Connection>,
    subs: SubscriptionSet,
    registry: ServiceRegistry<U>,
    upstream: U,
    muted: bool,
}

impl<U: Upstream + Clone> Router<U> {
    pub fn new(upstream: U) -> Self {
        Self {
            connections: IndexMap::new(),
            subs: SubscriptionSet::new(),
            registry: ServiceRegistry::new(upstream.clone()),
            upstream,
            muted: false,
        }
    }

    /// Register a Connection, failing `AlreadyExists` if `uuid` is
    /// already present.
    pub fn add_entry(
        &mut self,
        uuid: impl Into<String>,
        send: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<(), ErrorKind> {
        let uuid = uuid.into();
        if self.connections.contains_key(&uuid) {
            return Err(ErrorKind::AlreadyExists);
        }
        self.connections.insert(uuid.clone(), Connection::new(uuid, send));
        Ok(())
    }

    /// Remove a Connection: release all of its subscriptions (cascading
    /// upstream unsubscribes) and fire its armed disconnects.
    pub fn delete_entry(&mut self, uuid: &str) {
        let Some(mut conn) = self.connections.shift_remove(uuid) else {
            return;
        };

        let topics: Vec<String> = conn.subscriptions.topics().map(str::to_string).collect();
        let subs = &mut self.subs;
        let upstream = &self.upstream;
        let muted = self.muted;
        for topic in topics {
            let _ = conn.subscriptions.unsubscribe(&topic, |t| {
                subs.unsubscribe(t, |t2| if muted { Ok(()) } else { upstream.unsubscribe(t2) })
            });
        }

        conn.disconnects.fire(|msg| self.upstream.send(msg));
        self.registry.disconnect(&conn.uuid);
    }

    /// Stop generating upstream unsubscribes, used during shutdown to
    /// avoid deadlock with the broker being torn down.
    pub fn mute(&mut self) {
        self.muted = true;
    }

    /// Replay subscriptions and service registrations upstream after a
    /// transport reconnect.
    pub async fn renew(&mut self) -> Result<(), ErrorKind> {
        let upstream = &self.upstream;
        self.subs.renew(|t| upstream.subscribe(t))?;
        self.registry.renew().await
    }

    /// Process an inbound message from Connection `uuid`.
    pub async fn recv_from_client(&mut self, uuid: &str, msg: Message) -> Result<(), ErrorKind> {
        if msg.kind == MessageType::Request && INTERCEPTED_TOPICS.contains(&msg.topic.as_str()) {
            return self.handle_internal_request(uuid, msg).await;
        }

        match msg.kind {
            MessageType::Request => {
                let Some(conn) = self.connections.get_mut(uuid) else {
                    return Err(ErrorKind::Invalid);
                };
                let mut forwarded = msg.clone();
                forwarded.route_stack.push(uuid);
                conn.disconnects.arm(&msg);
                self.upstream.send(forwarded);
            }
            MessageType::Response | MessageType::Event => {
                self.upstream.send(msg);
            }
            MessageType::Control => {}
        }
        Ok(())
    }

    async fn handle_internal_request(
        &mut self,
        uuid: &str,
        msg: Message,
    ) -> Result<(), ErrorKind> {
        match msg.topic.as_str() {
            "event.subscribe" => {
                let topic = msg.payload["topic"].as_str().unwrap_or_default().to_string();
                let result = self.do_subscribe(uuid, &topic);
                self.reply_to(uuid, &msg, result);
            }
            "event.unsubscribe" => {
                let topic = msg.payload["topic"].as_str().unwrap_or_default().to_string();
                let result = self.do_unsubscribe(uuid, &topic);
                self.reply_to(uuid, &msg, result);
            }
            "service.add" => {
                let name = msg.payload["service"].as_str().unwrap_or_default().to_string();
                let result = self.registry.add(&name, uuid, &msg).await;
                self.reply_to(uuid, &msg, result);
            }
            "service.remove" => {
                let name = msg.payload["service"].as_str().unwrap_or_default().to_string();
                let result = self.registry.remove(&name, uuid, &msg).await;
                self.reply_to(uuid, &msg, result);
            }
            _ => unreachable!("caller filters to intercepted topics"),
        }
        Ok(())
    }

    fn do_subscribe(&mut self, uuid: &str, topic: &str) -> Result<(), ErrorKind> {
        let subs = &mut self.subs;
        let upstream = &self.upstream;
        let conn = self.connections.get_mut(uuid).ok_or(ErrorKind::Invalid)?;
        conn.subscriptions.subscribe(topic, |t| subs.subscribe(t, |t2| upstream.subscribe(t2)))
    }

    fn do_unsubscribe(&mut self, uuid: &str, topic: &str) -> Result<(), ErrorKind> {
        let subs = &mut self.subs;
        let upstream = &self.upstream;
        let muted = self.muted;
        let conn = self.connections.get_mut(uuid).ok_or(ErrorKind::Invalid)?;
        conn.subscriptions.unsubscribe(topic, |t| {
            subs.unsubscribe(t, |t2| if muted { Ok(()) } else { upstream.unsubscribe(t2) })
        })
    }

    fn reply_to(&self, uuid: &str, req: &Message, result: Result<(), ErrorKind>) {
        if req.is_noresponse() {
            return;
        }
        let Some(conn) = self.connections.get(uuid) else { return };
        let reply = match result {
            Ok(()) => req.respond(serde_json::Value::Null),
            Err(e) => req.respond_error(e, e.as_str()),
        };
        (conn.send)(reply);
    }

    /// `broker_request_in`: match against the service registry and
    /// deliver to the owning Connection, or respond `NoSuchMethod`
    /// upstream.
    pub fn dispatch_request_in(&self, msg: Message) {
        match self.registry.matches(&msg.topic) {
            Some(uuid) => {
                if let Some(conn) = self.connections.get(uuid) {
                    (conn.send)(msg);
                } else {
                    warn!(uuid, "service owner connection missing, dropping request");
                }
            }
            None => self.upstream.send(msg.respond_error(ErrorKind::NoSuchMethod, "no such method")),
        }
    }

    /// `broker_response_in`: pop the tail of the route stack to find
    /// the target Connection.
    pub fn dispatch_response_in(&self, mut msg: Message) -> Result<(), ErrorKind> {
        let Some(uuid) = msg.route_stack.pop() else {
            return Err(ErrorKind::HostUnreachable);
        };
        match self.connections.get(&uuid) {
            Some(conn) => {
                (conn.send)(msg);
                Ok(())
            }
            None => Err(ErrorKind::HostUnreachable),
        }
    }

    /// `broker_event_in`: forward to every Connection, in insertion
    /// order, whose subscriptions match the topic. Per-peer send
    /// failures are logged, not propagated.
    pub fn dispatch_event_in(&self, msg: Message) {
        for conn in self.connections.values() {
            if conn.subscriptions.matches(&msg.topic) {
                (conn.send)(msg.clone());
            }
        }
    }

    /// Deliver `msg` directly to `uuid`'s Connection, bypassing the
    /// route-stack lookup `dispatch_response_in` performs. Used for
    /// replies owed directly to the requester by a locally intercepted
    /// topic (e.g. `hello.idset`) rather than a forwarded route.
    pub fn send_to(&self, uuid: &str, msg: Message) {
        match self.connections.get(uuid) {
            Some(conn) => (conn.send)(msg),
            None => warn!(uuid, "connection missing, dropping local reply"),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn has_connection(&self, uuid: &str) -> bool {
        self.connections.contains_key(uuid)
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
