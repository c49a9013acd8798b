// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level per-node wiring: owns the Router, ModuleHost, and
//! ReductionCollector, and drives the single `tokio::select!` loop that
//! is this broker's one event loop (`spec.md` §5: "single event-loop per
//! component; Router and ModuleHost live on the broker's main loop").
//!
//! Grounded on the teacher's `session/run.rs` (a struct holding the
//! channels a session's tasks communicate over plus a `CancellationToken`,
//! constructed by a `new` that spawns nothing itself and a `run` that
//! owns the select loop).

use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::attrs::AttributeStore;
use crate::config::ConfigSource;
use crate::error::ErrorKind;
use crate::message::{Message, MessageType};
use crate::module::{ConfigReloadError, ModuleHost, ModuleMain};
use crate::reduction::ReductionCollector;
use crate::registry::Upstream;
use crate::router::Router;

/// Inbound traffic from accepted local clients, fed to the broker loop
/// by whatever transport accepted the connection (`transport::local` or
/// a test double). `Connected` carries the per-connection `send`
/// closure rather than registering it directly, so the Router's
/// `connections` map is mutated only from the broker's own loop
/// (`spec.md` §5).
pub enum ClientEvent {
    Connected { uuid: String, send: Box<dyn Fn(Message) + Send + Sync> },
    Message { uuid: String, msg: Message },
    Disconnected { uuid: String },
}

/// Owns every per-node component and the channels that glue them
/// together. `U` is the overlay/upstream transport, shared by the
/// Router's `ServiceRegistry` and the `ReductionCollector`.
pub struct Broker<U> {
    router: Router<U>,
    modules: ModuleHost<Box<dyn Fn(Message) + Send + Sync>>,
    reduction: ReductionCollector<U>,
    attrs: AttributeStore,
    conf: Arc<RwLock<Arc<serde_json::Value>>>,
    conf_source: Option<Box<dyn ConfigSource>>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    client_rx: mpsc::UnboundedReceiver<ClientEvent>,
    shutdown: CancellationToken,
}

impl<U: Upstream + Clone + 'static> Broker<U> {
    /// Wire up a fresh broker. `hwm`/`hello_timeout` parameterize the
    /// `ReductionCollector` (`spec.md` §4.6); `initial_conf` seeds both
    /// the module welcome payload and the `config.get` snapshot. Returns
    /// the broker plus the sender side of its client channel, so an
    /// accept loop can hand off inbound messages and disconnects without
    /// borrowing the broker itself.
    pub fn new(
        rank: u32,
        size: u32,
        hwm: usize,
        hello_timeout: std::time::Duration,
        upstream: U,
        initial_conf: serde_json::Value,
        conf_source: Option<Box<dyn ConfigSource>>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedSender<ClientEvent>) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (client_tx, client_rx) = mpsc::unbounded_channel::<ClientEvent>();

        let module_outbound = outbound_tx.clone();
        let on_outbound: Box<dyn Fn(Message) + Send + Sync> =
            Box::new(move |msg| { let _ = module_outbound.send(msg); });
        let modules = ModuleHost::new(initial_conf.clone(), on_outbound);

        let reduction_outbound = outbound_tx;
        let reduction = ReductionCollector::new(
            rank,
            size,
            hwm,
            hello_timeout,
            upstream.clone(),
            move |msg| { let _ = reduction_outbound.send(msg); },
        );

        let router = Router::new(upstream);

        // Seed the attributes a module's welcome payload and a client's
        // `attr.get` would expect to find already populated at startup
        // (`examples/original_source/src/broker/hello.c`'s rank/size/
        // hello-timeout attrs), each immutable since the broker's
        // identity doesn't change for its own lifetime.
        let mut attrs = AttributeStore::new();
        let _ = attrs.add("rank", rank.to_string(), true);
        let _ = attrs.add("size", size.to_string(), true);
        let _ = attrs.add("hello-timeout", hello_timeout.as_secs_f64().to_string(), true);

        let broker = Self {
            router,
            modules,
            reduction,
            attrs,
            conf: Arc::new(RwLock::new(Arc::new(initial_conf))),
            conf_source,
            outbound_rx,
            client_rx,
            shutdown,
        };
        (broker, client_tx)
    }

    /// Register an accepted client, bound to whatever `send` closure
    /// writes back to its transport (a framed Unix socket write, or a
    /// channel in tests).
    pub fn add_connection(
        &mut self,
        uuid: impl Into<String>,
        send: impl Fn(Message) + Send + Sync + 'static,
    ) -> Result<(), ErrorKind> {
        self.router.add_entry(uuid, send)
    }

    /// Load a hosted-thread module (`ModuleHost::load`), seeding its
    /// welcome payload's `attrs` from the broker's own attribute cache
    /// rather than a caller-supplied blob, matching the original's
    /// modules initializing their attr cache from the broker-wide one.
    pub fn load_module<M: ModuleMain>(
        &mut self,
        name: impl Into<String>,
        uuid: impl Into<String>,
        args: Vec<String>,
        main: M,
    ) -> Result<(), ErrorKind> {
        let attrs = self.attrs.to_json();
        self.modules.load(name, uuid, args, attrs, main)
    }

    /// `attr_get`.
    pub fn attr_get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key)
    }

    /// `attr_add`.
    pub fn attr_add(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        immutable: bool,
    ) -> Result<(), ErrorKind> {
        self.attrs.add(key, value, immutable)
    }

    pub async fn shutdown_module(&mut self, name: &str) -> Result<(), ErrorKind> {
        self.modules.shutdown(name).await
    }

    /// Current config snapshot (`config.get`'s payload).
    pub async fn config_get(&self) -> serde_json::Value {
        (**self.conf.read().await).clone()
    }

    /// Re-read the config source and fan it out to every loaded module
    /// (`config.reload`). Publishing the new snapshot only happens once
    /// the fan-out succeeds, per the write-once snapshot policy
    /// (`spec.md` §5).
    pub async fn config_reload(&mut self) -> Result<(), ConfigReloadError> {
        let Some(source) = self.conf_source.as_ref() else {
            return Err(ConfigReloadError::ModuleFailures("no config source configured".to_string()));
        };
        let new_conf =
            source.load().map_err(|e| ConfigReloadError::ModuleFailures(e.to_string()))?;
        self.modules.config_reload(new_conf.clone()).await?;
        *self.conf.write().await = Arc::new(new_conf);
        Ok(())
    }

    /// Process one message from an accepted client. `hello.*` and
    /// `config.*` are intercepted here rather than forwarded through
    /// `Router::recv_from_client`, the way `router.rs`'s own
    /// `INTERCEPTED_TOPICS` list intercepts `event.subscribe`/
    /// `service.add` ahead of the generic forwarding path.
    async fn handle_client_message(&mut self, uuid: &str, mut msg: Message) -> Result<(), ErrorKind> {
        match msg.topic.as_str() {
            "hello.idset" if msg.kind == MessageType::Request => {
                msg.route_stack.push(uuid);
                self.reduction.idset_request(msg)
            }
            "hello.cancel" if msg.kind == MessageType::Request => {
                let matchtag =
                    msg.payload.get("matchtag").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                self.reduction.cancel(uuid, matchtag);
                Ok(())
            }
            "config.get" if msg.kind == MessageType::Request => {
                let conf = self.config_get().await;
                self.router.send_to(uuid, msg.respond(conf));
                Ok(())
            }
            "config.reload" if msg.kind == MessageType::Request => {
                let reply = match self.config_reload().await {
                    Ok(()) => msg.respond(serde_json::Value::Null),
                    Err(e) => msg.respond_error(e.kind(), &e.to_string()),
                };
                self.router.send_to(uuid, reply);
                Ok(())
            }
            _ => self.router.recv_from_client(uuid, msg).await,
        }
    }

    /// A client dropped its transport connection: release its Router
    /// entries (cascading subscription/service cleanup) and drop any
    /// `hello.idset` listeners it held, without replying to either.
    fn disconnect_client(&mut self, uuid: &str) {
        self.router.delete_entry(uuid);
        self.reduction.disconnect(uuid);
    }

    async fn handle_client_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected { uuid, send } => {
                if let Err(e) = self.add_connection(uuid.clone(), send) {
                    warn!(uuid, error = %e, "failed to register connection");
                }
            }
            ClientEvent::Message { uuid, msg } => {
                if let Err(e) = self.handle_client_message(&uuid, msg).await {
                    warn!(uuid, error = %e, "client message handling failed");
                }
            }
            ClientEvent::Disconnected { uuid } => self.disconnect_client(&uuid),
        }
    }

    /// Route a message a module or the reduction collector pushed onto
    /// the shared outbound channel to the Router method matching its
    /// kind, mirroring `broker_request_in`/`broker_response_in`/
    /// `broker_event_in`'s split in the original router.
    fn dispatch_outbound(&mut self, msg: Message) {
        match msg.kind {
            MessageType::Response => {
                if let Err(e) = self.router.dispatch_response_in(msg) {
                    warn!(error = %e, "dropping outbound response");
                }
            }
            MessageType::Request => self.router.dispatch_request_in(msg),
            MessageType::Event => self.router.dispatch_event_in(msg),
            MessageType::Control => {}
        }
    }

    /// The broker's one event loop: dispatch outbound traffic from
    /// modules/the reduction collector, inbound client traffic, and the
    /// reduction collector's re-armed flush deadline, until cancelled.
    pub async fn run(mut self) {
        self.reduction.start();
        loop {
            let wake_at = self.reduction.deadline();
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("shutdown requested, broker loop exiting");
                    break;
                }
                Some(msg) = self.outbound_rx.recv() => {
                    self.dispatch_outbound(msg);
                }
                Some(event) = self.client_rx.recv() => {
                    self.handle_client_event(event).await;
                }
                _ = tokio::time::sleep_until(wake_at.unwrap_or_else(tokio::time::Instant::now)), if wake_at.is_some() => {
                    self.reduction.on_timeout();
                }
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.router.connection_count()
    }

    pub fn hello_listener_count(&self) -> usize {
        self.reduction.listener_count()
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
