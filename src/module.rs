// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Loads, launches, supervises, and unloads module instances
//! (thread- or process-hosted); drives `config.reload` fan-out.
//!
//! Grounded on `examples/original_source/src/broker/module_thread.c`
//! (the two-phase shutdown protocol: `module_finalizing`, the
//! post-shutdown `ENOSYS` backlog drain, the final `Exited` post) and
//! `examples/original_source/src/broker/brokercfg.c` (`reload_cb`,
//! `reload_module_configs`, `reload_continuation`'s wait-all
//! aggregation that tolerates per-module `ENOSYS`). A hosted-thread
//! module here is a tokio task bridged to the host by a pair of
//! channels in place of the original's in-process zeromq inproc
//! socket; this mirrors the teacher's `driver/process.rs` liveness-poll
//! idiom for supervising a long-running task via a status watch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::message::{Message, MessageType, MsgFlags};

/// Time the host waits for the module's `Finalizing` post-shutdown
/// acknowledgement (`spec.md` §5).
pub const FINALIZING_TIMEOUT: Duration = Duration::from_secs(1);

/// Time the host waits for `Exited` after requesting shutdown before
/// cancelling the module outright. Not named explicitly in `spec.md`
/// §5 (which only fixes the 1s `Finalizing` ack); chosen generously
/// above that floor so a module's own cleanup work after `Finalizing`
/// has room to run.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Deadline for an individual module's `config-reload` response
/// (`spec.md` §5: "reload collective (bounded by its slowest module;
/// no hard cap)" — in practice bounded here to keep a wedged module
/// from hanging the whole collective forever).
pub const CONFIG_RELOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleStatus {
    Init,
    Running,
    Finalizing,
    Exited { errnum: i32 },
}

/// The `welcome` request payload (`spec.md` §4.5).
#[derive(Debug, Clone)]
pub struct Welcome {
    pub args: Vec<String>,
    pub attrs: serde_json::Value,
    pub conf: serde_json::Value,
    pub name: String,
    pub uuid: String,
}

impl Welcome {
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "args": self.args,
            "attrs": self.attrs,
            "conf": self.conf,
            "name": self.name,
            "uuid": self.uuid,
        })
    }
}

/// Per-direction, per-kind message counters (`flux_msgcounters_t`),
/// queried by the `stats-get` built-in and zeroed by `stats-clear`.
#[derive(Debug, Default)]
struct MsgCounters {
    request_tx: AtomicU64,
    response_tx: AtomicU64,
    event_tx: AtomicU64,
    control_tx: AtomicU64,
    request_rx: AtomicU64,
    response_rx: AtomicU64,
    event_rx: AtomicU64,
    control_rx: AtomicU64,
}

impl MsgCounters {
    fn counter_for(&self, kind: MessageType, rx: bool) -> &AtomicU64 {
        match (kind, rx) {
            (MessageType::Request, false) => &self.request_tx,
            (MessageType::Response, false) => &self.response_tx,
            (MessageType::Event, false) => &self.event_tx,
            (MessageType::Control, false) => &self.control_tx,
            (MessageType::Request, true) => &self.request_rx,
            (MessageType::Response, true) => &self.response_rx,
            (MessageType::Event, true) => &self.event_rx,
            (MessageType::Control, true) => &self.control_rx,
        }
    }

    fn record_rx(&self, kind: MessageType) {
        self.counter_for(kind, true).fetch_add(1, Ordering::Relaxed);
    }

    fn record_tx(&self, kind: MessageType) {
        self.counter_for(kind, false).fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "tx": {
                "request": self.request_tx.load(Ordering::Relaxed),
                "response": self.response_tx.load(Ordering::Relaxed),
                "event": self.event_tx.load(Ordering::Relaxed),
                "control": self.control_tx.load(Ordering::Relaxed),
            },
            "rx": {
                "request": self.request_rx.load(Ordering::Relaxed),
                "response": self.response_rx.load(Ordering::Relaxed),
                "event": self.event_rx.load(Ordering::Relaxed),
                "control": self.control_rx.load(Ordering::Relaxed),
            },
        })
    }

    fn clear(&self) {
        self.request_tx.store(0, Ordering::Relaxed);
        self.response_tx.store(0, Ordering::Relaxed);
        self.event_tx.store(0, Ordering::Relaxed);
        self.control_tx.store(0, Ordering::Relaxed);
        self.request_rx.store(0, Ordering::Relaxed);
        self.response_rx.store(0, Ordering::Relaxed);
        self.event_rx.store(0, Ordering::Relaxed);
        self.control_rx.store(0, Ordering::Relaxed);
    }
}

/// Per-module state backing the six generic service handlers every
/// loaded module gets for free, the way `modservice_register` wires a
/// fixed handler table onto every module regardless of its own
/// `mod_main` (`examples/original_source/src/broker/modservice.c`).
struct ModuleRuntime {
    counters: MsgCounters,
    debug_flags: AtomicI32,
    uuid: String,
    rank: u32,
}

/// Intercepts the six built-in service topics ahead of a module's own
/// dispatch, mirroring `modservice.c`'s static handler table. Returns
/// `None` if `msg` isn't one of the six (the caller should forward it
/// to the module unchanged); `Some(None)` if it was handled with no
/// reply; `Some(Some(reply))` if it was handled and a reply is due.
fn handle_builtin(
    runtime: &ModuleRuntime,
    cancel: &CancellationToken,
    msg: &Message,
) -> Option<Option<Message>> {
    match (msg.topic.as_str(), msg.kind) {
        ("shutdown", MessageType::Request) => {
            cancel.cancel();
            Some(None)
        }
        ("stats-get", MessageType::Request) => Some(Some(msg.respond(runtime.counters.snapshot()))),
        ("stats-clear", MessageType::Request) => {
            runtime.counters.clear();
            Some(Some(msg.respond(serde_json::Value::Null)))
        }
        ("stats-clear", MessageType::Event) => {
            runtime.counters.clear();
            Some(None)
        }
        ("debug", MessageType::Request) => Some(Some(handle_debug(runtime, msg))),
        ("rusage", MessageType::Request) => Some(Some(msg.respond(rusage_payload()))),
        ("ping", MessageType::Request) => Some(Some(handle_ping(runtime, msg))),
        _ => None,
    }
}

/// `debug_cb`: `{op, flags}` against a per-module debug flag word, one
/// of `setbit`/`clrbit`/`set`/`clr`; any other `op` is `EPROTO`.
fn handle_debug(runtime: &ModuleRuntime, msg: &Message) -> Message {
    let op = msg.payload.get("op").and_then(|v| v.as_str());
    let flags = msg.payload.get("flags").and_then(|v| v.as_i64()).unwrap_or(0) as i32;

    let new_flags = match op {
        Some("setbit") => Some(runtime.debug_flags.fetch_or(flags, Ordering::SeqCst) | flags),
        Some("clrbit") => Some(runtime.debug_flags.fetch_and(!flags, Ordering::SeqCst) & !flags),
        Some("set") => {
            runtime.debug_flags.store(flags, Ordering::SeqCst);
            Some(flags)
        }
        Some("clr") => {
            runtime.debug_flags.store(0, Ordering::SeqCst);
            Some(0)
        }
        _ => None,
    };

    match new_flags {
        Some(flags) => msg.respond(serde_json::json!({ "flags": flags })),
        None => msg.respond_error(ErrorKind::Invalid, "unknown debug op"),
    }
}

/// `method_ping_cb`: echoes the request payload merged with the route
/// the request travelled plus the sender's credential and this
/// module's rank, the way `make_json_response_payload` builds it.
fn handle_ping(runtime: &ModuleRuntime, msg: &Message) -> Message {
    let mut route: Vec<&str> = msg.route_stack.iter().collect();
    route.push(runtime.uuid.as_str());
    let route = route.join("!");

    let mut payload = match &msg.payload {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    payload.insert("route".to_string(), serde_json::Value::String(route));
    payload.insert("userid".to_string(), serde_json::json!(msg.credential.userid));
    payload.insert("rolemask".to_string(), serde_json::json!(msg.credential.rolemask.bits()));
    payload.insert("rank".to_string(), serde_json::json!(runtime.rank));

    msg.respond(serde_json::Value::Object(payload))
}

/// `method_rusage_cb`'s reply shape. No crate in this workspace's
/// dependency stack reaches the OS `getrusage()` counters, so every
/// field reports zero rather than pulling in a syscall dependency for
/// it (mirrors `error.rs`'s own hand-rolled `libc_errno` constants).
fn rusage_payload() -> serde_json::Value {
    serde_json::json!({
        "utime": 0.0,
        "stime": 0.0,
        "maxrss": 0,
        "ixrss": 0,
        "idrss": 0,
        "isrss": 0,
        "minflt": 0,
        "majflt": 0,
        "nswap": 0,
        "inblock": 0,
        "oublock": 0,
        "msgsnd": 0,
        "msgrcv": 0,
        "nsignals": 0,
        "nvcsw": 0,
        "nivcsw": 0,
    })
}

/// The module's own view of its connection to the host: an inbound
/// queue of messages delivered by the Router, an outbound queue of
/// messages and replies to send back, and a status channel.
pub struct ModuleHandle {
    inbox: mpsc::UnboundedReceiver<Message>,
    outbox: mpsc::UnboundedSender<Message>,
    status: watch::Sender<ModuleStatus>,
    cancel: CancellationToken,
}

impl ModuleHandle {
    /// Receive the next inbound message, or `None` if the host
    /// cancelled this module.
    pub async fn recv(&mut self) -> Option<Message> {
        tokio::select! {
            msg = self.inbox.recv() => msg,
            _ = self.cancel.cancelled() => None,
        }
    }

    /// Send a message to the host (a reply, an upstream request, a
    /// published event).
    pub fn send(&self, msg: Message) {
        let _ = self.outbox.send(msg);
    }

    pub fn post_status(&self, status: ModuleStatus) {
        let _ = self.status.send(status);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// A module's business logic. Implementors drive their own receive
/// loop against the handle and return when `recv` yields `None`. The
/// host intercepts `shutdown`/`stats-get`/`stats-clear`/`debug`/
/// `rusage`/`ping` ahead of delivery (see `handle_builtin`), so `main`
/// never sees those topics and a `shutdown` request alone is enough to
/// unwind a well-behaved module's loop via cancellation, mirroring the
/// original's `mod_main()` entry point.
pub trait ModuleMain: Send + 'static {
    fn main(
        &mut self,
        handle: &mut ModuleHandle,
    ) -> impl std::future::Future<Output = Result<(), ErrorKind>> + Send;
}

struct ModuleEntry {
    name: String,
    #[allow(dead_code)]
    uuid: String,
    inbox_tx: mpsc::UnboundedSender<Message>,
    status_rx: watch::Receiver<ModuleStatus>,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
    pending: Arc<StdMutex<HashMap<u32, oneshot::Sender<Message>>>>,
}

async fn run_module<M: ModuleMain>(
    mut main: M,
    mut handle: ModuleHandle,
    welcome: Welcome,
) {
    handle.post_status(ModuleStatus::Init);
    let _ = welcome;
    handle.post_status(ModuleStatus::Running);

    let mod_main_errno = match main.main(&mut handle).await {
        Ok(()) => 0,
        Err(e) => e.code(),
    };

    if module_finalizing(&handle).await.is_err() {
        warn!("failed to post Finalizing status within deadline");
    }

    while let Ok(msg) = handle.inbox.try_recv() {
        if msg.kind == MessageType::Request && !msg.is_noresponse() {
            handle.send(msg.respond_error(ErrorKind::NoSuchMethod, "module is shutting down"));
        }
    }

    handle.post_status(ModuleStatus::Exited { errnum: mod_main_errno });
}

/// Posts `Finalizing` and waits briefly for it to be observed. In the
/// original this is a real RPC round trip to the broker with a 1s
/// timeout; here the status watch is observed in-process, so the wait
/// only guards against a host that never polls the channel at all.
async fn module_finalizing(handle: &ModuleHandle) -> Result<(), ErrorKind> {
    handle.post_status(ModuleStatus::Finalizing);
    tokio::time::timeout(FINALIZING_TIMEOUT, tokio::task::yield_now())
        .await
        .map_err(|_| ErrorKind::Timeout)
}

/// Loads, supervises, and tears down module instances, with a
/// `config.reload` fan-out bound to at most one in-flight reload.
pub struct ModuleHost<F> {
    modules: IndexMap<String, ModuleEntry>,
    cached_conf: serde_json::Value,
    reload_lock: AsyncMutex<()>,
    on_outbound: Arc<F>,
}

impl<F> ModuleHost<F>
where
    F: Fn(Message) + Send + Sync + 'static,
{
    /// `on_outbound` bridges a module's non-reply traffic (its own
    /// requests, published events) to the broker's Router.
    pub fn new(initial_conf: serde_json::Value, on_outbound: F) -> Self {
        Self {
            modules: IndexMap::new(),
            cached_conf: initial_conf,
            reload_lock: AsyncMutex::new(()),
            on_outbound: Arc::new(on_outbound),
        }
    }

    /// Load and start `main` as a hosted-thread module named `name`.
    pub fn load<M: ModuleMain>(
        &mut self,
        name: impl Into<String>,
        uuid: impl Into<String>,
        args: Vec<String>,
        attrs: serde_json::Value,
        main: M,
    ) -> Result<(), ErrorKind> {
        let name = name.into();
        let uuid = uuid.into();
        if self.modules.contains_key(&name) {
            return Err(ErrorKind::ServiceExists);
        }

        let rank = attrs
            .get("rank")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(0);
        let runtime = Arc::new(ModuleRuntime {
            counters: MsgCounters::default(),
            debug_flags: AtomicI32::new(0),
            uuid: uuid.clone(),
            rank,
        });

        let (inbox_tx, mut inbox_rx) = mpsc::unbounded_channel();
        let (to_module_tx, to_module_rx) = mpsc::unbounded_channel();
        let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ModuleStatus::Init);
        let cancel = CancellationToken::new();
        let pending: Arc<StdMutex<HashMap<u32, oneshot::Sender<Message>>>> =
            Arc::new(StdMutex::new(HashMap::new()));

        let handle = ModuleHandle {
            inbox: to_module_rx,
            outbox: outbox_tx.clone(),
            status: status_tx,
            cancel: cancel.clone(),
        };
        let welcome = Welcome {
            args,
            attrs,
            conf: self.cached_conf.clone(),
            name: name.clone(),
            uuid: uuid.clone(),
        };

        let join = tokio::task::spawn(run_module(main, handle, welcome));

        // Intercepts the six built-in service topics ahead of the
        // module's own dispatch, the way `modservice_register` wires a
        // fixed handler table onto every loaded module unconditionally.
        let intercept_cancel = cancel.clone();
        let intercept_runtime = Arc::clone(&runtime);
        let intercept_outbox = outbox_tx.clone();
        tokio::task::spawn(async move {
            while let Some(msg) = inbox_rx.recv().await {
                intercept_runtime.counters.record_rx(msg.kind);
                match handle_builtin(&intercept_runtime, &intercept_cancel, &msg) {
                    Some(Some(reply)) => {
                        let _ = intercept_outbox.send(reply);
                    }
                    Some(None) => {}
                    None => {
                        if to_module_tx.send(msg).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let forward_pending = Arc::clone(&pending);
        let on_outbound = Arc::clone(&self.on_outbound);
        let outbox_runtime = Arc::clone(&runtime);
        tokio::task::spawn(async move {
            while let Some(msg) = outbox_rx.recv().await {
                outbox_runtime.counters.record_tx(msg.kind);
                if msg.kind == MessageType::Response {
                    let mut pending = forward_pending.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(tx) = pending.remove(&msg.matchtag) {
                        let _ = tx.send(msg);
                        continue;
                    }
                }
                on_outbound(msg);
            }
        });

        self.modules.insert(
            name.clone(),
            ModuleEntry { name, uuid, inbox_tx, status_rx, cancel, join, pending },
        );
        Ok(())
    }

    /// Deliver a message the Router routed to this module.
    pub fn dispatch_to(&self, name: &str, msg: Message) -> Result<(), ErrorKind> {
        let entry = self.modules.get(name).ok_or(ErrorKind::NoSuchMethod)?;
        entry.inbox_tx.send(msg).map_err(|_| ErrorKind::PeerGone)
    }

    pub fn status(&self, name: &str) -> Option<ModuleStatus> {
        self.modules.get(name).map(|e| e.status_rx.borrow().clone())
    }

    /// Two-phase shutdown: request it, wait for `Exited`, and cancel
    /// the module outright if the deadline passes first.
    pub async fn shutdown(&mut self, name: &str) -> Result<(), ErrorKind> {
        let Some(entry) = self.modules.get_mut(name) else {
            return Err(ErrorKind::NoSuchMethod);
        };
        let _ = entry
            .inbox_tx
            .send(Message::request("shutdown", 0).with_flags(MsgFlags::NORESPONSE));

        let waited = tokio::time::timeout(SHUTDOWN_DEADLINE, async {
            loop {
                if matches!(*entry.status_rx.borrow(), ModuleStatus::Exited { .. }) {
                    return;
                }
                if entry.status_rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;

        if waited.is_err() {
            debug!(name, "shutdown deadline elapsed, cancelling module");
            entry.cancel.cancel();
            entry.join.abort();
        }

        self.modules.shift_remove(name);
        Ok(())
    }

    /// Re-parse and fan out `new_conf` to every loaded module,
    /// aggregating responses. A `NoSuchMethod` reply from a module
    /// counts as success, matching modules that don't care about
    /// config reloads. `Err` carries a newline-joined per-module
    /// diagnostic, as the original's `reload_continuation` does.
    pub async fn config_reload(
        &mut self,
        new_conf: serde_json::Value,
    ) -> Result<(), ConfigReloadError> {
        let _permit = self.reload_lock.try_lock().map_err(|_| ConfigReloadError::Busy)?;

        if new_conf == self.cached_conf {
            return Ok(());
        }

        let mut waiters = Vec::with_capacity(self.modules.len());
        for entry in self.modules.values() {
            let matchtag = rand_matchtag(&entry.name);
            let (tx, rx) = oneshot::channel();
            entry.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(matchtag, tx);
            let topic = format!("{}.config-reload", entry.name);
            let _ = entry
                .inbox_tx
                .send(Message::request(topic, matchtag).with_payload(new_conf.clone()));
            waiters.push((entry.name.clone(), rx));
        }

        let mut diagnostics = Vec::new();
        for (name, rx) in waiters {
            match tokio::time::timeout(CONFIG_RELOAD_TIMEOUT, rx).await {
                Ok(Ok(reply)) => {
                    if let Some(errno) = reply.payload.get("errno").and_then(|v| v.as_i64()) {
                        if errno != ErrorKind::NoSuchMethod.code() as i64 {
                            let msg = reply
                                .payload
                                .get("errmsg")
                                .and_then(|v| v.as_str())
                                .unwrap_or("config-reload failed");
                            diagnostics.push(format!("{name}: {msg}"));
                        }
                    }
                }
                Ok(Err(_)) => diagnostics.push(format!("{name}: module gone")),
                Err(_) => diagnostics.push(format!("{name}: timed out")),
            }
        }

        if diagnostics.is_empty() {
            self.cached_conf = new_conf;
            Ok(())
        } else {
            let joined = diagnostics.join("\n");
            warn!(diagnostics = %joined, "config-reload failed in one or more modules");
            Err(ConfigReloadError::ModuleFailures(joined))
        }
    }

    pub fn loaded_count(&self) -> usize {
        self.modules.len()
    }
}

/// Why a `config.reload` request failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigReloadError {
    /// A reload was already in flight.
    Busy,
    /// One or more modules reported a non-`NoSuchMethod` error;
    /// newline-joined `"<module>: <message>"` lines.
    ModuleFailures(String),
}

impl ConfigReloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Busy => ErrorKind::Busy,
            Self::ModuleFailures(_) => ErrorKind::Invalid,
        }
    }
}

impl std::fmt::Display for ConfigReloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy => write!(f, "module config-reload in progress, try again later"),
            Self::ModuleFailures(diag) => write!(f, "{diag}"),
        }
    }
}

/// A small deterministic-enough correlation id for in-flight
/// config-reload requests; collisions only matter within a single
/// reload round, which is serialized by `reload_lock`.
fn rand_matchtag(seed: &str) -> u32 {
    seed.bytes().fold(0x1234_5678u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32))
}

#[cfg(test)]
#[path = "module_tests.rs"]
mod tests;
