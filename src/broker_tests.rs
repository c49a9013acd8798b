// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use super::*;
use crate::message::MsgFlags;

#[derive(Clone, Default)]
struct NullUpstream;

impl Upstream for NullUpstream {
    async fn request(&self, msg: Message) -> Result<Message, ErrorKind> {
        Ok(msg.respond(serde_json::Value::Null))
    }

    fn send(&self, _msg: Message) {}

    fn subscribe(&self, _topic: &str) -> Result<(), ErrorKind> {
        Ok(())
    }

    fn unsubscribe(&self, _topic: &str) -> Result<(), ErrorKind> {
        Ok(())
    }
}

fn new_broker(
    rank: u32,
    size: u32,
) -> (Broker<NullUpstream>, mpsc::UnboundedSender<ClientEvent>, CancellationToken) {
    let shutdown = CancellationToken::new();
    let (broker, client_tx) = Broker::new(
        rank,
        size,
        size as usize,
        Duration::from_secs(10),
        NullUpstream,
        serde_json::json!({"a": 1}),
        None,
        shutdown.clone(),
    );
    (broker, client_tx, shutdown)
}

/// A Connection `send` closure that records every message and wakes a
/// `Notify`, so tests can await delivery instead of sleeping a fixed
/// duration past when the broker's select loop should have run.
fn notifying_connection() -> (Arc<Mutex<Vec<Message>>>, Arc<Notify>, impl Fn(Message) + Send + Sync + 'static)
{
    let received = Arc::new(Mutex::new(Vec::new()));
    let notify = Arc::new(Notify::new());
    let rx = Arc::clone(&received);
    let n = Arc::clone(&notify);
    let send = move |msg: Message| {
        rx.lock().unwrap_or_else(|e| e.into_inner()).push(msg);
        n.notify_one();
    };
    (received, notify, send)
}

#[tokio::test]
async fn hello_idset_reply_is_routed_back_to_requester() {
    let (mut broker, client_tx, shutdown) = new_broker(0, 1);
    let (received, notify, send) = notifying_connection();
    broker.add_connection("client-1", send).unwrap();
    let handle = tokio::task::spawn(broker.run());

    client_tx
        .send(ClientEvent::Message {
            uuid: "client-1".to_string(),
            msg: Message::request("hello.idset", 5),
        })
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), notify.notified()).await.unwrap();

    shutdown.cancel();
    handle.await.unwrap();

    let seen = received.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].matchtag, 5);
    // rank 0's own contribution sinks as soon as the loop starts
    // (hwm == size == 1), so the snapshot already contains it.
    assert_eq!(seen[0].payload["idset"], "[0]");
    assert_eq!(seen[0].payload["size"], 1);
}

#[tokio::test]
async fn config_get_returns_current_snapshot() {
    let (mut broker, client_tx, shutdown) = new_broker(0, 1);
    let (received, notify, send) = notifying_connection();
    broker.add_connection("client-1", send).unwrap();
    let handle = tokio::task::spawn(broker.run());

    client_tx
        .send(ClientEvent::Message {
            uuid: "client-1".to_string(),
            msg: Message::request("config.get", 1),
        })
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), notify.notified()).await.unwrap();

    shutdown.cancel();
    handle.await.unwrap();

    let seen = received.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].payload, serde_json::json!({"a": 1}));
}

#[tokio::test]
async fn hello_cancel_yields_a_canceled_reply_to_the_listener() {
    let (mut broker, client_tx, shutdown) = new_broker(0, 2);
    let (received, notify, send) = notifying_connection();
    broker.add_connection("client-1", send).unwrap();
    let handle = tokio::task::spawn(broker.run());

    let streaming = Message::request("hello.idset", 9).with_flags(MsgFlags::STREAMING);
    client_tx
        .send(ClientEvent::Message { uuid: "client-1".to_string(), msg: streaming })
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), notify.notified()).await.unwrap();

    let cancel =
        Message::request("hello.cancel", 0).with_payload(serde_json::json!({"matchtag": 9}));
    client_tx
        .send(ClientEvent::Message { uuid: "client-1".to_string(), msg: cancel })
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), notify.notified()).await.unwrap();

    shutdown.cancel();
    handle.await.unwrap();

    let seen = received.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].payload["errno"], ErrorKind::Canceled.code());
}

#[test]
fn startup_attrs_are_seeded_from_construction_args() {
    let (broker, _client_tx, _shutdown) = new_broker(3, 7);
    assert_eq!(broker.attr_get("rank"), Some("3"));
    assert_eq!(broker.attr_get("size"), Some("7"));
    assert_eq!(broker.attr_get("hello-timeout"), Some("10"));
}

#[tokio::test]
async fn client_disconnect_drops_its_hello_idset_listener() {
    // Drives handle_client_message/disconnect_client directly rather
    // than through the full select loop, since both are plain async
    // methods and this test only cares about listener bookkeeping.
    let (mut broker, _client_tx, _shutdown) = new_broker(0, 2);
    let (_received, _notify, send) = notifying_connection();
    broker.add_connection("client-1", send).unwrap();

    let streaming = Message::request("hello.idset", 9).with_flags(MsgFlags::STREAMING);
    broker.handle_client_message("client-1", streaming).await.unwrap();
    assert_eq!(broker.hello_listener_count(), 1);

    broker.disconnect_client("client-1");
    assert_eq!(broker.hello_listener_count(), 0);
}
