// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use super::*;
use crate::message::MsgFlags;

#[derive(Clone, Default)]
struct JoinUpstream {
    requests: Arc<Mutex<Vec<Message>>>,
    notify: Arc<Notify>,
}

impl Upstream for JoinUpstream {
    async fn request(&self, msg: Message) -> Result<Message, ErrorKind> {
        let reply = msg.respond(serde_json::Value::Null);
        self.requests.lock().unwrap().push(msg);
        self.notify.notify_one();
        Ok(reply)
    }

    fn send(&self, _msg: Message) {}

    fn subscribe(&self, _topic: &str) -> Result<(), ErrorKind> {
        Ok(())
    }

    fn unsubscribe(&self, _topic: &str) -> Result<(), ErrorKind> {
        Ok(())
    }
}

fn streaming_request(sender: &str, matchtag: u32) -> Message {
    let mut req = Message::request("hello.idset", matchtag).with_flags(MsgFlags::STREAMING);
    req.route_stack.push(sender);
    req
}

#[tokio::test]
async fn reduction_union_sinks_at_hwm() {
    let replies = Arc::new(Mutex::new(Vec::new()));
    let rx = Arc::clone(&replies);
    let mut collector = ReductionCollector::new(
        0,
        4,
        4,
        Duration::from_secs(10),
        JoinUpstream::default(),
        move |msg| rx.lock().unwrap().push(msg),
    );
    collector.idset_request(streaming_request("listener", 0)).unwrap();

    for rank in 0..4 {
        collector.append(Idset::singleton(rank));
    }

    assert!(collector.is_complete());
    assert_eq!(collector.count(), 4);
    let seen = replies.lock().unwrap();
    // one immediate reply from idset_request, one more from the sink
    // invocation triggered by the fourth append reaching hwm.
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1].payload["idset"], "[0-3]");
    assert_eq!(seen[1].payload["size"], 4);
}

#[tokio::test]
async fn time_based_flush_forwards_partial_at_timeout() {
    let upstream = JoinUpstream::default();
    let mut collector = ReductionCollector::new(
        1,
        4,
        4,
        Duration::from_millis(10),
        upstream.clone(),
        |_msg| {},
    );

    for rank in 1..4 {
        collector.append(Idset::singleton(rank));
    }
    assert!(upstream.requests.lock().unwrap().is_empty());

    collector.on_timeout();
    upstream.notify.notified().await;

    let sent = upstream.requests.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].topic, "hello.join");
    assert_eq!(sent[0].payload["idset"], "1-3");
    assert_eq!(sent[0].payload["batch"], 0);
}

#[tokio::test]
async fn cancellation_yields_exactly_one_canceled_reply() {
    let replies = Arc::new(Mutex::new(Vec::new()));
    let rx = Arc::clone(&replies);
    let mut collector = ReductionCollector::new(
        0,
        4,
        4,
        Duration::from_secs(10),
        JoinUpstream::default(),
        move |msg| rx.lock().unwrap().push(msg),
    );
    collector.idset_request(streaming_request("client-1", 7)).unwrap();
    collector.cancel("client-1", 7);

    // A subsequent sink invocation must not reply to the canceled listener.
    for rank in 0..4 {
        collector.append(Idset::singleton(rank));
    }

    let seen = replies.lock().unwrap();
    assert_eq!(seen.len(), 2); // immediate reply + Canceled
    assert_eq!(seen[1].payload["errno"], ErrorKind::Canceled.code());
}

#[tokio::test]
async fn disconnect_drops_listeners_from_departed_sender() {
    let mut collector = ReductionCollector::new(
        0,
        4,
        4,
        Duration::from_secs(10),
        JoinUpstream::default(),
        |_msg| {},
    );
    collector.idset_request(streaming_request("client-1", 0)).unwrap();
    collector.idset_request(streaming_request("client-2", 0)).unwrap();
    assert_eq!(collector.listener_count(), 2);

    collector.disconnect("client-1");
    assert_eq!(collector.listener_count(), 1);
}

#[tokio::test]
async fn non_streaming_request_is_not_kept_as_a_listener() {
    let mut collector = ReductionCollector::new(
        0,
        4,
        4,
        Duration::from_secs(10),
        JoinUpstream::default(),
        |_msg| {},
    );
    let req = Message::request("hello.idset", 0);
    collector.idset_request(req).unwrap();
    assert_eq!(collector.listener_count(), 0);
}

#[tokio::test]
async fn idset_request_on_nonzero_rank_is_invalid() {
    let mut collector = ReductionCollector::new(
        1,
        4,
        4,
        Duration::from_secs(10),
        JoinUpstream::default(),
        |_msg| {},
    );
    let err = collector.idset_request(Message::request("hello.idset", 0)).unwrap_err();
    assert_eq!(err, ErrorKind::Invalid);
}

#[tokio::test]
async fn handle_join_rejects_nonzero_batch() {
    let mut collector = ReductionCollector::new(
        0,
        4,
        4,
        Duration::from_secs(10),
        JoinUpstream::default(),
        |_msg| {},
    );
    let req = Message::request("hello.join", 0)
        .with_payload(serde_json::json!({ "idset": "0-1", "batch": 1 }));
    let reply = collector.handle_join(&req);
    assert_eq!(reply.payload["errno"], ErrorKind::Invalid.code());
    assert_eq!(collector.count(), 0);
}

#[tokio::test]
async fn handle_join_appends_decoded_idset() {
    let mut collector = ReductionCollector::new(
        0,
        4,
        99,
        Duration::from_secs(10),
        JoinUpstream::default(),
        |_msg| {},
    );
    let req = Message::request("hello.join", 0)
        .with_payload(serde_json::json!({ "idset": "0-2", "batch": 0 }));
    let reply = collector.handle_join(&req);
    assert_eq!(reply.kind, crate::message::MessageType::Response);
    assert_eq!(reply.payload, serde_json::Value::Null);
    assert_eq!(collector.count(), 3);
}
