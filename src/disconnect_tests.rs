// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::message::{Message, MsgFlags, NodeId};

#[test]
fn topic_derivation() {
    assert_eq!(disconnect_topic("foo"), "disconnect");
    assert_eq!(disconnect_topic("foo.bar"), "foo.disconnect");
    assert_eq!(disconnect_topic("foo.bar.baz"), "foo.bar.disconnect");
}

#[test]
fn hashkey_derivation() {
    assert_eq!(
        disconnect_hashkey("disconnect", NodeId::Rank(1), MsgFlags::UPSTREAM),
        "disconnect:1:16"
    );
    assert_eq!(
        disconnect_hashkey("foo.disconnect", NodeId::Any, MsgFlags::STREAMING),
        "foo.disconnect:4294967295:0"
    );
}

#[test]
fn idempotence_fires_one_message_per_distinct_key() {
    let mut cache = DisconnectCache::new();
    for topic in ["foo.bar", "foo.bar", "foo.baz", "meep.oops"] {
        cache.arm(&Message::request(topic, 0));
    }
    let mut fired = Vec::new();
    cache.fire(|msg| fired.push(msg.topic));
    assert_eq!(fired, vec!["foo.disconnect", "meep.disconnect"]);
}

#[test]
fn noresponse_requests_are_not_armed() {
    let mut cache = DisconnectCache::new();
    cache.arm(&Message::request("foo.bar", 0).with_flags(MsgFlags::NORESPONSE));
    assert!(cache.is_empty());
}

#[test]
fn fire_drains_the_cache() {
    let mut cache = DisconnectCache::new();
    cache.arm(&Message::request("foo.bar", 0));
    cache.fire(|_| {});
    assert!(cache.is_empty());
}
