// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::error::ErrorKind;

#[test]
fn upstream_flag_matches_historical_value() {
    assert_eq!(MsgFlags::UPSTREAM.bits(), 16);
}

#[test]
fn request_defaults_have_no_response_flags() {
    let m = Message::request("foo.bar", 42);
    assert!(!m.is_noresponse());
    assert!(!m.is_streaming());
    assert_eq!(m.matchtag, 42);
}

#[test]
fn respond_echoes_topic_and_matchtag() {
    let req = Message::request("foo.bar", 7).with_flags(MsgFlags::STREAMING);
    let resp = req.respond(serde_json::json!({"ok": true}));
    assert_eq!(resp.kind, MessageType::Response);
    assert_eq!(resp.topic, "foo.bar");
    assert_eq!(resp.matchtag, 7);
    assert!(resp.flags.is_empty());
}

#[test]
fn respond_error_encodes_errno_and_message() {
    let req = Message::request("foo.bar", 1);
    let resp = req.respond_error(ErrorKind::NoSuchMethod, "no such method");
    assert_eq!(resp.payload["errno"], 38);
    assert_eq!(resp.payload["errmsg"], "no such method");
}

#[test]
fn route_stack_push_pop_is_lifo() {
    let mut stack = RouteStack::new();
    stack.push("uuid-a");
    stack.push("uuid-b");
    assert_eq!(stack.last(), Some("uuid-b"));
    assert_eq!(stack.pop(), Some("uuid-b".to_string()));
    assert_eq!(stack.last(), Some("uuid-a"));
}

#[test]
fn nodeid_hashkey_values() {
    assert_eq!(NodeId::Rank(3).hashkey_value(), 3);
    assert_eq!(NodeId::Any.hashkey_value(), u32::MAX);
}

#[test]
fn credential_local_grants_local_role() {
    let cred = Credential::local(1000);
    assert!(cred.rolemask.contains(RoleMask::LOCAL));
    assert!(cred.rolemask.contains(RoleMask::USER));
    assert!(!cred.rolemask.contains(RoleMask::OWNER));
}
