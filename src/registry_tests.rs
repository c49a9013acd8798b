// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::*;

#[derive(Default)]
struct MockUpstream {
    fail_next: AtomicBool,
    best_effort_calls: Mutex<Vec<String>>,
    request_calls: AtomicUsize,
}

impl Upstream for MockUpstream {
    async fn request(&self, msg: Message) -> Result<Message, ErrorKind> {
        self.request_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            Err(ErrorKind::HostUnreachable)
        } else {
            Ok(msg.respond(serde_json::json!({"ok": true})))
        }
    }

    fn send(&self, msg: Message) {
        self.best_effort_calls.lock().unwrap().push(msg.payload["service"].to_string());
    }

    fn subscribe(&self, _topic: &str) -> Result<(), ErrorKind> {
        Ok(())
    }

    fn unsubscribe(&self, _topic: &str) -> Result<(), ErrorKind> {
        Ok(())
    }
}

#[tokio::test]
async fn add_then_remove_round_trips() {
    let mut registry = ServiceRegistry::new(MockUpstream::default());
    let req = Message::request("service.add", 1);
    registry.add("testfu", "uuid-a", &req).await.unwrap();
    assert_eq!(registry.matches("testfu.ping"), Some("uuid-a"));

    registry.remove("testfu", "uuid-a", &req).await.unwrap();
    assert_eq!(registry.matches("testfu.ping"), None);
}

#[tokio::test]
async fn add_duplicate_name_fails() {
    let mut registry = ServiceRegistry::new(MockUpstream::default());
    let req = Message::request("service.add", 1);
    registry.add("testfu", "uuid-a", &req).await.unwrap();
    let err = registry.add("testfu", "uuid-b", &req).await.unwrap_err();
    assert_eq!(err, ErrorKind::ServiceExists);
}

#[tokio::test]
async fn remove_by_non_owner_fails() {
    let mut registry = ServiceRegistry::new(MockUpstream::default());
    let req = Message::request("service.add", 1);
    registry.add("testfu", "uuid-a", &req).await.unwrap();
    let err = registry.remove("testfu", "uuid-b", &req).await.unwrap_err();
    assert_eq!(err, ErrorKind::NotOwner);
    assert_eq!(registry.matches("testfu.ping"), Some("uuid-a"));
}

#[tokio::test]
async fn add_failure_removes_entry() {
    let upstream = MockUpstream::default();
    upstream.fail_next.store(true, Ordering::SeqCst);
    let mut registry = ServiceRegistry::new(upstream);
    let req = Message::request("service.add", 1);
    assert!(registry.add("testfu", "uuid-a", &req).await.is_err());
    assert!(registry.is_empty());
}

#[tokio::test]
async fn disconnect_emits_best_effort_remove() {
    let mut registry = ServiceRegistry::new(MockUpstream::default());
    let req = Message::request("service.add", 1);
    registry.add("testfu", "uuid-a", &req).await.unwrap();
    registry.disconnect("uuid-a");
    assert!(registry.is_empty());
    assert_eq!(registry.upstream.best_effort_calls.lock().unwrap().len(), 1);
}

#[test]
fn service_glob_requires_dot_separator() {
    assert!(topic_matches_service("testfu.ping", "testfu"));
    assert!(!topic_matches_service("testfubar", "testfu"));
    assert!(!topic_matches_service("testfu", "testfu"));
}

#[tokio::test]
async fn standalone_upstream_has_no_parent_to_talk_to() {
    let upstream = StandaloneUpstream;
    let err = upstream.request(Message::request("anything", 0)).await.unwrap_err();
    assert_eq!(err, ErrorKind::HostUnreachable);
    assert!(upstream.subscribe("topic").is_ok());
    assert!(upstream.unsubscribe("topic").is_ok());
}
