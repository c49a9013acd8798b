// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn refcount_tracks_subscribe_unsubscribe() {
    let mut subs = SubscriptionSet::new();
    subs.subscribe("foo", |_| Ok(())).unwrap();
    subs.subscribe("foo", |_| Ok(())).unwrap();
    subs.unsubscribe("foo", |_| Ok(())).unwrap();
    assert!(subs.matches("foo"));
    subs.unsubscribe("foo", |_| Ok(())).unwrap();
    assert!(!subs.matches("foo"));
}

#[test]
fn first_subscribe_and_last_unsubscribe_invoke_callback() {
    let mut subs = SubscriptionSet::new();
    let mut first_calls = 0;
    subs.subscribe("foo", |_| {
        first_calls += 1;
        Ok(())
    })
    .unwrap();
    subs.subscribe("foo", |_| {
        first_calls += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(first_calls, 1);

    let mut last_calls = 0;
    subs.unsubscribe("foo", |_| {
        last_calls += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(last_calls, 0);
    subs.unsubscribe("foo", |_| {
        last_calls += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(last_calls, 1);
}

#[test]
fn prefix_match_semantics() {
    let mut subs = SubscriptionSet::new();
    subs.subscribe("fo", |_| Ok(())).unwrap();
    assert!(subs.matches("foo"));
    assert!(subs.matches("fo"));
    assert!(!subs.matches("f"));

    let mut empty_sub = SubscriptionSet::new();
    empty_sub.subscribe("", |_| Ok(())).unwrap();
    assert!(empty_sub.matches("anything"));
}

#[test]
fn foobar_subscriber_does_not_match_foo() {
    let mut subs = SubscriptionSet::new();
    subs.subscribe("foobar", |_| Ok(())).unwrap();
    assert!(!subs.matches("foo"));
}

#[test]
fn unsubscribe_unknown_topic_is_invalid() {
    let mut subs = SubscriptionSet::new();
    assert_eq!(subs.unsubscribe("nope", |_| Ok(())), Err(ErrorKind::Invalid));
}
