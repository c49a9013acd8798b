// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn add_then_get_roundtrips() {
    let mut store = AttributeStore::new();
    store.add("rank", "0", false).unwrap();
    assert_eq!(store.get("rank"), Some("0"));
}

#[test]
fn immutable_attribute_rejects_a_second_add() {
    let mut store = AttributeStore::new();
    store.add("hello.hwm", "4", true).unwrap();
    let err = store.add("hello.hwm", "5", true).unwrap_err();
    assert_eq!(err, ErrorKind::AlreadyExists);
    assert_eq!(store.get("hello.hwm"), Some("4"));
}

#[test]
fn set_immutable_locks_an_existing_mutable_attribute() {
    let mut store = AttributeStore::new();
    store.add("hello.timeout", "10.000", false).unwrap();
    store.set_immutable("hello.timeout").unwrap();
    assert!(store.is_immutable("hello.timeout"));
    assert_eq!(store.add("hello.timeout", "20.000", false), Err(ErrorKind::AlreadyExists));
}

#[test]
fn set_immutable_on_unknown_key_is_invalid() {
    let mut store = AttributeStore::new();
    assert_eq!(store.set_immutable("nope"), Err(ErrorKind::Invalid));
}
