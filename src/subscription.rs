// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reference-counted topic-prefix subscriptions with lazy upstream
//! (un)subscribe callbacks.
//!
//! Grounded on `examples/original_source/src/common/librouter/subhash.c`.
//! A router's `SubscriptionSet` represents the union of all its
//! connections' subscriptions; each connection has its own, wired so the
//! first subscriber to a topic triggers the router's callback and the
//! last unsubscriber triggers its release.

use indexmap::IndexMap;

use crate::error::ErrorKind;

struct Entry {
    refcount: usize,
}

/// A set of topic-prefix subscriptions, refcounted by topic string.
#[derive(Default)]
pub struct SubscriptionSet {
    subs: IndexMap<String, Entry>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topic`. `on_first_subscribe` runs only when this is
    /// the first subscriber to `topic` (refcount 0 -> 1); its failure
    /// aborts the subscribe without inserting the entry.
    pub fn subscribe(
        &mut self,
        topic: &str,
        on_first_subscribe: impl FnOnce(&str) -> Result<(), ErrorKind>,
    ) -> Result<(), ErrorKind> {
        if let Some(entry) = self.subs.get_mut(topic) {
            entry.refcount += 1;
            return Ok(());
        }
        on_first_subscribe(topic)?;
        self.subs.insert(topic.to_string(), Entry { refcount: 1 });
        Ok(())
    }

    /// Unsubscribe from `topic`. `on_last_unsubscribe` runs only when
    /// this is the last subscriber (refcount 1 -> 0); on its failure the
    /// entry is left armed with its refcount undecremented.
    pub fn unsubscribe(
        &mut self,
        topic: &str,
        on_last_unsubscribe: impl FnOnce(&str) -> Result<(), ErrorKind>,
    ) -> Result<(), ErrorKind> {
        let Some(entry) = self.subs.get_mut(topic) else {
            return Err(ErrorKind::Invalid);
        };
        if entry.refcount == 1 {
            on_last_unsubscribe(topic)?;
            self.subs.shift_remove(topic);
        } else {
            entry.refcount -= 1;
        }
        Ok(())
    }

    /// Whether `topic` matches any subscription, by prefix: a
    /// subscription to `""` matches every topic, one to `"foo"` matches
    /// `"foo"`, `"foobar"`, and `"foo.bar"` but not `"fo"`.
    pub fn matches(&self, topic: &str) -> bool {
        self.subs.keys().any(|sub| topic.starts_with(sub.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Subscribed topic strings, in insertion order.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.subs.keys().map(String::as_str)
    }

    /// Re-issue every subscription's upstream callback, e.g. after an
    /// overlay reconnect (`subhash_renew` in the original).
    pub fn renew(
        &self,
        mut on_subscribe: impl FnMut(&str) -> Result<(), ErrorKind>,
    ) -> Result<(), ErrorKind> {
        for topic in self.subs.keys() {
            on_subscribe(topic)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "subscription_tests.rs"]
mod tests;
