// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-memory attribute cache, standing in for the broker-wide key/value
//! store the reduction collector and overlay setup read at startup
//! (`tbon.descendants`, `hello.timeout`, rank/size).
//!
//! Grounded on `attr_get`/`attr_add`/`attr_set_flags`'s usage in
//! `examples/original_source/src/broker/hello.c`: attributes are
//! strings, can be marked immutable once set, and a second `set` of an
//! immutable attribute is rejected rather than silently overwritten.

use crate::error::ErrorKind;

#[derive(Debug, Clone)]
struct Attr {
    value: String,
    immutable: bool,
}

/// A flat string key/value store with per-key immutability, the same
/// shape as the original's `attr_t` table.
#[derive(Debug, Default)]
pub struct AttributeStore {
    entries: std::collections::HashMap<String, Attr>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// `attr_get`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|a| a.value.as_str())
    }

    /// `attr_add`: set `key` to `value`, optionally marking it
    /// immutable. Fails `AlreadyExists` if `key` is already immutable.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>, immutable: bool) -> Result<(), ErrorKind> {
        let key = key.into();
        if let Some(existing) = self.entries.get(&key) {
            if existing.immutable {
                return Err(ErrorKind::AlreadyExists);
            }
        }
        self.entries.insert(key, Attr { value: value.into(), immutable });
        Ok(())
    }

    /// `attr_set_flags`: mark an existing attribute immutable without
    /// changing its value. `Invalid` if the key is unset.
    pub fn set_immutable(&mut self, key: &str) -> Result<(), ErrorKind> {
        match self.entries.get_mut(key) {
            Some(attr) => {
                attr.immutable = true;
                Ok(())
            }
            None => Err(ErrorKind::Invalid),
        }
    }

    pub fn is_immutable(&self, key: &str) -> bool {
        self.entries.get(key).is_some_and(|a| a.immutable)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot every value (immutable or not) as a flat JSON object, the
    /// shape a module's welcome payload embeds its `attrs` cache as.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.entries.iter().map(|(k, a)| (k.clone(), serde_json::Value::String(a.value.clone()))).collect(),
        )
    }
}

#[cfg(test)]
#[path = "attrs_tests.rs"]
mod tests;
