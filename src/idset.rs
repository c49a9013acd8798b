// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! A compact set of nonnegative rank integers, with the bracket+range
//! string encoding used by the `hello.idset` reply payload (`spec.md`
//! §6, §GLOSSARY).
//!
//! Grounded on `idset_encode`/`idset_decode`/`idset_count` usage in
//! `examples/original_source/src/broker/hello.c`. Only the
//! `IDSET_FLAG_RANGE`/`IDSET_FLAG_BRACKETS` encoding the hello protocol
//! needs is implemented; the original's full idset library (set
//! arithmetic beyond union, iteration cursors, etc.) is out of scope.

use std::collections::BTreeSet;
use std::fmt::Write as _;

/// A set of ranks (nonnegative integers), ordered, deduplicated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Idset {
    members: BTreeSet<u32>,
}

impl Idset {
    pub fn new() -> Self {
        Self { members: BTreeSet::new() }
    }

    pub fn singleton(rank: u32) -> Self {
        let mut s = Self::new();
        s.set(rank);
        s
    }

    pub fn set(&mut self, rank: u32) {
        self.members.insert(rank);
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, rank: u32) -> bool {
        self.members.contains(&rank)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.members.iter().copied()
    }

    /// In-place union with `other`, consuming it (mirrors
    /// `r_reduce`'s pop-all-push-union in `hello.c`: the reducer keeps
    /// exactly one surviving idset).
    pub fn union_from(&mut self, other: Idset) {
        self.members.extend(other.members);
    }

    /// Encode with brackets and ranges, e.g. `[0-3,7]`, matching
    /// `IDSET_FLAG_BRACKETS | IDSET_FLAG_RANGE` in the original.
    pub fn encode_bracketed(&self) -> String {
        let body = self.encode_ranges();
        format!("[{body}]")
    }

    /// Encode with ranges but no brackets, matching `IDSET_FLAG_RANGE`
    /// alone (used for the `hello.join` forward payload).
    pub fn encode_ranges(&self) -> String {
        let mut out = String::new();
        let mut iter = self.members.iter().copied().peekable();
        let mut first = true;
        while let Some(start) = iter.next() {
            let mut end = start;
            while iter.peek() == Some(&(end + 1)) {
                end += 1;
                iter.next();
            }
            if !first {
                out.push(',');
            }
            first = false;
            if start == end {
                let _ = write!(out, "{start}");
            } else {
                let _ = write!(out, "{start}-{end}");
            }
        }
        out
    }

    /// Decode either the bracketed or bare range form produced by
    /// [`Idset::encode_bracketed`]/[`Idset::encode_ranges`].
    pub fn decode(s: &str) -> Option<Idset> {
        let body = s.strip_prefix('[').and_then(|s| s.strip_suffix(']')).unwrap_or(s);
        let mut out = Idset::new();
        if body.is_empty() {
            return Some(out);
        }
        for part in body.split(',') {
            if let Some((lo, hi)) = part.split_once('-') {
                let lo: u32 = lo.parse().ok()?;
                let hi: u32 = hi.parse().ok()?;
                if lo > hi {
                    return None;
                }
                for rank in lo..=hi {
                    out.set(rank);
                }
            } else {
                out.set(part.parse().ok()?);
            }
        }
        Some(out)
    }
}

impl FromIterator<u32> for Idset {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self { members: iter.into_iter().collect() }
    }
}

#[cfg(test)]
#[path = "idset_tests.rs"]
mod tests;
