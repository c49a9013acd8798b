// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Error kinds shared across the router, service registry, module host,
//! and reduction collector.
//!
//! Every fallible operation in this crate returns `Result<_, ErrorKind>`.
//! `ErrorKind` carries an errno-like numeric code so it can cross the wire
//! as a response error without inventing a second vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Distinguishable failure kinds, named by behavior per the propagation
/// policy: client-originating errors are always surfaced as a response;
/// broker-originating forwarding errors are logged, never propagated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed message or topic.
    Invalid,
    /// No service matches a request topic.
    NoSuchMethod,
    /// Duplicate service name.
    ServiceExists,
    /// A Connection uuid already has an entry in the Router.
    AlreadyExists,
    /// `service.remove` by a connection that doesn't own the entry.
    NotOwner,
    /// A response's route stack names no live connection.
    HostUnreachable,
    /// A streaming request was canceled.
    Canceled,
    /// A `config.reload` collided with one already in flight.
    Busy,
    /// Authentication/authorization denied.
    AuthDenied,
    /// An upstream or collective deadline elapsed.
    Timeout,
    /// Send failed because the peer is gone (EPIPE/ECONNRESET).
    PeerGone,
}

impl ErrorKind {
    /// The errno-like numeric code this error maps to on the wire.
    pub fn code(&self) -> i32 {
        match self {
            Self::Invalid => libc_errno::EPROTO,
            Self::NoSuchMethod => libc_errno::ENOSYS,
            Self::ServiceExists => libc_errno::EEXIST,
            Self::AlreadyExists => libc_errno::EEXIST,
            Self::NotOwner => libc_errno::ENOENT,
            Self::HostUnreachable => libc_errno::EHOSTUNREACH,
            Self::Canceled => libc_errno::ECANCELED,
            Self::Busy => libc_errno::EBUSY,
            Self::AuthDenied => libc_errno::EPERM,
            Self::Timeout => libc_errno::ETIMEDOUT,
            Self::PeerGone => libc_errno::EPIPE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invalid => "INVALID",
            Self::NoSuchMethod => "NO_SUCH_METHOD",
            Self::ServiceExists => "SERVICE_EXISTS",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::NotOwner => "NOT_OWNER",
            Self::HostUnreachable => "HOST_UNREACHABLE",
            Self::Canceled => "CANCELED",
            Self::Busy => "BUSY",
            Self::AuthDenied => "AUTH_DENIED",
            Self::Timeout => "TIMEOUT",
            Self::PeerGone => "PEER_GONE",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for ErrorKind {}

/// Minimal errno constants, named the way the original C router names
/// them, without depending on a libc crate for a handful of integers.
mod libc_errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EPIPE: i32 = 32;
    pub const EEXIST: i32 = 17;
    pub const ENOSYS: i32 = 38;
    pub const EPROTO: i32 = 71;
    pub const ECANCELED: i32 = 125;
    pub const EBUSY: i32 = 16;
    pub const EHOSTUNREACH: i32 = 113;
    pub const ETIMEDOUT: i32 = 110;
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
