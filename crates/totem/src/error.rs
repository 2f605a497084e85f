// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy shared by every layer of the engine.
//!
//! Errors are plain discriminated values; nothing in the core panics on a
//! recoverable condition and nothing unwinds across a callback boundary.

use std::fmt;

/// Errors returned by totem operations.
#[derive(Debug)]
pub enum Error {
    /// Handle unknown, stale, or not active.
    BadHandle,
    /// Argument violates a documented precondition.
    InvalidParam,
    /// Key or group name outside the permitted length range.
    NameTooLong,
    /// Allocation failed (or the RNG refused to produce a usable cookie).
    NoMemory,
    /// Key lifecycle mismatch: entry does not exist.
    NotExist,
    /// Key lifecycle mismatch: entry already exists.
    Exist,
    /// Operation disallowed by this map or policy.
    NotSupported,
    /// Transient condition; the caller may retry.
    TryAgain,
    /// Unrecoverable internal or wire failure.
    Library,
    /// A protocol timer expired.
    Timeout,
    /// I/O error from socket construction or persistence.
    Io(std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadHandle => write!(f, "Bad handle"),
            Error::InvalidParam => write!(f, "Invalid parameter"),
            Error::NameTooLong => write!(f, "Name too long"),
            Error::NoMemory => write!(f, "Out of memory"),
            Error::NotExist => write!(f, "Entry does not exist"),
            Error::Exist => write!(f, "Entry already exists"),
            Error::NotSupported => write!(f, "Operation not supported"),
            Error::TryAgain => write!(f, "Try again"),
            Error::Library => write!(f, "Internal library failure"),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
