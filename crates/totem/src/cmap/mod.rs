// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Typed key/value configuration map with prefix-based change notification.
//!
//! The map is the control/observation plane of the engine: configuration
//! lives under `totem.*`/`nodelist.*`, runtime state under `runtime.*`, and
//! the read-only stats view (see [`crate::stats`]) shares the same value
//! model and tracker semantics.

mod map;
mod value;

pub use map::{copy_map, key_value_eq, CMap, NotifyFn, TrackEvent, TrackToken};
pub use value::{MapValue, ValueType, MAX_VALUE_LEN};

use crate::error::{Error, Result};

/// Minimum key name length.
pub const KEYNAME_MINLEN: usize = 3;
/// Maximum key name length.
pub const KEYNAME_MAXLEN: usize = 255;

/// Tracker mask bit: key creation.
pub const TRACK_ADD: u8 = 0x01;
/// Tracker mask bit: key removal.
pub const TRACK_DELETE: u8 = 0x02;
/// Tracker mask bit: value replacement.
pub const TRACK_MODIFY: u8 = 0x04;
/// Tracker mask bit: treat the tracked name as a prefix.
pub const TRACK_PREFIX: u8 = 0x08;

fn is_valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':')
}

/// Validate a key name: length in `[KEYNAME_MINLEN, KEYNAME_MAXLEN]`, every
/// character from the permitted set.
pub fn check_key_name(key_name: &str) -> Result<()> {
    if key_name.len() < KEYNAME_MINLEN || key_name.len() > KEYNAME_MAXLEN {
        return Err(Error::NameTooLong);
    }
    if !key_name.chars().all(is_valid_name_char) {
        return Err(Error::NameTooLong);
    }
    Ok(())
}

/// Replace every character outside the permitted set with `_`.
pub fn convert_name_to_valid_name(key_name: &str) -> String {
    key_name
        .chars()
        .map(|c| if is_valid_name_char(c) { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_key_name_bounds() {
        assert!(check_key_name("a.b").is_ok());
        assert!(check_key_name(&"x".repeat(255)).is_ok());
        assert!(check_key_name("ab").is_err());
        assert!(check_key_name(&"x".repeat(256)).is_err());
    }

    #[test]
    fn test_check_key_name_charset() {
        assert!(check_key_name("stats.srp.orf_token_tx").is_ok());
        assert!(check_key_name("a/b:c-d_e.0").is_ok());
        assert!(check_key_name("has space").is_err());
        assert!(check_key_name("tab\there").is_err());
    }

    #[test]
    fn test_convert_name() {
        assert_eq!(convert_name_to_valid_name("proc name#1"), "proc_name_1");
        assert_eq!(convert_name_to_valid_name("ok.name"), "ok.name");
    }
}
