// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The in-memory configuration map.
//!
//! Keys are stored in a prefix-ordered tree so prefix iteration and prefix
//! change tracking walk only the matching range. Trackers fire synchronously
//! after each mutation commits, in registration order.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::cmap::value::{MapValue, ValueType, MAX_VALUE_LEN};
use crate::cmap::{check_key_name, TRACK_ADD, TRACK_DELETE, TRACK_MODIFY, TRACK_PREFIX};
use crate::error::{Error, Result};

/// Change event delivered to trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEvent {
    Add,
    Modify,
    Delete,
}

impl TrackEvent {
    fn mask_bit(self) -> u8 {
        match self {
            TrackEvent::Add => TRACK_ADD,
            TrackEvent::Modify => TRACK_MODIFY,
            TrackEvent::Delete => TRACK_DELETE,
        }
    }
}

/// Tracker callback: `(event, key, new_value, old_value)`.
///
/// For in-place adjustments (`fast_adjust_int`) the old value is not
/// retained; callbacks receive `old = None` and must tolerate it.
pub type NotifyFn = Box<dyn FnMut(TrackEvent, &str, Option<&MapValue>, Option<&MapValue>)>;

/// Token identifying a registered tracker.
pub type TrackToken = u64;

struct Track {
    token: TrackToken,
    key_name: String,
    mask: u8,
    notify: NotifyFn,
}

struct RoEntry {
    key_name: String,
    prefix: bool,
}

/// Typed key/value map with prefix iteration, change tracking, and
/// per-key/per-prefix read-only enforcement.
pub struct CMap {
    entries: BTreeMap<String, MapValue>,
    tracks: Vec<Track>,
    next_token: TrackToken,
    ro_entries: Vec<RoEntry>,
}

impl Default for CMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CMap {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            tracks: Vec::new(),
            next_token: 1,
            ro_entries: Vec::new(),
        }
    }

    fn notify(
        &mut self,
        event: TrackEvent,
        key: &str,
        new: Option<&MapValue>,
        old: Option<&MapValue>,
    ) {
        for track in &mut self.tracks {
            if track.mask & event.mask_bit() == 0 {
                continue;
            }
            let matches = if track.mask & TRACK_PREFIX != 0 {
                key.starts_with(track.key_name.as_str())
            } else {
                track.key_name == key
            };
            if matches {
                (track.notify)(event, key, new, old);
            }
        }
    }

    /// Insert or replace `key`. Setting an identical value is a no-op and
    /// fires no notification.
    pub fn set(&mut self, key: &str, value: MapValue) -> Result<()> {
        if value.value_len() > MAX_VALUE_LEN {
            return Err(Error::InvalidParam);
        }
        if self.is_key_ro(key) {
            return Err(Error::NotSupported);
        }
        match self.entries.get(key) {
            Some(existing) => {
                if existing.same_as(&value) {
                    return Ok(());
                }
                let old = self.entries.insert(key.to_string(), value.clone());
                self.notify(TrackEvent::Modify, key, Some(&value), old.as_ref());
            }
            None => {
                // Name rules are only enforced when the key is created.
                check_key_name(key)?;
                self.entries.insert(key.to_string(), value.clone());
                self.notify(TrackEvent::Add, key, Some(&value), None);
            }
        }
        Ok(())
    }

    /// Remove `key`.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        if self.is_key_ro(key) {
            return Err(Error::NotSupported);
        }
        match self.entries.remove(key) {
            Some(old) => {
                self.notify(TrackEvent::Delete, key, None, Some(&old));
                Ok(())
            }
            None => Err(Error::NotExist),
        }
    }

    /// Copy of the stored value.
    pub fn get(&self, key: &str) -> Result<MapValue> {
        self.get_ref(key).cloned()
    }

    /// Borrow the stored value.
    pub fn get_ref(&self, key: &str) -> Result<&MapValue> {
        self.entries.get(key).ok_or(Error::NotExist)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Add `step` to an integer key, wrapping in the key's own width.
    pub fn adjust_int(&mut self, key: &str, step: i32) -> Result<()> {
        let mut value = self.get(key)?;
        if !value.adjust(step) {
            return Err(Error::InvalidParam);
        }
        self.set(key, value)
    }

    /// In-place variant of [`adjust_int`](Self::adjust_int): no replacement
    /// allocation, and trackers observe `old = None`.
    pub fn fast_adjust_int(&mut self, key: &str, step: i32) -> Result<()> {
        let value = {
            let entry = self.entries.get_mut(key).ok_or(Error::NotExist)?;
            if !entry.adjust(step) {
                return Err(Error::InvalidParam);
            }
            entry.clone()
        };
        self.notify(TrackEvent::Modify, key, Some(&value), None);
        Ok(())
    }

    pub fn inc(&mut self, key: &str) -> Result<()> {
        self.adjust_int(key, 1)
    }

    pub fn dec(&mut self, key: &str) -> Result<()> {
        self.adjust_int(key, -1)
    }

    pub fn fast_inc(&mut self, key: &str) -> Result<()> {
        self.fast_adjust_int(key, 1)
    }

    pub fn fast_dec(&mut self, key: &str) -> Result<()> {
        self.fast_adjust_int(key, -1)
    }

    /// Iterate keys beginning with `prefix`, in lexicographic order.
    pub fn iter_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a MapValue)> + 'a {
        self.entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Register a tracker for `key_name` (exact, or a prefix when the mask
    /// carries [`TRACK_PREFIX`]).
    pub fn track_add(&mut self, key_name: &str, mask: u8, notify: NotifyFn) -> Result<TrackToken> {
        if mask & !(TRACK_ADD | TRACK_DELETE | TRACK_MODIFY | TRACK_PREFIX) != 0 {
            return Err(Error::InvalidParam);
        }
        let token = self.next_token;
        self.next_token += 1;
        self.tracks.push(Track {
            token,
            key_name: key_name.to_string(),
            mask,
            notify,
        });
        Ok(token)
    }

    pub fn track_delete(&mut self, token: TrackToken) -> Result<()> {
        match self.tracks.iter().position(|t| t.token == token) {
            Some(i) => {
                self.tracks.remove(i);
                Ok(())
            }
            None => Err(Error::NotExist),
        }
    }

    /// Toggle read-only access for an exact key or a whole prefix.
    pub fn set_ro_access(&mut self, key_name: &str, prefix: bool, ro: bool) -> Result<()> {
        if let Some(i) = self
            .ro_entries
            .iter()
            .position(|e| e.prefix == prefix && e.key_name == key_name)
        {
            if ro {
                return Err(Error::Exist);
            }
            self.ro_entries.remove(i);
            return Ok(());
        }
        if !ro {
            return Err(Error::NotExist);
        }
        self.ro_entries.push(RoEntry {
            key_name: key_name.to_string(),
            prefix,
        });
        Ok(())
    }

    pub fn is_key_ro(&self, key_name: &str) -> bool {
        self.ro_entries.iter().any(|e| {
            if e.prefix {
                key_name.starts_with(e.key_name.as_str())
            } else {
                e.key_name == key_name
            }
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Typed convenience accessors.

    pub fn set_u8(&mut self, key: &str, v: u8) -> Result<()> {
        self.set(key, MapValue::Uint8(v))
    }

    pub fn set_u32(&mut self, key: &str, v: u32) -> Result<()> {
        self.set(key, MapValue::Uint32(v))
    }

    pub fn set_u64(&mut self, key: &str, v: u64) -> Result<()> {
        self.set(key, MapValue::Uint64(v))
    }

    pub fn set_str(&mut self, key: &str, v: &str) -> Result<()> {
        self.set(key, MapValue::Str(v.to_string()))
    }

    pub fn get_u8(&self, key: &str) -> Result<u8> {
        match self.get_ref(key)? {
            MapValue::Uint8(v) => Ok(*v),
            _ => Err(Error::InvalidParam),
        }
    }

    pub fn get_u32(&self, key: &str) -> Result<u32> {
        match self.get_ref(key)? {
            MapValue::Uint32(v) => Ok(*v),
            _ => Err(Error::InvalidParam),
        }
    }

    pub fn get_u64(&self, key: &str) -> Result<u64> {
        match self.get_ref(key)? {
            MapValue::Uint64(v) => Ok(*v),
            _ => Err(Error::InvalidParam),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<String> {
        match self.get_ref(key)? {
            MapValue::Str(s) => Ok(s.clone()),
            _ => Err(Error::InvalidParam),
        }
    }

    pub fn get_type(&self, key: &str) -> Result<ValueType> {
        Ok(self.get_ref(key)?.value_type())
    }
}

/// True iff both keys exist, their types match, and their bytes compare
/// equal under type-appropriate length.
pub fn key_value_eq(map1: &CMap, key1: &str, map2: &CMap, key2: &str) -> bool {
    match (map1.get_ref(key1), map2.get_ref(key2)) {
        (Ok(v1), Ok(v2)) => v1.same_as(v2),
        _ => false,
    }
}

/// Deep-copy every entry of `src` into `dst`; the first failing set aborts
/// the copy and surfaces its error.
pub fn copy_map(dst: &mut CMap, src: &CMap) -> Result<()> {
    let entries: Vec<(String, MapValue)> = src
        .iter_prefix("")
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    for (key, value) in entries {
        dst.set(&key, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_set_get_round_trip() {
        let mut map = CMap::new();
        map.set("totem.token", MapValue::Uint32(1000)).unwrap();
        assert_eq!(map.get("totem.token").unwrap(), MapValue::Uint32(1000));
        assert_eq!(map.get_u32("totem.token").unwrap(), 1000);
        assert!(matches!(map.get("totem.nope"), Err(Error::NotExist)));
    }

    #[test]
    fn test_set_idempotent_no_modify_notify() {
        let mut map = CMap::new();
        let events: Rc<RefCell<Vec<TrackEvent>>> = Rc::default();
        let seen = Rc::clone(&events);
        map.track_add(
            "totem.",
            TRACK_ADD | TRACK_MODIFY | TRACK_PREFIX,
            Box::new(move |ev, _, _, _| seen.borrow_mut().push(ev)),
        )
        .unwrap();
        map.set("totem.token", MapValue::Uint32(5000)).unwrap();
        map.set("totem.token", MapValue::Uint32(5000)).unwrap();
        assert_eq!(&*events.borrow(), &[TrackEvent::Add]);
    }

    #[test]
    fn test_modify_notify_carries_old_and_new() {
        let mut map = CMap::new();
        map.set("totem.token", MapValue::Uint32(5000)).unwrap();
        let seen: Rc<RefCell<Vec<(u32, u32)>>> = Rc::default();
        let log = Rc::clone(&seen);
        map.track_add(
            "totem.",
            TRACK_MODIFY | TRACK_PREFIX,
            Box::new(move |_, _, new, old| {
                let n = match new {
                    Some(MapValue::Uint32(v)) => *v,
                    _ => panic!("missing new value"),
                };
                let o = match old {
                    Some(MapValue::Uint32(v)) => *v,
                    _ => panic!("missing old value"),
                };
                log.borrow_mut().push((o, n));
            }),
        )
        .unwrap();
        map.set("totem.token", MapValue::Uint32(6000)).unwrap();
        map.set("totem.token", MapValue::Uint32(6000)).unwrap();
        assert_eq!(&*seen.borrow(), &[(5000, 6000)]);
    }

    #[test]
    fn test_type_change_is_a_modify() {
        let mut map = CMap::new();
        map.set("runtime.x", MapValue::Uint32(1)).unwrap();
        map.set("runtime.x", MapValue::Uint64(1)).unwrap();
        assert_eq!(map.get("runtime.x").unwrap(), MapValue::Uint64(1));
    }

    #[test]
    fn test_exact_tracker_ignores_other_keys() {
        let mut map = CMap::new();
        let count = Rc::new(RefCell::new(0));
        let c = Rc::clone(&count);
        map.track_add(
            "totem.token",
            TRACK_ADD | TRACK_MODIFY | TRACK_DELETE,
            Box::new(move |_, _, _, _| *c.borrow_mut() += 1),
        )
        .unwrap();
        map.set("totem.token", MapValue::Uint32(1)).unwrap();
        map.set("totem.token_warning", MapValue::Uint32(2)).unwrap();
        map.delete("totem.token_warning").unwrap();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_track_delete_stops_delivery() {
        let mut map = CMap::new();
        let count = Rc::new(RefCell::new(0));
        let c = Rc::clone(&count);
        let token = map
            .track_add(
                "a.b",
                TRACK_ADD | TRACK_MODIFY,
                Box::new(move |_, _, _, _| *c.borrow_mut() += 1),
            )
            .unwrap();
        map.set("a.b", MapValue::Uint8(1)).unwrap();
        map.track_delete(token).unwrap();
        map.set("a.b", MapValue::Uint8(2)).unwrap();
        assert_eq!(*count.borrow(), 1);
        assert!(matches!(map.track_delete(token), Err(Error::NotExist)));
    }

    #[test]
    fn test_fast_adjust_old_aliases_away() {
        let mut map = CMap::new();
        map.set("stats.ctr", MapValue::Uint64(7)).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&seen);
        map.track_add(
            "stats.ctr",
            TRACK_MODIFY,
            Box::new(move |_, _, new, old| {
                log.borrow_mut()
                    .push((new.cloned(), old.map(|v| v.clone())));
            }),
        )
        .unwrap();
        map.fast_adjust_int("stats.ctr", 3).unwrap();
        let entries = seen.borrow();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, Some(MapValue::Uint64(10)));
        assert_eq!(entries[0].1, None);
    }

    #[test]
    fn test_adjust_int_type_rules() {
        let mut map = CMap::new();
        map.set("n.u8", MapValue::Uint8(255)).unwrap();
        map.adjust_int("n.u8", 1).unwrap();
        assert_eq!(map.get_u8("n.u8").unwrap(), 0);
        map.set("n.str", MapValue::Str("x".into())).unwrap();
        assert!(matches!(map.adjust_int("n.str", 1), Err(Error::InvalidParam)));
        assert!(matches!(map.adjust_int("n.gone", 1), Err(Error::NotExist)));
    }

    #[test]
    fn test_prefix_iteration_exact_set() {
        let mut map = CMap::new();
        for key in ["totem.token", "totem.version", "nodelist.node0", "runtime.x"] {
            map.set(key, MapValue::Uint32(0)).unwrap();
        }
        map.delete("totem.version").unwrap();
        let keys: Vec<&str> = map.iter_prefix("totem.").map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["totem.token"]);
        let all: Vec<&str> = map.iter_prefix("").map(|(k, _)| k).collect();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_ro_access() {
        let mut map = CMap::new();
        map.set("totem.token", MapValue::Uint32(1)).unwrap();
        map.set_ro_access("totem.", true, true).unwrap();
        assert!(map.is_key_ro("totem.token"));
        assert!(matches!(
            map.set("totem.token", MapValue::Uint32(2)),
            Err(Error::NotSupported)
        ));
        assert!(matches!(
            map.delete("totem.token"),
            Err(Error::NotSupported)
        ));
        assert!(matches!(
            map.set_ro_access("totem.", true, true),
            Err(Error::Exist)
        ));
        map.set_ro_access("totem.", true, false).unwrap();
        map.set("totem.token", MapValue::Uint32(2)).unwrap();
        assert!(matches!(
            map.set_ro_access("nope", false, false),
            Err(Error::NotExist)
        ));
    }

    #[test]
    fn test_key_name_rules() {
        let mut map = CMap::new();
        assert!(matches!(
            map.set("ab", MapValue::Uint8(0)),
            Err(Error::NameTooLong)
        ));
        assert!(matches!(
            map.set("bad key", MapValue::Uint8(0)),
            Err(Error::NameTooLong)
        ));
        let long = "k".repeat(256);
        assert!(matches!(
            map.set(&long, MapValue::Uint8(0)),
            Err(Error::NameTooLong)
        ));
        map.set("a.b", MapValue::Uint8(0)).unwrap();
    }

    #[test]
    fn test_oversized_value_rejected() {
        let mut map = CMap::new();
        let blob = vec![0u8; MAX_VALUE_LEN + 1];
        assert!(matches!(
            map.set("big.blob", MapValue::Binary(blob)),
            Err(Error::InvalidParam)
        ));
    }

    #[test]
    fn test_key_value_eq() {
        let mut m1 = CMap::new();
        let mut m2 = CMap::new();
        m1.set("a.b", MapValue::Str("hi".into())).unwrap();
        m2.set("c.d", MapValue::Str("hi".into())).unwrap();
        assert!(key_value_eq(&m1, "a.b", &m2, "c.d"));
        m2.set("c.d", MapValue::Str("ho".into())).unwrap();
        assert!(!key_value_eq(&m1, "a.b", &m2, "c.d"));
        assert!(!key_value_eq(&m1, "a.b", &m2, "missing"));
    }

    #[test]
    fn test_copy_map_deep_copies() {
        let mut src = CMap::new();
        src.set("a.one", MapValue::Uint32(1)).unwrap();
        src.set("a.two", MapValue::Str("x".into())).unwrap();
        let mut dst = CMap::new();
        copy_map(&mut dst, &src).unwrap();
        assert_eq!(dst.len(), 2);
        assert!(key_value_eq(&src, "a.one", &dst, "a.one"));
        src.set("a.one", MapValue::Uint32(9)).unwrap();
        assert_eq!(dst.get_u32("a.one").unwrap(), 1);
    }
}
