// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Read-only stats map synthesized from live protocol counters.
//!
//! Shares the value model and tracker semantics of [`crate::cmap`], but keys
//! are backed by accessor functions instead of stored bytes: `get` reads the
//! counter at call time, and mutation operations report `NotSupported`.
//! Static keys cover the SRP and PG counter inventory; dynamic sub-trees are
//! added and removed by the layers that own them as connections come and go.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::cmap::{MapValue, NotifyFn, TrackEvent, TrackToken, ValueType, TRACK_ADD,
    TRACK_DELETE, TRACK_MODIFY, TRACK_PREFIX};
use crate::error::{Error, Result};

/// Relaxed-ordering counter cells: the protocol thread is the only writer,
/// readers only need freshness, not ordering.
#[derive(Default)]
pub struct SrpStats {
    pub orf_token_tx: AtomicU64,
    pub orf_token_rx: AtomicU64,
    pub memb_merge_detect_tx: AtomicU64,
    pub memb_merge_detect_rx: AtomicU64,
    pub memb_join_tx: AtomicU64,
    pub memb_join_rx: AtomicU64,
    pub mcast_tx: AtomicU64,
    pub mcast_retx: AtomicU64,
    pub mcast_rx: AtomicU64,
    pub memb_commit_token_tx: AtomicU64,
    pub memb_commit_token_rx: AtomicU64,
    pub token_hold_cancel_tx: AtomicU64,
    pub token_hold_cancel_rx: AtomicU64,
    pub operational_entered: AtomicU64,
    pub operational_token_lost: AtomicU64,
    pub gather_entered: AtomicU64,
    pub gather_token_lost: AtomicU64,
    pub commit_entered: AtomicU64,
    pub commit_token_lost: AtomicU64,
    pub recovery_entered: AtomicU64,
    pub recovery_token_lost: AtomicU64,
    pub consensus_timeouts: AtomicU64,
    pub rx_msg_dropped: AtomicU64,
    pub continuous_gather: AtomicU32,
    pub continuous_sendmsg_failures: AtomicU32,
    pub firewall_enabled_or_nic_failure: AtomicU8,
    pub mtt_rx_token: AtomicU32,
    pub avg_token_workload: AtomicU32,
    pub avg_backlog_calc: AtomicU32,
}

#[derive(Default)]
pub struct PgStats {
    pub msg_queue_avail: AtomicU32,
    pub msg_reserved: AtomicU32,
}

/// Live counters shared between the protocol layers and the stats map.
#[derive(Default)]
pub struct TotemStats {
    pub srp: SrpStats,
    pub pg: PgStats,
}

impl TotemStats {
    pub fn clear(&self) {
        macro_rules! z64 {
            ($($f:ident),*) => { $( self.srp.$f.store(0, Ordering::Relaxed); )* };
        }
        z64!(
            orf_token_tx, orf_token_rx, memb_merge_detect_tx, memb_merge_detect_rx,
            memb_join_tx, memb_join_rx, mcast_tx, mcast_retx, mcast_rx,
            memb_commit_token_tx, memb_commit_token_rx, token_hold_cancel_tx,
            token_hold_cancel_rx, operational_entered, operational_token_lost,
            gather_entered, gather_token_lost, commit_entered, commit_token_lost,
            recovery_entered, recovery_token_lost, consensus_timeouts, rx_msg_dropped
        );
        self.srp.continuous_gather.store(0, Ordering::Relaxed);
        self.srp
            .continuous_sendmsg_failures
            .store(0, Ordering::Relaxed);
        self.srp
            .firewall_enabled_or_nic_failure
            .store(0, Ordering::Relaxed);
        self.srp.mtt_rx_token.store(0, Ordering::Relaxed);
        self.srp.avg_token_workload.store(0, Ordering::Relaxed);
        self.srp.avg_backlog_calc.store(0, Ordering::Relaxed);
        self.pg.msg_queue_avail.store(0, Ordering::Relaxed);
        self.pg.msg_reserved.store(0, Ordering::Relaxed);
    }
}

/// Accessor producing the current value of one stats key.
pub type ReadFn = Box<dyn Fn() -> MapValue + Send>;

struct Track {
    token: TrackToken,
    key_name: String,
    mask: u8,
    notify: NotifyFn,
    /// Last value handed to this tracker, for change polling.
    old_value: Option<MapValue>,
}

/// The stats map: same surface as [`crate::cmap::CMap`], values computed on
/// demand.
pub struct StatsMap {
    entries: BTreeMap<String, ReadFn>,
    tracks: Vec<Track>,
    next_token: TrackToken,
}

macro_rules! srp_u64_keys {
    ($map:expr, $stats:expr, $($name:ident),* $(,)?) => {
        $(
            let s = Arc::clone(&$stats);
            $map.add_entry(
                concat!("stats.srp.", stringify!($name)),
                Box::new(move || MapValue::Uint64(s.srp.$name.load(Ordering::Relaxed))),
            );
        )*
    };
}

impl StatsMap {
    /// Build the map and populate the static SRP/PG key inventory.
    pub fn new(stats: Arc<TotemStats>) -> Self {
        let mut map = Self {
            entries: BTreeMap::new(),
            tracks: Vec::new(),
            next_token: 1,
        };

        srp_u64_keys!(
            map, stats, orf_token_tx, orf_token_rx, memb_merge_detect_tx,
            memb_merge_detect_rx, memb_join_tx, memb_join_rx, mcast_tx, mcast_retx,
            mcast_rx, memb_commit_token_tx, memb_commit_token_rx, token_hold_cancel_tx,
            token_hold_cancel_rx, operational_entered, operational_token_lost,
            gather_entered, gather_token_lost, commit_entered, commit_token_lost,
            recovery_entered, recovery_token_lost, consensus_timeouts, rx_msg_dropped,
        );

        let s = Arc::clone(&stats);
        map.add_entry(
            "stats.srp.continuous_gather",
            Box::new(move || MapValue::Uint32(s.srp.continuous_gather.load(Ordering::Relaxed))),
        );
        let s = Arc::clone(&stats);
        map.add_entry(
            "stats.srp.continuous_sendmsg_failures",
            Box::new(move || {
                MapValue::Uint32(s.srp.continuous_sendmsg_failures.load(Ordering::Relaxed))
            }),
        );
        let s = Arc::clone(&stats);
        map.add_entry(
            "stats.srp.firewall_enabled_or_nic_failure",
            Box::new(move || {
                MapValue::Uint8(s.srp.firewall_enabled_or_nic_failure.load(Ordering::Relaxed))
            }),
        );
        let s = Arc::clone(&stats);
        map.add_entry(
            "stats.srp.mtt_rx_token",
            Box::new(move || MapValue::Uint32(s.srp.mtt_rx_token.load(Ordering::Relaxed))),
        );
        let s = Arc::clone(&stats);
        map.add_entry(
            "stats.srp.avg_token_workload",
            Box::new(move || MapValue::Uint32(s.srp.avg_token_workload.load(Ordering::Relaxed))),
        );
        let s = Arc::clone(&stats);
        map.add_entry(
            "stats.srp.avg_backlog_calc",
            Box::new(move || MapValue::Uint32(s.srp.avg_backlog_calc.load(Ordering::Relaxed))),
        );
        let s = Arc::clone(&stats);
        map.add_entry(
            "stats.pg.msg_queue_avail",
            Box::new(move || MapValue::Uint32(s.pg.msg_queue_avail.load(Ordering::Relaxed))),
        );
        let s = Arc::clone(&stats);
        map.add_entry(
            "stats.pg.msg_reserved",
            Box::new(move || MapValue::Uint32(s.pg.msg_reserved.load(Ordering::Relaxed))),
        );

        map
    }

    fn notify(&mut self, event: TrackEvent, key: &str, new: Option<&MapValue>) {
        for track in &mut self.tracks {
            let bit = match event {
                TrackEvent::Add => TRACK_ADD,
                TrackEvent::Modify => TRACK_MODIFY,
                TrackEvent::Delete => TRACK_DELETE,
            };
            if track.mask & bit == 0 {
                continue;
            }
            let matches = if track.mask & TRACK_PREFIX != 0 {
                key.starts_with(track.key_name.as_str())
            } else {
                track.key_name == key
            };
            if matches {
                (track.notify)(event, key, new, None);
            }
        }
    }

    /// Register a key backed by `read`. Fires an ADD notify so dynamic
    /// sub-trees surface to subscribers.
    pub fn add_entry(&mut self, key: &str, read: ReadFn) {
        let value = read();
        self.entries.insert(key.to_string(), read);
        self.notify(TrackEvent::Add, key, Some(&value));
    }

    /// Unregister a key; fires a DELETE notify.
    pub fn remove_entry(&mut self, key: &str) -> Result<()> {
        match self.entries.remove(key) {
            Some(_) => {
                self.notify(TrackEvent::Delete, key, None);
                Ok(())
            }
            None => Err(Error::NotExist),
        }
    }

    /// Drop an entire dynamic sub-tree (per-node, per-link, per-connection),
    /// with one DELETE notify per key.
    pub fn remove_prefix(&mut self, prefix: &str) {
        let keys: Vec<String> = self
            .entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            let _ = self.remove_entry(&key);
        }
    }

    /// Read the current value of `key`.
    pub fn get(&self, key: &str) -> Result<MapValue> {
        match self.entries.get(key) {
            Some(read) => Ok(read()),
            None => Err(Error::NotExist),
        }
    }

    pub fn get_type(&self, key: &str) -> Result<ValueType> {
        Ok(self.get(key)?.value_type())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Stats keys are synthesized; clients cannot write them.
    pub fn set(&mut self, _key: &str, _value: MapValue) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Stats keys are synthesized; clients cannot delete them.
    pub fn delete(&mut self, _key: &str) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Stats keys are synthesized; clients cannot adjust them.
    pub fn adjust_int(&mut self, _key: &str, _step: i32) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Iterate keys beginning with `prefix`, in lexicographic order, with
    /// their current values.
    pub fn iter_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, MapValue)> + 'a {
        self.entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, read)| (k.as_str(), read()))
    }

    pub fn track_add(&mut self, key_name: &str, mask: u8, notify: NotifyFn) -> Result<TrackToken> {
        if mask & !(TRACK_ADD | TRACK_DELETE | TRACK_MODIFY | TRACK_PREFIX) != 0 {
            return Err(Error::InvalidParam);
        }
        // Seed the change detector so the first poll compares against the
        // value current at subscription time.
        let old_value = if mask & TRACK_PREFIX == 0 {
            self.get(key_name).ok()
        } else {
            None
        };
        let token = self.next_token;
        self.next_token += 1;
        self.tracks.push(Track {
            token,
            key_name: key_name.to_string(),
            mask,
            notify,
            old_value,
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

    /// Poll every non-prefix tracker: re-read its key and fire a MODIFY
    /// notify when the value changed since last seen. Called periodically by
    /// the owner of the map.
    pub fn trigger_trackers(&mut self) {
        for track in &mut self.tracks {
            if track.mask & TRACK_PREFIX != 0 || track.mask & TRACK_MODIFY == 0 {
                continue;
            }
            let Some(read) = self.entries.get(track.key_name.as_str()) else {
                continue;
            };
            let current = read();
            let changed = match &track.old_value {
                Some(old) => !old.same_as(&current),
                None => true,
            };
            if changed {
                (track.notify)(
                    TrackEvent::Modify,
                    &track.key_name,
                    Some(&current),
                    track.old_value.as_ref(),
                );
                track.old_value = Some(current);
            }
        }
    }
}
