// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded cooperative event loop.
//!
//! One `mio::Poll` owns every transport descriptor; protocol timers are a
//! deadline-ordered list polled between readiness passes. All protocol
//! callbacks run to completion on this loop's stack; nothing here blocks
//! beyond the computed poll timeout.

use std::time::{Duration, Instant};

use mio::{Events, Poll, Token};

use crate::error::Result;

/// Handle identifying a pending timer, for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(u64);

struct TimerEntry<K> {
    id: u64,
    deadline: Instant,
    kind: K,
}

/// Deadline-ordered timer list.
///
/// The list is short (a dozen protocol timers at most), so insertion keeps a
/// plain vector sorted on pop instead of maintaining a heap.
pub struct Timers<K> {
    entries: Vec<TimerEntry<K>>,
    next_id: u64,
}

impl<K: Copy> Timers<K> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Arm a timer `after` from `now`.
    pub fn add(&mut self, now: Instant, after: Duration, kind: K) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(TimerEntry {
            id,
            deadline: now + after,
            kind,
        });
        TimerHandle(id)
    }

    /// Disarm. Harmless if the timer already fired.
    pub fn del(&mut self, handle: TimerHandle) {
        self.entries.retain(|e| e.id != handle.0);
    }

    /// Earliest pending deadline, for the poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|e| e.deadline).min()
    }

    /// Remove and return the earliest timer whose deadline has passed.
    /// Call repeatedly until `None` to drain a tick.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(TimerHandle, K)> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.deadline <= now)
            .min_by_key(|(_, e)| e.deadline)
            .map(|(i, _)| i)?;
        let entry = self.entries.remove(idx);
        Some((TimerHandle(entry.id), entry.kind))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Copy> Default for Timers<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Readiness loop: poll wrapper dispatching socket events by token.
pub struct EventLoop {
    poll: Poll,
    events: Events,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
        })
    }

    pub fn registry(&self) -> &mio::Registry {
        self.poll.registry()
    }

    /// Wait for readiness or the next timer deadline, whichever is sooner.
    /// Returns the tokens that became readable.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<Vec<Token>> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }
        Ok(self
            .events
            .iter()
            .filter(|ev| ev.is_readable())
            .map(|ev| ev.token())
            .collect())
    }
}
