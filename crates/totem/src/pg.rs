// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet-group layer: fragmentation, group filtering, and guarantee
//! escalation over the single-ring protocol.
//!
//! Application messages of up to [`crate::config::MESSAGE_SIZE_MAX`] bytes
//! are cut into ring-datagram-sized fragments; the first fragment carries
//! the total length and the destination group list, continuations carry an
//! offset. Reassembly is keyed by originator nodeid (the ring already
//! guarantees per-originator ordering), and an in-flight stream that does
//! not complete before a configuration change is dropped, never leaked into
//! the new ring.
//!
//! Group instances are handed out as check-tagged handles; a stale handle
//! can never reach another instance's callbacks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::{TotemConfig, MESSAGE_SIZE_MAX};
use crate::error::{Error, Result};
use crate::hdb::{Handle, HandleDatabase};
use crate::seq::SeqNo;
use crate::srp::wire::RingId;
use crate::srp::{ConfigurationType, Guarantee, SrpEvents, TokenEvent, TotemSrp};
use crate::stats::TotemStats;
use crate::totemip::TotemIpAddress;
use crate::transport::{create_transport, Transport, TransportEvents};

/// Callback receiving a reassembled message for a matching group.
pub type DeliverFn = Box<dyn FnMut(u32, &[u8], bool)>;

/// Callback receiving configuration changes.
pub type ConfchgFn = Box<dyn FnMut(ConfigurationType, &[u32], &[u32], &[u32], RingId)>;

/// Callback fired on a token event; return value is ignored for recurring
/// callbacks.
pub type TokenCallbackFn = Box<dyn FnMut(TokenEvent)>;

/// Transmit queue pressure, reported to the registered watcher when the
/// level changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QLevel {
    Low,
    Good,
    High,
    Critical,
}

pub type QLevelFn = Box<dyn FnMut(QLevel)>;

/// One registered group instance.
pub struct GroupInstance {
    groups: Mutex<Vec<Vec<u8>>>,
    deliver_fn: Mutex<DeliverFn>,
    confchg_fn: Mutex<ConfchgFn>,
}

// ===== Fragment header =====

/// Fixed part of the per-fragment header.
const FRAG_HEADER_LEN: usize = 13;

struct FragHeader {
    msg_len: u32,
    copy_len: u32,
    copy_base_offset: u32,
    continuation: bool,
}

fn frag_encode(
    out: &mut Vec<u8>,
    header: &FragHeader,
    groups: Option<&[Vec<u8>]>,
    payload: &[u8],
) {
    out.extend_from_slice(&header.msg_len.to_ne_bytes());
    out.extend_from_slice(&header.copy_len.to_ne_bytes());
    out.extend_from_slice(&header.copy_base_offset.to_ne_bytes());
    out.push(u8::from(header.continuation));
    if let Some(groups) = groups {
        out.extend_from_slice(&(groups.len() as u16).to_ne_bytes());
        for group in groups {
            out.extend_from_slice(&(group.len() as u16).to_ne_bytes());
            out.extend_from_slice(group);
        }
    }
    out.extend_from_slice(payload);
}

fn read_u16(data: &[u8], pos: &mut usize, swab: bool) -> Option<u16> {
    let bytes = data.get(*pos..*pos + 2)?;
    *pos += 2;
    let v = u16::from_ne_bytes([bytes[0], bytes[1]]);
    Some(if swab { v.swap_bytes() } else { v })
}

fn read_u32(data: &[u8], pos: &mut usize, swab: bool) -> Option<u32> {
    let bytes = data.get(*pos..*pos + 4)?;
    *pos += 4;
    let v = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Some(if swab { v.swap_bytes() } else { v })
}

struct DecodedFrag<'a> {
    header: FragHeader,
    groups: Vec<Vec<u8>>,
    payload: &'a [u8],
}

fn frag_decode(data: &[u8], swab: bool) -> Option<DecodedFrag<'_>> {
    let mut pos = 0usize;
    let msg_len = read_u32(data, &mut pos, swab)?;
    let copy_len = read_u32(data, &mut pos, swab)?;
    let copy_base_offset = read_u32(data, &mut pos, swab)?;
    let continuation = *data.get(pos)? != 0;
    pos += 1;
    let mut groups = Vec::new();
    if !continuation {
        let count = read_u16(data, &mut pos, swab)? as usize;
        for _ in 0..count {
            let len = read_u16(data, &mut pos, swab)? as usize;
            let bytes = data.get(pos..pos + len)?;
            pos += len;
            groups.push(bytes.to_vec());
        }
    }
    let payload = data.get(pos..)?;
    if payload.len() < copy_len as usize {
        return None;
    }
    Some(DecodedFrag {
        header: FragHeader {
            msg_len,
            copy_len,
            copy_base_offset,
            continuation,
        },
        groups,
        payload: &payload[..copy_len as usize],
    })
}

// ===== Reassembly =====

struct Assembly {
    msg_len: usize,
    groups: Vec<Vec<u8>>,
    swab: bool,
    buf: Vec<u8>,
    /// Set when a continuation arrived out of contract; the stream is
    /// discarded until the next first fragment.
    broken: bool,
}

struct PendingSafe {
    seq: SeqNo,
    nodeid: u32,
    groups: Vec<Vec<u8>>,
    msg: Vec<u8>,
    swab: bool,
}

struct TokenCallback {
    id: u64,
    event: TokenEvent,
    oneshot: bool,
    callback: TokenCallbackFn,
}

/// Queue fullness thresholds, in percent used.
const Q_LEVEL_GOOD_USED: u32 = 25;
const Q_LEVEL_HIGH_USED: u32 = 70;
const Q_LEVEL_CRITICAL_USED: u32 = 90;

/// The upcall half of the layer: everything the ring calls back into.
struct PgShared {
    instances: Arc<HandleDatabase<GroupInstance>>,
    assemblies: HashMap<u32, Assembly>,
    safe_pending: VecDeque<PendingSafe>,
    token_callbacks: Vec<TokenCallback>,
    next_token_callback: u64,
    q_level_fn: Option<QLevelFn>,
    q_level: QLevel,
}

impl PgShared {
    fn dispatch(&self, nodeid: u32, groups: &[Vec<u8>], msg: &[u8], swab: bool) {
        self.instances.iterator_reset();
        while let Some((instance, _handle)) = self.instances.iterator_next() {
            let subscribed = {
                let joined = instance.groups.lock();
                groups.iter().any(|g| joined.contains(g))
            };
            if subscribed {
                let mut deliver = instance.deliver_fn.lock();
                (*deliver)(nodeid, msg, swab);
            }
        }
    }

    fn flush_safe(&mut self, up_to: SeqNo) {
        while self
            .safe_pending
            .front()
            .is_some_and(|front| front.seq.lte(up_to))
        {
            if let Some(pending) = self.safe_pending.pop_front() {
                self.dispatch(pending.nodeid, &pending.groups, &pending.msg, pending.swab);
            }
        }
    }
}

impl SrpEvents for PgShared {
    fn deliver(&mut self, nodeid: u32, seq: SeqNo, guarantee: u8, payload: &[u8], swab: bool) {
        let Some(frag) = frag_decode(payload, swab) else {
            log::debug!("[pg] malformed fragment from node {}, dropped", nodeid);
            return;
        };
        if frag.header.msg_len as usize > MESSAGE_SIZE_MAX {
            log::debug!("[pg] oversized message ({} bytes) from node {}", frag.header.msg_len, nodeid);
            return;
        }

        let assembly = self.assemblies.entry(nodeid).or_insert_with(|| Assembly {
            msg_len: 0,
            groups: Vec::new(),
            swab: false,
            buf: Vec::new(),
            broken: false,
        });
        if frag.header.continuation {
            if assembly.broken
                || assembly.buf.len() != frag.header.copy_base_offset as usize
                || assembly.msg_len == 0
            {
                // Mid-stream fragment without its head; drop until the next
                // message starts.
                assembly.broken = true;
                return;
            }
        } else {
            if !assembly.buf.is_empty() {
                log::debug!(
                    "[pg] discarding incomplete {} byte stream from node {}",
                    assembly.buf.len(),
                    nodeid
                );
            }
            assembly.msg_len = frag.header.msg_len as usize;
            assembly.groups = frag.groups;
            assembly.swab = swab;
            assembly.buf.clear();
            assembly.broken = false;
        }
        assembly.buf.extend_from_slice(frag.payload);
        if assembly.buf.len() < assembly.msg_len {
            return;
        }

        let msg = std::mem::take(&mut assembly.buf);
        let groups = std::mem::take(&mut assembly.groups);
        let msg_swab = assembly.swab;
        assembly.msg_len = 0;

        if guarantee == Guarantee::Safe as u8 {
            // Withheld until every ring member has acknowledged the last
            // fragment; released by aru_update.
            self.safe_pending.push_back(PendingSafe {
                seq,
                nodeid,
                groups,
                msg,
                swab: msg_swab,
            });
        } else {
            self.dispatch(nodeid, &groups, &msg, msg_swab);
        }
    }

    fn confchg(
        &mut self,
        kind: ConfigurationType,
        members: &[u32],
        left: &[u32],
        joined: &[u32],
        ring_id: RingId,
    ) {
        if kind == ConfigurationType::Transitional {
            // Nothing acknowledged under the old ring can complete now;
            // withheld safe messages became agreed at the boundary, and
            // half-assembled streams die with the old ring.
            while let Some(pending) = self.safe_pending.pop_front() {
                self.dispatch(pending.nodeid, &pending.groups, &pending.msg, pending.swab);
            }
            let dropped: usize = self
                .assemblies
                .values()
                .filter(|a| !a.buf.is_empty())
                .count();
            if dropped > 0 {
                log::info!(
                    "[pg] configuration change: dropping {} incomplete fragment stream(s)",
                    dropped
                );
            }
            self.assemblies.clear();
        }
        self.instances.iterator_reset();
        while let Some((instance, _handle)) = self.instances.iterator_next() {
            let mut confchg = instance.confchg_fn.lock();
            (*confchg)(kind, members, left, joined, ring_id);
        }
    }

    fn aru_update(&mut self, aru: SeqNo) {
        self.flush_safe(aru);
    }

    fn token_event(&mut self, event: TokenEvent) {
        let mut fired_oneshots = Vec::new();
        for cb in &mut self.token_callbacks {
            if cb.event == event {
                (cb.callback)(event);
                if cb.oneshot {
                    fired_oneshots.push(cb.id);
                }
            }
        }
        self.token_callbacks
            .retain(|cb| !fired_oneshots.contains(&cb.id));
    }
}

/// The packet-group engine: owns the ring protocol, the transport, and the
/// registered group instances.
pub struct TotemPg {
    cfg: TotemConfig,
    srp: TotemSrp,
    net: Box<dyn Transport>,
    shared: PgShared,
    instances: Arc<HandleDatabase<GroupInstance>>,
    stats: Arc<TotemStats>,
    reserved: u32,
    recv_scratch: Vec<Vec<u8>>,
}

impl TotemPg {
    /// Build the engine with the transport selected by the configuration.
    pub fn new(mut cfg: TotemConfig) -> Result<Self> {
        let net = create_transport(&cfg)?;
        net.net_mtu_adjust(&mut cfg);
        Self::with_transport(cfg, net)
    }

    /// Build with a caller-supplied transport (tests, alternate backends).
    pub fn with_transport(cfg: TotemConfig, net: Box<dyn Transport>) -> Result<Self> {
        let stats = Arc::new(TotemStats::default());
        let srp = TotemSrp::new(cfg.clone(), Arc::clone(&stats))?;
        let instances = Arc::new(HandleDatabase::new(None));
        let shared = PgShared {
            instances: Arc::clone(&instances),
            assemblies: HashMap::new(),
            safe_pending: VecDeque::new(),
            token_callbacks: Vec::new(),
            next_token_callback: 1,
            q_level_fn: None,
            q_level: QLevel::Low,
        };
        Ok(Self {
            cfg,
            srp,
            net,
            shared,
            instances,
            stats,
            reserved: 0,
            recv_scratch: Vec::new(),
        })
    }

    pub fn stats(&self) -> Arc<TotemStats> {
        Arc::clone(&self.stats)
    }

    pub fn my_nodeid(&self) -> u32 {
        self.srp.my_nodeid()
    }

    pub fn ring_id(&self) -> RingId {
        self.srp.ring_id()
    }

    pub fn members(&self) -> Vec<u32> {
        self.srp.members()
    }

    pub fn ifaces_get(&self) -> Vec<TotemIpAddress> {
        self.net.ifaces_get()
    }

    pub fn iface_print(&self) -> String {
        self.net.iface_print()
    }

    pub fn crypto_set(&mut self, cipher: &str, hash: &str) -> Result<()> {
        self.net.crypto_set(cipher, hash)
    }

    /// Attach a transport event observer (interface changes, MTU changes,
    /// token target completion).
    pub fn transport_events_register(&mut self, events: Box<dyn TransportEvents>) {
        self.net.events_register(events);
    }

    /// Register transport sockets with the event loop.
    pub fn register(&mut self, registry: &mio::Registry, base: mio::Token) -> Result<()> {
        self.net.register(registry, base)
    }

    /// Start ring formation.
    pub fn start(&mut self, now: Instant) {
        self.srp.start(now, &mut *self.net);
    }

    /// Drain the transport and feed every datagram through the protocol.
    pub fn pump(&mut self, now: Instant) -> Result<()> {
        self.recv_scratch.clear();
        let scratch = &mut self.recv_scratch;
        self.net.recv_flush(&mut |data| scratch.push(data.to_vec()))?;
        for data in std::mem::take(&mut self.recv_scratch) {
            self.srp
                .message_received(now, &mut *self.net, &mut self.shared, &data);
        }
        self.check_q_level();
        Ok(())
    }

    /// Fire protocol timers whose deadline has passed.
    pub fn poll_timers(&mut self, now: Instant) {
        self.srp.poll_timers(now, &mut *self.net, &mut self.shared);
    }

    /// Earliest protocol deadline, for the poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.srp.next_deadline()
    }

    // ===== Group instances =====

    /// Register a group instance; the returned handle scopes every other
    /// group operation.
    pub fn groups_initialize(&mut self, deliver_fn: DeliverFn, confchg_fn: ConfchgFn) -> Result<Handle> {
        self.instances.create(GroupInstance {
            groups: Mutex::new(Vec::new()),
            deliver_fn: Mutex::new(deliver_fn),
            confchg_fn: Mutex::new(confchg_fn),
        })
    }

    pub fn groups_finalize(&mut self, handle: Handle) -> Result<()> {
        self.instances.destroy(handle)
    }

    pub fn groups_join(&mut self, handle: Handle, groups: &[&[u8]]) -> Result<()> {
        for group in groups {
            if group.len() > u16::MAX as usize {
                return Err(Error::NameTooLong);
            }
        }
        let instance = self.instances.get(handle)?;
        {
            let mut joined = instance.groups.lock();
            for group in groups {
                if !joined.iter().any(|g| g == group) {
                    joined.push(group.to_vec());
                }
            }
        }
        self.instances.put(handle)
    }

    pub fn groups_leave(&mut self, handle: Handle, groups: &[&[u8]]) -> Result<()> {
        let instance = self.instances.get(handle)?;
        {
            let mut joined = instance.groups.lock();
            joined.retain(|g| !groups.iter().any(|x| x == g));
        }
        self.instances.put(handle)
    }

    // ===== Multicast =====

    /// Multicast `iovec` to the groups this instance has joined.
    pub fn groups_mcast_joined(
        &mut self,
        handle: Handle,
        iovec: &[&[u8]],
        guarantee: Guarantee,
    ) -> Result<()> {
        let instance = self.instances.get(handle)?;
        let groups = instance.groups.lock().clone();
        self.instances.put(handle)?;
        self.mcast_with_groups(&groups, iovec, guarantee)
    }

    /// Multicast to an explicit group list, without joining.
    pub fn groups_mcast_groups(
        &mut self,
        guarantee: Guarantee,
        groups: &[&[u8]],
        iovec: &[&[u8]],
    ) -> Result<()> {
        let owned: Vec<Vec<u8>> = groups.iter().map(|g| g.to_vec()).collect();
        self.mcast_with_groups(&owned, iovec, guarantee)
    }

    fn mcast_with_groups(
        &mut self,
        groups: &[Vec<u8>],
        iovec: &[&[u8]],
        guarantee: Guarantee,
    ) -> Result<()> {
        if groups.is_empty() {
            return Err(Error::InvalidParam);
        }
        let msg: Vec<u8> = iovec.concat();
        if msg.len() > MESSAGE_SIZE_MAX {
            return Err(Error::InvalidParam);
        }
        let fragments = self.fragment(groups, &msg);
        if self.srp.avail() < fragments.len() {
            return Err(Error::TryAgain);
        }
        for frag in fragments {
            self.srp.mcast(&mut *self.net, &frag, guarantee)?;
        }
        self.check_q_level();
        Ok(())
    }

    /// Usable application bytes in the first fragment of a message tagged
    /// with `groups`.
    fn first_frag_capacity(&self, groups: &[Vec<u8>]) -> usize {
        let group_block: usize = 2 + groups.iter().map(|g| 2 + g.len()).sum::<usize>();
        self.max_srp_payload()
            .saturating_sub(FRAG_HEADER_LEN + group_block)
    }

    fn cont_frag_capacity(&self) -> usize {
        self.max_srp_payload().saturating_sub(FRAG_HEADER_LEN)
    }

    /// Bytes the ring can carry per datagram, after its own framing.
    fn max_srp_payload(&self) -> usize {
        // Totem mcast framing: header, source address, seq, ring id,
        // guarantee, payload length.
        const MCAST_OVERHEAD: usize = 13 + 22 + 4 + 12 + 1 + 4;
        self.cfg.net_mtu.saturating_sub(MCAST_OVERHEAD).max(64)
    }

    fn fragment(&self, groups: &[Vec<u8>], msg: &[u8]) -> Vec<Vec<u8>> {
        let mut fragments = Vec::new();
        let first_cap = self.first_frag_capacity(groups).max(1);
        let cont_cap = self.cont_frag_capacity().max(1);

        let first_len = msg.len().min(first_cap);
        let mut out = Vec::with_capacity(FRAG_HEADER_LEN + first_len + 64);
        frag_encode(
            &mut out,
            &FragHeader {
                msg_len: msg.len() as u32,
                copy_len: first_len as u32,
                copy_base_offset: 0,
                continuation: false,
            },
            Some(groups),
            &msg[..first_len],
        );
        fragments.push(out);

        let mut offset = first_len;
        while offset < msg.len() {
            let len = (msg.len() - offset).min(cont_cap);
            let mut out = Vec::with_capacity(FRAG_HEADER_LEN + len);
            frag_encode(
                &mut out,
                &FragHeader {
                    msg_len: msg.len() as u32,
                    copy_len: len as u32,
                    copy_base_offset: offset as u32,
                    continuation: true,
                },
                None,
                &msg[offset..offset + len],
            );
            fragments.push(out);
            offset += len;
        }
        fragments
    }

    // ===== Admission control =====

    /// Reserve transmit-queue space for `iovec` ahead of a send burst.
    /// Returns the number of ring messages reserved.
    pub fn groups_joined_reserve(&mut self, handle: Handle, iovec: &[&[u8]]) -> Result<usize> {
        let instance = self.instances.get(handle)?;
        let groups = instance.groups.lock().clone();
        self.instances.put(handle)?;

        let msg_len: usize = iovec.iter().map(|io| io.len()).sum();
        if msg_len > MESSAGE_SIZE_MAX {
            return Err(Error::InvalidParam);
        }
        let first_cap = self.first_frag_capacity(&groups).max(1);
        let cont_cap = self.cont_frag_capacity().max(1);
        let count = if msg_len <= first_cap {
            1
        } else {
            1 + (msg_len - first_cap).div_ceil(cont_cap)
        };
        if self.srp.avail() < self.reserved as usize + count {
            return Err(Error::TryAgain);
        }
        self.reserved += count as u32;
        self.stats
            .pg
            .msg_reserved
            .store(self.reserved, Ordering::Relaxed);
        Ok(count)
    }

    /// Return a reservation taken by [`groups_joined_reserve`](Self::groups_joined_reserve).
    pub fn groups_joined_release(&mut self, msg_count: usize) -> Result<()> {
        if (msg_count as u32) > self.reserved {
            return Err(Error::InvalidParam);
        }
        self.reserved -= msg_count as u32;
        self.stats
            .pg
            .msg_reserved
            .store(self.reserved, Ordering::Relaxed);
        Ok(())
    }

    // ===== Token callbacks and queue level =====

    /// Schedule `callback` on the given token event. A oneshot callback is
    /// removed after its first invocation.
    pub fn callback_token_create(
        &mut self,
        event: TokenEvent,
        oneshot: bool,
        callback: TokenCallbackFn,
    ) -> u64 {
        let id = self.shared.next_token_callback;
        self.shared.next_token_callback += 1;
        self.shared.token_callbacks.push(TokenCallback {
            id,
            event,
            oneshot,
            callback,
        });
        id
    }

    pub fn callback_token_destroy(&mut self, id: u64) {
        self.shared.token_callbacks.retain(|cb| cb.id != id);
    }

    /// Register the queue-pressure watcher.
    pub fn queue_level_register_callback(&mut self, callback: QLevelFn) {
        self.shared.q_level_fn = Some(callback);
    }

    fn check_q_level(&mut self) {
        let max = self.cfg.message_queue_max().max(1);
        let avail = self.srp.avail();
        let used_pct = (100 * (max - avail.min(max)) / max) as u32;
        let level = if used_pct >= Q_LEVEL_CRITICAL_USED {
            QLevel::Critical
        } else if used_pct >= Q_LEVEL_HIGH_USED {
            QLevel::High
        } else if used_pct >= Q_LEVEL_GOOD_USED {
            QLevel::Good
        } else {
            QLevel::Low
        };
        if level != self.shared.q_level {
            self.shared.q_level = level;
            if let Some(cb) = &mut self.shared.q_level_fn {
                cb(level);
            }
        }
    }
}
