// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Totem single-ring protocol: membership and totally-ordered multicast.
//!
//! The protocol is a state machine with four states. In OPERATIONAL a token
//! circulates the ring; holding it grants the right to multicast, and its
//! aru/rtr fields drive retransmission and release. Membership changes run
//! GATHER (JOIN consensus on the surviving set), COMMIT (two rotations of a
//! commit token install the new ring id), and RECOVERY (messages from the
//! old ring are re-multicast encapsulated into the new ring so every
//! survivor can finish old-ring delivery before the new configuration is
//! announced).
//!
//! Everything runs on the caller's event loop: entry points are
//! `message_received`, `poll_timers`, and `mcast`; outbound traffic goes
//! through the supplied transport, upcalls through [`SrpEvents`].

pub mod ring_id;
pub mod wire;

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{
    TotemConfig, MAX_NO_CONT_GATHER, MAX_NO_CONT_SENDMSG_FAILURES, TRANSMITS_ALLOWED,
};
use crate::error::{Error, Result};
use crate::rt::{TimerHandle, Timers};
use crate::seq::SeqNo;
use crate::sq::SortQueue;
use crate::stats::TotemStats;
use crate::totemip::TotemIpAddress;
use crate::transport::Transport;

use ring_id::{RingIdStore, RING_SEQ_INCREMENT};
use wire::{
    decode, CommitMembEntry, McastMessage, MembCommitToken, MembJoin, MembMergeDetect, Message,
    MessageHeader, MessageType, OrfToken, RingId, RtrItem, TokenHoldCancel,
    RETRANSMIT_ENTRIES_MAX,
};

/// Delivery guarantee requested for a multicast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guarantee {
    /// Totally ordered at every surviving member.
    Agreed = 0,
    /// Agreed, and withheld until every member has acknowledged the message.
    Safe = 1,
}

/// Configuration delivery kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationType {
    Regular,
    Transitional,
}

/// Token lifecycle notifications, for callback-token subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEvent {
    Received,
    Sent,
}

/// Upcalls from the protocol to the layer above.
pub trait SrpEvents {
    /// An ordered message is deliverable. Messages arrive in seq order
    /// within a ring; `swab` is set when the originator used the opposite
    /// byte order.
    fn deliver(&mut self, nodeid: u32, seq: SeqNo, guarantee: u8, payload: &[u8], swab: bool);

    /// A configuration change. The transitional configuration precedes any
    /// message of the new ring and follows the last message of the old one.
    fn confchg(
        &mut self,
        kind: ConfigurationType,
        members: &[u32],
        left: &[u32],
        joined: &[u32],
        ring_id: RingId,
    );

    /// The ring's all-received-up-to point advanced: every member now holds
    /// all messages up to `aru`. Safe-guarantee delivery keys off this.
    fn aru_update(&mut self, aru: SeqNo);

    /// The token was received or forwarded by this node.
    fn token_event(&mut self, event: TokenEvent);
}

/// Protocol membership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembState {
    Operational,
    Gather,
    Commit,
    Recovery,
}

/// Protocol timers dispatched by the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SrpTimer {
    /// Token failed to return: ring is dead.
    TokenLoss,
    /// Retransmit the last forwarded token.
    TokenRetransmit,
    /// Release an idle-held token.
    TokenHold,
    /// Re-broadcast JOIN while gathering.
    Join,
    /// Consensus not reached in time.
    Consensus,
    /// Periodic merge-detect multicast (ring representative).
    MergeDetect,
    /// Commit token failed to complete its rotations.
    CommitTokenLoss,
}

/// One received multicast, parked in a sort-queue slot.
#[derive(Debug, Clone, Default)]
struct RecvSlot {
    /// Original wire bytes, for RTR retransmission.
    bytes: Vec<u8>,
    from_nodeid: u32,
    guarantee: u8,
    encapsulated: bool,
    payload: Vec<u8>,
    swab: bool,
}

/// A locally originated message waiting for the token.
struct QueuedMsg {
    payload: Vec<u8>,
    guarantee: Guarantee,
}

// Sorted-set helpers over address lists. Lists stay sorted by address so
// ring order and representative selection fall out of the ordering.

fn memb_sort(list: &mut Vec<TotemIpAddress>) {
    list.sort_by(|a, b| a.compare(b));
    list.dedup();
}

fn memb_union(a: &[TotemIpAddress], b: &[TotemIpAddress]) -> Vec<TotemIpAddress> {
    let mut out = a.to_vec();
    out.extend_from_slice(b);
    memb_sort(&mut out);
    out
}

fn memb_subtract(a: &[TotemIpAddress], b: &[TotemIpAddress]) -> Vec<TotemIpAddress> {
    a.iter().filter(|x| !b.contains(x)).copied().collect()
}

fn memb_intersect(a: &[TotemIpAddress], b: &[TotemIpAddress]) -> Vec<TotemIpAddress> {
    a.iter().filter(|x| b.contains(x)).copied().collect()
}

fn memb_eq(a: &[TotemIpAddress], b: &[TotemIpAddress]) -> bool {
    a.len() == b.len() && a.iter().all(|x| b.contains(x))
}

fn nodeids(list: &[TotemIpAddress]) -> Vec<u32> {
    list.iter().map(|a| a.nodeid).collect()
}

/// The single-ring protocol instance.
pub struct TotemSrp {
    cfg: TotemConfig,
    stats: Arc<TotemStats>,
    my_addr: TotemIpAddress,

    state: MembState,

    // Membership sets (sorted by address).
    my_proc_list: Vec<TotemIpAddress>,
    my_failed_list: Vec<TotemIpAddress>,
    my_memb_list: Vec<TotemIpAddress>,
    my_new_memb_list: Vec<TotemIpAddress>,
    consensus_set: Vec<u32>,

    my_ring_id: RingId,
    my_old_ring_id: RingId,
    highest_ring_seq: u64,
    ring_id_store: RingIdStore,

    // Ordering state for the active queue (regular in OPERATIONAL/GATHER,
    // recovery in RECOVERY).
    regular_sort_queue: SortQueue<RecvSlot>,
    recovery_sort_queue: SortQueue<RecvSlot>,
    my_aru: SeqNo,
    my_high_seq_received: SeqNo,
    my_high_delivered: SeqNo,
    my_last_aru: SeqNo,
    my_aru_count: u32,
    my_token_seq: Option<u32>,

    // Transmit queues.
    new_message_queue: VecDeque<QueuedMsg>,
    retrans_message_queue: VecDeque<Vec<u8>>,

    // Token bookkeeping.
    last_token_bytes: Option<Vec<u8>>,
    held_token: Option<OrfToken>,
    hold_cancel_sent: bool,
    last_token_rx: Option<Instant>,

    // Recovery bookkeeping.
    my_install_seq: SeqNo,
    my_retrans_flg_count: u32,
    /// Old ring's highest received seq, the delivery bound at the boundary.
    old_ring_high_seq: SeqNo,

    // Timers.
    timers: Timers<SrpTimer>,
    t_token_loss: Option<TimerHandle>,
    t_token_retransmit: Option<TimerHandle>,
    t_token_hold: Option<TimerHandle>,
    t_join: Option<TimerHandle>,
    t_consensus: Option<TimerHandle>,
    t_merge: Option<TimerHandle>,
    t_commit_loss: Option<TimerHandle>,

    continuous_gather: u32,
    send_fail_count: u32,

    /// Protocol clock, refreshed at every entry point. Timers are armed
    /// against this so a driver may run the protocol on virtual time.
    now: Instant,
}

impl TotemSrp {
    pub fn new(cfg: TotemConfig, stats: Arc<TotemStats>) -> Result<Self> {
        let iface = cfg.interfaces.first().ok_or(Error::InvalidParam)?;
        let mut my_addr = iface.bindnet;
        my_addr.nodeid = cfg.node_id;
        if my_addr.nodeid == 0 {
            return Err(Error::InvalidParam);
        }
        let queue_len = cfg.message_queue_max().max(16);
        let ring_id_store = RingIdStore::new(&cfg.ring_id_dir, my_addr.nodeid);
        let highest_ring_seq = ring_id_store.load();
        log::debug!(
            "[srp] initializing node {} ({}), queue depth {}",
            my_addr.nodeid,
            my_addr,
            queue_len
        );
        Ok(Self {
            my_proc_list: vec![my_addr],
            my_failed_list: Vec::new(),
            my_memb_list: vec![my_addr],
            my_new_memb_list: Vec::new(),
            consensus_set: vec![my_addr.nodeid],
            my_ring_id: RingId {
                rep: my_addr.nodeid,
                seq: 0,
            },
            my_old_ring_id: RingId::default(),
            highest_ring_seq,
            ring_id_store,
            regular_sort_queue: SortQueue::new(queue_len, SeqNo(0)),
            recovery_sort_queue: SortQueue::new(queue_len, SeqNo(0)),
            my_aru: SeqNo(0),
            my_high_seq_received: SeqNo(0),
            my_high_delivered: SeqNo(0),
            my_last_aru: SeqNo(0),
            my_aru_count: 0,
            my_token_seq: None,
            new_message_queue: VecDeque::new(),
            retrans_message_queue: VecDeque::new(),
            last_token_bytes: None,
            held_token: None,
            hold_cancel_sent: false,
            last_token_rx: None,
            my_install_seq: SeqNo(0),
            my_retrans_flg_count: 0,
            old_ring_high_seq: SeqNo(0),
            timers: Timers::new(),
            t_token_loss: None,
            t_token_retransmit: None,
            t_token_hold: None,
            t_join: None,
            t_consensus: None,
            t_merge: None,
            t_commit_loss: None,
            continuous_gather: 0,
            send_fail_count: 0,
            now: Instant::now(),
            state: MembState::Gather,
            my_addr,
            cfg,
            stats,
        })
    }

    pub fn my_nodeid(&self) -> u32 {
        self.my_addr.nodeid
    }

    pub fn ring_id(&self) -> RingId {
        self.my_ring_id
    }

    pub fn state(&self) -> MembState {
        self.state
    }

    pub fn members(&self) -> Vec<u32> {
        nodeids(&self.my_memb_list)
    }

    /// Queue slots available for new originations, for admission control.
    pub fn avail(&self) -> usize {
        self.cfg
            .message_queue_max()
            .saturating_sub(self.new_message_queue.len())
    }

    /// Begin ring formation. Call once after construction.
    pub fn start(&mut self, now: Instant, net: &mut dyn Transport) {
        self.now = now;
        log::info!("[srp] node {} starting membership protocol", self.my_addr.nodeid);
        self.memb_state_gather_enter(net, "start");
    }

    /// Earliest pending timer deadline, for the poll timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    // ===== Timer plumbing =====

    fn arm(&mut self, slot: fn(&mut Self) -> &mut Option<TimerHandle>, ms: u64, kind: SrpTimer) {
        let handle = self
            .timers
            .add(self.now, Duration::from_millis(ms.max(1)), kind);
        if let Some(old) = slot(self).replace(handle) {
            self.timers.del(old);
        }
    }

    fn cancel(&mut self, slot: fn(&mut Self) -> &mut Option<TimerHandle>) {
        if let Some(handle) = slot(self).take() {
            self.timers.del(handle);
        }
    }

    fn cancel_token_timers(&mut self) {
        self.cancel(|s| &mut s.t_token_loss);
        self.cancel(|s| &mut s.t_token_retransmit);
        self.cancel(|s| &mut s.t_token_hold);
        self.cancel(|s| &mut s.t_merge);
        self.held_token = None;
    }

    /// Dispatch every timer whose deadline has passed.
    pub fn poll_timers(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        events: &mut dyn SrpEvents,
    ) {
        self.now = now;
        self.check_send_health(net);
        while let Some((handle, kind)) = self.timers.pop_expired(now) {
            self.clear_fired_handle(handle);
            self.timer_expired(kind, net, events);
        }
    }

    /// A run of send failures long enough to indicate a local firewall or
    /// NIC fault abandons the ring rather than letting it rot silently.
    fn check_send_health(&mut self, net: &mut dyn Transport) {
        if matches!(self.state, MembState::Operational)
            && self.send_fail_count >= MAX_NO_CONT_SENDMSG_FAILURES
        {
            self.send_fail_count = 0;
            self.memb_state_gather_enter(net, "continuous sendmsg failures");
        }
    }

    fn clear_fired_handle(&mut self, handle: TimerHandle) {
        for slot in [
            &mut self.t_token_loss,
            &mut self.t_token_retransmit,
            &mut self.t_token_hold,
            &mut self.t_join,
            &mut self.t_consensus,
            &mut self.t_merge,
            &mut self.t_commit_loss,
        ] {
            if *slot == Some(handle) {
                *slot = None;
            }
        }
    }

    fn timer_expired(&mut self, kind: SrpTimer, net: &mut dyn Transport, events: &mut dyn SrpEvents) {
        match kind {
            SrpTimer::TokenLoss => {
                match self.state {
                    MembState::Operational => {
                        self.stats
                            .srp
                            .operational_token_lost
                            .fetch_add(1, Ordering::Relaxed);
                        log::warn!(
                            "[srp] token lost in OPERATIONAL, ring {}",
                            self.my_ring_id
                        );
                    }
                    MembState::Recovery => {
                        self.stats
                            .srp
                            .recovery_token_lost
                            .fetch_add(1, Ordering::Relaxed);
                        log::warn!("[srp] token lost in RECOVERY, ring {}", self.my_ring_id);
                    }
                    _ => {}
                }
                self.memb_state_gather_enter(net, "token loss");
            }
            SrpTimer::TokenRetransmit => {
                if let Some(bytes) = self.last_token_bytes.clone() {
                    let _ = self.net_token_send(net, &bytes);
                    self.arm(
                        |s| &mut s.t_token_retransmit,
                        self.cfg.token_retransmit_timeout,
                        SrpTimer::TokenRetransmit,
                    );
                }
            }
            SrpTimer::TokenHold => {
                if let Some(token) = self.held_token.take() {
                    self.token_forward(net, events, token);
                }
            }
            SrpTimer::Join => {
                if matches!(self.state, MembState::Gather) {
                    self.memb_join_send(net);
                    self.arm(|s| &mut s.t_join, self.cfg.join_timeout, SrpTimer::Join);
                }
            }
            SrpTimer::Consensus => {
                if matches!(self.state, MembState::Gather) {
                    self.stats
                        .srp
                        .consensus_timeouts
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .srp
                        .gather_token_lost
                        .fetch_add(1, Ordering::Relaxed);
                    // Everyone that failed to agree is treated as failed.
                    let silent: Vec<TotemIpAddress> = self
                        .my_proc_list
                        .iter()
                        .filter(|a| !self.consensus_set.contains(&a.nodeid))
                        .copied()
                        .collect();
                    if !silent.is_empty() {
                        log::warn!(
                            "[srp] consensus timeout, marking {:?} failed",
                            nodeids(&silent)
                        );
                        self.my_failed_list = memb_union(&self.my_failed_list, &silent);
                    }
                    self.memb_state_gather_enter(net, "consensus timeout");
                }
            }
            SrpTimer::MergeDetect => {
                if matches!(self.state, MembState::Operational) && self.i_am_rep() {
                    let merge = MembMergeDetect {
                        header: self.header(MessageType::MembMergeDetect),
                        system_from: self.my_addr,
                        ring_id: self.my_ring_id,
                    };
                    if self.net_mcast(net, &merge.encode()).is_ok() {
                        self.stats
                            .srp
                            .memb_merge_detect_tx
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    self.arm(
                        |s| &mut s.t_merge,
                        self.cfg.merge_timeout,
                        SrpTimer::MergeDetect,
                    );
                }
            }
            SrpTimer::CommitTokenLoss => {
                if matches!(self.state, MembState::Commit) {
                    self.stats
                        .srp
                        .commit_token_lost
                        .fetch_add(1, Ordering::Relaxed);
                    self.memb_state_gather_enter(net, "commit token lost");
                }
            }
        }
    }

    // ===== Send helpers with failure accounting =====

    fn header(&self, msg_type: MessageType) -> MessageHeader {
        MessageHeader {
            msg_type,
            encapsulated: false,
            nodeid: self.my_addr.nodeid,
            target_nodeid: 0,
        }
    }

    fn note_send(&mut self, result: &Result<()>) {
        match result {
            Ok(()) => {
                self.send_fail_count = 0;
                self.stats
                    .srp
                    .continuous_sendmsg_failures
                    .store(0, Ordering::Relaxed);
            }
            Err(_) => {
                self.send_fail_count += 1;
                self.stats
                    .srp
                    .continuous_sendmsg_failures
                    .store(self.send_fail_count, Ordering::Relaxed);
                if self.send_fail_count >= MAX_NO_CONT_SENDMSG_FAILURES {
                    self.stats
                        .srp
                        .firewall_enabled_or_nic_failure
                        .store(1, Ordering::Relaxed);
                    log::error!(
                        "[srp] {} consecutive send failures, local firewall or NIC fault",
                        self.send_fail_count
                    );
                }
            }
        }
    }

    fn net_mcast(&mut self, net: &mut dyn Transport, bytes: &[u8]) -> Result<()> {
        let res = net.mcast_flush_send(bytes);
        self.note_send(&res);
        res
    }

    fn net_token_send(&mut self, net: &mut dyn Transport, bytes: &[u8]) -> Result<()> {
        let res = net.token_send(bytes);
        self.note_send(&res);
        if res.is_ok() {
            self.stats.srp.orf_token_tx.fetch_add(1, Ordering::Relaxed);
        }
        res
    }

    // ===== Application origination =====

    /// Queue an application multicast. The message is transmitted on the
    /// next token visit, subject to the flow-control window.
    pub fn mcast(
        &mut self,
        net: &mut dyn Transport,
        payload: &[u8],
        guarantee: Guarantee,
    ) -> Result<()> {
        if self.avail() == 0 {
            return Err(Error::TryAgain);
        }
        self.new_message_queue.push_back(QueuedMsg {
            payload: payload.to_vec(),
            guarantee,
        });
        self.stats
            .pg
            .msg_queue_avail
            .store(self.avail() as u32, Ordering::Relaxed);
        // Ask the current holder to stop idling so the message goes out on
        // the next rotation rather than after the hold timeout.
        if matches!(self.state, MembState::Operational)
            && self.held_token.is_none()
            && !self.hold_cancel_sent
        {
            let cancel = TokenHoldCancel {
                header: self.header(MessageType::TokenHoldCancel),
                ring_id: self.my_ring_id,
            };
            if self.net_mcast(net, &cancel.encode()).is_ok() {
                self.stats
                    .srp
                    .token_hold_cancel_tx
                    .fetch_add(1, Ordering::Relaxed);
                self.hold_cancel_sent = true;
            }
        }
        Ok(())
    }

    // ===== Inbound dispatch =====

    /// Process one datagram from the transport.
    pub fn message_received(
        &mut self,
        now: Instant,
        net: &mut dyn Transport,
        events: &mut dyn SrpEvents,
        data: &[u8],
    ) {
        self.now = now;
        let Some((message, swab)) = decode(data) else {
            self.stats.srp.rx_msg_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match message {
            Message::OrfToken(token) => self.orf_token_rx(net, events, token),
            Message::Mcast(msg) => self.mcast_rx(net, events, msg, swab, data),
            Message::MembJoin(join) => self.memb_join_rx(net, events, join),
            Message::MembCommitToken(token) => self.commit_token_rx(net, events, token),
            Message::MembMergeDetect(merge) => self.merge_detect_rx(net, events, merge),
            Message::TokenHoldCancel(cancel) => self.token_hold_cancel_rx(net, events, cancel),
        }
    }

    // ===== GATHER =====

    fn memb_state_gather_enter(&mut self, net: &mut dyn Transport, reason: &str) {
        if matches!(self.state, MembState::Gather) {
            self.continuous_gather += 1;
        } else {
            self.continuous_gather = 0;
        }
        self.stats
            .srp
            .continuous_gather
            .store(self.continuous_gather, Ordering::Relaxed);
        if self.continuous_gather >= MAX_NO_CONT_GATHER {
            // Topology is thrashing; keep broadcasting our view but stop
            // rebuilding the candidate sets.
            log::warn!(
                "[srp] {} consecutive gathers, broadcasting only ({})",
                self.continuous_gather,
                reason
            );
            self.memb_join_send(net);
            self.arm(|s| &mut s.t_join, self.cfg.join_timeout, SrpTimer::Join);
            self.arm(
                |s| &mut s.t_consensus,
                self.cfg.consensus_timeout,
                SrpTimer::Consensus,
            );
            return;
        }

        self.cancel_token_timers();
        self.cancel(|s| &mut s.t_commit_loss);

        if !matches!(self.state, MembState::Gather) {
            // Candidates start from the last known good membership.
            self.my_proc_list = memb_union(&self.my_memb_list, &[self.my_addr]);
            self.my_failed_list.clear();
        }
        self.consensus_set = vec![self.my_addr.nodeid];
        self.my_new_memb_list.clear();
        self.state = MembState::Gather;
        self.stats.srp.gather_entered.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "[srp] entering GATHER ({}), proc_list {:?}",
            reason,
            nodeids(&self.my_proc_list)
        );

        self.memb_join_send(net);
        self.arm(|s| &mut s.t_join, self.cfg.join_timeout, SrpTimer::Join);
        self.arm(
            |s| &mut s.t_consensus,
            self.cfg.consensus_timeout,
            SrpTimer::Consensus,
        );
    }

    fn memb_join_send(&mut self, net: &mut dyn Transport) {
        let join = MembJoin {
            header: self.header(MessageType::MembJoin),
            system_from: self.my_addr,
            ring_seq: self.highest_ring_seq.max(self.my_ring_id.seq),
            proc_list: self.my_proc_list.clone(),
            failed_list: self.my_failed_list.clone(),
        };
        if self.net_mcast(net, &join.encode()).is_ok() {
            self.stats.srp.memb_join_tx.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn memb_join_rx(
        &mut self,
        net: &mut dyn Transport,
        _events: &mut dyn SrpEvents,
        join: MembJoin,
    ) {
        self.stats.srp.memb_join_rx.fetch_add(1, Ordering::Relaxed);
        self.highest_ring_seq = self.highest_ring_seq.max(join.ring_seq);

        if !matches!(self.state, MembState::Gather) {
            // A JOIN means somebody is reforming; join them.
            self.memb_state_gather_enter(net, "join received");
        }

        let merged_proc = memb_union(&self.my_proc_list, &join.proc_list);
        let mut merged_failed = memb_union(&self.my_failed_list, &join.failed_list);
        // Nobody gets to declare us failed on our behalf.
        merged_failed.retain(|a| *a != self.my_addr);

        if !memb_eq(&merged_proc, &self.my_proc_list)
            || !memb_eq(&merged_failed, &self.my_failed_list)
        {
            self.my_proc_list = merged_proc;
            self.my_failed_list = merged_failed;
            self.consensus_set = vec![self.my_addr.nodeid];
            log::debug!(
                "[srp] join from {} widened proc_list to {:?}",
                join.system_from.nodeid,
                nodeids(&self.my_proc_list)
            );
            self.memb_join_send(net);
            self.arm(
                |s| &mut s.t_consensus,
                self.cfg.consensus_timeout,
                SrpTimer::Consensus,
            );
            return;
        }

        // Matching view: record consensus from the sender.
        if memb_eq(&join.proc_list, &self.my_proc_list)
            && memb_eq(&join.failed_list, &self.my_failed_list)
        {
            let sender = join.system_from.nodeid;
            if !self.consensus_set.contains(&sender) {
                self.consensus_set.push(sender);
            }
            let candidates = memb_subtract(&self.my_proc_list, &self.my_failed_list);
            let agreed = candidates
                .iter()
                .all(|a| self.consensus_set.contains(&a.nodeid));
            if agreed {
                self.memb_consensus_reached(net, candidates);
            }
        }
    }

    fn memb_consensus_reached(
        &mut self,
        net: &mut dyn Transport,
        candidates: Vec<TotemIpAddress>,
    ) {
        self.cancel(|s| &mut s.t_join);
        self.my_new_memb_list = candidates;
        log::debug!(
            "[srp] consensus reached on {:?}",
            nodeids(&self.my_new_memb_list)
        );
        if self.i_am_new_rep() {
            self.memb_commit_token_originate(net);
        }
        // Non-representatives wait for the commit token under the consensus
        // timer; its expiry sends the ring back to GATHER.
    }

    fn i_am_rep(&self) -> bool {
        self.my_memb_list
            .first()
            .is_some_and(|a| *a == self.my_addr)
    }

    fn i_am_new_rep(&self) -> bool {
        self.my_new_memb_list
            .first()
            .is_some_and(|a| *a == self.my_addr)
    }

    // ===== COMMIT =====

    fn memb_commit_token_originate(&mut self, net: &mut dyn Transport) {
        let seq = self
            .highest_ring_seq
            .max(self.my_ring_id.seq)
            .max(self.ring_id_store.load())
            + RING_SEQ_INCREMENT;
        let ring_id = RingId {
            rep: self.my_addr.nodeid,
            seq,
        };
        let n = self.my_new_memb_list.len();
        let mut token = MembCommitToken {
            header: self.header(MessageType::MembCommitToken),
            token_seq: 0,
            ring_id,
            retrans_flg: 0,
            memb_index: 0,
            addr_list: self.my_new_memb_list.clone(),
            memb_list: vec![CommitMembEntry::default(); n],
        };
        self.memb_state_commit_enter(&token);
        // Fill our slot (position 0: the representative sorts first) and
        // start the first rotation.
        token.memb_list[0] = self.my_commit_entry();
        token.memb_index = 1;
        self.commit_token_forward(net, token);
    }

    fn my_commit_entry(&self) -> CommitMembEntry {
        // my_aru and my_high_delivered still describe the old ring here;
        // recovery entry is what resets them.
        CommitMembEntry {
            ring_id: self.my_old_ring_id,
            aru: self.my_aru,
            high_delivered: self.my_high_delivered,
            received_flg: 0,
        }
    }

    fn memb_state_commit_enter(&mut self, token: &MembCommitToken) {
        self.cancel(|s| &mut s.t_join);
        self.cancel(|s| &mut s.t_consensus);
        self.my_old_ring_id = self.my_ring_id;
        self.my_ring_id = token.ring_id;
        if let Err(e) = self.ring_id_store.store(token.ring_id.seq) {
            log::warn!("[srp] unable to persist ring seq {}: {}", token.ring_id.seq, e);
        }
        self.highest_ring_seq = self.highest_ring_seq.max(token.ring_id.seq);
        self.my_new_memb_list = token.addr_list.clone();
        self.state = MembState::Commit;
        self.stats.srp.commit_entered.fetch_add(1, Ordering::Relaxed);
        log::debug!("[srp] entering COMMIT, new ring {}", self.my_ring_id);
        self.arm(
            |s| &mut s.t_commit_loss,
            self.cfg.token_timeout,
            SrpTimer::CommitTokenLoss,
        );
    }

    fn commit_token_forward(&mut self, net: &mut dyn Transport, mut token: MembCommitToken) {
        token.token_seq = token.token_seq.wrapping_add(1);
        let n = token.addr_list.len() as u32;
        let next = token.addr_list[(token.memb_index % n) as usize];
        token.header = self.header(MessageType::MembCommitToken);
        token.header.target_nodeid = next.nodeid;
        let bytes = token.encode();
        if net.token_target_set(&next).is_ok() {
            let res = self.net_token_send(net, &bytes);
            if res.is_ok() {
                self.stats
                    .srp
                    .memb_commit_token_tx
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn commit_token_rx(
        &mut self,
        net: &mut dyn Transport,
        events: &mut dyn SrpEvents,
        mut token: MembCommitToken,
    ) {
        self.stats
            .srp
            .memb_commit_token_rx
            .fetch_add(1, Ordering::Relaxed);
        let n = token.addr_list.len();
        let Some(pos) = token.addr_list.iter().position(|a| *a == self.my_addr) else {
            self.stats.srp.rx_msg_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let pos = pos as u32;
        let n32 = n as u32;

        match self.state {
            MembState::Gather => {
                // First rotation: contribute our old-ring state. Only a
                // token for the membership we agreed on, with a ring seq
                // beyond our current ring, installs anything.
                if token.memb_index != pos
                    || token.ring_id.seq <= self.my_ring_id.seq
                    || !memb_eq(&token.addr_list, &self.my_new_memb_list)
                {
                    self.stats.srp.rx_msg_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.memb_state_commit_enter(&token);
                token.memb_list[pos as usize] = self.my_commit_entry();
                token.memb_index = pos + 1;
                self.commit_token_forward(net, token);
            }
            MembState::Commit => {
                // Second rotation: the token now carries everyone's state.
                if token.ring_id != self.my_ring_id || token.memb_index != n32 + pos {
                    self.stats.srp.rx_msg_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.memb_state_recovery_enter(events, &token);
                token.memb_index += 1;
                self.commit_token_forward(net, token);
            }
            MembState::Recovery => {
                // The representative sees the token a third time once every
                // member has entered recovery, and converts it into the new
                // ring's circulating token.
                if self.i_am_new_rep()
                    && token.ring_id == self.my_ring_id
                    && token.memb_index == 2 * n32
                {
                    self.orf_token_originate(net, events);
                } else {
                    self.stats.srp.rx_msg_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            MembState::Operational => {
                self.stats.srp.rx_msg_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // ===== RECOVERY =====

    fn memb_state_recovery_enter(&mut self, events: &mut dyn SrpEvents, token: &MembCommitToken) {
        let _ = events;
        self.cancel(|s| &mut s.t_commit_loss);
        self.state = MembState::Recovery;
        self.stats.srp.recovery_entered.fetch_add(1, Ordering::Relaxed);

        // my_aru / my_high_seq_received still describe the old ring; from
        // here on they track the recovery seq space.
        let old_ring_aru = self.my_aru;
        let old_ring_high = self.my_high_seq_received;
        self.old_ring_high_seq = old_ring_high;

        self.recovery_sort_queue.reinit(SeqNo(0));
        self.my_aru = SeqNo(0);
        self.my_high_seq_received = SeqNo(0);
        self.my_last_aru = SeqNo(0);
        self.my_aru_count = 0;
        self.my_token_seq = None;
        self.my_install_seq = SeqNo(0);
        self.my_retrans_flg_count = 0;
        self.retrans_message_queue.clear();

        // Messages some old-ring survivor lacks must be re-multicast into
        // the new ring, encapsulated, so old-ring delivery can complete
        // everywhere before the configuration change is announced.
        let low_ring_aru = token
            .memb_list
            .iter()
            .filter(|e| e.ring_id == self.my_old_ring_id)
            .map(|e| e.aru)
            .fold(old_ring_aru, |acc, aru| if aru.lt(acc) { aru } else { acc });
        let mut seq = low_ring_aru.next();
        while seq.lte(old_ring_high) {
            if self.regular_sort_queue.in_range(seq) {
                if let Some(slot) = self.regular_sort_queue.item_get(seq) {
                    self.retrans_message_queue.push_back(slot.bytes.clone());
                }
            }
            seq = seq.next();
        }
        log::debug!(
            "[srp] entering RECOVERY, ring {}, {} message(s) to retransmit (low aru {}, high {})",
            self.my_ring_id,
            self.retrans_message_queue.len(),
            low_ring_aru,
            old_ring_high
        );
        self.arm(
            |s| &mut s.t_token_loss,
            self.cfg.token_timeout,
            SrpTimer::TokenLoss,
        );
    }

    fn orf_token_originate(&mut self, net: &mut dyn Transport, events: &mut dyn SrpEvents) {
        let token = OrfToken {
            header: self.header(MessageType::OrfToken),
            seq: SeqNo(0),
            token_seq: 0,
            aru: SeqNo(0),
            aru_addr: 0,
            ring_id: self.my_ring_id,
            backlog: 0,
            fcc: 0,
            retrans_flg: 1,
            rtr_list: Vec::new(),
        };
        log::debug!("[srp] originating token for ring {}", self.my_ring_id);
        self.orf_token_process(net, events, token, true);
    }

    // ===== OPERATIONAL entry =====

    fn memb_state_operational_enter(&mut self, net: &mut dyn Transport, events: &mut dyn SrpEvents) {
        // 1. Merge recovered old-ring messages back into the old ring's
        // queue so its delivery can complete.
        let mut recovered: Vec<(McastMessage, bool)> = Vec::new();
        let mut seq = self.recovery_sort_queue.head_seq();
        let recovery_high = self.my_high_seq_received;
        while seq.lte(recovery_high) {
            if self.recovery_sort_queue.in_range(seq) {
                if let Some(slot) = self.recovery_sort_queue.item_get(seq) {
                    if slot.encapsulated {
                        if let Some((Message::Mcast(inner), inner_swab)) = decode(&slot.payload) {
                            recovered.push((inner, inner_swab));
                        }
                    }
                }
            }
            seq = seq.next();
        }
        for (inner, inner_swab) in recovered {
            self.old_ring_mcast_restore(inner, inner_swab);
        }

        // 2. Finish old-ring delivery. Recovery retransmission has already
        // equalized the survivors' message sets up to the old high water,
        // so everything contiguous below it is all-received.
        let old_members = self.my_memb_list.clone();
        self.deliver_regular(events, self.old_ring_high_seq);

        // 3. Configuration callbacks: transitional then regular.
        let trans_memb = memb_intersect(&old_members, &self.my_new_memb_list);
        let left = memb_subtract(&old_members, &self.my_new_memb_list);
        let joined = memb_subtract(&self.my_new_memb_list, &old_members);
        events.confchg(
            ConfigurationType::Transitional,
            &nodeids(&trans_memb),
            &nodeids(&left),
            &[],
            self.my_ring_id,
        );

        // 4. The recovery queue becomes the ring's queue. Encapsulated
        // slots were delivered through the old ring above; anything else is
        // a fresh new-ring message delivered after the regular callback.
        std::mem::swap(&mut self.regular_sort_queue, &mut self.recovery_sort_queue);
        self.my_high_delivered = SeqNo(0);
        self.my_last_aru = SeqNo(0);
        self.my_aru_count = 0;

        self.my_memb_list = self.my_new_memb_list.clone();
        self.my_proc_list = self.my_memb_list.clone();
        self.my_failed_list.clear();
        self.state = MembState::Operational;
        self.continuous_gather = 0;
        self.stats
            .srp
            .continuous_gather
            .store(0, Ordering::Relaxed);
        self.stats
            .srp
            .operational_entered
            .fetch_add(1, Ordering::Relaxed);

        events.confchg(
            ConfigurationType::Regular,
            &nodeids(&self.my_memb_list),
            &[],
            &nodeids(&joined),
            self.my_ring_id,
        );
        log::info!(
            "[srp] node {} entering OPERATIONAL, ring {}, members {:?}",
            self.my_addr.nodeid,
            self.my_ring_id,
            self.members()
        );

        // 5. Deliver new-ring messages that arrived while recovering, up to
        // the recovery aru; anything beyond waits for the next token visit.
        loop {
            let next = self.my_high_delivered.next();
            if !next.lte(self.my_aru) {
                break;
            }
            if !self.regular_sort_queue.in_range(next) {
                break;
            }
            let Some(slot) = self.regular_sort_queue.item_get(next) else {
                break;
            };
            if !slot.encapsulated {
                events.deliver(slot.from_nodeid, next, slot.guarantee, &slot.payload, slot.swab);
            }
            self.my_high_delivered = next;
        }

        if self.i_am_rep() {
            self.arm(
                |s| &mut s.t_merge,
                self.cfg.merge_timeout,
                SrpTimer::MergeDetect,
            );
        }
        let _ = net;
    }

    /// Put a recovered old-ring message back into the regular queue so
    /// delivery can complete, skipping anything already present or already
    /// delivered.
    fn old_ring_mcast_restore(&mut self, inner: McastMessage, swab: bool) {
        if inner.ring_id != self.my_old_ring_id {
            // A different partition's traffic; its own survivors deliver it.
            return;
        }
        if inner.seq.lte(self.my_high_delivered) {
            return;
        }
        if !self.regular_sort_queue.in_range(inner.seq)
            || self.regular_sort_queue.item_inuse(inner.seq)
        {
            return;
        }
        let slot = RecvSlot {
            bytes: inner.encode(),
            from_nodeid: inner.system_from.nodeid,
            guarantee: inner.guarantee,
            encapsulated: false,
            payload: inner.payload.clone(),
            swab,
        };
        self.regular_sort_queue.item_add(slot, inner.seq);
    }

    // ===== Multicast receive =====

    fn mcast_rx(
        &mut self,
        net: &mut dyn Transport,
        _events: &mut dyn SrpEvents,
        msg: McastMessage,
        swab: bool,
        raw: &[u8],
    ) {
        if msg.ring_id != self.my_ring_id {
            // Traffic from another ring. A live sender we do not know about
            // means two rings can see each other: reform.
            let foreign = !self
                .my_memb_list
                .iter()
                .any(|a| a.nodeid == msg.header.nodeid);
            if foreign && matches!(self.state, MembState::Operational) {
                log::warn!(
                    "[srp] foreign multicast from node {} (ring {})",
                    msg.header.nodeid,
                    msg.ring_id
                );
                self.memb_state_gather_enter(net, "foreign message");
            } else {
                self.stats.srp.rx_msg_dropped.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        self.stats.srp.mcast_rx.fetch_add(1, Ordering::Relaxed);

        if matches!(self.state, MembState::Commit) {
            // Between ring install and recovery entry there is no queue
            // that can hold this message; recovery retransmission repairs
            // the loss.
            self.stats.srp.rx_msg_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let queue = match self.state {
            MembState::Recovery => &mut self.recovery_sort_queue,
            _ => &mut self.regular_sort_queue,
        };
        if !queue.in_range(msg.seq) || queue.item_inuse(msg.seq) {
            self.stats.srp.rx_msg_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let slot = RecvSlot {
            bytes: raw.to_vec(),
            from_nodeid: msg.system_from.nodeid,
            guarantee: msg.guarantee,
            encapsulated: msg.header.encapsulated,
            payload: msg.payload,
            swab,
        };
        queue.item_add(slot, msg.seq);
        self.my_high_seq_received = self.my_high_seq_received.max(msg.seq);
        // Delivery waits for the token path: a message is handed up only
        // after the ring's aru covers it.
    }

    /// Deliver queued messages in seq order, up to and including `up_to`.
    ///
    /// `up_to` is the ring's all-received point: a message leaves the queue
    /// only once every processor holds it, so no processor can deliver
    /// something the rest of the ring would lose with it. Runs on the token
    /// path after the aru fold, never straight off a datagram.
    fn deliver_regular(&mut self, events: &mut dyn SrpEvents, up_to: SeqNo) {
        loop {
            let next = self.my_high_delivered.next();
            if !next.lte(up_to) {
                break;
            }
            if !self.regular_sort_queue.in_range(next) {
                break;
            }
            let Some(slot) = self.regular_sort_queue.item_get(next) else {
                break;
            };
            events.deliver(slot.from_nodeid, next, slot.guarantee, &slot.payload, slot.swab);
            self.my_high_delivered = next;
        }
    }

    // ===== Token path =====

    fn orf_token_rx(&mut self, net: &mut dyn Transport, events: &mut dyn SrpEvents, token: OrfToken) {
        if token.ring_id != self.my_ring_id
            || !matches!(self.state, MembState::Operational | MembState::Recovery)
        {
            self.stats.srp.rx_msg_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // Duplicate suppression: a retransmitted token we already forwarded.
        if let Some(last) = self.my_token_seq {
            if token.token_seq <= last {
                self.stats.srp.rx_msg_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.stats.srp.orf_token_rx.fetch_add(1, Ordering::Relaxed);
        let now = self.now;
        if let Some(prev) = self.last_token_rx {
            let delta = now.duration_since(prev).as_millis() as u32;
            let mtt = self.stats.srp.mtt_rx_token.load(Ordering::Relaxed);
            self.stats
                .srp
                .mtt_rx_token
                .store((mtt * 3 + delta) / 4, Ordering::Relaxed);
        }
        self.last_token_rx = Some(now);
        events.token_event(TokenEvent::Received);

        self.orf_token_process(net, events, token, false);
    }

    fn orf_token_process(
        &mut self,
        net: &mut dyn Transport,
        events: &mut dyn SrpEvents,
        mut token: OrfToken,
        originated: bool,
    ) {
        let started = Instant::now();
        self.my_token_seq = Some(token.token_seq);
        self.cancel(|s| &mut s.t_token_loss);
        self.cancel(|s| &mut s.t_token_retransmit);
        self.hold_cancel_sent = false;

        let backlog_sample = self.new_message_queue.len() as u32;
        let avg = self.stats.srp.avg_backlog_calc.load(Ordering::Relaxed);
        self.stats
            .srp
            .avg_backlog_calc
            .store((avg * 3 + backlog_sample) / 4, Ordering::Relaxed);

        // Service retransmit requests we can satisfy from our queue.
        self.rtr_service(net, &mut token);

        // Advance our all-received point over the active queue.
        self.aru_update_local();

        // Token aru rules: restart the minimum when we set it last round or
        // nobody has yet, otherwise fold our aru into the minimum.
        if self.my_aru.lt(token.aru)
            || token.aru_addr == 0
            || token.aru_addr == self.my_addr.nodeid
        {
            token.aru = self.my_aru;
            token.aru_addr = self.my_addr.nodeid;
        }

        // Failure to receive: our own queue is the one holding the ring
        // back for too many rotations.
        if token.aru == self.my_last_aru && token.aru_addr == self.my_addr.nodeid {
            if token.aru.lt(token.seq) {
                self.my_aru_count += 1;
            }
        } else {
            self.my_aru_count = 0;
        }
        if self.my_aru_count > self.cfg.fail_to_recv_const
            && token.aru_addr == self.my_addr.nodeid
        {
            // Our queue has been the one holding the ring back for too many
            // rotations; the missing messages are unrecoverable here.
            log::error!("[srp] failed to receive (aru {} stuck below {})", token.aru, token.seq);
            self.memb_state_gather_enter(net, "failed to receive");
            return;
        }
        self.my_last_aru = token.aru;

        // Request what we are still missing.
        self.rtr_request(&mut token);

        match self.state {
            MembState::Operational => {
                let transmitted = self.orf_token_mcast(net, &mut token);
                token.fcc = token.fcc.wrapping_add(transmitted);
                self.deliver_regular(events, token.aru);
                events.aru_update(token.aru);
                let release_to = if token.aru.lt(self.my_high_delivered) {
                    token.aru
                } else {
                    self.my_high_delivered
                };
                if self.regular_sort_queue.head_seq().lte(release_to) {
                    self.regular_sort_queue.items_release(release_to);
                }
            }
            MembState::Recovery => {
                let transmitted = self.orf_token_retrans_mcast(net, &mut token);
                token.fcc = token.fcc.wrapping_add(transmitted);
                self.my_install_seq = self.my_install_seq.max(token.seq);
                // The retransmit flag drains to zero only when nobody still
                // holds undelivered old-ring messages.
                if self.i_am_new_rep() {
                    token.retrans_flg = 0;
                }
                if !self.retrans_message_queue.is_empty() {
                    token.retrans_flg = 1;
                }
                let installed = token.retrans_flg == 0
                    && self.my_install_seq.lte(self.my_aru)
                    && self.my_install_seq.lte(token.aru);
                if installed {
                    self.my_retrans_flg_count += 1;
                } else {
                    self.my_retrans_flg_count = 0;
                }
                if self.my_retrans_flg_count >= 2 {
                    self.memb_state_operational_enter(net, events);
                }
            }
            _ => return,
        }

        token.backlog = self.new_message_queue.len() as u32;

        let workload_ms = started.elapsed().as_millis() as u32;
        let avg = self.stats.srp.avg_token_workload.load(Ordering::Relaxed);
        self.stats
            .srp
            .avg_token_workload
            .store((avg * 3 + workload_ms) / 4, Ordering::Relaxed);

        // Idle ring: hold the token briefly instead of spinning it.
        let idle = matches!(self.state, MembState::Operational)
            && token.backlog == 0
            && token.rtr_list.is_empty()
            && token.aru == token.seq
            && self.my_aru == token.seq
            && !originated;
        if idle && self.cfg.token_hold_timeout > 0 {
            self.held_token = Some(token);
            self.arm(
                |s| &mut s.t_token_hold,
                self.cfg.token_hold_timeout,
                SrpTimer::TokenHold,
            );
        } else {
            self.token_forward(net, events, token);
        }
    }

    fn token_forward(&mut self, net: &mut dyn Transport, events: &mut dyn SrpEvents, mut token: OrfToken) {
        let ring = match self.state {
            MembState::Recovery => &self.my_new_memb_list,
            _ => &self.my_memb_list,
        };
        let n = ring.len();
        let pos = ring.iter().position(|a| *a == self.my_addr).unwrap_or(0);
        let next = ring[(pos + 1) % n];
        token.token_seq = token.token_seq.wrapping_add(1);
        token.header = self.header(MessageType::OrfToken);
        token.header.target_nodeid = next.nodeid;
        let bytes = token.encode();
        self.last_token_bytes = Some(bytes.clone());

        if net.token_target_set(&next).is_ok() {
            let _ = self.net_token_send(net, &bytes);
        }
        events.token_event(TokenEvent::Sent);

        self.arm(
            |s| &mut s.t_token_retransmit,
            self.cfg.token_retransmit_timeout,
            SrpTimer::TokenRetransmit,
        );
        let loss_ms = self.cfg.token_timeout
            + (n as u64) * self.cfg.token_hold_timeout.max(1);
        self.arm(|s| &mut s.t_token_loss, loss_ms, SrpTimer::TokenLoss);
    }

    /// Retransmit messages named in the token's rtr list that we hold.
    fn rtr_service(&mut self, net: &mut dyn Transport, token: &mut OrfToken) {
        let mut serviced = 0usize;
        let mut kept = Vec::with_capacity(token.rtr_list.len());
        let rtr_list = std::mem::take(&mut token.rtr_list);
        for rtr in rtr_list {
            if serviced >= TRANSMITS_ALLOWED || rtr.ring_id != self.my_ring_id {
                kept.push(rtr);
                continue;
            }
            let queue = match self.state {
                MembState::Recovery => &self.recovery_sort_queue,
                _ => &self.regular_sort_queue,
            };
            let bytes = if queue.in_range(rtr.seq) {
                queue.item_get(rtr.seq).map(|slot| slot.bytes.clone())
            } else {
                None
            };
            match bytes {
                Some(bytes) => {
                    if self.net_mcast(net, &bytes).is_ok() {
                        self.stats.srp.mcast_retx.fetch_add(1, Ordering::Relaxed);
                        serviced += 1;
                    } else {
                        kept.push(rtr);
                    }
                }
                None => kept.push(rtr),
            }
        }
        token.rtr_list = kept;
    }

    /// Append our missing sequence numbers to the token's rtr list.
    fn rtr_request(&mut self, token: &mut OrfToken) {
        let ring_id = self.my_ring_id;
        let miss_limit = self.cfg.miss_count_const;
        let start = self.my_aru.next();
        let queue = match self.state {
            MembState::Recovery => &mut self.recovery_sort_queue,
            _ => &mut self.regular_sort_queue,
        };
        let mut seq = start;
        while seq.lte(token.seq) && token.rtr_list.len() < RETRANSMIT_ENTRIES_MAX {
            if queue.in_range(seq) && !queue.item_inuse(seq) {
                let already = token
                    .rtr_list
                    .iter()
                    .any(|r| r.seq == seq && r.ring_id == ring_id);
                if !already && queue.item_miss_count(seq) <= miss_limit {
                    token.rtr_list.push(RtrItem { ring_id, seq });
                }
            }
            seq = seq.next();
        }
    }

    fn aru_update_local(&mut self) {
        let queue = match self.state {
            MembState::Recovery => &self.recovery_sort_queue,
            _ => &self.regular_sort_queue,
        };
        let mut aru = self.my_aru;
        loop {
            let next = aru.next();
            if !queue.in_range(next) || !queue.item_inuse(next) {
                break;
            }
            aru = next;
        }
        self.my_aru = aru;
    }

    /// Transmit queued originations, subject to the flow-control window.
    fn orf_token_mcast(&mut self, net: &mut dyn Transport, token: &mut OrfToken) -> u32 {
        let outstanding = token.seq.since(token.aru);
        let window = self.cfg.window_size.saturating_sub(outstanding);
        let allowed = window
            .min(self.cfg.max_messages)
            .min(TRANSMITS_ALLOWED as u32)
            .min(self.new_message_queue.len() as u32);
        let mut sent = 0;
        for _ in 0..allowed {
            let Some(queued) = self.new_message_queue.pop_front() else {
                break;
            };
            let seq = token.seq.next();
            let msg = McastMessage {
                header: self.header(MessageType::Mcast),
                system_from: self.my_addr,
                seq,
                ring_id: self.my_ring_id,
                guarantee: queued.guarantee as u8,
                payload: queued.payload,
            };
            let guarantee = queued.guarantee;
            let bytes = msg.encode();
            if self.net_mcast(net, &bytes).is_err() {
                // Put it back; the window retries on the next rotation.
                self.new_message_queue.push_front(QueuedMsg {
                    payload: msg.payload,
                    guarantee,
                });
                break;
            }
            token.seq = seq;
            sent += 1;
            self.stats.srp.mcast_tx.fetch_add(1, Ordering::Relaxed);
        }
        self.stats
            .pg
            .msg_queue_avail
            .store(self.avail() as u32, Ordering::Relaxed);
        sent
    }

    /// Recovery: re-multicast old-ring messages encapsulated under the new
    /// ring id.
    fn orf_token_retrans_mcast(&mut self, net: &mut dyn Transport, token: &mut OrfToken) -> u32 {
        let outstanding = token.seq.since(token.aru);
        let window = self.cfg.window_size.saturating_sub(outstanding);
        let allowed = window
            .min(TRANSMITS_ALLOWED as u32)
            .min(self.retrans_message_queue.len() as u32);
        let mut sent = 0;
        for _ in 0..allowed {
            let Some(original) = self.retrans_message_queue.pop_front() else {
                break;
            };
            let seq = token.seq.next();
            let mut header = self.header(MessageType::Mcast);
            header.encapsulated = true;
            let msg = McastMessage {
                header,
                system_from: self.my_addr,
                seq,
                ring_id: self.my_ring_id,
                guarantee: Guarantee::Agreed as u8,
                payload: original,
            };
            let bytes = msg.encode();
            if self.net_mcast(net, &bytes).is_err() {
                self.retrans_message_queue.push_front(msg.payload);
                break;
            }
            token.seq = seq;
            sent += 1;
            self.stats.srp.mcast_retx.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    // ===== Merge detect / hold cancel =====

    fn merge_detect_rx(
        &mut self,
        net: &mut dyn Transport,
        _events: &mut dyn SrpEvents,
        merge: MembMergeDetect,
    ) {
        self.stats
            .srp
            .memb_merge_detect_rx
            .fetch_add(1, Ordering::Relaxed);
        let known = self
            .my_memb_list
            .iter()
            .any(|a| a.nodeid == merge.system_from.nodeid);
        if !known && matches!(self.state, MembState::Operational) {
            log::info!(
                "[srp] merge detected with ring {} (rep node {})",
                merge.ring_id,
                merge.system_from.nodeid
            );
            self.memb_state_gather_enter(net, "merge detect");
        }
    }

    fn token_hold_cancel_rx(
        &mut self,
        net: &mut dyn Transport,
        events: &mut dyn SrpEvents,
        cancel: TokenHoldCancel,
    ) {
        if cancel.ring_id != self.my_ring_id {
            self.stats.srp.rx_msg_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if cancel.header.nodeid == self.my_addr.nodeid {
            return;
        }
        self.stats
            .srp
            .token_hold_cancel_rx
            .fetch_add(1, Ordering::Relaxed);
        if let Some(token) = self.held_token.take() {
            self.cancel(|s| &mut s.t_token_hold);
            self.token_forward(net, events, token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn addr(s: &str, nodeid: u32) -> TotemIpAddress {
        TotemIpAddress::from_ip(s.parse::<IpAddr>().unwrap(), nodeid)
    }

    #[test]
    fn test_memb_set_ops() {
        let a = vec![addr("10.0.0.1", 1), addr("10.0.0.2", 2)];
        let b = vec![addr("10.0.0.2", 2), addr("10.0.0.3", 3)];
        let u = memb_union(&a, &b);
        assert_eq!(nodeids(&u), vec![1, 2, 3]);
        assert_eq!(nodeids(&memb_subtract(&a, &b)), vec![1]);
        assert_eq!(nodeids(&memb_intersect(&a, &b)), vec![2]);
        assert!(memb_eq(&u, &[addr("10.0.0.3", 3), addr("10.0.0.1", 1), addr("10.0.0.2", 2)]));
    }

    #[test]
    fn test_union_sorted_by_address_gives_rep_first() {
        let mixed = vec![addr("10.0.0.9", 9), addr("10.0.0.1", 1), addr("10.0.0.4", 4)];
        let sorted = memb_union(&mixed, &[]);
        assert_eq!(nodeids(&sorted), vec![1, 4, 9]);
    }
}
