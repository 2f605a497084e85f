// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Protocol configuration and sizing constants.

use std::path::PathBuf;

use crate::totemip::TotemIpAddress;

/// Maximum number of processors in a single ring.
pub const PROCESSOR_COUNT_MAX: usize = 384;

/// Maximum application message size accepted by the packet-group layer.
pub const MESSAGE_SIZE_MAX: usize = 1024 * 1024;

/// Maximum number of configured interfaces per node.
pub const INTERFACE_MAX: usize = 8;

/// Maximum on-wire datagram frame.
pub const FRAME_SIZE_MAX: usize = 65536;

/// Retransmissions serviced from the sort-queue per token visit.
pub const TRANSMITS_ALLOWED: usize = 16;

/// Number of consecutive GATHER entries after which topology stops changing.
pub const MAX_NO_CONT_GATHER: u32 = 3;

/// Consecutive sendmsg failures treated as a local NIC/firewall fault.
pub const MAX_NO_CONT_SENDMSG_FAILURES: u32 = 30;

/// Small-footprint profile limits.
pub const SMALL_PROCESSOR_COUNT_MAX: usize = 16;
pub const SMALL_MESSAGE_SIZE_MAX: usize = 1024 * 64;
pub const SMALL_MESSAGE_QUEUE_MAX: usize = 512;

/// Transport backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// UDP multicast.
    Udp,
    /// UDP unicast with an explicit member list.
    Udpu,
}

/// One configured network interface.
#[derive(Debug, Clone)]
pub struct TotemInterface {
    /// Network to bind to; the transport picks the matching local address.
    pub bindnet: TotemIpAddress,
    /// Address actually bound, filled in by the transport.
    pub boundto: TotemIpAddress,
    /// Multicast group address (UDP transport).
    pub mcast_addr: TotemIpAddress,
    pub ip_port: u16,
    pub ttl: u8,
    pub configured: bool,
    /// Unicast peers (UDPU transport).
    pub member_list: Vec<TotemIpAddress>,
}

impl TotemInterface {
    pub fn new(bindnet: TotemIpAddress, mcast_addr: TotemIpAddress, ip_port: u16) -> Self {
        Self {
            bindnet,
            boundto: TotemIpAddress::default(),
            mcast_addr,
            ip_port,
            ttl: 1,
            configured: true,
            member_list: Vec::new(),
        }
    }
}

/// Totem runtime configuration.
///
/// Timeouts are milliseconds. Derived timeouts (`token_retransmit_timeout`,
/// `token_hold_timeout`) are recomputed by [`TotemConfig::derive_timeouts`]
/// when left at zero.
#[derive(Debug, Clone)]
pub struct TotemConfig {
    pub node_id: u32,
    pub transport: TransportKind,
    pub interfaces: Vec<TotemInterface>,

    pub token_timeout: u64,
    pub token_warning: u64,
    pub token_retransmit_timeout: u64,
    pub token_hold_timeout: u64,
    pub token_retransmits_before_loss_const: u32,
    pub join_timeout: u64,
    pub send_join_timeout: u64,
    pub consensus_timeout: u64,
    pub merge_timeout: u64,
    pub downcheck_timeout: u64,
    pub fail_to_recv_const: u32,
    pub seqno_unchanged_const: u32,
    pub miss_count_const: u32,
    pub max_network_delay: u64,
    pub window_size: u32,
    pub max_messages: u32,
    pub net_mtu: usize,

    /// Directory holding the persisted ring-id sequence per node.
    pub ring_id_dir: PathBuf,
}

impl Default for TotemConfig {
    fn default() -> Self {
        let mut cfg = Self {
            node_id: 0,
            transport: TransportKind::Udp,
            interfaces: Vec::new(),
            token_timeout: 1000,
            token_warning: 75,
            token_retransmit_timeout: 0,
            token_hold_timeout: 0,
            token_retransmits_before_loss_const: 4,
            join_timeout: 50,
            send_join_timeout: 0,
            consensus_timeout: 1200,
            merge_timeout: 200,
            downcheck_timeout: 1000,
            fail_to_recv_const: 2500,
            seqno_unchanged_const: 30,
            miss_count_const: 5,
            max_network_delay: 50,
            window_size: 50,
            max_messages: 17,
            net_mtu: 1500,
            ring_id_dir: PathBuf::from("."),
        };
        cfg.derive_timeouts();
        cfg
    }
}

impl TotemConfig {
    /// Fill in the timeouts derived from `token_timeout` when unset.
    pub fn derive_timeouts(&mut self) {
        if self.token_retransmit_timeout == 0 {
            self.token_retransmit_timeout = (self.token_timeout as f64
                / (self.token_retransmits_before_loss_const as f64 + 0.25))
                as u64;
        }
        if self.token_hold_timeout == 0 {
            let hold =
                self.token_retransmit_timeout as f64 * 0.8 - (2 * self.max_network_delay) as f64;
            self.token_hold_timeout = if hold > 0.0 { hold as u64 } else { 1 };
        }
        if self.consensus_timeout == 0 {
            self.consensus_timeout = (self.token_timeout as f64 * 1.2) as u64;
        }
    }

    /// Depth of the transmit/receive sort-queues for this MTU.
    pub fn message_queue_max(&self) -> usize {
        (4 * MESSAGE_SIZE_MAX) / self.net_mtu
    }
}
