// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Datagram transport contract and backend dispatch.
//!
//! A transport moves opaque totem datagrams: unicast tokens to a single
//! target, multicast (real or emulated) to the ring. Transports preserve
//! message boundaries and never reorder at their own layer; the protocol
//! above tolerates loss, duplication, and late arrival.

pub mod udp;
pub mod udpu;

use crate::config::{TotemConfig, TransportKind};
use crate::error::Result;
use crate::totemip::TotemIpAddress;

pub use udp::UdpTransport;
pub use udpu::UdpuTransport;

/// IPv4 + UDP header bytes subtracted from the interface MTU.
const UDP_IP_HEADER_LEN: usize = 20 + 8;

/// Datagram transport used by the single-ring protocol.
///
/// `recv_flush` drains every pending datagram into `deliver`; the buffer
/// passed to the callback is owned by the transport and only valid for the
/// duration of the call.
pub trait Transport {
    /// Allocate an MTU-sized send frame.
    fn buffer_alloc(&self) -> Vec<u8>;

    /// Return a frame obtained from [`buffer_alloc`](Self::buffer_alloc).
    fn buffer_release(&mut self, buf: Vec<u8>);

    /// Unicast `data` to the current token target.
    fn token_send(&mut self, data: &[u8]) -> Result<()>;

    /// Multicast `data`, flushing any batched datagrams first.
    fn mcast_flush_send(&mut self, data: &[u8]) -> Result<()>;

    /// Multicast `data`; the transport may batch.
    fn mcast_noflush_send(&mut self, data: &[u8]) -> Result<()>;

    /// Drain pending receive I/O, invoking `deliver` once per datagram.
    fn recv_flush(&mut self, deliver: &mut dyn FnMut(&[u8])) -> Result<()>;

    /// Drain any batched sends.
    fn send_flush(&mut self) -> Result<()>;

    /// Re-check local interface state; fires `iface_change` observers on a
    /// successful (re)bind.
    fn iface_check(&mut self) -> Result<()>;

    /// Bind to a specific local interface address.
    fn iface_set(&mut self, addr: &TotemIpAddress) -> Result<()>;

    /// Addresses this transport is bound to.
    fn ifaces_get(&self) -> Vec<TotemIpAddress>;

    /// Human-readable interface summary for logs and status queries.
    fn iface_print(&self) -> String {
        self.ifaces_get()
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Set the unicast destination for subsequent [`token_send`](Self::token_send).
    fn token_target_set(&mut self, target: &TotemIpAddress) -> Result<()>;

    /// Add a unicast peer. Multicast backends may ignore this.
    fn member_add(&mut self, member: &TotemIpAddress) -> Result<()>;

    /// Remove a unicast peer.
    fn member_remove(&mut self, member: &TotemIpAddress) -> Result<()>;

    /// Mark a peer active/inactive without forgetting it.
    fn member_set_active(&mut self, member: &TotemIpAddress, active: bool) -> Result<()>;

    /// Configure payload protection. The UDP backends carry no cipher; a
    /// non-empty request is rejected.
    fn crypto_set(&mut self, cipher: &str, hash: &str) -> Result<()>;

    /// Apply a changed configuration (member lists, timeouts).
    fn reconfigure(&mut self, config: &TotemConfig) -> Result<()>;

    /// True when no multicast datagrams are queued in the kernel. Used at
    /// ring formation to flush stale traffic.
    fn recv_mcast_empty(&mut self) -> Result<bool>;

    /// Shrink `config.net_mtu` by this transport's per-datagram overhead.
    fn net_mtu_adjust(&self, config: &mut TotemConfig) {
        config.net_mtu -= UDP_IP_HEADER_LEN;
    }

    /// Reset transport-level counters.
    fn stats_clear(&mut self) {}

    /// Attach the event observer. The transport reports its already-bound
    /// interface immediately, and exactly once per successful (re)bind
    /// afterwards.
    fn events_register(&mut self, events: Box<dyn TransportEvents>);

    /// Register receive sockets with the event loop.
    fn register(&mut self, registry: &mio::Registry, base: mio::Token) -> Result<()>;
}

/// Observer interface for transport-level events.
///
/// The datagram backends complete everything synchronously, so
/// `target_set_completed` fires as soon as a *changed* token target is
/// accepted, and `mtu_changed` when a reconfiguration alters the usable
/// datagram size.
pub trait TransportEvents {
    /// The transport (re)bound to a local interface.
    fn iface_change(&mut self, iface: &TotemIpAddress);
    /// The usable datagram size changed.
    fn mtu_changed(&mut self, net_mtu: usize);
    /// A previous `token_target_set` took effect.
    fn target_set_completed(&mut self);
}

/// Construct the backend selected by `config.transport`.
pub fn create_transport(config: &TotemConfig) -> Result<Box<dyn Transport>> {
    match config.transport {
        TransportKind::Udp => {
            log::info!("[net] initializing transport (UDP/IP Multicast).");
            Ok(Box::new(UdpTransport::new(config)?))
        }
        TransportKind::Udpu => {
            log::info!("[net] initializing transport (UDP/IP Unicast).");
            Ok(Box::new(UdpuTransport::new(config)?))
        }
    }
}

/// Retry a send interrupted by a signal; report `WouldBlock` upward so the
/// caller can count consecutive failures.
pub(crate) fn send_retry_eintr<F>(mut send: F) -> std::io::Result<usize>
where
    F: FnMut() -> std::io::Result<usize>,
{
    loop {
        match send() {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
