// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # totem - virtually-synchronous total-order group messaging
//!
//! A pure Rust implementation of the Totem single-ring protocol: token-based
//! totally-ordered multicast with extended-virtual-synchrony membership, the
//! packet-group layer above it, and the supporting infrastructure (sort
//! queue, handle database, typed key/value maps, datagram transports).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use totem::config::{TotemConfig, TotemInterface, TransportKind};
//! use totem::pg::TotemPg;
//! use totem::totemip::TotemIpAddress;
//!
//! fn main() -> totem::Result<()> {
//!     let bindnet = TotemIpAddress::from_ip("192.168.1.10".parse().unwrap(), 0);
//!     let mcast = TotemIpAddress::from_ip("239.192.0.1".parse().unwrap(), 0);
//!     let cfg = TotemConfig {
//!         node_id: bindnet.nodeid,
//!         transport: TransportKind::Udp,
//!         interfaces: vec![TotemInterface::new(bindnet, mcast, 5405)],
//!         ..TotemConfig::default()
//!     };
//!     let mut pg = TotemPg::new(cfg)?;
//!     let handle = pg.groups_initialize(
//!         Box::new(|nodeid, msg, _swab| println!("{} bytes from node {}", msg.len(), nodeid)),
//!         Box::new(|_kind, members, _left, _joined, ring| {
//!             println!("ring {} members {:?}", ring, members);
//!         }),
//!     )?;
//!     pg.groups_join(handle, &[b"chat"])?;
//!     pg.start(std::time::Instant::now());
//!     // drive pg.pump / pg.poll_timers from the event loop...
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------+
//! |                     Application groups                       |
//! |   groups_join / groups_mcast_joined / confchg callbacks      |
//! +--------------------------------------------------------------+
//! |  Packet groups (pg): fragmentation, filtering, guarantees    |
//! +--------------------------------------------------------------+
//! |  Single-ring protocol (srp): membership, token, ordering     |
//! +--------------------------------------------------------------+
//! |  Transport: UDP multicast | UDP unicast (explicit members)   |
//! +--------------------------------------------------------------+
//! ```

/// Typed key/value configuration map with prefix change tracking.
pub mod cmap;
/// Protocol configuration and sizing constants.
pub mod config;
/// Crate-wide error taxonomy.
pub mod error;
/// Check-tagged handle database.
pub mod hdb;
/// Packet-group layer (fragmentation, group filtering, guarantees).
pub mod pg;
/// Single-threaded event loop: poll wrapper and protocol timers.
pub mod rt;
/// Rollover-aware sequence numbers.
pub mod seq;
/// Sort-queue: seqno-indexed message slots.
pub mod sq;
/// Single-ring membership and ordered multicast protocol.
pub mod srp;
/// Live-counter stats map.
pub mod stats;
/// Processor network identity.
pub mod totemip;
/// Datagram transport contract and backends.
pub mod transport;

pub use error::{Error, Result};
pub use seq::SeqNo;

pub use cmap::{CMap, MapValue, ValueType};
pub use hdb::{Handle, HandleDatabase};
pub use pg::TotemPg;
pub use sq::SortQueue;
pub use srp::wire::RingId;
pub use srp::{ConfigurationType, Guarantee, MembState, TokenEvent};
pub use stats::{StatsMap, TotemStats};
pub use totemip::TotemIpAddress;
