// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Simulated cluster harness for protocol integration tests.
//!
//! Nodes share an in-memory lossless network; the driver alternates between
//! pumping queued datagrams and advancing a virtual clock to the earliest
//! protocol deadline, so multi-second membership scenarios run in
//! microseconds and stay fully deterministic.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::time::{Duration, Instant};

use totem::config::{TotemConfig, TotemInterface, TransportKind};
use totem::pg::TotemPg;
use totem::srp::wire::RingId;
use totem::srp::ConfigurationType;
use totem::totemip::TotemIpAddress;
use totem::transport::{Transport, TransportEvents};
use totem::{Error, Result};

pub fn node_addr(nodeid: u32) -> TotemIpAddress {
    TotemIpAddress::from_ip(format!("10.0.0.{}", nodeid).parse().unwrap(), nodeid)
}

// ===== In-memory network =====

#[derive(Default)]
pub struct SimNet {
    queues: HashMap<u32, VecDeque<Vec<u8>>>,
    dead: Vec<u32>,
    /// Crash injection: the node dies after this many further multicasts.
    fail_after_mcasts: HashMap<u32, u32>,
    /// Crash injection: the node dies on the token send that follows its
    /// next multicast (datagram escapes, ordering state does not).
    kill_on_token_after_mcast: Option<u32>,
    last_send_was_mcast: HashMap<u32, bool>,
    pub mcast_sent: u64,
}

impl SimNet {
    fn push(&mut self, node: u32, data: &[u8]) {
        if self.dead.contains(&node) {
            return;
        }
        self.queues.entry(node).or_default().push_back(data.to_vec());
    }

    fn sender_alive(&mut self, node: u32) -> bool {
        if self.dead.contains(&node) {
            return false;
        }
        if let Some(remaining) = self.fail_after_mcasts.get_mut(&node) {
            if *remaining == 0 {
                self.kill(node);
                return false;
            }
        }
        true
    }

    fn note_mcast(&mut self, node: u32) {
        if let Some(remaining) = self.fail_after_mcasts.get_mut(&node) {
            *remaining -= 1;
        }
    }

    pub fn kill(&mut self, node: u32) {
        self.dead.push(node);
        self.queues.remove(&node);
    }

    /// Arrange for `node` to crash after `count` further multicasts.
    pub fn fail_after_mcasts(&mut self, node: u32, count: u32) {
        self.fail_after_mcasts.insert(node, count);
    }

    /// Arrange for `node` to crash on the token send immediately following
    /// its next multicast: peers receive the datagram, but the token (and
    /// with it the acknowledgement state) dies with the sender.
    pub fn kill_on_token_after_mcast(&mut self, node: u32) {
        self.kill_on_token_after_mcast = Some(node);
        self.last_send_was_mcast.insert(node, false);
    }

    pub fn is_dead(&self, node: u32) -> bool {
        self.dead.contains(&node)
    }

    pub fn pending(&self) -> usize {
        self.queues.values().map(|q| q.len()).sum()
    }
}

pub struct SimTransport {
    node: u32,
    peers: Vec<u32>,
    net: Rc<RefCell<SimNet>>,
    token_target: Option<u32>,
    bound_to: TotemIpAddress,
    events: Option<Box<dyn TransportEvents>>,
}

impl Transport for SimTransport {
    fn buffer_alloc(&self) -> Vec<u8> {
        vec![0u8; 1500]
    }

    fn buffer_release(&mut self, _buf: Vec<u8>) {}

    fn token_send(&mut self, data: &[u8]) -> Result<()> {
        let target = self.token_target.ok_or(Error::InvalidParam)?;
        let mut net = self.net.borrow_mut();
        if !net.sender_alive(self.node) {
            return Ok(());
        }
        if net.kill_on_token_after_mcast == Some(self.node)
            && net.last_send_was_mcast.get(&self.node) == Some(&true)
        {
            net.kill(self.node);
            return Ok(());
        }
        net.last_send_was_mcast.insert(self.node, false);
        net.push(target, data);
        Ok(())
    }

    fn mcast_flush_send(&mut self, data: &[u8]) -> Result<()> {
        let mut net = self.net.borrow_mut();
        if !net.sender_alive(self.node) {
            return Ok(());
        }
        net.note_mcast(self.node);
        net.last_send_was_mcast.insert(self.node, true);
        net.mcast_sent += 1;
        for peer in &self.peers {
            net.push(*peer, data);
        }
        Ok(())
    }

    fn mcast_noflush_send(&mut self, data: &[u8]) -> Result<()> {
        self.mcast_flush_send(data)
    }

    fn recv_flush(&mut self, deliver: &mut dyn FnMut(&[u8])) -> Result<()> {
        loop {
            let data = self.net.borrow_mut().queues.get_mut(&self.node).and_then(|q| q.pop_front());
            match data {
                Some(data) => deliver(&data),
                None => return Ok(()),
            }
        }
    }

    fn send_flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn iface_check(&mut self) -> Result<()> {
        Ok(())
    }

    fn iface_set(&mut self, addr: &TotemIpAddress) -> Result<()> {
        self.bound_to = *addr;
        Ok(())
    }

    fn ifaces_get(&self) -> Vec<TotemIpAddress> {
        vec![self.bound_to]
    }

    fn token_target_set(&mut self, target: &TotemIpAddress) -> Result<()> {
        self.token_target = Some(target.nodeid);
        Ok(())
    }

    fn member_add(&mut self, member: &TotemIpAddress) -> Result<()> {
        if !self.peers.contains(&member.nodeid) {
            self.peers.push(member.nodeid);
        }
        Ok(())
    }

    fn member_remove(&mut self, member: &TotemIpAddress) -> Result<()> {
        self.peers.retain(|p| *p != member.nodeid);
        Ok(())
    }

    fn member_set_active(&mut self, _member: &TotemIpAddress, _active: bool) -> Result<()> {
        Ok(())
    }

    fn crypto_set(&mut self, cipher: &str, hash: &str) -> Result<()> {
        if cipher.is_empty() && hash.is_empty() {
            return Ok(());
        }
        Err(Error::NotSupported)
    }

    fn reconfigure(&mut self, _config: &TotemConfig) -> Result<()> {
        Ok(())
    }

    fn recv_mcast_empty(&mut self) -> Result<bool> {
        Ok(self
            .net
            .borrow()
            .queues
            .get(&self.node)
            .is_none_or(|q| q.is_empty()))
    }

    fn events_register(&mut self, mut events: Box<dyn TransportEvents>) {
        events.iface_change(&self.bound_to);
        self.events = Some(events);
    }

    fn register(&mut self, _registry: &mio::Registry, _base: mio::Token) -> Result<()> {
        Ok(())
    }
}

// ===== Per-node observation log =====

#[derive(Debug, Clone)]
pub struct ConfchgRec {
    pub kind: ConfigurationType,
    pub members: Vec<u32>,
    pub left: Vec<u32>,
    pub joined: Vec<u32>,
    pub ring: RingId,
}

#[derive(Default)]
pub struct NodeLog {
    pub delivered: Vec<(u32, Vec<u8>)>,
    pub confchg: Vec<ConfchgRec>,
}

impl NodeLog {
    pub fn regular_confchgs(&self) -> Vec<&ConfchgRec> {
        self.confchg
            .iter()
            .filter(|c| c.kind == ConfigurationType::Regular)
            .collect()
    }

    pub fn transitional_confchgs(&self) -> Vec<&ConfchgRec> {
        self.confchg
            .iter()
            .filter(|c| c.kind == ConfigurationType::Transitional)
            .collect()
    }
}

pub struct SimNode {
    pub id: u32,
    pub pg: TotemPg,
    pub log: Rc<RefCell<NodeLog>>,
    pub handle: totem::Handle,
}

// ===== Cluster driver =====

pub struct Cluster {
    pub net: Rc<RefCell<SimNet>>,
    pub nodes: Vec<SimNode>,
    pub now: Instant,
    _ring_dir: tempfile::TempDir,
}

impl Cluster {
    pub fn new(n: u32) -> Self {
        Self::with_config(n, |_| {})
    }

    pub fn with_config(n: u32, tweak: impl Fn(&mut TotemConfig)) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let net: Rc<RefCell<SimNet>> = Rc::default();
        let ring_dir = tempfile::tempdir().expect("tempdir");
        let ids: Vec<u32> = (1..=n).collect();
        let mut nodes = Vec::new();
        for id in &ids {
            let addr = node_addr(*id);
            let mcast = TotemIpAddress::from_ip("239.192.0.1".parse().unwrap(), 0);
            let mut cfg = TotemConfig {
                node_id: *id,
                transport: TransportKind::Udp,
                interfaces: vec![TotemInterface::new(addr, mcast, 5405)],
                ring_id_dir: ring_dir.path().to_path_buf(),
                ..TotemConfig::default()
            };
            tweak(&mut cfg);
            let transport = SimTransport {
                node: *id,
                peers: ids.clone(),
                net: Rc::clone(&net),
                token_target: None,
                bound_to: addr,
                events: None,
            };
            let mut pg = TotemPg::with_transport(cfg, Box::new(transport)).expect("pg init");
            let log: Rc<RefCell<NodeLog>> = Rc::default();
            let deliver_log = Rc::clone(&log);
            let confchg_log = Rc::clone(&log);
            let handle = pg
                .groups_initialize(
                    Box::new(move |nodeid, msg, _swab| {
                        deliver_log.borrow_mut().delivered.push((nodeid, msg.to_vec()));
                    }),
                    Box::new(move |kind, members, left, joined, ring| {
                        confchg_log.borrow_mut().confchg.push(ConfchgRec {
                            kind,
                            members: members.to_vec(),
                            left: left.to_vec(),
                            joined: joined.to_vec(),
                            ring,
                        });
                    }),
                )
                .expect("groups_initialize");
            pg.groups_join(handle, &[b"G"]).expect("groups_join");
            nodes.push(SimNode {
                id: *id,
                pg,
                log,
                handle,
            });
        }
        let mut cluster = Self {
            net,
            nodes,
            now: Instant::now(),
            _ring_dir: ring_dir,
        };
        let now = cluster.now;
        for node in &mut cluster.nodes {
            node.pg.start(now);
        }
        cluster
    }

    pub fn node(&mut self, id: u32) -> &mut SimNode {
        self.nodes
            .iter_mut()
            .find(|n| n.id == id)
            .expect("unknown node id")
    }

    pub fn kill(&mut self, id: u32) {
        self.net.borrow_mut().kill(id);
        self.nodes.retain(|n| n.id != id);
    }

    /// Deliver queued datagrams until the network is quiet.
    pub fn pump(&mut self) {
        for _ in 0..10_000 {
            if self.net.borrow().pending() == 0 {
                return;
            }
            let now = self.now;
            for node in &mut self.nodes {
                node.pg.pump(now).expect("pump");
            }
        }
        panic!("network failed to quiesce");
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.nodes.iter().filter_map(|n| n.pg.next_deadline()).min()
    }

    /// Pump, then jump the virtual clock to the next protocol deadline.
    /// Returns false when no timer is pending (the protocol has stalled).
    pub fn step(&mut self) -> bool {
        self.pump();
        let Some(deadline) = self.earliest_deadline() else {
            return false;
        };
        if deadline > self.now {
            self.now = deadline;
        }
        let now = self.now;
        for node in &mut self.nodes {
            node.pg.poll_timers(now);
        }
        self.pump();
        true
    }

    /// Step until `pred` holds, panicking after `max_virtual` of simulated
    /// time.
    pub fn run_until(&mut self, max_virtual: Duration, mut pred: impl FnMut(&Cluster) -> bool) {
        let limit = self.now + max_virtual;
        loop {
            self.pump();
            if pred(self) {
                return;
            }
            assert!(self.now <= limit, "condition not reached in simulated time");
            assert!(self.step(), "protocol stalled with no pending timers");
        }
    }

    /// True when every node is OPERATIONAL on the same ring with exactly
    /// `ids` as members.
    pub fn formed(&self, ids: &[u32]) -> bool {
        let mut rings = Vec::new();
        for node in &self.nodes {
            if node.pg.members() != ids {
                return false;
            }
            match node.log.borrow().regular_confchgs().last() {
                Some(rec) if rec.members == ids => rings.push(rec.ring),
                _ => return false,
            }
        }
        rings.windows(2).all(|w| w[0] == w[1])
    }

    pub fn wait_formed(&mut self, ids: &[u32]) {
        self.run_until(Duration::from_secs(120), |c| c.formed(ids));
    }
}
