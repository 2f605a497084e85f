// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP unicast transport.
//!
//! For networks without multicast routing: one socket, an explicit peer
//! list, and "multicast" emulated by sending the datagram to every active
//! member. The peer list is maintained by the membership layer through
//! `member_add`/`member_remove`.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::TotemConfig;
use crate::error::{Error, Result};
use crate::totemip::TotemIpAddress;
use crate::transport::{send_retry_eintr, Transport, TransportEvents};

struct Member {
    addr: TotemIpAddress,
    sockaddr: SocketAddr,
    active: bool,
}

pub struct UdpuTransport {
    socket: mio::net::UdpSocket,
    bound_to: TotemIpAddress,
    port: u16,
    members: Vec<Member>,
    token_target: Option<SocketAddr>,
    net_mtu: usize,
    recv_buf: Vec<u8>,
    events: Option<Box<dyn TransportEvents>>,
}

impl UdpuTransport {
    pub fn new(config: &TotemConfig) -> Result<Self> {
        let iface = config.interfaces.first().ok_or(Error::InvalidParam)?;
        let local_ip = match iface.bindnet.to_ip() {
            Some(IpAddr::V4(v4)) => v4,
            _ => Ipv4Addr::UNSPECIFIED,
        };
        let bind = SocketAddr::new(IpAddr::V4(local_ip), iface.ip_port);

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&bind.into())?;
        let socket: UdpSocket = socket.into();
        log::debug!("[udpu] bound to {}", bind);

        let bound_to = TotemIpAddress::from_ip(IpAddr::V4(local_ip), config.node_id);

        let mut transport = Self {
            socket: mio::net::UdpSocket::from_std(socket),
            bound_to,
            port: iface.ip_port,
            members: Vec::new(),
            token_target: None,
            net_mtu: config.net_mtu,
            recv_buf: vec![0u8; crate::config::FRAME_SIZE_MAX],
            events: None,
        };
        for member in &iface.member_list {
            transport.member_add(member)?;
        }
        Ok(transport)
    }

    fn send_to(&self, data: &[u8], dest: SocketAddr) -> Result<()> {
        match send_retry_eintr(|| self.socket.send_to(data, dest)) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::TryAgain),
            Err(e) => {
                log::debug!("[udpu] sendmsg to {} failed: {}", dest, e);
                Err(Error::TryAgain)
            }
        }
    }

    fn mcast_emulate(&self, data: &[u8]) -> Result<()> {
        let mut first_err = None;
        for member in self.members.iter().filter(|m| m.active) {
            if let Err(e) = self.send_to(data, member.sockaddr) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        // Loop the datagram back; unicast sends skip the local node.
        let local = SocketAddr::new(
            self.bound_to.to_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            self.port,
        );
        if !self.members.iter().any(|m| m.sockaddr == local) {
            let _ = self.send_to(data, local);
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Transport for UdpuTransport {
    fn buffer_alloc(&self) -> Vec<u8> {
        vec![0u8; self.net_mtu]
    }

    fn buffer_release(&mut self, _buf: Vec<u8>) {}

    fn token_send(&mut self, data: &[u8]) -> Result<()> {
        let target = self.token_target.ok_or(Error::InvalidParam)?;
        self.send_to(data, target)
    }

    fn mcast_flush_send(&mut self, data: &[u8]) -> Result<()> {
        self.mcast_emulate(data)
    }

    fn mcast_noflush_send(&mut self, data: &[u8]) -> Result<()> {
        self.mcast_emulate(data)
    }

    fn recv_flush(&mut self, deliver: &mut dyn FnMut(&[u8])) -> Result<()> {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((len, _from)) => deliver(&self.recv_buf[..len]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
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
        let addr = target.to_socket_addr(self.port).ok_or(Error::InvalidParam)?;
        let changed = self.token_target != Some(addr);
        self.token_target = Some(addr);
        if changed {
            if let Some(events) = &mut self.events {
                events.target_set_completed();
            }
        }
        Ok(())
    }

    fn member_add(&mut self, member: &TotemIpAddress) -> Result<()> {
        if self.members.iter().any(|m| m.addr == *member) {
            return Ok(());
        }
        let sockaddr = member.to_socket_addr(self.port).ok_or(Error::InvalidParam)?;
        log::debug!("[udpu] adding new UDPU member {}", member);
        self.members.push(Member {
            addr: *member,
            sockaddr,
            active: true,
        });
        Ok(())
    }

    fn member_remove(&mut self, member: &TotemIpAddress) -> Result<()> {
        match self.members.iter().position(|m| m.addr == *member) {
            Some(i) => {
                log::debug!("[udpu] removing UDPU member {}", member);
                self.members.remove(i);
                Ok(())
            }
            None => Err(Error::NotExist),
        }
    }

    fn member_set_active(&mut self, member: &TotemIpAddress, active: bool) -> Result<()> {
        match self.members.iter_mut().find(|m| m.addr == *member) {
            Some(m) => {
                m.active = active;
                Ok(())
            }
            None => Err(Error::NotExist),
        }
    }

    fn crypto_set(&mut self, cipher: &str, hash: &str) -> Result<()> {
        if cipher != "none" && !cipher.is_empty() {
            return Err(Error::NotSupported);
        }
        if hash != "none" && !hash.is_empty() {
            return Err(Error::NotSupported);
        }
        Ok(())
    }

    fn reconfigure(&mut self, config: &TotemConfig) -> Result<()> {
        if self.net_mtu != config.net_mtu {
            self.net_mtu = config.net_mtu;
            if let Some(events) = &mut self.events {
                events.mtu_changed(self.net_mtu);
            }
        }
        if let Some(iface) = config.interfaces.first() {
            for member in &iface.member_list {
                self.member_add(member)?;
            }
        }
        Ok(())
    }

    fn events_register(&mut self, mut events: Box<dyn TransportEvents>) {
        events.iface_change(&self.bound_to);
        self.events = Some(events);
    }

    fn recv_mcast_empty(&mut self) -> Result<bool> {
        let mut buf = [0u8; 1];
        match self.socket.peek_from(&mut buf) {
            Ok(_) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn register(&mut self, registry: &mio::Registry, base: mio::Token) -> Result<()> {
        registry.register(&mut self.socket, base, mio::Interest::READABLE)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TotemConfig, TotemInterface, TransportKind};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default, Clone)]
    struct Counters {
        iface_changes: Rc<RefCell<u32>>,
        target_sets: Rc<RefCell<u32>>,
        mtu_changes: Rc<RefCell<Vec<usize>>>,
    }

    impl TransportEvents for Counters {
        fn iface_change(&mut self, _iface: &TotemIpAddress) {
            *self.iface_changes.borrow_mut() += 1;
        }

        fn mtu_changed(&mut self, net_mtu: usize) {
            self.mtu_changes.borrow_mut().push(net_mtu);
        }

        fn target_set_completed(&mut self) {
            *self.target_sets.borrow_mut() += 1;
        }
    }

    fn test_config() -> TotemConfig {
        let bindnet = TotemIpAddress::from_ip("127.0.0.1".parse().unwrap(), 1);
        let mcast = TotemIpAddress::from_ip("239.192.0.1".parse().unwrap(), 0);
        TotemConfig {
            node_id: 1,
            transport: TransportKind::Udpu,
            interfaces: vec![TotemInterface::new(bindnet, mcast, 0)],
            ..TotemConfig::default()
        }
    }

    #[test]
    fn test_iface_change_fires_once_on_register() {
        let mut transport = UdpuTransport::new(&test_config()).unwrap();
        let counters = Counters::default();
        transport.events_register(Box::new(counters.clone()));
        assert_eq!(*counters.iface_changes.borrow(), 1);
        transport.iface_check().unwrap();
        assert_eq!(*counters.iface_changes.borrow(), 1);
    }

    #[test]
    fn test_target_set_completed_fires_on_change_only() {
        let mut transport = UdpuTransport::new(&test_config()).unwrap();
        let counters = Counters::default();
        transport.events_register(Box::new(counters.clone()));

        let peer_a = TotemIpAddress::from_ip("127.0.0.2".parse().unwrap(), 2);
        let peer_b = TotemIpAddress::from_ip("127.0.0.3".parse().unwrap(), 3);
        transport.token_target_set(&peer_a).unwrap();
        transport.token_target_set(&peer_a).unwrap();
        assert_eq!(*counters.target_sets.borrow(), 1);
        transport.token_target_set(&peer_b).unwrap();
        assert_eq!(*counters.target_sets.borrow(), 2);
    }

    #[test]
    fn test_mtu_change_reported_on_reconfigure() {
        let mut cfg = test_config();
        let mut transport = UdpuTransport::new(&cfg).unwrap();
        let counters = Counters::default();
        transport.events_register(Box::new(counters.clone()));

        transport.reconfigure(&cfg).unwrap();
        assert!(counters.mtu_changes.borrow().is_empty());
        cfg.net_mtu = 9000;
        transport.reconfigure(&cfg).unwrap();
        assert_eq!(&*counters.mtu_changes.borrow(), &[9000]);
    }

    #[test]
    fn test_member_list_tracks_adds_and_removes() {
        let mut transport = UdpuTransport::new(&test_config()).unwrap();
        let peer = TotemIpAddress::from_ip("127.0.0.2".parse().unwrap(), 2);
        transport.member_add(&peer).unwrap();
        transport.member_add(&peer).unwrap();
        assert_eq!(transport.members.len(), 1);
        transport.member_set_active(&peer, false).unwrap();
        transport.member_remove(&peer).unwrap();
        assert!(matches!(
            transport.member_remove(&peer),
            Err(Error::NotExist)
        ));
    }
}
