// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP multicast transport.
//!
//! Two sockets per instance: a multicast socket bound to the ring port and
//! joined to the configured group (loopback enabled so a single-host ring
//! works), and a unicast socket on port+1 for token forwarding. Both are
//! nonblocking and registered with the event loop.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};

use crate::config::TotemConfig;
use crate::error::{Error, Result};
use crate::totemip::TotemIpAddress;
use crate::transport::{send_retry_eintr, Transport, TransportEvents};

/// Token offset added to the ring port for the unicast token socket.
const TOKEN_PORT_OFFSET: u16 = 1;

pub struct UdpTransport {
    mcast_socket: mio::net::UdpSocket,
    token_socket: mio::net::UdpSocket,
    mcast_addr: SocketAddr,
    bound_to: TotemIpAddress,
    token_target: Option<SocketAddr>,
    net_mtu: usize,
    recv_buf: Vec<u8>,
    events: Option<Box<dyn TransportEvents>>,
}

fn make_socket(bind: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&bind.into())?;
    Ok(socket.into())
}

impl UdpTransport {
    pub fn new(config: &TotemConfig) -> Result<Self> {
        let iface = config.interfaces.first().ok_or(Error::InvalidParam)?;
        let mcast_ip = match iface.mcast_addr.to_ip() {
            Some(IpAddr::V4(v4)) if v4.is_multicast() => v4,
            _ => return Err(Error::InvalidParam),
        };
        let port = iface.ip_port;

        let local_ip = local_bind_address(iface)?;
        let mcast_std = make_socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))?;
        mcast_std.join_multicast_v4(&mcast_ip, &local_ip)?;
        mcast_std.set_multicast_loop_v4(true)?;
        mcast_std.set_multicast_ttl_v4(u32::from(iface.ttl.max(1)))?;
        log::debug!(
            "[udp] joined multicast group {} on iface {} port {}",
            mcast_ip,
            local_ip,
            port
        );

        let token_std = make_socket(SocketAddr::new(
            IpAddr::V4(local_ip),
            port + TOKEN_PORT_OFFSET,
        ))?;

        let bound_to = TotemIpAddress::from_ip(IpAddr::V4(local_ip), config.node_id);

        Ok(Self {
            mcast_socket: mio::net::UdpSocket::from_std(mcast_std),
            token_socket: mio::net::UdpSocket::from_std(token_std),
            mcast_addr: SocketAddr::new(IpAddr::V4(mcast_ip), port),
            bound_to,
            token_target: None,
            net_mtu: config.net_mtu,
            recv_buf: vec![0u8; crate::config::FRAME_SIZE_MAX],
            events: None,
        })
    }

    fn send_to(socket: &mio::net::UdpSocket, data: &[u8], dest: SocketAddr) -> Result<()> {
        match send_retry_eintr(|| socket.send_to(data, dest)) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Err(Error::TryAgain),
            Err(e) => {
                log::debug!("[udp] sendmsg to {} failed: {}", dest, e);
                Err(Error::TryAgain)
            }
        }
    }

    fn drain(
        socket: &mio::net::UdpSocket,
        buf: &mut [u8],
        deliver: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        loop {
            match socket.recv_from(buf) {
                Ok((len, _from)) => deliver(&buf[..len]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Transport for UdpTransport {
    fn buffer_alloc(&self) -> Vec<u8> {
        vec![0u8; self.net_mtu]
    }

    fn buffer_release(&mut self, _buf: Vec<u8>) {}

    fn token_send(&mut self, data: &[u8]) -> Result<()> {
        let target = self.token_target.ok_or(Error::InvalidParam)?;
        Self::send_to(&self.token_socket, data, target)
    }

    fn mcast_flush_send(&mut self, data: &[u8]) -> Result<()> {
        Self::send_to(&self.mcast_socket, data, self.mcast_addr)
    }

    fn mcast_noflush_send(&mut self, data: &[u8]) -> Result<()> {
        // The kernel already batches UDP sends; no userspace queue.
        self.mcast_flush_send(data)
    }

    fn recv_flush(&mut self, deliver: &mut dyn FnMut(&[u8])) -> Result<()> {
        let mut buf = std::mem::take(&mut self.recv_buf);
        let res = Self::drain(&self.mcast_socket, &mut buf, deliver)
            .and_then(|()| Self::drain(&self.token_socket, &mut buf, deliver));
        self.recv_buf = buf;
        res
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
        let addr = target
            .to_socket_addr(self.mcast_addr.port() + TOKEN_PORT_OFFSET)
            .ok_or(Error::InvalidParam)?;
        let changed = self.token_target != Some(addr);
        self.token_target = Some(addr);
        if changed {
            if let Some(events) = &mut self.events {
                events.target_set_completed();
            }
        }
        Ok(())
    }

    fn member_add(&mut self, _member: &TotemIpAddress) -> Result<()> {
        // Group membership is carried by IGMP; nothing to track.
        Ok(())
    }

    fn member_remove(&mut self, _member: &TotemIpAddress) -> Result<()> {
        Ok(())
    }

    fn member_set_active(&mut self, _member: &TotemIpAddress, _active: bool) -> Result<()> {
        Ok(())
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
        Ok(())
    }

    fn events_register(&mut self, mut events: Box<dyn TransportEvents>) {
        // The multicast join already succeeded in the constructor; report
        // the bound interface exactly once.
        events.iface_change(&self.bound_to);
        self.events = Some(events);
    }

    fn recv_mcast_empty(&mut self) -> Result<bool> {
        let mut buf = [0u8; 1];
        match self.mcast_socket.peek_from(&mut buf) {
            Ok(_) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    fn register(&mut self, registry: &mio::Registry, base: mio::Token) -> Result<()> {
        use mio::Interest;
        registry.register(&mut self.mcast_socket, base, Interest::READABLE)?;
        registry.register(
            &mut self.token_socket,
            mio::Token(base.0 + 1),
            Interest::READABLE,
        )?;
        Ok(())
    }
}

/// Resolve the local IPv4 address to bind: an address on the same network as
/// `bindnet` when one is known, otherwise the primary local address.
fn local_bind_address(iface: &crate::config::TotemInterface) -> Result<Ipv4Addr> {
    if let Some(IpAddr::V4(v4)) = iface.bindnet.to_ip() {
        if !v4.is_unspecified() {
            return Ok(v4);
        }
    }
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(v4)) => Ok(v4),
        Ok(IpAddr::V6(_)) | Err(_) => Ok(Ipv4Addr::LOCALHOST),
    }
}
