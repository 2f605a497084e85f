// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire encoding of totem datagrams.
//!
//! Every datagram starts with the common header. Multi-byte fields travel in
//! the sender's byte order; the 16-bit magic doubles as an endian detector,
//! and a receiver whose magic reads byte-swapped converts every field while
//! parsing. Encoding always uses the native order.

use crate::seq::SeqNo;
use crate::totemip::{AddressFamily, TotemIpAddress};

/// Magic / endian detector.
pub const MESSAGE_MAGIC: u16 = 0xC070;
/// Wire protocol version.
pub const MESSAGE_VERSION: u8 = 0x03;

/// Upper bound on retransmit requests carried by one token.
pub const RETRANSMIT_ENTRIES_MAX: usize = 30;

/// Datagram type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    OrfToken = 0,
    Mcast = 1,
    MembMergeDetect = 2,
    MembJoin = 3,
    MembCommitToken = 4,
    TokenHoldCancel = 5,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MessageType::OrfToken),
            1 => Some(MessageType::Mcast),
            2 => Some(MessageType::MembMergeDetect),
            3 => Some(MessageType::MembJoin),
            4 => Some(MessageType::MembCommitToken),
            5 => Some(MessageType::TokenHoldCancel),
            _ => None,
        }
    }
}

/// Ring identifier: representative nodeid plus a per-representative
/// monotonically increasing sequence. Ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, PartialOrd, Ord, Hash)]
pub struct RingId {
    pub rep: u32,
    pub seq: u64,
}

impl std::fmt::Display for RingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}.{})", self.rep, self.seq)
    }
}

/// Common header present on every totem datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub msg_type: MessageType,
    pub encapsulated: bool,
    pub nodeid: u32,
    pub target_nodeid: u32,
}

pub const MESSAGE_HEADER_LEN: usize = 13;

/// One retransmit request piggybacked on the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtrItem {
    pub ring_id: RingId,
    pub seq: SeqNo,
}

/// The circulating ordering-and-flow-control token.
#[derive(Debug, Clone, PartialEq)]
pub struct OrfToken {
    pub header: MessageHeader,
    pub seq: SeqNo,
    pub token_seq: u32,
    pub aru: SeqNo,
    pub aru_addr: u32,
    pub ring_id: RingId,
    pub backlog: u32,
    pub fcc: u32,
    pub retrans_flg: u8,
    pub rtr_list: Vec<RtrItem>,
}

/// An ordered multicast carrying packet-group payload.
#[derive(Debug, Clone, PartialEq)]
pub struct McastMessage {
    pub header: MessageHeader,
    pub system_from: TotemIpAddress,
    pub seq: SeqNo,
    pub ring_id: RingId,
    pub guarantee: u8,
    pub payload: Vec<u8>,
}

/// Membership JOIN broadcast during GATHER.
#[derive(Debug, Clone, PartialEq)]
pub struct MembJoin {
    pub header: MessageHeader,
    pub system_from: TotemIpAddress,
    pub ring_seq: u64,
    pub proc_list: Vec<TotemIpAddress>,
    pub failed_list: Vec<TotemIpAddress>,
}

/// Per-member slot inside the commit token.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CommitMembEntry {
    pub ring_id: RingId,
    pub aru: SeqNo,
    pub high_delivered: SeqNo,
    pub received_flg: u8,
}

/// The two-rotation commit token that installs a new ring.
#[derive(Debug, Clone, PartialEq)]
pub struct MembCommitToken {
    pub header: MessageHeader,
    pub token_seq: u32,
    pub ring_id: RingId,
    pub retrans_flg: u8,
    pub memb_index: u32,
    pub addr_list: Vec<TotemIpAddress>,
    pub memb_list: Vec<CommitMembEntry>,
}

/// Multicast announcing that two rings can see each other.
#[derive(Debug, Clone, PartialEq)]
pub struct MembMergeDetect {
    pub header: MessageHeader,
    pub system_from: TotemIpAddress,
    pub ring_id: RingId,
}

/// Multicast asking the token holder to release an idle-held token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenHoldCancel {
    pub header: MessageHeader,
    pub ring_id: RingId,
}

// ===== Encoding =====

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_ne_bytes());
}

fn put_header(buf: &mut Vec<u8>, header: &MessageHeader) {
    put_u16(buf, MESSAGE_MAGIC);
    buf.push(MESSAGE_VERSION);
    buf.push(header.msg_type as u8);
    buf.push(u8::from(header.encapsulated));
    put_u32(buf, header.nodeid);
    put_u32(buf, header.target_nodeid);
}

fn put_ring_id(buf: &mut Vec<u8>, ring_id: &RingId) {
    put_u32(buf, ring_id.rep);
    put_u64(buf, ring_id.seq);
}

fn put_addr(buf: &mut Vec<u8>, addr: &TotemIpAddress) {
    put_u32(buf, addr.nodeid);
    let family = match addr.family {
        AddressFamily::Unset => 0u16,
        AddressFamily::Inet => 1,
        AddressFamily::Inet6 => 2,
    };
    put_u16(buf, family);
    buf.extend_from_slice(&addr.addr);
}

const ADDR_LEN: usize = 22;
const RING_ID_LEN: usize = 12;

impl OrfToken {
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.rtr_list.len() <= RETRANSMIT_ENTRIES_MAX);
        let mut buf = Vec::with_capacity(
            MESSAGE_HEADER_LEN + 32 + RING_ID_LEN + self.rtr_list.len() * (RING_ID_LEN + 4),
        );
        put_header(&mut buf, &self.header);
        put_u32(&mut buf, self.seq.0);
        put_u32(&mut buf, self.token_seq);
        put_u32(&mut buf, self.aru.0);
        put_u32(&mut buf, self.aru_addr);
        put_ring_id(&mut buf, &self.ring_id);
        put_u32(&mut buf, self.backlog);
        put_u32(&mut buf, self.fcc);
        buf.push(self.retrans_flg);
        put_u32(&mut buf, self.rtr_list.len() as u32);
        for rtr in &self.rtr_list {
            put_ring_id(&mut buf, &rtr.ring_id);
            put_u32(&mut buf, rtr.seq.0);
        }
        buf
    }
}

impl McastMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(MESSAGE_HEADER_LEN + ADDR_LEN + RING_ID_LEN + 9 + self.payload.len());
        put_header(&mut buf, &self.header);
        put_addr(&mut buf, &self.system_from);
        put_u32(&mut buf, self.seq.0);
        put_ring_id(&mut buf, &self.ring_id);
        buf.push(self.guarantee);
        put_u32(&mut buf, self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
        buf
    }
}

impl MembJoin {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            MESSAGE_HEADER_LEN
                + ADDR_LEN
                + 16
                + (self.proc_list.len() + self.failed_list.len()) * ADDR_LEN,
        );
        put_header(&mut buf, &self.header);
        put_addr(&mut buf, &self.system_from);
        put_u64(&mut buf, self.ring_seq);
        put_u32(&mut buf, self.proc_list.len() as u32);
        put_u32(&mut buf, self.failed_list.len() as u32);
        for addr in &self.proc_list {
            put_addr(&mut buf, addr);
        }
        for addr in &self.failed_list {
            put_addr(&mut buf, addr);
        }
        buf
    }
}

impl MembCommitToken {
    pub fn encode(&self) -> Vec<u8> {
        debug_assert_eq!(self.addr_list.len(), self.memb_list.len());
        let mut buf = Vec::with_capacity(
            MESSAGE_HEADER_LEN
                + 32
                + self.addr_list.len() * (ADDR_LEN + RING_ID_LEN + 9),
        );
        put_header(&mut buf, &self.header);
        put_u32(&mut buf, self.token_seq);
        put_ring_id(&mut buf, &self.ring_id);
        buf.push(self.retrans_flg);
        put_u32(&mut buf, self.memb_index);
        put_u32(&mut buf, self.addr_list.len() as u32);
        for addr in &self.addr_list {
            put_addr(&mut buf, addr);
        }
        for memb in &self.memb_list {
            put_ring_id(&mut buf, &memb.ring_id);
            put_u32(&mut buf, memb.aru.0);
            put_u32(&mut buf, memb.high_delivered.0);
            buf.push(memb.received_flg);
        }
        buf
    }
}

impl MembMergeDetect {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MESSAGE_HEADER_LEN + ADDR_LEN + RING_ID_LEN);
        put_header(&mut buf, &self.header);
        put_addr(&mut buf, &self.system_from);
        put_ring_id(&mut buf, &self.ring_id);
        buf
    }
}

impl TokenHoldCancel {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MESSAGE_HEADER_LEN + RING_ID_LEN);
        put_header(&mut buf, &self.header);
        put_ring_id(&mut buf, &self.ring_id);
        buf
    }
}

// ===== Decoding =====

/// Byte reader that undoes a foreign byte order detected from the magic.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    swab: bool,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Option<u8> {
        let v = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.data.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        let v = u16::from_ne_bytes([bytes[0], bytes[1]]);
        Some(if self.swab { v.swap_bytes() } else { v })
    }

    fn u32(&mut self) -> Option<u32> {
        let bytes = self.data.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        let v = u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Some(if self.swab { v.swap_bytes() } else { v })
    }

    fn u64(&mut self) -> Option<u64> {
        let bytes = self.data.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        let v = u64::from_ne_bytes(raw);
        Some(if self.swab { v.swap_bytes() } else { v })
    }

    fn ring_id(&mut self) -> Option<RingId> {
        Some(RingId {
            rep: self.u32()?,
            seq: self.u64()?,
        })
    }

    fn addr(&mut self) -> Option<TotemIpAddress> {
        let nodeid = self.u32()?;
        let family = match self.u16()? {
            0 => AddressFamily::Unset,
            1 => AddressFamily::Inet,
            2 => AddressFamily::Inet6,
            _ => return None,
        };
        let bytes = self.data.get(self.pos..self.pos + 16)?;
        self.pos += 16;
        let mut addr = [0u8; 16];
        addr.copy_from_slice(bytes);
        Some(TotemIpAddress {
            nodeid,
            family,
            addr,
        })
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// A parsed datagram plus whether its fields were byte-swapped in transit.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    OrfToken(OrfToken),
    Mcast(McastMessage),
    MembJoin(MembJoin),
    MembCommitToken(MembCommitToken),
    MembMergeDetect(MembMergeDetect),
    TokenHoldCancel(TokenHoldCancel),
}

/// Parse one datagram. Returns the message and `true` when the sender used
/// the opposite byte order. `None` means the frame is malformed and must be
/// dropped (the caller counts it).
pub fn decode(data: &[u8]) -> Option<(Message, bool)> {
    if data.len() < MESSAGE_HEADER_LEN {
        return None;
    }
    let raw_magic = u16::from_ne_bytes([data[0], data[1]]);
    let swab = if raw_magic == MESSAGE_MAGIC {
        false
    } else if raw_magic.swap_bytes() == MESSAGE_MAGIC {
        true
    } else {
        return None;
    };
    let mut r = Reader { data, pos: 2, swab };
    let version = r.u8()?;
    if version != MESSAGE_VERSION {
        return None;
    }
    let msg_type = MessageType::from_u8(r.u8()?)?;
    let encapsulated = r.u8()? != 0;
    let header = MessageHeader {
        msg_type,
        encapsulated,
        nodeid: r.u32()?,
        target_nodeid: r.u32()?,
    };

    let message = match msg_type {
        MessageType::OrfToken => {
            let seq = SeqNo(r.u32()?);
            let token_seq = r.u32()?;
            let aru = SeqNo(r.u32()?);
            let aru_addr = r.u32()?;
            let ring_id = r.ring_id()?;
            let backlog = r.u32()?;
            let fcc = r.u32()?;
            let retrans_flg = r.u8()?;
            let entries = r.u32()? as usize;
            if entries > RETRANSMIT_ENTRIES_MAX {
                return None;
            }
            let mut rtr_list = Vec::with_capacity(entries);
            for _ in 0..entries {
                rtr_list.push(RtrItem {
                    ring_id: r.ring_id()?,
                    seq: SeqNo(r.u32()?),
                });
            }
            Message::OrfToken(OrfToken {
                header,
                seq,
                token_seq,
                aru,
                aru_addr,
                ring_id,
                backlog,
                fcc,
                retrans_flg,
                rtr_list,
            })
        }
        MessageType::Mcast => {
            let system_from = r.addr()?;
            let seq = SeqNo(r.u32()?);
            let ring_id = r.ring_id()?;
            let guarantee = r.u8()?;
            let payload_len = r.u32()? as usize;
            let rest = r.remaining();
            if rest.len() < payload_len {
                return None;
            }
            Message::Mcast(McastMessage {
                header,
                system_from,
                seq,
                ring_id,
                guarantee,
                payload: rest[..payload_len].to_vec(),
            })
        }
        MessageType::MembJoin => {
            let system_from = r.addr()?;
            let ring_seq = r.u64()?;
            let proc_entries = r.u32()? as usize;
            let failed_entries = r.u32()? as usize;
            if proc_entries > crate::config::PROCESSOR_COUNT_MAX
                || failed_entries > crate::config::PROCESSOR_COUNT_MAX
            {
                return None;
            }
            let mut proc_list = Vec::with_capacity(proc_entries);
            for _ in 0..proc_entries {
                proc_list.push(r.addr()?);
            }
            let mut failed_list = Vec::with_capacity(failed_entries);
            for _ in 0..failed_entries {
                failed_list.push(r.addr()?);
            }
            Message::MembJoin(MembJoin {
                header,
                system_from,
                ring_seq,
                proc_list,
                failed_list,
            })
        }
        MessageType::MembCommitToken => {
            let token_seq = r.u32()?;
            let ring_id = r.ring_id()?;
            let retrans_flg = r.u8()?;
            let memb_index = r.u32()?;
            let entries = r.u32()? as usize;
            if entries > crate::config::PROCESSOR_COUNT_MAX {
                return None;
            }
            let mut addr_list = Vec::with_capacity(entries);
            for _ in 0..entries {
                addr_list.push(r.addr()?);
            }
            let mut memb_list = Vec::with_capacity(entries);
            for _ in 0..entries {
                memb_list.push(CommitMembEntry {
                    ring_id: r.ring_id()?,
                    aru: SeqNo(r.u32()?),
                    high_delivered: SeqNo(r.u32()?),
                    received_flg: r.u8()?,
                });
            }
            Message::MembCommitToken(MembCommitToken {
                header,
                token_seq,
                ring_id,
                retrans_flg,
                memb_index,
                addr_list,
                memb_list,
            })
        }
        MessageType::MembMergeDetect => Message::MembMergeDetect(MembMergeDetect {
            header,
            system_from: r.addr()?,
            ring_id: r.ring_id()?,
        }),
        MessageType::TokenHoldCancel => Message::TokenHoldCancel(TokenHoldCancel {
            header,
            ring_id: r.ring_id()?,
        }),
    };
    Some((message, swab))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn addr(s: &str, nodeid: u32) -> TotemIpAddress {
        TotemIpAddress::from_ip(s.parse::<IpAddr>().unwrap(), nodeid)
    }

    fn header(t: MessageType, nodeid: u32) -> MessageHeader {
        MessageHeader {
            msg_type: t,
            encapsulated: false,
            nodeid,
            target_nodeid: 0,
        }
    }

    #[test]
    fn test_orf_token_round_trip() {
        let token = OrfToken {
            header: header(MessageType::OrfToken, 1),
            seq: SeqNo(42),
            token_seq: 7,
            aru: SeqNo(40),
            aru_addr: 2,
            ring_id: RingId { rep: 1, seq: 8 },
            backlog: 3,
            fcc: 5,
            retrans_flg: 0,
            rtr_list: vec![RtrItem {
                ring_id: RingId { rep: 1, seq: 8 },
                seq: SeqNo(41),
            }],
        };
        let (decoded, swab) = decode(&token.encode()).unwrap();
        assert!(!swab);
        assert_eq!(decoded, Message::OrfToken(token));
    }

    #[test]
    fn test_mcast_round_trip() {
        let msg = McastMessage {
            header: header(MessageType::Mcast, 3),
            system_from: addr("10.0.0.3", 3),
            seq: SeqNo(9),
            ring_id: RingId { rep: 1, seq: 4 },
            guarantee: 0,
            payload: b"payload bytes".to_vec(),
        };
        let (decoded, _) = decode(&msg.encode()).unwrap();
        assert_eq!(decoded, Message::Mcast(msg));
    }

    #[test]
    fn test_join_round_trip() {
        let join = MembJoin {
            header: header(MessageType::MembJoin, 2),
            system_from: addr("10.0.0.2", 2),
            ring_seq: 12,
            proc_list: vec![addr("10.0.0.1", 1), addr("10.0.0.2", 2)],
            failed_list: vec![addr("10.0.0.3", 3)],
        };
        let (decoded, _) = decode(&join.encode()).unwrap();
        assert_eq!(decoded, Message::MembJoin(join));
    }

    #[test]
    fn test_commit_token_round_trip() {
        let token = MembCommitToken {
            header: header(MessageType::MembCommitToken, 1),
            token_seq: 1,
            ring_id: RingId { rep: 1, seq: 12 },
            retrans_flg: 1,
            memb_index: 2,
            addr_list: vec![addr("10.0.0.1", 1), addr("10.0.0.2", 2)],
            memb_list: vec![
                CommitMembEntry {
                    ring_id: RingId { rep: 1, seq: 8 },
                    aru: SeqNo(5),
                    high_delivered: SeqNo(5),
                    received_flg: 1,
                },
                CommitMembEntry::default(),
            ],
        };
        let (decoded, _) = decode(&token.encode()).unwrap();
        assert_eq!(decoded, Message::MembCommitToken(token));
    }

    #[test]
    fn test_merge_detect_and_hold_cancel_round_trip() {
        let merge = MembMergeDetect {
            header: header(MessageType::MembMergeDetect, 4),
            system_from: addr("10.0.0.4", 4),
            ring_id: RingId { rep: 1, seq: 4 },
        };
        let (decoded, _) = decode(&merge.encode()).unwrap();
        assert_eq!(decoded, Message::MembMergeDetect(merge));

        let cancel = TokenHoldCancel {
            header: header(MessageType::TokenHoldCancel, 4),
            ring_id: RingId { rep: 1, seq: 4 },
        };
        let (decoded, _) = decode(&cancel.encode()).unwrap();
        assert_eq!(decoded, Message::TokenHoldCancel(cancel));
    }

    #[test]
    fn test_byteswapped_frame_detected_and_converted() {
        // Hand-build a frame as a foreign-endian sender would: every
        // multi-byte field byte-swapped, including the magic.
        let native = TokenHoldCancel {
            header: header(MessageType::TokenHoldCancel, 0x01020304),
            ring_id: RingId {
                rep: 0x0a0b0c0d,
                seq: 0x1122334455667788,
            },
        };
        let mut swapped = Vec::new();
        swapped.extend_from_slice(&MESSAGE_MAGIC.swap_bytes().to_ne_bytes());
        swapped.push(MESSAGE_VERSION);
        swapped.push(MessageType::TokenHoldCancel as u8);
        swapped.push(0);
        swapped.extend_from_slice(&0x01020304u32.swap_bytes().to_ne_bytes());
        swapped.extend_from_slice(&0u32.to_ne_bytes());
        swapped.extend_from_slice(&0x0a0b0c0du32.swap_bytes().to_ne_bytes());
        swapped.extend_from_slice(&0x1122334455667788u64.swap_bytes().to_ne_bytes());

        let (decoded, swab) = decode(&swapped).unwrap();
        assert!(swab);
        assert_eq!(decoded, Message::TokenHoldCancel(native));
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(decode(&[]).is_none());
        assert!(decode(&[0u8; 5]).is_none());
        // Bad magic.
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x1234u16.to_ne_bytes());
        buf.extend_from_slice(&[0u8; 20]);
        assert!(decode(&buf).is_none());
        // Truncated payload length.
        let msg = McastMessage {
            header: header(MessageType::Mcast, 3),
            system_from: addr("10.0.0.3", 3),
            seq: SeqNo(9),
            ring_id: RingId { rep: 1, seq: 4 },
            guarantee: 0,
            payload: b"0123456789".to_vec(),
        };
        let mut bytes = msg.encode();
        bytes.truncate(bytes.len() - 4);
        assert!(decode(&bytes).is_none());
    }

    #[test]
    fn test_bad_version_rejected() {
        let cancel = TokenHoldCancel {
            header: header(MessageType::TokenHoldCancel, 1),
            ring_id: RingId::default(),
        };
        let mut bytes = cancel.encode();
        bytes[2] = 0x02;
        assert!(decode(&bytes).is_none());
    }
}
