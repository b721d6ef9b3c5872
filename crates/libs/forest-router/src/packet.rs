//! Wire format for the Forest packet header and the in-memory packet
//! representation carried through the router (spec §3, §6).

use std::net::Ipv4Addr;

use crate::address::ForestAddr;
use crate::error::{ForestError, Result};

/// Total header length in bytes: four 32-bit words.
pub const HDR_LENGTH: usize = 20;
/// Maximum payload a packet buffer can hold.
pub const MAX_PAYLOAD: usize = 1456;
/// Maximum total datagram length (header + payload), kept comfortably under
/// the 12-bit length field's practical ceiling.
pub const MAX_PACKET_LENGTH: usize = HDR_LENGTH + MAX_PAYLOAD;

/// Fixed UDP port routers listen on for peer traffic (spec §6).
pub const ROUTER_PORT: u16 = 30122;
/// Fixed UDP port the network manager listens on for boot/control traffic.
pub const NM_PORT: u16 = 30120;

/// Comtree reserved for CONNECT/DISCONNECT handshakes (spec §6).
pub const CONNECT_COMT: u32 = 1;
/// Comtree reserved for CLIENT_SIG traffic (spec §6).
pub const CLIENT_SIG_COMT: u32 = 2;
/// Comtree reserved for NET_SIG (router control-plane) traffic (spec §6).
pub const NET_SIG_COMT: u32 = 3;

/// Packet type codes carried in the header's `type` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PacketType {
    ClientData = 1,
    SubUnsub = 2,
    Connect = 3,
    Disconnect = 4,
    RteReply = 5,
    ClientSig = 6,
    NetSig = 7,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            1 => PacketType::ClientData,
            2 => PacketType::SubUnsub,
            3 => PacketType::Connect,
            4 => PacketType::Disconnect,
            5 => PacketType::RteReply,
            6 => PacketType::ClientSig,
            7 => PacketType::NetSig,
            other => return Err(ForestError::UnknownControlType(other)),
        })
    }
}

/// Flag bits carried in the header's `flags` byte.
pub mod flags {
    /// Request route discovery for this packet's destination.
    pub const RTE_REQ: u8 = 0x01;
    /// Marks a reply/acknowledgement packet.
    pub const ACK_FLAG: u8 = 0x02;
}

/// Peer classification used to decide trust level (spec §3, §4.5).
///
/// Ordinal order matters: anything ordered below [`PeerType::Router`] is
/// "untrusted" for the purposes of `pktCheck` (spec §4.5) — its packets are
/// subjected to the full validity check, while router/controller peers are
/// assumed to have already validated their own clients upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum PeerType {
    Client = 0,
    Server = 1,
    Router = 2,
    Controller = 3,
    Undef = 4,
}

impl PeerType {
    pub const TRUSTED: PeerType = PeerType::Router;

    pub fn is_untrusted(self) -> bool {
        self < PeerType::TRUSTED
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => PeerType::Client,
            1 => PeerType::Server,
            2 => PeerType::Router,
            3 => PeerType::Controller,
            _ => PeerType::Undef,
        }
    }
}

/// The fixed 20-byte Forest packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub length: u16,
    pub ptype: PacketType,
    pub flags: u8,
    pub comtree: u32,
    pub src_adr: ForestAddr,
    pub dst_adr: ForestAddr,
}

impl Header {
    pub const CURRENT_VERSION: u8 = 1;

    pub fn pack(&self, out: &mut [u8; HDR_LENGTH]) {
        let word0 = ((self.version as u32 & 0xf) << 28)
            | ((self.length as u32 & 0xfff) << 16)
            | ((self.ptype as u32 & 0xff) << 8)
            | (self.flags as u32 & 0xff);
        out[0..4].copy_from_slice(&word0.to_be_bytes());
        out[4..8].copy_from_slice(&self.comtree.to_be_bytes());
        out[8..12].copy_from_slice(&self.src_adr.raw().to_be_bytes());
        out[12..16].copy_from_slice(&self.dst_adr.raw().to_be_bytes());
        // header error check: reserved, currently a no-op zero field.
        out[16..20].copy_from_slice(&0u32.to_be_bytes());
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HDR_LENGTH {
            return Err(ForestError::TableConflict("short header".into()));
        }
        let word0 = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let version = (word0 >> 28) as u8 & 0xf;
        let length = ((word0 >> 16) & 0xfff) as u16;
        let ptype = PacketType::from_u8(((word0 >> 8) & 0xff) as u8)?;
        let hflags = (word0 & 0xff) as u8;
        let comtree = u32::from_be_bytes(bytes[4..8].try_into().unwrap());
        let src_adr = ForestAddr(u32::from_be_bytes(bytes[8..12].try_into().unwrap()));
        let dst_adr = ForestAddr(u32::from_be_bytes(bytes[12..16].try_into().unwrap()));
        Ok(Header { version, length, ptype, flags: hflags, comtree, src_adr, dst_adr })
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn set_flag(&mut self, flag: u8) {
        self.flags |= flag;
    }

    pub fn clear_flag(&mut self, flag: u8) {
        self.flags &= !flag;
    }
}

/// A fixed-capacity payload buffer, sized to the largest datagram this
/// router will ever move.
#[derive(Debug, Clone, Copy)]
pub struct PacketBuffer {
    bytes: [u8; MAX_PAYLOAD],
    len: usize,
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self { bytes: [0u8; MAX_PAYLOAD], len: 0 }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.set(data);
        buf
    }

    pub fn set(&mut self, data: &[u8]) {
        let n = data.len().min(MAX_PAYLOAD);
        self.bytes[..n].copy_from_slice(&data[..n]);
        self.len = n;
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read a big-endian u32 payload word at the given word index.
    pub fn word(&self, index: usize) -> Option<u32> {
        let start = index * 4;
        if start + 4 > self.len {
            return None;
        }
        Some(u32::from_be_bytes(self.bytes[start..start + 4].try_into().unwrap()))
    }

    pub fn set_word(&mut self, index: usize, value: u32) {
        let start = index * 4;
        let needed = start + 4;
        if needed > self.len {
            self.len = needed.min(MAX_PAYLOAD);
        }
        self.bytes[start..start + 4].copy_from_slice(&value.to_be_bytes());
    }
}

impl Default for PacketBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A packet descriptor's full contents: header, payload, and ephemeral
/// receive-side fields populated by `IoProcessor::receive` (spec §3).
#[derive(Debug, Clone, Copy)]
pub struct Packet {
    pub header: Header,
    pub payload: PacketBuffer,
    /// Link this packet arrived on, or 0 if self-originated.
    pub in_link: u32,
    pub tun_src_ip: Ipv4Addr,
    pub tun_src_port: u16,
    /// Total bytes received on the wire for this datagram.
    pub buffer_len: usize,
}

impl Packet {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            payload: PacketBuffer::new(),
            in_link: 0,
            tun_src_ip: Ipv4Addr::UNSPECIFIED,
            tun_src_port: 0,
            buffer_len: 0,
        }
    }

    pub fn to_wire(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HDR_LENGTH + self.payload.len() + 4);
        let mut hdr_bytes = [0u8; HDR_LENGTH];
        self.header.pack(&mut hdr_bytes);
        out.extend_from_slice(&hdr_bytes);
        out.extend_from_slice(self.payload.as_slice());
        // payload error check: reserved, currently a no-op zero field.
        out.extend_from_slice(&0u32.to_be_bytes());
        out
    }

    pub fn from_wire(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HDR_LENGTH {
            return Err(ForestError::TableConflict("datagram shorter than header".into()));
        }
        let header = Header::unpack(&bytes[..HDR_LENGTH])?;
        let payload_end = bytes.len().saturating_sub(4).max(HDR_LENGTH);
        let payload = PacketBuffer::from_slice(&bytes[HDR_LENGTH..payload_end]);
        let mut packet = Packet::new(header);
        packet.payload = payload;
        packet.buffer_len = bytes.len();
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            version: Header::CURRENT_VERSION,
            length: 100,
            ptype: PacketType::ClientData,
            flags: flags::RTE_REQ,
            comtree: 1001,
            src_adr: ForestAddr::new(1, 2),
            dst_adr: ForestAddr::new(2, 1),
        }
    }

    #[test]
    fn pack_unpack_header_roundtrip() {
        let h = sample_header();
        let mut bytes = [0u8; HDR_LENGTH];
        h.pack(&mut bytes);
        let back = Header::unpack(&bytes).expect("unpack");
        assert_eq!(h, back);
    }

    #[test]
    fn wire_roundtrip_preserves_header_and_payload() {
        let mut packet = Packet::new(sample_header());
        packet.payload.set(b"hello forest");
        let wire = packet.to_wire();
        let back = Packet::from_wire(&wire).expect("from_wire");
        assert_eq!(back.header, packet.header);
        assert_eq!(back.payload.as_slice(), b"hello forest");
    }

    #[test]
    fn flags_set_and_clear() {
        let mut h = sample_header();
        assert!(h.has_flag(flags::RTE_REQ));
        h.clear_flag(flags::RTE_REQ);
        assert!(!h.has_flag(flags::RTE_REQ));
        h.set_flag(flags::ACK_FLAG);
        assert!(h.has_flag(flags::ACK_FLAG));
    }

    #[test]
    fn peer_type_trust_threshold() {
        assert!(PeerType::Client.is_untrusted());
        assert!(PeerType::Server.is_untrusted());
        assert!(!PeerType::Router.is_untrusted());
        assert!(!PeerType::Controller.is_untrusted());
    }
}
