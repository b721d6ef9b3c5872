//! Bounded packet trace buffer, drained by the `GET_LOGGED_PACKETS`
//! control operation (spec §4.6, §6).
//!
//! Logging is opt-in per [`PacketType`](crate::packet::PacketType) via
//! an enable mask, so a deployment can trace control traffic without
//! paying to copy every data packet.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::address::ForestAddr;
use crate::packet::{Packet, PacketType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggedPacket {
    pub direction: LogDirection,
    pub link: u32,
    pub comtree: u32,
    pub src: u32,
    pub dst: u32,
    #[serde(with = "serde_bytes")]
    pub payload_prefix: Vec<u8>,
}

fn packet_type_bit(ptype: PacketType) -> u32 {
    1 << (ptype as u8)
}

pub struct PacketLog {
    capacity: usize,
    entries: VecDeque<LoggedPacket>,
    enabled_mask: u32,
    prefix_len: usize,
}

impl PacketLog {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: VecDeque::with_capacity(capacity), enabled_mask: 0, prefix_len: 64 }
    }

    pub fn enable(&mut self, ptype: PacketType) {
        self.enabled_mask |= packet_type_bit(ptype);
    }

    pub fn disable(&mut self, ptype: PacketType) {
        self.enabled_mask &= !packet_type_bit(ptype);
    }

    pub fn is_enabled(&self, ptype: PacketType) -> bool {
        self.enabled_mask & packet_type_bit(ptype) != 0
    }

    /// Record `packet` if its type is enabled. Oldest entries are
    /// dropped once `capacity` is reached.
    pub fn log(&mut self, direction: LogDirection, link: u32, packet: &Packet) {
        if !self.is_enabled(packet.header.ptype) {
            return;
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        let payload = packet.payload.as_slice();
        let n = payload.len().min(self.prefix_len);
        self.entries.push_back(LoggedPacket {
            direction,
            link,
            comtree: packet.header.comtree,
            src: packet.header.src_adr.raw(),
            dst: packet.header.dst_adr.raw(),
            payload_prefix: payload[..n].to_vec(),
        });
    }

    /// Drain every buffered entry. Used to answer `GET_LOGGED_PACKETS`
    /// without holding the buffer open indefinitely.
    pub fn drain(&mut self) -> Vec<LoggedPacket> {
        self.entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{flags, Header};

    fn sample(ptype: PacketType) -> Packet {
        let header = Header {
            version: Header::CURRENT_VERSION,
            length: 20,
            ptype,
            flags: flags::RTE_REQ,
            comtree: 7,
            src_adr: ForestAddr::new(1, 1),
            dst_adr: ForestAddr::new(1, 2),
        };
        let mut p = Packet::new(header);
        p.payload.set(b"trace me");
        p
    }

    #[test]
    fn disabled_type_is_not_recorded() {
        let mut log = PacketLog::new(10);
        log.log(LogDirection::In, 1, &sample(PacketType::ClientData));
        assert!(log.is_empty());
    }

    #[test]
    fn enabled_type_is_recorded_and_drained() {
        let mut log = PacketLog::new(10);
        log.enable(PacketType::ClientSig);
        log.log(LogDirection::In, 5, &sample(PacketType::ClientSig));
        assert_eq!(log.len(), 1);
        let drained = log.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].link, 5);
        assert!(log.is_empty());
    }

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let mut log = PacketLog::new(2);
        log.enable(PacketType::NetSig);
        for lnk in 1..=3u32 {
            let mut pkt = sample(PacketType::NetSig);
            pkt.header.comtree = lnk;
            log.log(LogDirection::Out, lnk, &pkt);
        }
        let drained = log.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].comtree, 2);
        assert_eq!(drained[1].comtree, 3);
    }
}
