//! Non-blocking UDP transport for interfaces and the boot socket (spec
//! §4.4).
//!
//! Each configured interface owns one bound [`tokio::net::UdpSocket`].
//! `IoProcessor` also keeps a dedicated boot socket used only to receive
//! the first `CONNECT` from a not-yet-connected peer, identified by
//! nonce rather than by `(ip,port)` (spec §4.5 `handleConnDisc`).

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;

use crate::error::{ForestError, Result};
use crate::packet::{Packet, MAX_PACKET_LENGTH};
use crate::tables::iface::IfaceId;

pub struct ReceivedDatagram {
    pub iface: IfaceId,
    pub from: SocketAddr,
    pub packet: Packet,
}

struct IfaceSocket {
    iface: IfaceId,
    socket: UdpSocket,
}

/// Binds and round-robins across the router's UDP sockets.
pub struct IoProcessor {
    ifaces: Vec<IfaceSocket>,
    boot: Option<UdpSocket>,
    next_poll: usize,
}

impl IoProcessor {
    pub fn new() -> Self {
        Self { ifaces: Vec::new(), boot: None, next_poll: 0 }
    }

    pub async fn bind_iface(&mut self, iface: IfaceId, local_ip: Ipv4Addr, port: u16) -> Result<()> {
        let socket = UdpSocket::bind((local_ip, port)).await?;
        self.ifaces.push(IfaceSocket { iface, socket });
        Ok(())
    }

    pub async fn bind_boot(&mut self, local_ip: Ipv4Addr, port: u16) -> Result<()> {
        self.boot = Some(UdpSocket::bind((local_ip, port)).await?);
        Ok(())
    }

    pub fn unbind_iface(&mut self, iface: IfaceId) {
        self.ifaces.retain(|s| s.iface != iface);
    }

    /// Poll every bound socket (interfaces, then the boot socket) once in
    /// round-robin order, returning the first datagram found. Non-blocking:
    /// returns `Ok(None)` rather than waiting when nothing is ready.
    pub fn try_receive(&mut self) -> Result<Option<ReceivedDatagram>> {
        let n = self.ifaces.len();
        for step in 0..n {
            let idx = (self.next_poll + step) % n;
            let mut buf = [0u8; MAX_PACKET_LENGTH];
            match self.ifaces[idx].socket.try_recv_from(&mut buf) {
                Ok((len, from)) => {
                    self.next_poll = (idx + 1) % n.max(1);
                    match Packet::from_wire(&buf[..len]) {
                        Ok(packet) => {
                            return Ok(Some(ReceivedDatagram { iface: self.ifaces[idx].iface, from, packet }));
                        }
                        Err(e) => {
                            log::debug!("dropping malformed datagram from {from} on iface {}: {e}", self.ifaces[idx].iface);
                            continue;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(ForestError::Io(e)),
            }
        }

        if let Some(boot) = &self.boot {
            let mut buf = [0u8; MAX_PACKET_LENGTH];
            match boot.try_recv_from(&mut buf) {
                Ok((len, from)) => match Packet::from_wire(&buf[..len]) {
                    Ok(packet) => return Ok(Some(ReceivedDatagram { iface: 0, from, packet })),
                    Err(e) => log::debug!("dropping malformed datagram from {from} on boot socket: {e}"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(ForestError::Io(e)),
            }
        }

        Ok(None)
    }

    pub fn try_send(&self, iface: IfaceId, to: SocketAddr, packet: &Packet) -> Result<usize> {
        let wire = packet.to_wire();
        let sock = if iface == 0 {
            self.boot.as_ref().ok_or_else(|| ForestError::TableConflict("boot socket not bound".into()))?
        } else {
            &self
                .ifaces
                .iter()
                .find(|s| s.iface == iface)
                .ok_or_else(|| ForestError::TableConflict(format!("iface {iface} not bound")))?
                .socket
        };
        match sock.try_send_to(&wire, to) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(ForestError::Io(e)),
        }
    }
}

impl Default for IoProcessor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ForestAddr;
    use crate::packet::{flags, Header, PacketType};

    fn sample_packet() -> Packet {
        let header = Header {
            version: Header::CURRENT_VERSION,
            length: 24,
            ptype: PacketType::ClientData,
            flags: flags::RTE_REQ,
            comtree: 1,
            src_adr: ForestAddr::new(1, 1),
            dst_adr: ForestAddr::new(1, 2),
        };
        let mut p = Packet::new(header);
        p.payload.set(b"payload");
        p
    }

    #[tokio::test]
    async fn round_trip_between_two_bound_interfaces() {
        let mut a = IoProcessor::new();
        let mut b = IoProcessor::new();
        a.bind_iface(1, Ipv4Addr::LOCALHOST, 0).await.unwrap();
        b.bind_iface(2, Ipv4Addr::LOCALHOST, 0).await.unwrap();

        let b_addr = b.ifaces[0].socket.local_addr().unwrap();
        let pkt = sample_packet();
        loop {
            if a.try_send(1, b_addr, &pkt).unwrap() > 0 {
                break;
            }
        }

        let mut received = None;
        for _ in 0..1000 {
            if let Some(dgram) = b.try_receive().unwrap() {
                received = Some(dgram);
                break;
            }
            tokio::task::yield_now().await;
        }
        let dgram = received.expect("datagram should have arrived");
        assert_eq!(dgram.iface, 2);
        assert_eq!(dgram.packet.header.comtree, 1);
        assert_eq!(dgram.packet.payload.as_slice(), b"payload");
    }

    #[tokio::test]
    async fn try_receive_is_none_when_nothing_pending() {
        let mut io = IoProcessor::new();
        io.bind_iface(1, Ipv4Addr::LOCALHOST, 0).await.unwrap();
        assert!(io.try_receive().unwrap().is_none());
    }
}
