//! Packet store: fixed pools of packet descriptors and shared buffers
//! (spec §3, §4.1).
//!
//! Mirrors the reference router's `PacketStore`: an arena of descriptor
//! slots and a separate arena of buffer slots, each with its own intrusive
//! free list. A descriptor owns a `Header` plus the ephemeral receive-side
//! fields; a buffer owns the payload bytes and a reference count so
//! multicast fan-out can clone a descriptor without copying payload bytes.

use crate::packet::{Header, Packet, PacketBuffer};

/// Packet handle. `0` means "no packet" everywhere it's used, matching the
/// reference router's convention of 1-based, 0-sentinel indices.
pub type Px = u32;

struct DescriptorSlot {
    in_use: bool,
    buf_idx: u32,
    header: Header,
    in_link: u32,
    tun_src_ip: std::net::Ipv4Addr,
    tun_src_port: u16,
    buffer_len: usize,
    next_free: u32,
}

struct BufferSlot {
    refcount: u32,
    data: PacketBuffer,
    next_free: u32,
}

/// Fixed pools of descriptors (`N`) and buffers (`M`, with `N >= M`).
pub struct PacketStore {
    descriptors: Vec<DescriptorSlot>,
    buffers: Vec<BufferSlot>,
    free_desc_head: u32,
    free_buf_head: u32,
    n_in_use: usize,
    m_in_use: usize,
}

const NONE: u32 = 0;

impl PacketStore {
    pub fn new(n_descriptors: usize, m_buffers: usize) -> Self {
        assert!(n_descriptors >= m_buffers, "descriptor pool must be >= buffer pool");

        let mut descriptors = Vec::with_capacity(n_descriptors + 1);
        descriptors.push(DescriptorSlot {
            in_use: false,
            buf_idx: NONE,
            header: Header {
                version: 0,
                length: 0,
                ptype: crate::packet::PacketType::ClientData,
                flags: 0,
                comtree: 0,
                src_adr: crate::address::ForestAddr::RESERVED,
                dst_adr: crate::address::ForestAddr::RESERVED,
            },
            in_link: 0,
            tun_src_ip: std::net::Ipv4Addr::UNSPECIFIED,
            tun_src_port: 0,
            buffer_len: 0,
            next_free: NONE,
        });
        for i in 1..=n_descriptors as u32 {
            descriptors.push(DescriptorSlot {
                in_use: false,
                buf_idx: NONE,
                header: descriptors[0].header,
                in_link: 0,
                tun_src_ip: std::net::Ipv4Addr::UNSPECIFIED,
                tun_src_port: 0,
                buffer_len: 0,
                next_free: if i == n_descriptors as u32 { NONE } else { i + 1 },
            });
        }

        let mut buffers = Vec::with_capacity(m_buffers + 1);
        buffers.push(BufferSlot { refcount: 0, data: PacketBuffer::new(), next_free: NONE });
        for i in 1..=m_buffers as u32 {
            buffers.push(BufferSlot {
                refcount: 0,
                data: PacketBuffer::new(),
                next_free: if i == m_buffers as u32 { NONE } else { i + 1 },
            });
        }

        Self {
            descriptors,
            buffers,
            free_desc_head: if n_descriptors == 0 { NONE } else { 1 },
            free_buf_head: if m_buffers == 0 { NONE } else { 1 },
            n_in_use: 0,
            m_in_use: 0,
        }
    }

    pub fn in_use(&self) -> usize {
        self.n_in_use
    }

    pub fn buffers_in_use(&self) -> usize {
        self.m_in_use
    }

    fn pop_free_desc(&mut self) -> Option<u32> {
        if self.free_desc_head == NONE {
            return None;
        }
        let px = self.free_desc_head;
        self.free_desc_head = self.descriptors[px as usize].next_free;
        Some(px)
    }

    fn push_free_desc(&mut self, px: u32) {
        self.descriptors[px as usize].in_use = false;
        self.descriptors[px as usize].next_free = self.free_desc_head;
        self.free_desc_head = px;
    }

    fn pop_free_buf(&mut self) -> Option<u32> {
        if self.free_buf_head == NONE {
            return None;
        }
        let b = self.free_buf_head;
        self.free_buf_head = self.buffers[b as usize].next_free;
        Some(b)
    }

    fn push_free_buf(&mut self, b: u32) {
        self.buffers[b as usize].refcount = 0;
        self.buffers[b as usize].next_free = self.free_buf_head;
        self.free_buf_head = b;
    }

    /// Allocate a fresh descriptor and buffer, refcount 1. Returns 0 if
    /// either pool is exhausted.
    pub fn alloc(&mut self, packet: &Packet) -> Px {
        let Some(px) = self.pop_free_desc() else { return 0 };
        let Some(b) = self.pop_free_buf() else {
            self.push_free_desc(px);
            return 0;
        };

        self.buffers[b as usize].refcount = 1;
        self.buffers[b as usize].data = packet.payload;
        let slot = &mut self.descriptors[px as usize];
        slot.in_use = true;
        slot.buf_idx = b;
        slot.header = packet.header;
        slot.in_link = packet.in_link;
        slot.tun_src_ip = packet.tun_src_ip;
        slot.tun_src_port = packet.tun_src_port;
        slot.buffer_len = packet.buffer_len;

        self.n_in_use += 1;
        self.m_in_use += 1;
        px
    }

    /// Release a descriptor. Idempotent: freeing an invalid or already-free
    /// descriptor is a no-op. Decrements the buffer refcount and releases
    /// the buffer exactly when it reaches zero.
    pub fn free(&mut self, px: Px) {
        if px == 0 || px as usize >= self.descriptors.len() {
            return;
        }
        if !self.descriptors[px as usize].in_use {
            return;
        }

        let b = self.descriptors[px as usize].buf_idx;
        self.push_free_desc(px);
        self.n_in_use -= 1;

        if b != NONE {
            let rc = &mut self.buffers[b as usize].refcount;
            *rc -= 1;
            if *rc == 0 {
                self.push_free_buf(b);
                self.m_in_use -= 1;
            }
        }
    }

    /// Allocate a descriptor that aliases `px`'s buffer (refcount+1). The
    /// new descriptor's header and ephemeral fields are a bitwise copy of
    /// `px`'s at the moment of cloning.
    pub fn clone_packet(&mut self, px: Px) -> Px {
        if px == 0 || !self.descriptors[px as usize].in_use {
            return 0;
        }
        let Some(cx) = self.pop_free_desc() else { return 0 };

        let src = px as usize;
        let buf_idx = self.descriptors[src].buf_idx;
        self.buffers[buf_idx as usize].refcount += 1;

        let header = self.descriptors[src].header;
        let in_link = self.descriptors[src].in_link;
        let tun_src_ip = self.descriptors[src].tun_src_ip;
        let tun_src_port = self.descriptors[src].tun_src_port;
        let buffer_len = self.descriptors[src].buffer_len;

        let dst = &mut self.descriptors[cx as usize];
        dst.in_use = true;
        dst.buf_idx = buf_idx;
        dst.header = header;
        dst.in_link = in_link;
        dst.tun_src_ip = tun_src_ip;
        dst.tun_src_port = tun_src_port;
        dst.buffer_len = buffer_len;

        self.n_in_use += 1;
        cx
    }

    /// Allocate a fresh descriptor and buffer, memcopying `px`'s payload
    /// into the new buffer. Used when a copy needs independent mutation
    /// (e.g. rewriting an RTE_REPLY payload while the original forwards
    /// on).
    pub fn full_copy(&mut self, px: Px) -> Px {
        if px == 0 || !self.descriptors[px as usize].in_use {
            return 0;
        }
        let Some(cx) = self.pop_free_desc() else { return 0 };
        let Some(b) = self.pop_free_buf() else {
            self.push_free_desc(cx);
            return 0;
        };

        let src = px as usize;
        let src_buf = self.descriptors[src].buf_idx;
        self.buffers[b as usize].data = self.buffers[src_buf as usize].data;
        self.buffers[b as usize].refcount = 1;

        let header = self.descriptors[src].header;
        let in_link = self.descriptors[src].in_link;
        let tun_src_ip = self.descriptors[src].tun_src_ip;
        let tun_src_port = self.descriptors[src].tun_src_port;
        let buffer_len = self.descriptors[src].buffer_len;

        let dst = &mut self.descriptors[cx as usize];
        dst.in_use = true;
        dst.buf_idx = b;
        dst.header = header;
        dst.in_link = in_link;
        dst.tun_src_ip = tun_src_ip;
        dst.tun_src_port = tun_src_port;
        dst.buffer_len = buffer_len;

        self.n_in_use += 1;
        self.m_in_use += 1;
        cx
    }

    pub fn header(&self, px: Px) -> &Header {
        &self.descriptors[px as usize].header
    }

    pub fn header_mut(&mut self, px: Px) -> &mut Header {
        &mut self.descriptors[px as usize].header
    }

    pub fn payload(&self, px: Px) -> &PacketBuffer {
        let b = self.descriptors[px as usize].buf_idx;
        &self.buffers[b as usize].data
    }

    pub fn payload_mut(&mut self, px: Px) -> &mut PacketBuffer {
        let b = self.descriptors[px as usize].buf_idx;
        &mut self.buffers[b as usize].data
    }

    pub fn in_link(&self, px: Px) -> u32 {
        self.descriptors[px as usize].in_link
    }

    pub fn set_in_link(&mut self, px: Px, link: u32) {
        self.descriptors[px as usize].in_link = link;
    }

    pub fn tun_source(&self, px: Px) -> (std::net::Ipv4Addr, u16) {
        let d = &self.descriptors[px as usize];
        (d.tun_src_ip, d.tun_src_port)
    }

    pub fn set_tun_source(&mut self, px: Px, ip: std::net::Ipv4Addr, port: u16) {
        let d = &mut self.descriptors[px as usize];
        d.tun_src_ip = ip;
        d.tun_src_port = port;
    }

    pub fn buffer_len(&self, px: Px) -> usize {
        self.descriptors[px as usize].buffer_len
    }

    pub fn set_buffer_len(&mut self, px: Px, len: usize) {
        self.descriptors[px as usize].buffer_len = len;
    }

    /// Buffer refcount for `px`'s buffer. Used by tests and invariant
    /// checks (spec §8).
    pub fn refcount(&self, px: Px) -> u32 {
        if px == 0 || !self.descriptors[px as usize].in_use {
            return 0;
        }
        let b = self.descriptors[px as usize].buf_idx;
        self.buffers[b as usize].refcount
    }

    /// Reconstruct a standalone [`Packet`] snapshot (header + payload +
    /// ephemeral fields) for `px`.
    pub fn to_packet(&self, px: Px) -> Packet {
        let d = &self.descriptors[px as usize];
        Packet {
            header: d.header,
            payload: self.buffers[d.buf_idx as usize].data,
            in_link: d.in_link,
            tun_src_ip: d.tun_src_ip,
            tun_src_port: d.tun_src_port,
            buffer_len: d.buffer_len,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::ForestAddr;
    use crate::packet::{Header, PacketType};

    fn sample_packet() -> Packet {
        let header = Header {
            version: Header::CURRENT_VERSION,
            length: 24,
            ptype: PacketType::ClientData,
            flags: 0,
            comtree: 1001,
            src_adr: ForestAddr::new(1, 2),
            dst_adr: ForestAddr::new(2, 1),
        };
        Packet::new(header)
    }

    #[test]
    fn alloc_fails_when_pools_exhausted() {
        let mut store = PacketStore::new(1, 1);
        let px1 = store.alloc(&sample_packet());
        assert_ne!(px1, 0);
        let px2 = store.alloc(&sample_packet());
        assert_eq!(px2, 0, "second alloc must fail: pools exhausted");
    }

    #[test]
    fn clone_shares_buffer_and_free_releases_correctly() {
        let mut store = PacketStore::new(4, 4);
        let px1 = store.alloc(&sample_packet());
        let px2 = store.clone_packet(px1);
        assert_ne!(px2, 0);
        assert_eq!(store.refcount(px1), 2);
        assert_eq!(store.refcount(px2), 2);

        store.free(px1);
        assert_eq!(store.refcount(px2), 1, "buffer must survive one free while aliased");

        store.free(px2);
        assert_eq!(store.in_use(), 0);
        assert_eq!(store.buffers_in_use(), 0);
    }

    #[test]
    fn free_is_idempotent() {
        let mut store = PacketStore::new(2, 2);
        let px = store.alloc(&sample_packet());
        store.free(px);
        store.free(px); // must not panic or double-decrement
        store.free(0);
        assert_eq!(store.in_use(), 0);
    }

    #[test]
    fn full_copy_gets_independent_buffer() {
        let mut store = PacketStore::new(4, 4);
        let px1 = store.alloc(&sample_packet());
        store.payload_mut(px1).set(b"original");
        let px2 = store.full_copy(px1);

        store.payload_mut(px2).set(b"mutated");
        assert_eq!(store.payload(px1).as_slice(), b"original");
        assert_eq!(store.payload(px2).as_slice(), b"mutated");
        assert_eq!(store.refcount(px1), 1);
        assert_eq!(store.refcount(px2), 1);
    }

    #[test]
    fn clone_descriptor_is_bit_equal_at_clone_time() {
        let mut store = PacketStore::new(4, 4);
        let px1 = store.alloc(&sample_packet());
        store.set_in_link(px1, 7);
        let px2 = store.clone_packet(px1);
        assert_eq!(store.header(px1), store.header(px2));
        assert_eq!(store.in_link(px2), 7);

        // subsequent mutation of px1's header must not affect px2
        store.header_mut(px1).comtree = 9999;
        assert_ne!(store.header(px1).comtree, store.header(px2).comtree);
    }
}
