//! Link table: per-link peer identity, rates, and the connect-state
//! indices (spec §3, §4.2).
//!
//! A link lives in exactly one of two indices: before `connect()`
//! completes it is found by its pre-declared nonce; after `connect()` it
//! is found by `(peer_ip, peer_port)`. `revertEntry` is the inverse,
//! used on disconnect.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use crate::address::ForestAddr;
use crate::error::{ForestError, Result};
use crate::packet::PeerType;
use crate::rate::RateSpec;
use crate::tables::iface::IfaceId;

pub type LinkId = u32;

#[derive(Debug, Clone)]
pub struct LinkEntry {
    pub iface: IfaceId,
    pub peer_ip: Ipv4Addr,
    pub peer_port: u16,
    pub peer_adr: ForestAddr,
    pub peer_type: PeerType,
    pub connected: bool,
    pub nonce: u64,
    pub rates: RateSpec,
    pub avail_rates: RateSpec,
    pub comtrees: HashSet<u32>,
}

#[derive(Debug, Default)]
pub struct LinkTable {
    entries: HashMap<LinkId, LinkEntry>,
    by_ip_port: HashMap<(Ipv4Addr, u16), LinkId>,
    by_nonce: HashMap<u64, LinkId>,
}

impl LinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn valid(&self, lnk: LinkId) -> bool {
        self.entries.contains_key(&lnk)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, lnk: LinkId) -> Option<&LinkEntry> {
        self.entries.get(&lnk)
    }

    pub fn get_mut(&mut self, lnk: LinkId) -> Option<&mut LinkEntry> {
        self.entries.get_mut(&lnk)
    }

    /// Pre-declare a link, indexed by its nonce until `connect()`.
    pub fn add(
        &mut self,
        lnk: LinkId,
        iface: IfaceId,
        peer_ip: Ipv4Addr,
        peer_port: u16,
        peer_adr: ForestAddr,
        peer_type: PeerType,
        nonce: u64,
        rates: RateSpec,
    ) -> Result<()> {
        if self.entries.contains_key(&lnk) {
            return Err(ForestError::TableConflict(format!("link {lnk} already exists")));
        }
        if self.by_nonce.contains_key(&nonce) {
            return Err(ForestError::TableConflict(format!("nonce already registered")));
        }
        self.entries.insert(
            lnk,
            LinkEntry {
                iface,
                peer_ip,
                peer_port,
                peer_adr,
                peer_type,
                connected: false,
                nonce,
                rates,
                avail_rates: rates,
                comtrees: HashSet::new(),
            },
        );
        self.by_nonce.insert(nonce, lnk);
        Ok(())
    }

    pub fn drop(&mut self, lnk: LinkId) -> Result<()> {
        let Some(entry) = self.entries.remove(&lnk) else {
            return Err(ForestError::TableConflict(format!("link {lnk} does not exist")));
        };
        if entry.connected {
            self.by_ip_port.remove(&(entry.peer_ip, entry.peer_port));
        } else {
            self.by_nonce.remove(&entry.nonce);
        }
        Ok(())
    }

    /// `lookup(ip,port)`: the unique link whose connected index matches,
    /// else 0.
    pub fn lookup_by_addr(&self, ip: Ipv4Addr, port: u16) -> Option<LinkId> {
        self.by_ip_port.get(&(ip, port)).copied()
    }

    /// `lookup(nonce)`: the unique pre-declared link, else 0.
    pub fn lookup_by_nonce(&self, nonce: u64) -> Option<LinkId> {
        self.by_nonce.get(&nonce).copied()
    }

    /// Move `lnk` from the nonce index to the `(ip,port)` index. Fails if
    /// `lnk` is already connected or if `(ip,port)` is already in use by
    /// another link. The table is left unchanged on failure.
    pub fn connect(&mut self, lnk: LinkId, ip: Ipv4Addr, port: u16) -> Result<()> {
        let entry = self
            .entries
            .get(&lnk)
            .ok_or_else(|| ForestError::TableConflict(format!("link {lnk} does not exist")))?;
        if entry.connected {
            return Err(ForestError::TableConflict(format!("link {lnk} already connected")));
        }
        if self.by_ip_port.contains_key(&(ip, port)) {
            return Err(ForestError::TableConflict(format!("{ip}:{port} already in use")));
        }

        let nonce = entry.nonce;
        self.by_nonce.remove(&nonce);
        let entry = self.entries.get_mut(&lnk).unwrap();
        entry.connected = true;
        entry.peer_ip = ip;
        entry.peer_port = port;
        self.by_ip_port.insert((ip, port), lnk);
        Ok(())
    }

    /// Inverse of `connect`: re-key `lnk` back onto its nonce index.
    pub fn revert_entry(&mut self, lnk: LinkId) -> Result<()> {
        let entry = self
            .entries
            .get(&lnk)
            .ok_or_else(|| ForestError::TableConflict(format!("link {lnk} does not exist")))?;
        if !entry.connected {
            return Err(ForestError::TableConflict(format!("link {lnk} not connected")));
        }
        let (ip, port, nonce) = (entry.peer_ip, entry.peer_port, entry.nonce);
        self.by_ip_port.remove(&(ip, port));
        let entry = self.entries.get_mut(&lnk).unwrap();
        entry.connected = false;
        self.by_nonce.insert(nonce, lnk);
        Ok(())
    }

    pub fn add_comtree(&mut self, lnk: LinkId, comt: u32) -> Result<()> {
        let entry = self
            .entries
            .get_mut(&lnk)
            .ok_or_else(|| ForestError::TableConflict(format!("link {lnk} does not exist")))?;
        entry.comtrees.insert(comt);
        Ok(())
    }

    pub fn remove_comtree(&mut self, lnk: LinkId, comt: u32) {
        if let Some(entry) = self.entries.get_mut(&lnk) {
            entry.comtrees.remove(&comt);
        }
    }

    pub fn first(&self) -> Option<LinkId> {
        self.entries.keys().min().copied()
    }

    pub fn next(&self, lnk: LinkId) -> Option<LinkId> {
        self.entries.keys().filter(|&&l| l > lnk).min().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LinkId, &LinkEntry)> {
        self.entries.iter()
    }

    /// Invariant check (spec §8): every `(ip,port)` in the connected index
    /// maps to an entry with `connected == true`; every nonce in the nonce
    /// index maps to an entry with `connected == false`.
    #[cfg(test)]
    fn check_index_invariant(&self) -> bool {
        self.by_ip_port.values().all(|lnk| self.entries[lnk].connected)
            && self.by_nonce.values().all(|lnk| !self.entries[lnk].connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add_link(t: &mut LinkTable, lnk: LinkId, nonce: u64) {
        t.add(
            lnk,
            1,
            Ipv4Addr::UNSPECIFIED,
            0,
            ForestAddr::new(1, 2),
            PeerType::Client,
            nonce,
            RateSpec::new(1000, 1000, 100, 100),
        )
        .unwrap();
    }

    #[test]
    fn connect_remaps_nonce_to_addr_index() {
        let mut t = LinkTable::new();
        add_link(&mut t, 1, 0xdead_beef);
        assert_eq!(t.lookup_by_nonce(0xdead_beef), Some(1));
        assert_eq!(t.lookup_by_addr(Ipv4Addr::new(10, 0, 0, 5), 4000), None);

        t.connect(1, Ipv4Addr::new(10, 0, 0, 5), 4000).unwrap();
        assert_eq!(t.lookup_by_nonce(0xdead_beef), None);
        assert_eq!(t.lookup_by_addr(Ipv4Addr::new(10, 0, 0, 5), 4000), Some(1));
        assert!(t.check_index_invariant());
    }

    #[test]
    fn connect_twice_fails_and_leaves_table_unchanged() {
        let mut t = LinkTable::new();
        add_link(&mut t, 1, 1);
        t.connect(1, Ipv4Addr::new(1, 1, 1, 1), 1).unwrap();
        let err = t.connect(1, Ipv4Addr::new(2, 2, 2, 2), 2);
        assert!(err.is_err());
        assert_eq!(t.lookup_by_addr(Ipv4Addr::new(1, 1, 1, 1), 1), Some(1));
        assert_eq!(t.lookup_by_addr(Ipv4Addr::new(2, 2, 2, 2), 2), None);
    }

    #[test]
    fn connect_rejects_addr_already_in_use() {
        let mut t = LinkTable::new();
        add_link(&mut t, 1, 1);
        add_link(&mut t, 2, 2);
        t.connect(1, Ipv4Addr::new(1, 1, 1, 1), 1).unwrap();
        let err = t.connect(2, Ipv4Addr::new(1, 1, 1, 1), 1);
        assert!(err.is_err());
    }

    #[test]
    fn revert_entry_is_inverse_of_connect() {
        let mut t = LinkTable::new();
        add_link(&mut t, 1, 42);
        t.connect(1, Ipv4Addr::new(9, 9, 9, 9), 7).unwrap();
        t.revert_entry(1).unwrap();
        assert_eq!(t.lookup_by_nonce(42), Some(1));
        assert_eq!(t.lookup_by_addr(Ipv4Addr::new(9, 9, 9, 9), 7), None);
        assert!(t.check_index_invariant());
    }
}
