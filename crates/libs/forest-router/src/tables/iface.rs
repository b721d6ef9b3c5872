//! Interface table: logical UDP interfaces and their rate budgets
//! (spec §3, §4.2).

use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::error::{ForestError, Result};
use crate::rate::RateSpec;

pub type IfaceId = u32;

#[derive(Debug, Clone)]
pub struct IfaceEntry {
    pub local_ip: Ipv4Addr,
    pub port: u16,
    pub rates: RateSpec,
    pub avail_rates: RateSpec,
}

#[derive(Debug, Default)]
pub struct IfaceTable {
    entries: HashMap<IfaceId, IfaceEntry>,
}

impl IfaceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn valid(&self, iface: IfaceId) -> bool {
        self.entries.contains_key(&iface)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, iface: IfaceId) -> Option<&IfaceEntry> {
        self.entries.get(&iface)
    }

    pub fn get_mut(&mut self, iface: IfaceId) -> Option<&mut IfaceEntry> {
        self.entries.get_mut(&iface)
    }

    pub fn add(&mut self, iface: IfaceId, local_ip: Ipv4Addr, port: u16, rates: RateSpec) -> Result<()> {
        if self.entries.contains_key(&iface) {
            return Err(ForestError::TableConflict(format!("iface {iface} already exists")));
        }
        self.entries
            .insert(iface, IfaceEntry { local_ip, port, rates, avail_rates: rates });
        Ok(())
    }

    pub fn drop(&mut self, iface: IfaceId) -> Result<()> {
        if self.entries.remove(&iface).is_none() {
            return Err(ForestError::TableConflict(format!("iface {iface} does not exist")));
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IfaceId, &IfaceEntry)> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&IfaceId, &mut IfaceEntry)> {
        self.entries.iter_mut()
    }

    pub fn first(&self) -> Option<IfaceId> {
        self.entries.keys().min().copied()
    }

    pub fn next(&self, iface: IfaceId) -> Option<IfaceId> {
        self.entries.keys().filter(|&&i| i > iface).min().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_drop_roundtrips() {
        let mut t = IfaceTable::new();
        t.add(1, Ipv4Addr::new(10, 0, 0, 1), 30123, RateSpec::new(1000, 1000, 100, 100)).unwrap();
        assert!(t.valid(1));
        t.drop(1).unwrap();
        assert!(!t.valid(1));
    }

    #[test]
    fn duplicate_add_fails_cleanly() {
        let mut t = IfaceTable::new();
        t.add(1, Ipv4Addr::UNSPECIFIED, 1, RateSpec::ZERO).unwrap();
        let err = t.add(1, Ipv4Addr::UNSPECIFIED, 1, RateSpec::ZERO);
        assert!(err.is_err());
        assert!(t.valid(1), "failed mutator must leave table unchanged");
    }
}
