//! Route table: `(comtree, destination) -> link(s)` (spec §3, §4.2).
//!
//! Unicast destinations map to a single outgoing link. Multicast
//! destinations map to a set of outgoing links, since a multicast packet
//! may need to fan out across several links at once.

use std::collections::{HashMap, HashSet};

use crate::address::ForestAddr;
use crate::error::{ForestError, Result};
use crate::tables::link::LinkId;

pub type ComtreeId = u32;

#[derive(Debug, Clone)]
pub enum RouteTarget {
    Unicast(LinkId),
    Multicast(HashSet<LinkId>),
}

#[derive(Debug, Default)]
pub struct RouteTable {
    entries: HashMap<(ComtreeId, ForestAddr), RouteTarget>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn valid(&self, comt: ComtreeId, dest: ForestAddr) -> bool {
        self.entries.contains_key(&(comt, dest))
    }

    pub fn lookup(&self, comt: ComtreeId, dest: ForestAddr) -> Option<&RouteTarget> {
        self.entries.get(&(comt, dest))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Install a fresh unicast route, replacing any existing entry for the
    /// same key (spec §4.2: route installation overwrites).
    pub fn add_unicast(&mut self, comt: ComtreeId, dest: ForestAddr, lnk: LinkId) -> Result<()> {
        if !dest.is_unicast() {
            return Err(ForestError::TableConflict(format!("{dest} is not a unicast address")));
        }
        self.entries.insert((comt, dest), RouteTarget::Unicast(lnk));
        Ok(())
    }

    /// Install or replace a multicast route with an explicit link set.
    pub fn add_multicast(&mut self, comt: ComtreeId, dest: ForestAddr, links: HashSet<LinkId>) -> Result<()> {
        if !dest.is_multicast() {
            return Err(ForestError::TableConflict(format!("{dest} is not a multicast address")));
        }
        self.entries.insert((comt, dest), RouteTarget::Multicast(links));
        Ok(())
    }

    /// Add a single link to an existing multicast route, creating an empty
    /// one first if necessary. Fails if the key already holds a unicast
    /// route.
    pub fn add_link(&mut self, comt: ComtreeId, dest: ForestAddr, lnk: LinkId) -> Result<()> {
        if !dest.is_multicast() {
            return Err(ForestError::TableConflict(format!("{dest} is not a multicast address")));
        }
        match self.entries.entry((comt, dest)).or_insert_with(|| RouteTarget::Multicast(HashSet::new())) {
            RouteTarget::Multicast(links) => {
                links.insert(lnk);
                Ok(())
            }
            RouteTarget::Unicast(_) => {
                Err(ForestError::TableConflict(format!("{dest} in comtree {comt} is a unicast route")))
            }
        }
    }

    /// Remove a single link from a multicast route. The route entry itself
    /// is kept even if it becomes empty, matching `noLinks` semantics
    /// below.
    pub fn remove_link(&mut self, comt: ComtreeId, dest: ForestAddr, lnk: LinkId) -> Result<()> {
        match self.entries.get_mut(&(comt, dest)) {
            Some(RouteTarget::Multicast(links)) => {
                links.remove(&lnk);
                Ok(())
            }
            Some(RouteTarget::Unicast(_)) => {
                Err(ForestError::TableConflict(format!("{dest} in comtree {comt} is a unicast route")))
            }
            None => Err(ForestError::TableConflict(format!("no route for ({comt},{dest})"))),
        }
    }

    /// True iff the multicast route for `(comt,dest)` exists and has no
    /// links left — the caller should then purge it.
    pub fn no_links(&self, comt: ComtreeId, dest: ForestAddr) -> bool {
        matches!(self.entries.get(&(comt, dest)), Some(RouteTarget::Multicast(links)) if links.is_empty())
    }

    pub fn remove(&mut self, comt: ComtreeId, dest: ForestAddr) -> Result<()> {
        if self.entries.remove(&(comt, dest)).is_none() {
            return Err(ForestError::TableConflict(format!("no route for ({comt},{dest})")));
        }
        Ok(())
    }

    /// Drop every multicast route in every comtree whose link set has
    /// become empty (spec §4.2: periodic/opportunistic route cleanup).
    pub fn purge_empty_routes(&mut self) -> usize {
        let dead: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, target)| matches!(target, RouteTarget::Multicast(links) if links.is_empty()))
            .map(|(key, _)| *key)
            .collect();
        let n = dead.len();
        for key in dead {
            self.entries.remove(&key);
        }
        n
    }

    /// `purgeRoutes(comt)`: drop every route entry in comtree `comt`,
    /// regardless of link set (spec §3 lifecycle, `dropComtree`).
    pub fn purge_comtree(&mut self, comt: ComtreeId) -> usize {
        let dead: Vec<_> = self.entries.keys().filter(|(c, _)| *c == comt).copied().collect();
        let n = dead.len();
        for key in dead {
            self.entries.remove(&key);
        }
        n
    }

    /// Drop every route in `comt` that routes through `lnk`, whether
    /// unicast or as one member of a multicast set. Used when a link goes
    /// down (spec §4.2, §4.5 `handleConnDisc`).
    pub fn purge_link(&mut self, lnk: LinkId) {
        let dead: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, target)| match target {
                RouteTarget::Unicast(l) => *l == lnk,
                RouteTarget::Multicast(links) => links.contains(&lnk),
            })
            .map(|(key, _)| *key)
            .collect();
        for key in dead {
            match self.entries.get_mut(&key).unwrap() {
                RouteTarget::Unicast(_) => {
                    self.entries.remove(&key);
                }
                RouteTarget::Multicast(links) => {
                    links.remove(&lnk);
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&(ComtreeId, ForestAddr), &RouteTarget)> {
        self.entries.iter()
    }
}
