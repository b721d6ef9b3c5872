//! Comtree table: per-comtree membership and the per-(comtree,link)
//! forwarding attributes (spec §3, §4.2).
//!
//! A comtree entry tracks three link subsets — core, router, and member —
//! that must satisfy `core ⊆ router` and `router ∩ member == ∅` (spec
//! §4.2 invariant). Each link in a comtree also carries its own queue id,
//! rate share, and whether packets toward it require a permit.

use std::collections::{HashMap, HashSet};

use crate::error::{ForestError, Result};
use crate::rate::RateSpec;
use crate::tables::link::LinkId;

pub type ComtreeId = u32;

#[derive(Debug, Clone, Default)]
pub struct ComtreeLinkInfo {
    pub queue: u32,
    pub rates: RateSpec,
}

#[derive(Debug, Clone)]
pub struct ComtreeEntry {
    pub parent_link: LinkId,
    pub core_flag: bool,
    pub core_links: HashSet<LinkId>,
    pub router_links: HashSet<LinkId>,
    pub member_links: HashSet<LinkId>,
    pub link_info: HashMap<LinkId, ComtreeLinkInfo>,
}

impl ComtreeEntry {
    fn new(parent_link: LinkId, core_flag: bool) -> Self {
        Self {
            parent_link,
            core_flag,
            core_links: HashSet::new(),
            router_links: HashSet::new(),
            member_links: HashSet::new(),
            link_info: HashMap::new(),
        }
    }

    /// spec §4.2 `checkEntry`: every core link is a router link; every
    /// router link is a comtree link (`member`/`router` disjoint by
    /// construction); the parent link, if any, is a router link; if this
    /// router is in the comtree's core, its parent link (if any) is also
    /// a core link; otherwise there is at most one core link, and if one
    /// exists it is the parent link.
    pub fn check_invariant(&self) -> bool {
        if !self.core_links.is_subset(&self.router_links) {
            return false;
        }
        if !self.router_links.is_disjoint(&self.member_links) {
            return false;
        }
        if self.parent_link != 0 && !self.router_links.contains(&self.parent_link) {
            return false;
        }
        if self.core_flag {
            self.parent_link == 0 || self.core_links.contains(&self.parent_link)
        } else {
            self.core_links.is_empty()
                || (self.core_links.len() == 1 && self.core_links.contains(&self.parent_link))
        }
    }
}

#[derive(Debug, Default)]
pub struct ComtreeTable {
    entries: HashMap<ComtreeId, ComtreeEntry>,
}

impl ComtreeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn valid(&self, comt: ComtreeId) -> bool {
        self.entries.contains_key(&comt)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, comt: ComtreeId) -> Option<&ComtreeEntry> {
        self.entries.get(&comt)
    }

    /// Mutable access for `MOD_COMTREE`-style updates. Callers are
    /// responsible for re-checking `check_invariant` afterward.
    pub fn get_mut(&mut self, comt: ComtreeId) -> Option<&mut ComtreeEntry> {
        self.entries.get_mut(&comt)
    }

    pub fn link_info_mut(&mut self, comt: ComtreeId, lnk: LinkId) -> Option<&mut ComtreeLinkInfo> {
        self.entries.get_mut(&comt)?.link_info.get_mut(&lnk)
    }

    pub fn add(&mut self, comt: ComtreeId, parent_link: LinkId, core_flag: bool) -> Result<()> {
        if self.entries.contains_key(&comt) {
            return Err(ForestError::TableConflict(format!("comtree {comt} already exists")));
        }
        self.entries.insert(comt, ComtreeEntry::new(parent_link, core_flag));
        Ok(())
    }

    pub fn drop(&mut self, comt: ComtreeId) -> Result<()> {
        if self.entries.remove(&comt).is_none() {
            return Err(ForestError::TableConflict(format!("comtree {comt} does not exist")));
        }
        Ok(())
    }

    fn entry_mut(&mut self, comt: ComtreeId) -> Result<&mut ComtreeEntry> {
        self.entries
            .get_mut(&comt)
            .ok_or_else(|| ForestError::TableConflict(format!("comtree {comt} does not exist")))
    }

    /// Add `lnk` as a router link (and, when `is_core`, also a core link).
    /// Fails rather than leave the invariant violated.
    pub fn add_router_link(&mut self, comt: ComtreeId, lnk: LinkId, is_core: bool, info: ComtreeLinkInfo) -> Result<()> {
        let entry = self.entry_mut(comt)?;
        if entry.member_links.contains(&lnk) {
            return Err(ForestError::TableConflict(format!(
                "link {lnk} is already a member link in comtree {comt}"
            )));
        }
        if is_core && !entry.core_flag {
            let other_core = entry.core_links.iter().find(|&&c| c != lnk).copied();
            if other_core.is_some() || (entry.parent_link != 0 && entry.parent_link != lnk) {
                return Err(ForestError::TableConflict(format!(
                    "comtree {comt} is not core: at most one core link is allowed, and it must be the parent"
                )));
            }
        }
        entry.router_links.insert(lnk);
        if is_core {
            entry.core_links.insert(lnk);
        }
        entry.link_info.insert(lnk, info);
        Ok(())
    }

    /// Add `lnk` as a member (leaf) link. Fails if `lnk` is already a
    /// router link in this comtree.
    pub fn add_member_link(&mut self, comt: ComtreeId, lnk: LinkId, info: ComtreeLinkInfo) -> Result<()> {
        let entry = self.entry_mut(comt)?;
        if entry.router_links.contains(&lnk) {
            return Err(ForestError::TableConflict(format!(
                "link {lnk} is already a router link in comtree {comt}"
            )));
        }
        entry.member_links.insert(lnk);
        entry.link_info.insert(lnk, info);
        Ok(())
    }

    pub fn remove_link(&mut self, comt: ComtreeId, lnk: LinkId) -> Result<()> {
        let entry = self.entry_mut(comt)?;
        entry.core_links.remove(&lnk);
        entry.router_links.remove(&lnk);
        entry.member_links.remove(&lnk);
        entry.link_info.remove(&lnk);
        Ok(())
    }

    pub fn in_comtree(&self, comt: ComtreeId, lnk: LinkId) -> bool {
        self.entries
            .get(&comt)
            .map(|e| e.router_links.contains(&lnk) || e.member_links.contains(&lnk))
            .unwrap_or(false)
    }

    pub fn is_core_link(&self, comt: ComtreeId, lnk: LinkId) -> bool {
        self.entries.get(&comt).map(|e| e.core_links.contains(&lnk)).unwrap_or(false)
    }

    /// Every link participating in `comt`, member or router.
    pub fn links(&self, comt: ComtreeId) -> Vec<LinkId> {
        match self.entries.get(&comt) {
            Some(e) => e.router_links.iter().chain(e.member_links.iter()).copied().collect(),
            None => Vec::new(),
        }
    }

    pub fn link_info(&self, comt: ComtreeId, lnk: LinkId) -> Option<&ComtreeLinkInfo> {
        self.entries.get(&comt).and_then(|e| e.link_info.get(&lnk))
    }

    pub fn first(&self) -> Option<ComtreeId> {
        self.entries.keys().min().copied()
    }

    pub fn next(&self, comt: ComtreeId) -> Option<ComtreeId> {
        self.entries.keys().filter(|&&c| c > comt).min().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ComtreeId, &ComtreeEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_link_is_also_router_link() {
        let mut t = ComtreeTable::new();
        t.add(1001, 1, true).unwrap();
        t.add_router_link(1001, 5, true, ComtreeLinkInfo::default()).unwrap();
        assert!(t.is_core_link(1001, 5));
        assert!(t.in_comtree(1001, 5));
        assert!(t.get(1001).unwrap().check_invariant());
    }

    #[test]
    fn member_and_router_are_disjoint() {
        let mut t = ComtreeTable::new();
        t.add(1001, 1, false).unwrap();
        t.add_router_link(1001, 5, false, ComtreeLinkInfo::default()).unwrap();
        let err = t.add_member_link(1001, 5, ComtreeLinkInfo::default());
        assert!(err.is_err());
        assert!(t.get(1001).unwrap().check_invariant());
    }

    #[test]
    fn remove_link_clears_all_subsets() {
        let mut t = ComtreeTable::new();
        t.add(1001, 1, true).unwrap();
        t.add_router_link(1001, 5, true, ComtreeLinkInfo::default()).unwrap();
        t.remove_link(1001, 5).unwrap();
        assert!(!t.in_comtree(1001, 5));
        assert!(!t.is_core_link(1001, 5));
    }
}
