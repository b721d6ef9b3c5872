//! Traffic counters and the configurable statistics feed (spec §4.6,
//! §6 `GET_STATISTICS`).
//!
//! Mirrors the reference router's `StatsModule`: a small set of counter
//! *kinds* (in/out packets and bytes per link, queue occupancy) and a
//! caller-configured list of which `(link, queue, kind)` triples to
//! report. Unlike the original's periodic file dump, `record()` here
//! just logs a structured line through the `log` facade and `snapshot()`
//! hands back values for the control plane to encode.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::queue::QueueManager;
use crate::tables::link::LinkId;

pub type QueueId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterKind {
    InPkt,
    OutPkt,
    InByte,
    OutByte,
    QPkt,
    QByte,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatItem {
    pub lnk: LinkId,
    pub queue: QueueId,
    pub kind: CounterKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatValue {
    pub item: StatItem,
    pub value: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub values: Vec<StatValue>,
}

#[derive(Debug, Default, Clone, Copy)]
struct LinkCounters {
    in_pkts: u64,
    out_pkts: u64,
    in_bytes: u64,
    out_bytes: u64,
    discards: u64,
}

#[derive(Default)]
pub struct StatsModule {
    counters: HashMap<LinkId, LinkCounters>,
    watched: Vec<StatItem>,
}

impl StatsModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_in(&mut self, lnk: LinkId, bytes: u64) {
        let c = self.counters.entry(lnk).or_default();
        c.in_pkts += 1;
        c.in_bytes += bytes;
    }

    pub fn record_out(&mut self, lnk: LinkId, bytes: u64) {
        let c = self.counters.entry(lnk).or_default();
        c.out_pkts += 1;
        c.out_bytes += bytes;
    }

    /// A packet destined for `lnk` was dropped before it could be sent —
    /// store exhaustion, a full queue, or a rejected enqueue (spec §4.6).
    pub fn record_discard(&mut self, lnk: LinkId) {
        self.counters.entry(lnk).or_default().discards += 1;
    }

    /// Register `item` for inclusion in future [`snapshot`](Self::snapshot)
    /// calls. Duplicate registration is a no-op.
    pub fn watch(&mut self, item: StatItem) {
        if !self.watched.contains(&item) {
            self.watched.push(item);
        }
    }

    pub fn unwatch(&mut self, item: StatItem) {
        self.watched.retain(|s| s != &item);
    }

    fn value_of(&self, item: &StatItem, qm: &QueueManager) -> u64 {
        match item.kind {
            CounterKind::InPkt => self.counters.get(&item.lnk).map(|c| c.in_pkts).unwrap_or(0),
            CounterKind::OutPkt => self.counters.get(&item.lnk).map(|c| c.out_pkts).unwrap_or(0),
            CounterKind::InByte => self.counters.get(&item.lnk).map(|c| c.in_bytes).unwrap_or(0),
            CounterKind::OutByte => self.counters.get(&item.lnk).map(|c| c.out_bytes).unwrap_or(0),
            CounterKind::QPkt => qm.qlen_pkts(item.lnk) as u64,
            CounterKind::QByte => qm.qlen_bytes(item.lnk),
            CounterKind::Discard => self.counters.get(&item.lnk).map(|c| c.discards).unwrap_or(0),
        }
    }

    /// Evaluate every watched stat against current link/queue state.
    pub fn snapshot(&self, qm: &QueueManager) -> StatsSnapshot {
        let values = self
            .watched
            .iter()
            .map(|item| StatValue { item: *item, value: self.value_of(item, qm) })
            .collect();
        StatsSnapshot { values }
    }

    /// Periodic log line (spec §4.6 `RouterCore` main loop periodic
    /// stats tick). Logged at `info` so it survives in production
    /// deployments without `debug` enabled.
    pub fn record(&self, qm: &QueueManager) {
        for item in &self.watched {
            log::info!(
                "stat lnk={} queue={} kind={:?} value={}",
                item.lnk,
                item.queue,
                item.kind,
                self.value_of(item, qm)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_and_out_counters_are_independent() {
        let mut stats = StatsModule::new();
        stats.record_in(1, 100);
        stats.record_in(1, 50);
        stats.record_out(1, 20);

        let qm = QueueManager::new();
        stats.watch(StatItem { lnk: 1, queue: 0, kind: CounterKind::InPkt });
        stats.watch(StatItem { lnk: 1, queue: 0, kind: CounterKind::InByte });
        stats.watch(StatItem { lnk: 1, queue: 0, kind: CounterKind::OutPkt });

        let snap = stats.snapshot(&qm);
        let by_kind: HashMap<_, _> = snap.values.iter().map(|v| (v.item.kind, v.value)).collect();
        assert_eq!(by_kind[&CounterKind::InPkt], 2);
        assert_eq!(by_kind[&CounterKind::InByte], 150);
        assert_eq!(by_kind[&CounterKind::OutPkt], 1);
    }

    #[test]
    fn discards_accumulate_independently_of_in_out() {
        let mut stats = StatsModule::new();
        stats.record_in(1, 100);
        stats.record_discard(1);
        stats.record_discard(1);

        let qm = QueueManager::new();
        stats.watch(StatItem { lnk: 1, queue: 0, kind: CounterKind::Discard });
        let snap = stats.snapshot(&qm);
        assert_eq!(snap.values[0].value, 2);
    }

    #[test]
    fn watch_is_idempotent_and_unwatch_removes() {
        let mut stats = StatsModule::new();
        let item = StatItem { lnk: 3, queue: 1, kind: CounterKind::QPkt };
        stats.watch(item);
        stats.watch(item);
        assert_eq!(stats.watched.len(), 1);
        stats.unwatch(item);
        assert!(stats.watched.is_empty());
    }
}
