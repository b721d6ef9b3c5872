//! Four-tuple rate budgets shared by interfaces, links, and comtree-links
//! (spec §3 GLOSSARY, §4.6 `setAvailRates`).

use serde::{Deserialize, Serialize};

/// Up/down bit-rate (bits/sec) and packet-rate (packets/sec) limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateSpec {
    pub bit_rate_up: u32,
    pub bit_rate_down: u32,
    pub pkt_rate_up: u32,
    pub pkt_rate_down: u32,
}

impl RateSpec {
    pub const ZERO: RateSpec =
        RateSpec { bit_rate_up: 0, bit_rate_down: 0, pkt_rate_up: 0, pkt_rate_down: 0 };

    pub fn new(bit_rate_up: u32, bit_rate_down: u32, pkt_rate_up: u32, pkt_rate_down: u32) -> Self {
        Self { bit_rate_up, bit_rate_down, pkt_rate_up, pkt_rate_down }
    }

    /// Component-wise subtraction, saturating at zero. Used when carving a
    /// committed rate out of a parent's available rate.
    pub fn saturating_sub(self, other: RateSpec) -> RateSpec {
        RateSpec {
            bit_rate_up: self.bit_rate_up.saturating_sub(other.bit_rate_up),
            bit_rate_down: self.bit_rate_down.saturating_sub(other.bit_rate_down),
            pkt_rate_up: self.pkt_rate_up.saturating_sub(other.pkt_rate_up),
            pkt_rate_down: self.pkt_rate_down.saturating_sub(other.pkt_rate_down),
        }
    }

    /// True iff `self` has at least as much capacity as `other` in every
    /// component — i.e. `other` can be carved out of `self` without
    /// oversubscribing it.
    pub fn covers(self, other: RateSpec) -> bool {
        self.bit_rate_up >= other.bit_rate_up
            && self.bit_rate_down >= other.bit_rate_down
            && self.pkt_rate_up >= other.pkt_rate_up
            && self.pkt_rate_down >= other.pkt_rate_down
    }

    /// Scale every component by `percent / 100`.
    pub fn scaled_percent(self, percent: u32) -> RateSpec {
        RateSpec {
            bit_rate_up: (self.bit_rate_up as u64 * percent as u64 / 100) as u32,
            bit_rate_down: (self.bit_rate_down as u64 * percent as u64 / 100) as u32,
            pkt_rate_up: (self.pkt_rate_up as u64 * percent as u64 / 100) as u32,
            pkt_rate_down: (self.pkt_rate_down as u64 * percent as u64 / 100) as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn covers_is_componentwise() {
        let big = RateSpec::new(100, 100, 100, 100);
        let small = RateSpec::new(50, 50, 50, 50);
        assert!(big.covers(small));
        assert!(!small.covers(big));
    }

    #[test]
    fn scaled_percent_rounds_down() {
        let r = RateSpec::new(1000, 1000, 1000, 1000);
        assert_eq!(r.scaled_percent(90).bit_rate_up, 900);
    }
}
