//! Aggregate attendance statistics.

use serde::{Deserialize, Serialize};

use crate::scan::CheckpointType;

/// Count and share of capacity for one checkpoint type.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointCount {
    pub count: u64,
    pub percentage: u32,
}

/// Per-event attendance statistics.
///
/// `total` is the event capacity; percentages are relative to it.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStats {
    pub total: u32,
    pub entry: CheckpointCount,
    pub refreshment: CheckpointCount,
    pub swag: CheckpointCount,
}

impl CheckpointStats {
    /// Build statistics from raw per-type counts.
    pub fn from_counts(capacity: u32, counts: impl IntoIterator<Item = (CheckpointType, u64)>) -> Self {
        let mut stats = CheckpointStats {
            total: capacity,
            ..Default::default()
        };
        for (kind, count) in counts {
            let slot = stats.slot_mut(kind);
            slot.count += count;
        }
        for kind in CheckpointType::ALL {
            let slot = stats.slot_mut(kind);
            slot.percentage = percentage(slot.count, capacity);
        }
        stats
    }

    fn slot_mut(&mut self, kind: CheckpointType) -> &mut CheckpointCount {
        match kind {
            CheckpointType::Entry => &mut self.entry,
            CheckpointType::Refreshment => &mut self.refreshment,
            CheckpointType::Swag => &mut self.swag,
        }
    }
}

/// `round(count / capacity * 100)` with halves rounded up; 0 when capacity is 0.
///
/// Integer arithmetic, so there is no float drift at the .5 boundary. Counts
/// above capacity (walk-ins) yield percentages above 100.
pub fn percentage(count: u64, capacity: u32) -> u32 {
    if capacity == 0 {
        return 0;
    }
    let capacity = u128::from(capacity);
    let scaled = u128::from(count) * 100 + capacity / 2;
    u32::try_from(scaled / capacity).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn forty_of_a_hundred_is_forty_percent() {
        let stats = CheckpointStats::from_counts(100, [(CheckpointType::Entry, 40)]);
        assert_eq!(stats.entry, CheckpointCount { count: 40, percentage: 40 });
        assert_eq!(stats.swag, CheckpointCount::default());
        assert_eq!(stats.total, 100);
    }

    #[test]
    fn zero_capacity_never_divides() {
        assert_eq!(percentage(12, 0), 0);
        let stats = CheckpointStats::from_counts(0, [(CheckpointType::Swag, 3)]);
        assert_eq!(stats.swag.count, 3);
        assert_eq!(stats.swag.percentage, 0);
    }

    #[test]
    fn halves_round_up() {
        assert_eq!(percentage(1, 8), 13); // 12.5
        assert_eq!(percentage(1, 3), 33);
        assert_eq!(percentage(2, 3), 67);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 512,
            ..ProptestConfig::default()
        })]

        /// Property: matches `round(count / capacity * 100)` away from exact halves.
        #[test]
        fn percentage_matches_rounded_ratio(count in 0u64..1_000_000, capacity in 1u32..1_000_000) {
            let rem = (u128::from(count) * 100) % u128::from(capacity);
            prop_assume!(rem * 2 != u128::from(capacity));
            let expected = ((count as f64 / capacity as f64) * 100.0).round() as u32;
            prop_assert_eq!(percentage(count, capacity), expected);
        }

        #[test]
        fn percentage_is_positive_from_half_a_percent(count in 0u64..10_000, capacity in 0u32..10_000) {
            let p = percentage(count, capacity);
            if capacity == 0 {
                prop_assert_eq!(p, 0);
            } else if count * 200 >= capacity as u64 {
                prop_assert!(p >= 1);
            } else {
                prop_assert_eq!(p, 0);
            }
        }
    }
}
