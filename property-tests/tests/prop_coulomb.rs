//! Property tests for the coulomb counter
//!
//! Tests invariants for:
//! - Capacity bounds: remaining always within [0, max]
//! - Clamp reporting: one event per transition into a clamp
//! - Faulted samples: never move the counter
//! - SOC: monotone, 0 at empty, 255 at full

use proptest::prelude::*;
use qbms::coulomb::{state_of_charge, CapacityEvent, PackCoulombCounter};
use qbms::frames::SensorReading;
use qbms::types::Capacity;

// ============================================================================
// Strategies
// ============================================================================

fn capacity_strategy() -> impl Strategy<Value = (Capacity, Capacity)> {
    (1u32..=2_000_000_000).prop_flat_map(|max| (Just(max), 0..=max))
}

/// (milliamps, elapsed ms) pairs, charge and discharge mixed
fn step_strategy() -> impl Strategy<Value = (i32, u32)> {
    (-400_000i32..400_000, 0u32..5_000)
}

fn faulted_status() -> impl Strategy<Value = u8> {
    1u8..=255u8
}

// ============================================================================
// Capacity Property Tests
// ============================================================================

proptest! {
    /// Remaining capacity never leaves [0, max]
    #[test]
    fn remaining_stays_bounded(
        (max, remaining) in capacity_strategy(),
        steps in prop::collection::vec(step_strategy(), 1..50)
    ) {
        let mut counter = PackCoulombCounter::new(max, remaining);
        for (milliamps, elapsed) in steps {
            counter.integrate(milliamps, elapsed);
            prop_assert!(counter.remaining() <= max);
        }
    }

    /// Zero current or zero time changes nothing
    #[test]
    fn idle_integration_is_identity(
        (max, remaining) in capacity_strategy(),
        milliamps in -400_000i32..400_000,
        elapsed in 0u32..5_000
    ) {
        let mut counter = PackCoulombCounter::new(max, remaining);
        prop_assert_eq!(counter.integrate(0, elapsed), None);
        prop_assert_eq!(counter.integrate(milliamps, 0), None);
        prop_assert_eq!(counter.remaining(), remaining);
    }

    /// Sustained charging reports full exactly once
    #[test]
    fn sustained_charge_reports_full_once(
        (max, remaining) in capacity_strategy(),
        milliamps in 1_000i32..400_000,
        steps in 1usize..100
    ) {
        let mut counter = PackCoulombCounter::new(max, remaining);
        // enough charge to overflow any capacity in the range
        let elapsed = ((max as u64 * 360 / milliamps as u64) + 1).min(u32::MAX as u64) as u32;
        let mut reports = 0;
        for _ in 0..steps {
            if counter.integrate(-milliamps, elapsed) == Some(CapacityEvent::PackFull) {
                reports += 1;
            }
        }
        prop_assert_eq!(reports, 1);
        prop_assert_eq!(counter.remaining(), max);
        prop_assert!(!counter.has_room());
    }

    /// Faulted sensor messages leave capacity and current untouched
    #[test]
    fn faulted_samples_ignored(
        (max, remaining) in capacity_strategy(),
        milliamps in -400_000i32..400_000,
        status in faulted_status(),
        times in prop::collection::vec(0u32..100_000, 1..20)
    ) {
        let mut counter = PackCoulombCounter::new(max, remaining);
        for now in times {
            let event = counter.on_sample(&SensorReading { milliamps, status }, now);
            prop_assert_eq!(event, None);
        }
        prop_assert_eq!(counter.remaining(), remaining);
        prop_assert_eq!(counter.milliamps(), 0);
        prop_assert!(counter.last_fault().is_some());
    }
}

// ============================================================================
// State of Charge Property Tests
// ============================================================================

proptest! {
    /// SOC hits both ends of the scale
    #[test]
    fn soc_endpoints(max in 1u32..=u32::MAX) {
        prop_assert_eq!(state_of_charge(0, max), 0);
        prop_assert_eq!(state_of_charge(max, max), 255);
    }

    /// SOC never decreases as remaining capacity grows
    #[test]
    fn soc_monotone(
        (max, a) in capacity_strategy(),
        b_frac in 0.0f64..=1.0
    ) {
        let b = (max as f64 * b_frac) as Capacity;
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        prop_assert!(state_of_charge(low, max) <= state_of_charge(high, max));
    }

    /// Remaining above max reads as full, not as a wrapped value
    #[test]
    fn soc_saturates(max in 1u32..1_000_000, excess in 1u32..1_000_000) {
        prop_assert_eq!(state_of_charge(max + excess, max), 255);
    }
}
