//! Property tests for the causal clock.
//!
//! 1. The next clock is always strictly greater than the last observed one.
//! 2. The next clock never lags behind the wall clock.
//! 3. Repeated sends against a frozen wall clock produce a strictly
//!    increasing sequence.

use proptest::prelude::*;
use termsync_proto::clock::{SKEW_TOLERANCE_MS, next_clock};

proptest! {
    #[test]
    fn next_clock_exceeds_last_observed(
        last in (i64::MIN..i64::MAX - SKEW_TOLERANCE_MS),
        wall in (i64::MIN..i64::MAX - SKEW_TOLERANCE_MS),
    ) {
        prop_assert!(next_clock(last, wall) > last);
    }

    #[test]
    fn next_clock_is_never_behind_wall_clock(
        last in any::<i32>().prop_map(i64::from),
        wall in any::<i32>().prop_map(i64::from),
    ) {
        prop_assert!(next_clock(last, wall) >= wall);
    }

    #[test]
    fn chained_clocks_strictly_increase(
        start in any::<i32>().prop_map(i64::from),
        wall in any::<i32>().prop_map(i64::from),
        steps in 1usize..64,
    ) {
        let mut clock = start;
        for _ in 0..steps {
            let next = next_clock(clock, wall);
            prop_assert!(next > clock);
            clock = next;
        }
    }
}
