//! Causal clock for outgoing messages.
//!
//! Every outgoing message carries a logical clock computed from the last
//! clock observed in its conversation and the local wall clock. The result
//! always exceeds the last observed value, and jumps ahead of the wall
//! clock by a fixed tolerance so that it outranks clocks reported by peers
//! whose devices drift by up to that amount.

/// Tolerated clock skew between devices (5 minutes, in milliseconds).
pub const SKEW_TOLERANCE_MS: i64 = 5 * 60 * 1000;

/// Computes the logical clock for the next outgoing message.
///
/// If `last_observed < wall_clock_ms` the result is
/// `wall_clock_ms + SKEW_TOLERANCE_MS`, otherwise `last_observed + 1`.
/// The result is strictly greater than `last_observed` for every
/// `last_observed < i64::MAX`; at `i64::MAX` it saturates.
///
/// ```
/// use termsync_proto::clock::next_clock;
///
/// assert_eq!(next_clock(10, 20), 300_020);
/// assert_eq!(next_clock(300_050, 20), 300_051);
/// ```
#[must_use]
pub const fn next_clock(last_observed: i64, wall_clock_ms: i64) -> i64 {
    if last_observed < wall_clock_ms {
        wall_clock_ms.saturating_add(SKEW_TOLERANCE_MS)
    } else {
        last_observed.saturating_add(1)
    }
}

/// Current wall clock in milliseconds since the UNIX epoch.
#[must_use]
pub fn now_millis() -> i64 {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    i64::try_from(millis).unwrap_or(i64::MAX)
}

/// Current wall clock in whole seconds since the UNIX epoch.
#[must_use]
pub fn now_secs() -> i64 {
    now_millis() / 1000
}
