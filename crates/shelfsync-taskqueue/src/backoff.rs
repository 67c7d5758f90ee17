//! Exponential retry backoff.

use std::time::Duration;

/// Delay before the next attempt of a task that has failed `retries` times.
///
/// `2^(retries + 1)` units: 4 after the first failure, 8 after the second.
/// Saturates instead of overflowing for absurd retry counts.
pub fn backoff(retries: u32, unit: Duration) -> Duration {
    let factor = 1u32.checked_shl(retries.saturating_add(1)).unwrap_or(u32::MAX);
    unit.saturating_mul(factor)
}
