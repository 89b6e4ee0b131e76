//! Exponential backoff, base 2, clipped to a configured maximum (§9:
//! "Backoff saturation").

use crate::config::Config;
use chrono::Duration;

/// `backoff(n) = base * 2^n` seconds, clipped to `backoff_max_seconds`.
///
/// `n` is the number of attempts already consumed before this failure
/// (the "pre-increment" attempts count in §4.4's step 5), so the first
/// retry uses `n=0` (`base` seconds), the second `n=1` (`2*base`), etc.
pub fn backoff(n: u32, config: &Config) -> Duration {
    let base = config.backoff_base_seconds;
    let max = config.backoff_max_seconds;
    let seconds = if n >= 63 {
        max
    } else {
        base.saturating_mul(1u64 << n).min(max)
    };
    Duration::seconds(seconds as i64)
}
