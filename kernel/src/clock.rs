// Monotonic UTC timestamps for the repository watermark and increment names.

use chrono::{DateTime, TimeDelta, Utc};

/// Watermark of a repository that has never been modified.
pub const MINIMUM_TIME: DateTime<Utc> = DateTime::<Utc>::MIN_UTC;

/// Smallest step the clock can take.
pub fn tick() -> TimeDelta {
    TimeDelta::nanoseconds(1)
}

/// Current time, or one tick past `previous` if the wall clock has not
/// moved beyond it (coarse clock, or a clock set backwards).
pub fn next_after(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        return now;
    }
    previous.checked_add_signed(tick()).unwrap_or(previous)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing_under_rapid_calls() {
        let mut last = MINIMUM_TIME;
        for _ in 0..10_000 {
            let next = next_after(last);
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn steps_past_a_future_watermark() {
        let future = Utc::now() + TimeDelta::hours(1);
        assert_eq!(next_after(future), future + tick());
    }
}
