//! Sliding Window Arithmetic
//!
//! Approximates a continuously sliding window with two fixed windows:
//!
//! ```text
//!   previous window        current window
//! |-------------------|------------x------|
//!                     ^  elapsed   ^ now
//!
//! effective = current + previous × (period − elapsed) / period
//! ```
//!
//! Only two counters per identity are stored; no per-request timestamps.
//! The weighted previous count is rounded up so the approximation never
//! admits more than an exact sliding window would.

use std::time::Duration;

/// Position of a store timestamp within the fixed windows of a period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPosition {
    /// Index of the current window since the epoch
    pub index: u64,
    /// Milliseconds elapsed since the current window started
    pub elapsed_ms: u64,
    /// Window length in milliseconds
    pub period_ms: u64,
}

impl WindowPosition {
    /// Locate `now_ms` (store clock) within windows of `period`
    pub fn at(now_ms: u64, period: Duration) -> Self {
        let period_ms = (period.as_millis() as u64).max(1);
        Self {
            index: now_ms / period_ms,
            elapsed_ms: now_ms % period_ms,
            period_ms,
        }
    }

    /// Index of the previous window, if any
    pub fn previous_index(&self) -> Option<u64> {
        self.index.checked_sub(1)
    }

    /// Share of the previous window still covered by the sliding window (0, 1]
    pub fn overlap_fraction(&self) -> f64 {
        (self.period_ms - self.elapsed_ms) as f64 / self.period_ms as f64
    }

    /// Time until the current window closes
    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.period_ms - self.elapsed_ms)
    }

    /// Previous window's count scaled by the overlap, rounded up
    pub fn weighted_previous(&self, previous: u64) -> u64 {
        let covered = (self.period_ms - self.elapsed_ms) as u128;
        let scaled = previous as u128 * covered;
        scaled.div_ceil(self.period_ms as u128) as u64
    }

    /// `current + previous × overlap`, unrounded, for reporting
    pub fn effective_count(&self, current: u64, previous: u64) -> f64 {
        current as f64 + previous as f64 * self.overlap_fraction()
    }

    /// Highest value the current counter may reach while staying within `limit`
    pub fn ceiling(&self, limit: u64, previous: u64) -> u64 {
        limit.saturating_sub(self.weighted_previous(previous))
    }

    /// Shortest wait after which a request of `cost` fits under `limit`.
    ///
    /// Considers the rest of the current window first (the previous window
    /// keeps decaying), then the next window where `current` becomes the
    /// decaying count. Always at least one millisecond.
    pub fn retry_after(&self, limit: u64, current: u64, previous: u64, cost: u64) -> Duration {
        let period = self.period_ms as u128;
        let floor = Duration::from_millis(1);

        if cost > limit {
            return self.reset_after() + Duration::from_millis(self.period_ms);
        }

        // Still within the current window?
        if let Some(room) = limit.checked_sub(current + cost) {
            if previous == 0 {
                return floor;
            }
            // ceil(previous × (P − e) / P) ≤ room  ⇔  e ≥ P − ⌊room × P / previous⌋
            let allowance = (room as u128 * period) / previous as u128;
            let needed = period.saturating_sub(allowance) as u64;
            if needed < self.period_ms {
                return Duration::from_millis(needed.saturating_sub(self.elapsed_ms)).max(floor);
            }
        }

        // Next window: today's `current` becomes the decaying count
        let room = limit - cost;
        let needed = if current == 0 {
            0
        } else {
            let allowance = (room as u128 * period) / current as u128;
            period.saturating_sub(allowance) as u64
        };
        (self.reset_after() + Duration::from_millis(needed)).max(floor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_position_at_window_start() {
        let pos = WindowPosition::at(120_000, MINUTE);
        assert_eq!(pos.index, 2);
        assert_eq!(pos.elapsed_ms, 0);
        assert_eq!(pos.previous_index(), Some(1));
        assert_eq!(pos.overlap_fraction(), 1.0);
        assert_eq!(pos.reset_after(), MINUTE);
    }

    #[test]
    fn test_first_window_has_no_previous() {
        let pos = WindowPosition::at(500, MINUTE);
        assert_eq!(pos.index, 0);
        assert_eq!(pos.previous_index(), None);
    }

    #[test]
    fn test_weighted_previous_rounds_up() {
        // 15s into the window: 75% of the previous window still counts
        let pos = WindowPosition::at(60_000 + 15_000, MINUTE);
        assert_eq!(pos.weighted_previous(4), 3);
        assert_eq!(pos.weighted_previous(5), 4); // 3.75 -> 4
        assert_eq!(pos.weighted_previous(0), 0);
        assert!((pos.effective_count(1, 4) - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ceiling_saturates() {
        let pos = WindowPosition::at(60_000, MINUTE);
        assert_eq!(pos.ceiling(5, 2), 3);
        assert_eq!(pos.ceiling(5, 9), 0);
    }

    #[test]
    fn test_retry_after_full_first_window() {
        // limit=5 used up at the start of a fresh window with no history
        let pos = WindowPosition::at(0, MINUTE);
        let wait = pos.retry_after(5, 5, 0, 1);
        // Rest of this window (60s) plus 12s until 5 × (60−e)/60 ≤ 4
        assert_eq!(wait, Duration::from_secs(72));
    }

    #[test]
    fn test_retry_after_waits_for_previous_to_decay() {
        // 30s in, previous window had 10, current has 0, limit 5
        let pos = WindowPosition::at(60_000 + 30_000, MINUTE);
        assert_eq!(pos.weighted_previous(10), 5);
        let wait = pos.retry_after(5, 0, 10, 1);
        // Need ceil(10 × (60−e)/60) ≤ 4  ⇔  e ≥ 36s
        assert_eq!(wait, Duration::from_secs(6));

        // After waiting that long the request fits
        let later = WindowPosition::at(60_000 + 36_000, MINUTE);
        assert!(later.ceiling(5, 10) >= 1);
    }

    #[test]
    fn test_retry_after_never_zero() {
        let pos = WindowPosition::at(10, MINUTE);
        assert!(pos.retry_after(5, 0, 0, 1) >= Duration::from_millis(1));
    }

    #[test]
    fn test_retry_after_cost_above_limit() {
        let pos = WindowPosition::at(0, MINUTE);
        assert_eq!(pos.retry_after(5, 0, 0, 6), Duration::from_secs(120));
    }
}
