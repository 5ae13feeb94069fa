// =============================================================================
// Window Assigner — tumbling windows
// =============================================================================
//
// Maps a trade timestamp to the half-open interval [start, end) of fixed
// length that contains it:
//   start = t - (t mod D)
//   end   = start + D
// Windows of the same length tile the timeline with no gaps or overlaps.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Half-open interval `[start_ms, end_ms)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub start_ms: i64,
    pub end_ms: i64,
}

impl Window {
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        self.start_ms <= timestamp_ms && timestamp_ms < self.end_ms
    }
}

/// Length of a window in milliseconds.
pub fn duration_ms(candle_seconds: u32) -> i64 {
    i64::from(candle_seconds) * 1_000
}

/// Assign `timestamp_ms` to its tumbling window of `candle_seconds`.
///
/// Uses Euclidean remainder so pre-epoch timestamps still land in the window
/// that contains them. A zero duration is rejected by config validation and
/// is treated here as a one-millisecond window. The last window before
/// `i64::MAX` is clamped to end there.
pub fn window_for(timestamp_ms: i64, candle_seconds: u32) -> Window {
    let duration = duration_ms(candle_seconds).max(1);
    let start_ms = timestamp_ms - timestamp_ms.rem_euclid(duration);
    Window {
        start_ms,
        end_ms: start_ms.saturating_add(duration),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_starts_at_multiple_of_duration() {
        let w = window_for(12_345, 10);
        assert_eq!(w, Window { start_ms: 10_000, end_ms: 20_000 });
    }

    #[test]
    fn boundary_timestamp_opens_next_window() {
        assert_eq!(window_for(10_000, 10).start_ms, 10_000);
        assert_eq!(window_for(9_999, 10).start_ms, 0);
    }

    #[test]
    fn windows_tile_without_gaps() {
        let d = 7;
        let mut prev = window_for(0, d);
        for t in (0..200_000).step_by(997) {
            let w = window_for(t, d);
            assert!(w.contains(t));
            assert_eq!(w.end_ms - w.start_ms, 7_000);
            assert_eq!(w.start_ms % 7_000, 0);
            assert!(w.start_ms == prev.start_ms || w.start_ms >= prev.end_ms);
            prev = w;
        }
    }

    #[test]
    fn window_near_i64_max_saturates() {
        let w = window_for(i64::MAX, 60);
        assert_eq!(w.end_ms, i64::MAX);
        assert!(w.start_ms < w.end_ms);
    }

    #[test]
    fn negative_timestamp_uses_floor() {
        let w = window_for(-1, 10);
        assert_eq!(w, Window { start_ms: -10_000, end_ms: 0 });
    }
}
