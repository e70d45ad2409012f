//! Bounded per-endpoint request history driving the blacklist decision.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Capacity of the circular buffer.
pub const HISTORY_CAPACITY: usize = 100;
/// Observation window for the blacklist decision.
pub const HISTORY_WINDOW: Duration = Duration::from_secs(140);
/// Consecutive in-window failures required to mark an endpoint inactive.
pub const FAILURE_THRESHOLD: usize = 3;

#[derive(Debug, Clone)]
struct HistoryEntry {
    at: Instant,
    success: bool,
    request_id: String,
}

/// Circular buffer of recent request outcomes. Adds evict the oldest
/// entry once at capacity.
#[derive(Debug)]
pub struct RequestHistory {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    window: Duration,
}

impl RequestHistory {
    /// A buffer with the default capacity and window.
    pub fn new() -> Self {
        Self::with_limits(HISTORY_CAPACITY, HISTORY_WINDOW)
    }

    /// A buffer with explicit limits, for tests.
    pub fn with_limits(capacity: usize, window: Duration) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            window,
        }
    }

    /// Record one outcome.
    pub fn record(&mut self, now: Instant, success: bool, request_id: &str) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(HistoryEntry {
            at: now,
            success,
            request_id: request_id.to_string(),
        });
    }

    /// True when the newest entries form a run of at least
    /// [`FAILURE_THRESHOLD`] failures inside the window with no
    /// intervening success.
    pub fn should_mark_inactive(&self, now: Instant) -> bool {
        let mut run = 0;
        for entry in self.entries.iter().rev() {
            if entry.success {
                return false;
            }
            if now.duration_since(entry.at) > self.window {
                break;
            }
            run += 1;
            if run >= FAILURE_THRESHOLD {
                return true;
            }
        }
        false
    }

    /// Request ids of all in-window failures, oldest first.
    pub fn recent_failure_request_ids(&self, now: Instant) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| !entry.success && now.duration_since(entry.at) <= self.window)
            .map(|entry| entry.request_id.clone())
            .collect()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for RequestHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_consecutive_failures_trip_the_threshold() {
        let mut history = RequestHistory::new();
        let now = Instant::now();
        for i in 0..3 {
            history.record(now, false, &format!("req-{i}"));
        }
        assert!(history.should_mark_inactive(now));
    }

    #[test]
    fn two_failures_do_not_trip() {
        let mut history = RequestHistory::new();
        let now = Instant::now();
        history.record(now, false, "a");
        history.record(now, false, "b");
        assert!(!history.should_mark_inactive(now));
    }

    #[test]
    fn intervening_success_resets_the_run() {
        let mut history = RequestHistory::new();
        let now = Instant::now();
        history.record(now, false, "a");
        history.record(now, false, "b");
        history.record(now, true, "ok");
        history.record(now, false, "c");
        assert!(!history.should_mark_inactive(now));
    }

    #[test]
    fn failures_outside_the_window_do_not_count() {
        let mut history = RequestHistory::with_limits(100, Duration::from_secs(140));
        let start = Instant::now();
        history.record(start, false, "old-1");
        history.record(start, false, "old-2");
        history.record(start, false, "old-3");

        let later = start + Duration::from_secs(200);
        assert!(!history.should_mark_inactive(later));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut history = RequestHistory::with_limits(3, Duration::from_secs(140));
        let now = Instant::now();
        for i in 0..5 {
            history.record(now, true, &format!("req-{i}"));
        }
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn failure_ids_are_reported_in_order() {
        let mut history = RequestHistory::new();
        let now = Instant::now();
        history.record(now, false, "a");
        history.record(now, true, "ok");
        history.record(now, false, "b");
        assert_eq!(history.recent_failure_request_ids(now), vec!["a", "b"]);
    }
}
