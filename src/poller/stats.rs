use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

pub const SAMPLE_WINDOW: usize = 5;
pub const ERROR_LOG_CAPACITY: usize = 10;
/// Failures within the last `CIRCUIT_SPAN` fired cycles that open the circuit.
pub const CIRCUIT_THRESHOLD: usize = 3;
pub const CIRCUIT_SPAN: u64 = 3;

const ROUNDING_MS: f64 = 100.0;

/// Observed gaps between polls, averaged every [`SAMPLE_WINDOW`] samples.
#[derive(Debug, Clone, Default)]
pub struct SampleWindow {
    samples: Vec<Duration>,
    average: Duration,
}

impl SampleWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the new average once the window fills up; the window is
    /// cleared at that point.
    pub fn push(&mut self, gap: Duration) -> Option<Duration> {
        self.samples.push(gap);
        if self.samples.len() < SAMPLE_WINDOW {
            return None;
        }

        let total_ms: f64 = self.samples.iter().map(|s| s.as_millis() as f64).sum();
        let mean = total_ms / self.samples.len() as f64;
        let rounded = (mean / ROUNDING_MS).round() * ROUNDING_MS;

        self.average = Duration::from_millis(rounded as u64);
        self.samples.clear();
        Some(self.average)
    }

    pub fn average(&self) -> Duration {
        self.average
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.average = Duration::ZERO;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEntry {
    pub time: DateTime<Utc>,
    pub fired: u64,
}

/// Ring buffer of recent failures, keyed by the fired counter at the time
/// of failure.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    entries: VecDeque<ErrorEntry>,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, fired: u64, time: DateTime<Utc>) {
        self.entries.push_back(ErrorEntry { time, fired });
        while self.entries.len() > ERROR_LOG_CAPACITY {
            self.entries.pop_front();
        }
    }

    /// Failures recorded at `fired`, `fired - 1` or `fired - 2`.
    pub fn recent_failures(&self, fired: u64) -> usize {
        self.entries
            .iter()
            .filter(|e| fired.checked_sub(e.fired).is_some_and(|d| d < CIRCUIT_SPAN))
            .count()
    }

    pub fn should_open_circuit(&self, fired: u64) -> bool {
        self.recent_failures(fired) >= CIRCUIT_THRESHOLD
    }

    pub fn last(&self) -> Option<&ErrorEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ErrorEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_average_after_five_samples() {
        let mut window = SampleWindow::new();
        for _ in 0..4 {
            assert_eq!(window.push(ms(1000)), None);
        }
        assert_eq!(window.len(), 4);
        assert_eq!(window.average(), Duration::ZERO);

        assert_eq!(window.push(ms(5000)), Some(ms(1800)));
        assert!(window.is_empty());
        assert_eq!(window.average(), ms(1800));
    }

    #[test]
    fn test_average_rounds_to_nearest_hundred() {
        let mut window = SampleWindow::new();
        for gap in [1040, 1040, 1040, 1040, 1040] {
            window.push(ms(gap));
        }
        assert_eq!(window.average(), ms(1000));

        for gap in [1050, 1050, 1050, 1050, 1050] {
            window.push(ms(gap));
        }
        assert_eq!(window.average(), ms(1100));
    }

    #[test]
    fn test_four_samples_keep_previous_average() {
        let mut window = SampleWindow::new();
        for _ in 0..5 {
            window.push(ms(2000));
        }
        for _ in 0..4 {
            window.push(ms(9000));
        }
        assert_eq!(window.average(), ms(2000));
        assert_eq!(window.len(), 4);
    }

    #[test]
    fn test_reset_clears_average() {
        let mut window = SampleWindow::new();
        for _ in 0..5 {
            window.push(ms(3000));
        }
        window.push(ms(1));
        window.reset();
        assert!(window.is_empty());
        assert_eq!(window.average(), Duration::ZERO);
    }

    #[test]
    fn test_clustered_failures_open_circuit() {
        let mut log = ErrorLog::new();
        for fired in [3, 4, 5] {
            log.record(fired, Utc::now());
        }
        assert_eq!(log.recent_failures(5), 3);
        assert!(log.should_open_circuit(5));
    }

    #[test]
    fn test_spread_failures_keep_circuit_closed() {
        let mut log = ErrorLog::new();
        for fired in [1, 3, 5] {
            log.record(fired, Utc::now());
        }
        assert_eq!(log.recent_failures(5), 2);
        assert!(!log.should_open_circuit(5));
    }

    #[test]
    fn test_error_log_evicts_oldest() {
        let mut log = ErrorLog::new();
        for fired in 1..=12 {
            log.record(fired, Utc::now());
        }
        assert_eq!(log.len(), ERROR_LOG_CAPACITY);
        assert_eq!(log.iter().next().map(|e| e.fired), Some(3));
        assert_eq!(log.last().map(|e| e.fired), Some(12));
    }

    #[test]
    fn test_failures_ahead_of_counter_are_ignored() {
        let mut log = ErrorLog::new();
        log.record(7, Utc::now());
        assert_eq!(log.recent_failures(5), 0);
    }
}
