//! Load metrics of a strategy manager.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;

use super::RetrievalSource;

/// Number of load-time samples kept
pub const SAMPLE_WINDOW: usize = 100;

/// Hit, miss and error counters plus a rolling window of load times
#[derive(Debug, Clone, Default)]
pub struct StrategyMetrics {
    hits: u64,
    misses: u64,
    errors: u64,
    load_times: VecDeque<Duration>,
    avg_load_time: Duration,
}

impl StrategyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, elapsed: Duration, source: RetrievalSource) {
        if self.load_times.len() == SAMPLE_WINDOW {
            self.load_times.pop_front();
        }
        self.load_times.push_back(elapsed);
        let total: Duration = self.load_times.iter().sum();
        self.avg_load_time = total / self.load_times.len() as u32;

        match source {
            RetrievalSource::Cache => self.hits += 1,
            RetrievalSource::Network => self.misses += 1,
        }
    }

    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            hits: self.hits,
            misses: self.misses,
            errors: self.errors,
            avg_load_time_ms: self.avg_load_time.as_micros() as f64 / 1000.0,
            samples: self.load_times.len(),
            hit_rate: percentage(self.hits, self.hits + self.misses),
            error_rate: percentage(self.errors, self.hits + self.misses + self.errors),
        }
    }
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

/// Read-only view of [`StrategyMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub avg_load_time_ms: f64,
    /// Load-time samples currently in the window
    pub samples: usize,
    /// Hits over hits and misses, in percent
    pub hit_rate: f64,
    /// Errors over all loads, in percent
    pub error_rate: f64,
}

impl MetricsSnapshot {
    /// Every recorded load, failed ones included
    pub fn total_loads(&self) -> u64 {
        self.hits + self.misses + self.errors
    }

    /// Hits over every recorded load, in percent
    pub fn served_from_cache_rate(&self) -> f64 {
        percentage(self.hits, self.total_loads())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rates_are_zero() {
        let snapshot = StrategyMetrics::new().snapshot();
        assert_eq!(snapshot.hit_rate, 0.0);
        assert_eq!(snapshot.error_rate, 0.0);
        assert_eq!(snapshot.served_from_cache_rate(), 0.0);
        assert_eq!(snapshot.avg_load_time_ms, 0.0);
    }

    #[test]
    fn test_rates() {
        let mut metrics = StrategyMetrics::new();
        for _ in 0..3 {
            metrics.record_success(Duration::from_millis(10), RetrievalSource::Cache);
        }
        metrics.record_success(Duration::from_millis(50), RetrievalSource::Network);
        metrics.record_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.hit_rate, 75.0);
        assert_eq!(snapshot.error_rate, 20.0);
        assert_eq!(snapshot.served_from_cache_rate(), 60.0);
        assert_eq!(snapshot.avg_load_time_ms, 20.0);
        assert_eq!(snapshot.samples, 4);
    }

    #[test]
    fn test_window_keeps_latest_samples() {
        let mut metrics = StrategyMetrics::new();
        for _ in 0..SAMPLE_WINDOW {
            metrics.record_success(Duration::from_millis(100), RetrievalSource::Network);
        }
        for _ in 0..SAMPLE_WINDOW {
            metrics.record_success(Duration::from_millis(2), RetrievalSource::Cache);
        }

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.samples, SAMPLE_WINDOW);
        assert_eq!(snapshot.avg_load_time_ms, 2.0);
        assert_eq!(snapshot.hits + snapshot.misses, 2 * SAMPLE_WINDOW as u64);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut metrics = StrategyMetrics::new();
        metrics.record_success(Duration::from_millis(1), RetrievalSource::Cache);
        metrics.record_error();
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
