//! Training metrics and tracking

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Metrics recorded over one epoch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    scalars: BTreeMap<String, f32>,
    counters: BTreeMap<String, u64>,
    #[serde(skip)]
    timings: BTreeMap<String, Duration>,
}

impl TrainingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_scalar(&mut self, name: &str, value: f32) {
        self.scalars.insert(name.to_string(), value);
    }

    pub fn record_timing(&mut self, name: &str, duration: Duration) {
        self.timings.insert(name.to_string(), duration);
    }

    pub fn increment_counter(&mut self, name: &str) {
        self.add_to_counter(name, 1);
    }

    pub fn add_to_counter(&mut self, name: &str, amount: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += amount;
    }

    pub fn get_scalar(&self, name: &str) -> Option<f32> {
        self.scalars.get(name).copied()
    }

    pub fn get_timing(&self, name: &str) -> Option<Duration> {
        self.timings.get(name).copied()
    }

    pub fn get_counter(&self, name: &str) -> Option<u64> {
        self.counters.get(name).copied()
    }

    pub fn all_scalars(&self) -> &BTreeMap<String, f32> {
        &self.scalars
    }
}

/// Running mean of a scalar
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    total: f64,
    count: usize,
}

impl RunningMean {
    pub fn add(&mut self, value: f32, weight: usize) {
        self.total += value as f64 * weight as f64;
        self.count += weight;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn mean(&self) -> Option<f32> {
        (self.count > 0).then(|| (self.total / self.count as f64) as f32)
    }
}

/// Metric tracker for training: one [`TrainingMetrics`] per finished epoch
#[derive(Debug, Clone)]
pub struct MetricTracker {
    current_metrics: TrainingMetrics,
    history: Vec<TrainingMetrics>,
    start_time: Instant,
}

impl Default for MetricTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricTracker {
    pub fn new() -> Self {
        Self {
            current_metrics: TrainingMetrics::new(),
            history: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn record_scalar(&mut self, name: &str, value: f32) {
        self.current_metrics.record_scalar(name, value);
    }

    pub fn record_timing(&mut self, name: &str, duration: Duration) {
        self.current_metrics.record_timing(name, duration);
    }

    pub fn increment_counter(&mut self, name: &str) {
        self.current_metrics.increment_counter(name);
    }

    /// Close the current epoch and start a fresh one
    pub fn step(&mut self) -> TrainingMetrics {
        let finished = std::mem::take(&mut self.current_metrics);
        self.history.push(finished.clone());
        finished
    }

    pub fn current(&self) -> &TrainingMetrics {
        &self.current_metrics
    }

    pub fn history(&self) -> &[TrainingMetrics] {
        &self.history
    }

    /// One value per finished epoch that recorded `name`
    pub fn scalar_history(&self, name: &str) -> Vec<f32> {
        self.history.iter().filter_map(|m| m.get_scalar(name)).collect()
    }

    pub fn total_time(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_running_mean() {
        let mut mean = RunningMean::default();
        assert_eq!(mean.mean(), None);
        mean.add(1.0, 1);
        mean.add(4.0, 2);
        assert_eq!(mean.count(), 3);
        assert!((mean.mean().unwrap() - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_tracker_history() {
        let mut tracker = MetricTracker::new();
        tracker.record_scalar("loss", 0.8);
        tracker.increment_counter("steps");
        tracker.increment_counter("steps");
        let first = tracker.step();
        assert_eq!(first.get_counter("steps"), Some(2));

        tracker.record_scalar("loss", 0.5);
        tracker.step();
        tracker.step();

        assert_eq!(tracker.history().len(), 3);
        assert_eq!(tracker.scalar_history("loss"), vec![0.8, 0.5]);
        assert!(tracker.current().all_scalars().is_empty());
    }
}
