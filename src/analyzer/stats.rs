//! Rolling statistics for anomaly detection

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Floor on the standard deviation so scores stay finite
const MIN_STD_DEV: f64 = 1e-6;

/// Fixed-size window of recent numeric samples
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollingStats {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl RollingStats {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(2),
            samples: VecDeque::with_capacity(capacity.max(2)),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// Population variance
    pub fn variance(&self) -> Option<f64> {
        let mean = self.mean()?;
        Some(self.samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / self.samples.len() as f64)
    }

    pub fn std_dev(&self) -> Option<f64> {
        self.variance().map(f64::sqrt)
    }

    /// Z-score of `value` against the current window, if the window holds at
    /// least `min_samples` and has any spread
    pub fn z_score(&self, value: f64, min_samples: usize) -> Option<f64> {
        if self.samples.len() < min_samples.max(2) {
            return None;
        }
        let mean = self.mean()?;
        // A flat window still scores departures, just very highly
        let std_dev = self.std_dev()?.max(MIN_STD_DEV);
        Some((value - mean) / std_dev)
    }

    /// Score `value` against the window before it, then add it.
    pub fn push(&mut self, value: f64, min_samples: usize) -> Option<f64> {
        let z = self.z_score(value, min_samples);
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
        z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_and_variance() {
        let mut stats = RollingStats::new(10);
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stats.push(v, 5);
        }
        assert_eq!(stats.mean(), Some(5.0));
        assert_eq!(stats.std_dev(), Some(2.0));
    }

    #[test]
    fn test_window_is_bounded() {
        let mut stats = RollingStats::new(3);
        for v in 0..10 {
            stats.push(v as f64, 5);
        }
        assert_eq!(stats.len(), 3);
        assert_eq!(stats.mean(), Some(8.0));
    }

    #[test]
    fn test_spike_scored_against_prior_window() {
        let mut stats = RollingStats::new(20);
        for v in [70.0, 71.0, 70.0, 69.0, 70.0, 71.0] {
            assert!(stats.push(v, 5).map_or(true, |z| z.abs() < 2.5));
        }
        let z = stats.push(95.0, 5).unwrap();
        assert!(z > 2.5);
    }

    #[test]
    fn test_flat_window_scores_finite() {
        let mut stats = RollingStats::new(20);
        for _ in 0..5 {
            stats.push(1.0, 5);
        }
        assert_eq!(stats.z_score(1.0, 5), Some(0.0));
        let z = stats.z_score(2.0, 5).unwrap();
        assert!(z.is_finite() && z > 1000.0);
    }

    #[test]
    fn test_no_score_before_min_samples() {
        let mut stats = RollingStats::new(20);
        for v in [1.0, 2.0, 3.0] {
            assert!(stats.push(v, 5).is_none());
        }
    }
}
