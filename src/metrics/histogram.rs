//! Reservoir-sampled histogram metric.

use rand::Rng;
use serde_json::{json, Value};

/// Fixed-capacity uniform-reservoir histogram.
///
/// Uses Algorithm R: the first `capacity` observations are kept outright; after that, the `n`th
/// observation replaces a uniformly-random existing sample with probability `capacity / n`. This
/// bounds memory while keeping the sample an unbiased representation of the full stream.
#[derive(Debug)]
pub struct Histogram {
    capacity: usize,
    samples: parking_lot::Mutex<Vec<f64>>,
    count: std::sync::atomic::AtomicU64,
}

impl Histogram {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: parking_lot::Mutex::new(Vec::with_capacity(capacity)),
            count: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Record a single observation.
    pub fn observe(&self, value: f64) {
        let n = self.count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut samples = self.samples.lock();
        if samples.len() < self.capacity {
            samples.push(value);
        } else {
            let j = rand::thread_rng().gen_range(0..=n);
            if (j as usize) < self.capacity {
                samples[j as usize] = value;
            }
        }
    }

    /// Total number of observations recorded, including ones evicted from the reservoir.
    #[must_use]
    pub fn observed_count(&self) -> u64 {
        self.count.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub(super) fn report(&self) -> Value {
        let mut samples = self.samples.lock().clone();
        samples.sort_by(|a, b| a.total_cmp(b));
        let stats = Stats::from_sorted(&samples);
        json!({
            "type": "histogram",
            "count": self.observed_count(),
            "min": stats.min,
            "max": stats.max,
            "mean": stats.mean,
            "stddev": stats.stddev,
            "p50": stats.percentile(0.50),
            "p90": stats.percentile(0.90),
            "p95": stats.percentile(0.95),
            "p99": stats.percentile(0.99),
            "p999": stats.percentile(0.999),
        })
    }

    pub(super) fn reset(&self) {
        self.samples.lock().clear();
        self.count.store(0, std::sync::atomic::Ordering::Relaxed);
    }
}

struct Stats<'a> {
    sorted: &'a [f64],
    min: f64,
    max: f64,
    mean: f64,
    stddev: f64,
}

impl<'a> Stats<'a> {
    fn from_sorted(sorted: &'a [f64]) -> Self {
        if sorted.is_empty() {
            return Self {
                sorted,
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                stddev: 0.0,
            };
        }
        let n = sorted.len() as f64;
        let mean = sorted.iter().sum::<f64>() / n;
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Self {
            sorted,
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            mean,
            stddev: variance.sqrt(),
        }
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.sorted.is_empty() {
            return 0.0;
        }
        let rank = (p * (self.sorted.len() - 1) as f64).round() as usize;
        self.sorted[rank.min(self.sorted.len() - 1)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_capacity_keeps_every_sample() {
        let h = Histogram::new(10);
        for i in 0..10 {
            h.observe(i as f64);
        }
        assert_eq!(h.samples.lock().len(), 10);
        assert_eq!(h.observed_count(), 10);
    }

    #[test]
    fn over_capacity_bounds_reservoir_size() {
        let h = Histogram::new(8);
        for i in 0..1000 {
            h.observe(i as f64);
        }
        assert_eq!(h.samples.lock().len(), 8);
        assert_eq!(h.observed_count(), 1000);
    }

    #[test]
    fn reset_clears_samples_and_count() {
        let h = Histogram::new(8);
        h.observe(1.0);
        h.reset();
        assert_eq!(h.observed_count(), 0);
        assert_eq!(h.samples.lock().len(), 0);
    }
}
