//! Rolling estimators: median filters, time-weighted averages, and their
//! composition.

use std::collections::VecDeque;
use std::time::Duration;

/// A rolling estimator over a stream of samples.
pub trait MovingAvg: Send + Sync + std::fmt::Debug {
    /// Feed one sample.
    fn add(&mut self, value: f64);

    /// Current estimate.
    fn get(&self) -> f64;

    /// Overwrite the estimate, discarding history. Test hook.
    fn set(&mut self, value: f64);
}

/// Median over the most recent `size` samples.
///
/// The median tolerates the one-interval spikes that a plain mean would chase,
/// at the cost of reacting one or two reports late.
#[derive(Debug, Clone)]
pub struct MedianFilter {
    records: VecDeque<f64>,
    size: usize,
}

impl MedianFilter {
    /// Create a filter over a window of `size` samples.
    pub fn new(size: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(size),
            size,
        }
    }
}

impl MovingAvg for MedianFilter {
    fn add(&mut self, value: f64) {
        if self.records.len() == self.size {
            self.records.pop_front();
        }
        self.records.push_back(value);
    }

    fn get(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.records.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 1 {
            sorted[mid]
        } else {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        }
    }

    fn set(&mut self, value: f64) {
        self.records.clear();
        self.records.push_back(value);
    }
}

/// Average of deltas over their summed intervals, windowed by report count.
#[derive(Debug, Clone)]
pub struct AvgOverTime {
    records: VecDeque<(f64, Duration)>,
    size: usize,
}

impl AvgOverTime {
    /// Create an averager over the most recent `size` (delta, interval) pairs.
    pub fn new(size: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(size),
            size,
        }
    }

    /// Feed one report: `delta` accumulated over `interval`.
    pub fn add(&mut self, delta: f64, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        if self.records.len() == self.size {
            self.records.pop_front();
        }
        self.records.push_back((delta, interval));
    }

    /// Rate estimate: total delta divided by total observed time.
    pub fn get(&self) -> f64 {
        let total_time: f64 = self.records.iter().map(|(_, d)| d.as_secs_f64()).sum();
        if total_time == 0.0 {
            return 0.0;
        }
        let total_delta: f64 = self.records.iter().map(|(v, _)| v).sum();
        total_delta / total_time
    }

    /// Discard history.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Median filter fed by a time-weighted average: the estimator behind the
/// per-store flow rates.
#[derive(Debug, Clone)]
pub struct TimeMedian {
    aot: AvgOverTime,
    mf: MedianFilter,
}

impl TimeMedian {
    /// Create with an averaging window of `aot_size` reports feeding a median
    /// window of `mf_size` estimates.
    pub fn new(aot_size: usize, mf_size: usize) -> Self {
        Self {
            aot: AvgOverTime::new(aot_size),
            mf: MedianFilter::new(mf_size),
        }
    }

    /// Feed one report.
    pub fn add(&mut self, delta: f64, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        self.aot.add(delta, interval);
        self.mf.add(self.aot.get());
    }

    /// Current rate estimate.
    pub fn get(&self) -> f64 {
        self.mf.get()
    }

    /// Overwrite the estimate, discarding history. Test hook.
    pub fn set(&mut self, rate: f64) {
        self.aot.clear();
        self.mf.set(rate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_filter_window() {
        let mut mf = MedianFilter::new(3);
        assert_eq!(mf.get(), 0.0);

        mf.add(10.0);
        assert_eq!(mf.get(), 10.0);

        mf.add(20.0);
        assert_eq!(mf.get(), 15.0);

        mf.add(1000.0); // spike
        assert_eq!(mf.get(), 20.0);

        // Window slides: {20, 1000, 30} -> median 30.
        mf.add(30.0);
        assert_eq!(mf.get(), 30.0);
    }

    #[test]
    fn test_median_filter_set_discards_history() {
        let mut mf = MedianFilter::new(5);
        mf.add(1.0);
        mf.add(2.0);
        mf.set(9.0);
        assert_eq!(mf.get(), 9.0);
    }

    #[test]
    fn test_avg_over_time_rate() {
        let mut aot = AvgOverTime::new(2);
        aot.add(100.0, Duration::from_secs(10));
        assert_eq!(aot.get(), 10.0);

        aot.add(300.0, Duration::from_secs(10));
        assert_eq!(aot.get(), 20.0);

        // Zero intervals are ignored rather than dividing by zero.
        aot.add(999.0, Duration::ZERO);
        assert_eq!(aot.get(), 20.0);
    }

    #[test]
    fn test_time_median_composition() {
        let mut tm = TimeMedian::new(2, 3);
        for _ in 0..5 {
            tm.add(100.0, Duration::from_secs(10));
        }
        assert!((tm.get() - 10.0).abs() < f64::EPSILON);

        tm.set(42.0);
        assert_eq!(tm.get(), 42.0);
    }
}
