//! Metrics for monitoring the scheduler.
//!
//! Prometheus-style primitives backed by atomics: counters for operator
//! lifecycle events, gauges for store-limit state. Collection and export are
//! left to the embedding server.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Create a new counter.
    pub const fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a specific amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// An integer gauge that can move in both directions.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    /// Create a new gauge.
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    /// Set the gauge to a value.
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Increment by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A floating-point gauge stored as f64 bit patterns.
#[derive(Debug, Default)]
pub struct FloatGauge {
    bits: AtomicU64,
}

impl FloatGauge {
    /// Create a new float gauge.
    pub const fn new() -> Self {
        Self {
            bits: AtomicU64::new(0),
        }
    }

    /// Set the gauge to a value.
    pub fn set(&self, v: f64) {
        self.bits.store(v.to_bits(), Ordering::Relaxed);
    }

    /// Get the current value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// A counter keyed by label values.
#[derive(Debug, Default)]
pub struct LabeledCounter {
    counters: RwLock<HashMap<(String, String), AtomicU64>>,
}

impl LabeledCounter {
    /// Create a new labeled counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter for the given label pair.
    pub fn inc(&self, a: &str, b: &str) {
        {
            let counters = self.counters.read();
            if let Some(c) = counters.get(&(a.to_string(), b.to_string())) {
                c.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut counters = self.counters.write();
        counters
            .entry((a.to_string(), b.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Get the value for a label pair.
    pub fn get(&self, a: &str, b: &str) -> u64 {
        self.counters
            .read()
            .get(&(a.to_string(), b.to_string()))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Get all values with their labels.
    pub fn get_all(&self) -> Vec<((String, String), u64)> {
        self.counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect()
    }
}

/// A float gauge keyed by label values.
#[derive(Debug, Default)]
pub struct LabeledGauge {
    gauges: RwLock<HashMap<(String, String), AtomicU64>>,
}

impl LabeledGauge {
    /// Create a new labeled gauge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the gauge for a label pair.
    pub fn set(&self, a: &str, b: &str, v: f64) {
        {
            let gauges = self.gauges.read();
            if let Some(g) = gauges.get(&(a.to_string(), b.to_string())) {
                g.store(v.to_bits(), Ordering::Relaxed);
                return;
            }
        }
        let mut gauges = self.gauges.write();
        gauges
            .entry((a.to_string(), b.to_string()))
            .or_insert_with(|| AtomicU64::new(0))
            .store(v.to_bits(), Ordering::Relaxed);
    }

    /// Get the gauge for a label pair.
    pub fn get(&self, a: &str, b: &str) -> f64 {
        self.gauges
            .read()
            .get(&(a.to_string(), b.to_string()))
            .map(|g| f64::from_bits(g.load(Ordering::Relaxed)))
            .unwrap_or(0.0)
    }
}

/// Metrics for the operator controller and heartbeat ingest.
///
/// Labels follow (operator description, event) for operator counters and
/// (store id, limit type) for store-limit gauges.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    /// Operator lifecycle events: check, start, finish, replace, expire,
    /// timeout, cancel, stale, disappear, unexpected, remove, create.
    pub operator_events: LabeledCounter,
    /// Waiting-queue events: put, get, promote_canceled, add_canceled,
    /// exceed_max.
    pub waiting_events: LabeledCounter,
    /// Store-limit token cost consumed, in region-influence units.
    pub store_limit_cost: LabeledCounter,
    /// Store-limit available tokens, in region-influence units.
    pub store_limit_available: LabeledGauge,
    /// Store-limit configured rate, regions per minute.
    pub store_limit_rate: LabeledGauge,
    /// Region ingest events: update_cache, update_kv.
    pub region_events: LabeledCounter,
    /// Count of running operators.
    pub running_operators: Gauge,
}

impl SchedulerMetrics {
    /// Create a fresh metrics set.
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_and_gauge() {
        let c = Counter::new();
        c.inc();
        c.inc_by(4);
        assert_eq!(c.get(), 5);

        let g = Gauge::new();
        g.set(7);
        g.dec();
        assert_eq!(g.get(), 6);

        let f = FloatGauge::new();
        f.set(2.5);
        assert_eq!(f.get(), 2.5);
    }

    #[test]
    fn test_labeled_counter() {
        let c = LabeledCounter::new();
        c.inc("transfer-leader", "finish");
        c.inc("transfer-leader", "finish");
        c.inc("move-peer", "cancel");

        assert_eq!(c.get("transfer-leader", "finish"), 2);
        assert_eq!(c.get("move-peer", "cancel"), 1);
        assert_eq!(c.get("move-peer", "finish"), 0);
        assert_eq!(c.get_all().len(), 2);
    }

    #[test]
    fn test_labeled_gauge() {
        let g = LabeledGauge::new();
        g.set("1", "add-peer", 15.0);
        assert_eq!(g.get("1", "add-peer"), 15.0);
        assert_eq!(g.get("1", "remove-peer"), 0.0);
    }
}
