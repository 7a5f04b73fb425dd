//! Metrics registry
//!
//! Components publish named counters and gauges into a shared registry that
//! is handed to them at construction; the registry renders a JSON snapshot
//! for `/debug/vars`. There are no process globals: a test can build its own
//! registry and inspect it directly.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Monotonically increasing counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment by one
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by `n`
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Gauge tracking a fluctuating quantity
#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    /// Increment by one
    pub fn incr(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by one
    pub fn decr(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    /// Current value
    #[must_use]
    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// RAII guard that holds a gauge incremented for its lifetime
#[derive(Debug)]
pub struct GaugeGuard(Arc<Gauge>);

impl GaugeGuard {
    /// Increment `gauge` and decrement it again when the guard drops.
    #[must_use]
    pub fn acquire(gauge: &Arc<Gauge>) -> Self {
        gauge.incr();
        Self(Arc::clone(gauge))
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.decr();
    }
}

#[derive(Debug, Clone)]
enum Metric {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
}

/// Shared registry of named metrics
///
/// Names are dotted paths (`action.get.hit.local`); the first segment is the
/// publishing component.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    metrics: RwLock<BTreeMap<String, Metric>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or register the counter with the given name.
    ///
    /// # Panics
    ///
    /// Panics if the name is already registered as a gauge; metric names are
    /// assigned statically at construction so this is a programming error.
    pub fn counter(&self, name: &str) -> Arc<Counter> {
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        match metrics
            .entry(name.to_string())
            .or_insert_with(|| Metric::Counter(Arc::new(Counter::default())))
        {
            Metric::Counter(c) => Arc::clone(c),
            Metric::Gauge(_) => panic!("metric {name} already registered as a gauge"),
        }
    }

    /// Get or register the gauge with the given name.
    ///
    /// # Panics
    ///
    /// Panics if the name is already registered as a counter.
    pub fn gauge(&self, name: &str) -> Arc<Gauge> {
        let mut metrics = self.metrics.write().unwrap_or_else(|e| e.into_inner());
        match metrics
            .entry(name.to_string())
            .or_insert_with(|| Metric::Gauge(Arc::new(Gauge::default())))
        {
            Metric::Gauge(g) => Arc::clone(g),
            Metric::Counter(_) => panic!("metric {name} already registered as a counter"),
        }
    }

    /// JSON snapshot of every registered metric, for `/debug/vars`.
    #[must_use]
    pub fn snapshot(&self) -> Value {
        let metrics = self.metrics.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Map::new();
        for (name, metric) in metrics.iter() {
            let value = match metric {
                Metric::Counter(c) => Value::from(c.get()),
                Metric::Gauge(g) => Value::from(g.get()),
            };
            out.insert(name.clone(), value);
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_roundtrip() {
        let registry = MetricsRegistry::new();
        let c = registry.counter("action.get.miss");
        c.incr();
        c.add(2);

        // Same name returns the same counter
        assert_eq!(registry.counter("action.get.miss").get(), 3);
    }

    #[test]
    fn test_gauge_guard() {
        let registry = MetricsRegistry::new();
        let g = registry.gauge("action.inflight.gets");
        {
            let _guard = GaugeGuard::acquire(&g);
            let _second = GaugeGuard::acquire(&g);
            assert_eq!(g.get(), 2);
        }
        assert_eq!(g.get(), 0);
    }

    #[test]
    fn test_snapshot() {
        let registry = MetricsRegistry::new();
        registry.counter("a.hits").add(5);
        registry.gauge("a.inflight").incr();

        let snap = registry.snapshot();
        assert_eq!(snap["a.hits"], 5);
        assert_eq!(snap["a.inflight"], 1);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_kind_mismatch_panics() {
        let registry = MetricsRegistry::new();
        registry.counter("x");
        registry.gauge("x");
    }
}
