//! Process-wide metrics built on atomics
//!
//! Metrics are looked up by name in a global registry; handles are cheap to
//! clone and share the same underlying value. Every update is also emitted as
//! a `trace` event so that metrics can be followed from the log stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, trace};

/// A counter metric that can only increase
#[derive(Clone, Debug)]
pub struct Counter {
    name: Arc<str>,
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Increment the counter by 1
    pub fn increment(&self) {
        self.add(1);
    }

    /// Add a value to the counter
    pub fn add(&self, value: u64) {
        let total = self.value.fetch_add(value, Ordering::Relaxed) + value;
        trace!(metric = "counter", name = %self.name, value, total);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge metric that can increase or decrease
#[derive(Clone, Debug)]
pub struct Gauge {
    name: Arc<str>,
    value: Arc<AtomicI64>,
}

impl Gauge {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
        trace!(metric = "gauge", name = %self.name, value);
    }

    pub fn increment(&self) {
        let value = self.value.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(metric = "gauge", name = %self.name, value);
    }

    pub fn decrement(&self) {
        let value = self.value.fetch_sub(1, Ordering::Relaxed) - 1;
        trace!(metric = "gauge", name = %self.name, value);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Running count and sum of observed values
///
/// Observations are stored in microseconds when recorded through
/// [`Histogram::observe_duration`].
#[derive(Clone, Debug)]
pub struct Histogram {
    name: Arc<str>,
    count: Arc<AtomicU64>,
    sum: Arc<AtomicU64>,
}

impl Histogram {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            count: Arc::new(AtomicU64::new(0)),
            sum: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn observe(&self, value: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(value, Ordering::Relaxed);
        trace!(metric = "histogram", name = %self.name, value);
    }

    pub fn observe_duration(&self, duration: Duration) {
        self.observe(u64::try_from(duration.as_micros()).unwrap_or(u64::MAX));
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Mean of all observations, `None` before the first one
    #[allow(clippy::cast_precision_loss)]
    pub fn mean(&self) -> Option<f64> {
        let count = self.count();
        if count == 0 {
            return None;
        }
        Some(self.sum() as f64 / count as f64)
    }
}

/// Registry of named metrics
#[derive(Default)]
pub struct Metrics {
    counters: RwLock<HashMap<String, Counter>>,
    gauges: RwLock<HashMap<String, Gauge>>,
    histograms: RwLock<HashMap<String, Histogram>>,
}

fn get_or_insert<M: Clone>(
    map: &RwLock<HashMap<String, M>>,
    name: &str,
    make: impl FnOnce() -> M,
) -> M {
    if let Ok(entries) = map.read()
        && let Some(metric) = entries.get(name)
    {
        return metric.clone();
    }

    match map.write() {
        Ok(mut entries) => entries.entry(name.to_string()).or_insert_with(make).clone(),
        Err(_) => make(),
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a counter
    pub fn counter(&self, name: &str) -> Counter {
        get_or_insert(&self.counters, name, || Counter::new(name))
    }

    /// Get or create a gauge
    pub fn gauge(&self, name: &str) -> Gauge {
        get_or_insert(&self.gauges, name, || Gauge::new(name))
    }

    /// Get or create a histogram
    pub fn histogram(&self, name: &str) -> Histogram {
        get_or_insert(&self.histograms, name, || Histogram::new(name))
    }

    /// Current value of every counter
    pub fn all_counters(&self) -> HashMap<String, u64> {
        self.counters
            .read()
            .map(|c| c.iter().map(|(k, v)| (k.clone(), v.get())).collect())
            .unwrap_or_default()
    }

    /// Current value of every gauge
    pub fn all_gauges(&self) -> HashMap<String, i64> {
        self.gauges
            .read()
            .map(|g| g.iter().map(|(k, v)| (k.clone(), v.get())).collect())
            .unwrap_or_default()
    }

    /// Log all metrics at info level
    pub fn log_all(&self) {
        for (name, value) in self.all_counters() {
            info!(metric_type = "counter", metric_name = %name, value, "Metric value");
        }
        for (name, value) in self.all_gauges() {
            info!(metric_type = "gauge", metric_name = %name, value, "Metric value");
        }
        if let Ok(histograms) = self.histograms.read() {
            for (name, histogram) in histograms.iter() {
                info!(
                    metric_type = "histogram",
                    metric_name = %name,
                    count = histogram.count(),
                    sum = histogram.sum(),
                    "Metric value"
                );
            }
        }
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_METRICS: Metrics = Metrics::new();
}

/// Get or create a global counter
pub fn counter(name: &str) -> Counter {
    GLOBAL_METRICS.counter(name)
}

/// Get or create a global gauge
pub fn gauge(name: &str) -> Gauge {
    GLOBAL_METRICS.gauge(name)
}

/// Get or create a global histogram
pub fn histogram(name: &str) -> Histogram {
    GLOBAL_METRICS.histogram(name)
}

/// Get the global metrics instance
pub fn global() -> &'static Metrics {
    &GLOBAL_METRICS
}
