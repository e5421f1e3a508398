//! Process-wide metrics registry.
//!
//! Four metric kinds are supported: monotonic [`Counter`]s, rate-tracking [`Meter`]s,
//! reservoir-sampled [`Histogram`]s, and append-only [`DataList`]s. The registry is indexed by
//! name and shared across the HTTP and ZMQ frontends and the query processor via [`MetricsRegistry`].

mod data_list;
mod histogram;

use std::{sync::Arc, time::Duration};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing, Json, Router};
use dashmap::{mapref::one::Ref, DashMap};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::debug;

pub use self::{data_list::DataList, histogram::Histogram};

/// Metrics subsystem configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct MetricsConfig {
    /// Default reservoir capacity for newly created histograms.
    #[serde(default = "MetricsConfig::default_histogram_capacity")]
    pub histogram_capacity: usize,
    /// Interval between meter rate-window updates.
    #[serde(default = "MetricsConfig::default_tick_interval", with = "humantime_serde")]
    pub tick_interval: Duration,
    /// Mount the `/metrics` endpoint in the HTTP router.
    #[serde(default = "crate::util::default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            histogram_capacity: Self::default_histogram_capacity(),
            tick_interval: Self::default_tick_interval(),
            enabled: true,
        }
    }
}

impl MetricsConfig {
    #[must_use]
    #[inline]
    fn default_histogram_capacity() -> usize {
        32_768
    }

    #[must_use]
    #[inline]
    fn default_tick_interval() -> Duration {
        Duration::from_secs(5)
    }
}

/// Error type used in the metrics subsystem.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MetricsError {
    /// A metric of this name already exists under a different kind.
    #[error("metric {name:?} already registered as a different kind")]
    KindMismatch {
        /// Offending metric name.
        name: String,
    },
}

/// Monotonic 64-bit counter.
#[derive(Debug, Default)]
pub struct Counter(std::sync::atomic::AtomicI64);

impl Counter {
    /// Add `delta` to the counter. `delta` may be negative.
    pub fn increment(&self, delta: i64) {
        self.0.fetch_add(delta, std::sync::atomic::Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn value(&self) -> i64 {
        self.0.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn reset(&self) {
        self.0.store(0, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Exponentially-weighted moving-average event rate meter.
///
/// Rates are updated on a periodic tick driven by [`MetricsRegistry::spawn_tick_task`], matching
/// the 5-second cadence `spec.md` §4.1 specifies.
#[derive(Debug)]
pub struct Meter {
    count: std::sync::atomic::AtomicI64,
    uncounted: std::sync::atomic::AtomicI64,
    rate1: parking_lot::Mutex<Ewma>,
    rate5: parking_lot::Mutex<Ewma>,
    rate15: parking_lot::Mutex<Ewma>,
}

#[derive(Debug, Clone, Copy)]
struct Ewma {
    rate: f64,
    alpha: f64,
    initialized: bool,
}

impl Ewma {
    fn new(window_minutes: f64, tick: Duration) -> Self {
        let alpha = 1.0 - (-tick.as_secs_f64() / 60.0 / window_minutes).exp();
        Self {
            rate: 0.0,
            alpha,
            initialized: false,
        }
    }

    fn tick(&mut self, instant_rate: f64) {
        if self.initialized {
            self.rate += self.alpha * (instant_rate - self.rate);
        } else {
            self.rate = instant_rate;
            self.initialized = true;
        }
    }
}

impl Default for Meter {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl Meter {
    fn new(tick: Duration) -> Self {
        Self {
            count: std::sync::atomic::AtomicI64::new(0),
            uncounted: std::sync::atomic::AtomicI64::new(0),
            rate1: parking_lot::Mutex::new(Ewma::new(1.0, tick)),
            rate5: parking_lot::Mutex::new(Ewma::new(5.0, tick)),
            rate15: parking_lot::Mutex::new(Ewma::new(15.0, tick)),
        }
    }

    /// Record `n` events.
    pub fn mark(&self, n: i64) {
        self.count.fetch_add(n, std::sync::atomic::Ordering::Relaxed);
        self.uncounted
            .fetch_add(n, std::sync::atomic::Ordering::Relaxed);
    }

    /// Total events recorded since creation (or last reset).
    #[must_use]
    pub fn count(&self) -> i64 {
        self.count.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Current 1/5/15-minute EWMA rates, in events per second.
    #[must_use]
    pub fn rates(&self) -> (f64, f64, f64) {
        (
            self.rate1.lock().rate,
            self.rate5.lock().rate,
            self.rate15.lock().rate,
        )
    }

    fn tick(&self, tick: Duration) {
        let n = self.uncounted.swap(0, std::sync::atomic::Ordering::Relaxed);
        let instant_rate = n as f64 / tick.as_secs_f64();
        self.rate1.lock().tick(instant_rate);
        self.rate5.lock().tick(instant_rate);
        self.rate15.lock().tick(instant_rate);
    }

    fn reset(&self) {
        self.count.store(0, std::sync::atomic::Ordering::Relaxed);
        self.uncounted.store(0, std::sync::atomic::Ordering::Relaxed);
        *self.rate1.lock() = Ewma::new(1.0, Duration::from_secs(5));
        *self.rate5.lock() = Ewma::new(5.0, Duration::from_secs(5));
        *self.rate15.lock() = Ewma::new(15.0, Duration::from_secs(5));
    }
}

/// A named metric of any of the four supported kinds.
#[derive(Debug)]
pub enum Metric {
    /// See [`Counter`].
    Counter(Arc<Counter>),
    /// See [`Meter`].
    Meter(Arc<Meter>),
    /// See [`Histogram`].
    Histogram(Arc<Histogram>),
    /// See [`DataList`].
    DataList(Arc<DataList>),
}

impl Metric {
    fn report(&self) -> Value {
        match self {
            Self::Counter(c) => json!({ "type": "counter", "value": c.value() }),
            Self::Meter(m) => {
                let (r1, r5, r15) = m.rates();
                json!({
                    "type": "meter",
                    "count": m.count(),
                    "rate_1min": r1,
                    "rate_5min": r5,
                    "rate_15min": r15,
                })
            }
            Self::Histogram(h) => h.report(),
            Self::DataList(d) => d.report(),
        }
    }

    fn reset(&self) {
        match self {
            Self::Counter(c) => c.reset(),
            Self::Meter(m) => m.reset(),
            Self::Histogram(h) => h.reset(),
            Self::DataList(d) => d.reset(),
        }
    }
}

/// Process-wide registry of named metrics, shared via `Arc` across frontends and the processor.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    metrics: DashMap<String, Metric>,
    config: MetricsConfig,
    /// Guards the whole-snapshot atomicity `report_metrics(clear: true)` requires.
    report_lock: parking_lot::Mutex<()>,
}

impl MetricsRegistry {
    /// Create an empty registry using the given configuration.
    #[must_use]
    pub fn new(config: MetricsConfig) -> Arc<Self> {
        Arc::new(Self {
            metrics: DashMap::new(),
            config,
            report_lock: parking_lot::Mutex::new(()),
        })
    }

    /// Idempotently create (or fetch) a counter by name.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `name` is already registered as a different metric kind.
    pub fn create_counter(&self, name: impl Into<String>) -> Result<Arc<Counter>, MetricsError> {
        self.get_or_create(name, || Metric::Counter(Arc::new(Counter::default())), |m| match m {
            Metric::Counter(c) => Some(c.clone()),
            _ => None,
        })
    }

    /// Idempotently create (or fetch) a meter by name.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `name` is already registered as a different metric kind.
    pub fn create_meter(&self, name: impl Into<String>) -> Result<Arc<Meter>, MetricsError> {
        let tick = self.config.tick_interval;
        self.get_or_create(
            name,
            || Metric::Meter(Arc::new(Meter::new(tick))),
            |m| match m {
                Metric::Meter(m) => Some(m.clone()),
                _ => None,
            },
        )
    }

    /// Idempotently create (or fetch) a histogram by name, using the registry's default
    /// reservoir capacity.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `name` is already registered as a different metric kind.
    pub fn create_histogram(&self, name: impl Into<String>) -> Result<Arc<Histogram>, MetricsError> {
        let capacity = self.config.histogram_capacity;
        self.get_or_create(
            name,
            || Metric::Histogram(Arc::new(Histogram::new(capacity))),
            |m| match m {
                Metric::Histogram(h) => Some(h.clone()),
                _ => None,
            },
        )
    }

    /// Idempotently create (or fetch) a data-list by name.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `name` is already registered as a different metric kind.
    pub fn create_data_list(&self, name: impl Into<String>) -> Result<Arc<DataList>, MetricsError> {
        self.get_or_create(
            name,
            || Metric::DataList(Arc::new(DataList::default())),
            |m| match m {
                Metric::DataList(d) => Some(d.clone()),
                _ => None,
            },
        )
    }

    fn get_or_create<T>(
        &self,
        name: impl Into<String>,
        make: impl FnOnce() -> Metric,
        extract: impl Fn(&Metric) -> Option<Arc<T>>,
    ) -> Result<Arc<T>, MetricsError> {
        let name = name.into();
        let entry = self.metrics.entry(name.clone()).or_insert_with(make);
        extract(entry.value()).ok_or(MetricsError::KindMismatch { name })
    }

    /// Look up a metric by name, regardless of kind.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Ref<'_, String, Metric>> {
        self.metrics.get(name)
    }

    /// Render a JSON snapshot of every registered metric.
    ///
    /// When `clear` is `true`, all counters, meters, histograms, and data-lists are reset to
    /// their initial state atomically relative to other reporters.
    #[must_use]
    pub fn report(&self, clear: bool) -> Value {
        let _guard = self.report_lock.lock();
        let mut out = serde_json::Map::new();
        for entry in self.metrics.iter() {
            out.insert(entry.key().clone(), entry.value().report());
        }
        if clear {
            for entry in self.metrics.iter() {
                entry.value().reset();
            }
        }
        Value::Object(out)
    }

    /// Spawn the background task that advances every meter's rate window on a fixed tick.
    pub fn spawn_tick_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        let tick = registry.config.tick_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                for entry in registry.metrics.iter() {
                    if let Metric::Meter(m) = entry.value() {
                        m.tick(tick);
                    }
                }
                debug!(metrics = registry.metrics.len(), "ticked meters");
            }
        })
    }

    /// Number of distinct registered metric names.
    #[must_use]
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    /// Whether the registry has no registered metrics.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

async fn metrics_handler(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    (StatusCode::OK, Json(registry.report(false)))
}

/// Build the `GET /metrics` route, mounted by the HTTP frontend.
#[must_use]
pub fn metrics_router(registry: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/metrics", routing::get(metrics_handler))
        .with_state(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_counter_is_idempotent() {
        let registry = MetricsRegistry::new(MetricsConfig::default());
        let a = registry.create_counter("requests").unwrap();
        let b = registry.create_counter("requests").unwrap();
        a.increment(5);
        assert_eq!(b.value(), 5);
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let registry = MetricsRegistry::new(MetricsConfig::default());
        registry.create_counter("x").unwrap();
        assert!(registry.create_meter("x").is_err());
    }

    #[test]
    fn report_clear_resets_counters_to_zero() {
        let registry = MetricsRegistry::new(MetricsConfig::default());
        let c = registry.create_counter("dropped").unwrap();
        c.increment(3);
        let snapshot = registry.report(true);
        assert_eq!(snapshot["dropped"]["value"], 3);
        let after = registry.report(false);
        assert_eq!(after["dropped"]["value"], 0);
    }
}
