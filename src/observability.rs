//! # Observability
//!
//! [`SyncMetrics`] holds pre-registered handles for every series the
//! scheduler, executor and purge worker emit. Handles are registered against
//! the global `metrics` recorder by default; tests register them against a
//! [`LocalCollector`] instead and read the values back.
//!
//! Series (all prefixed `repo_updater_`):
//! - `sched_known_repos`, `sched_update_queue_length` gauges
//! - `sched_loops_total`, `sched_error_total`, `sched_deferred_total`,
//!   `sched_auto_fetch_total`, `sched_manual_fetch_total` counters
//! - `sync_attempts_total{outcome,trigger}` counter
//! - `sync_duration_seconds{success,family}` histogram
//! - `purge_success_total`, `purge_failed_total` counters

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use metrics::{
    Counter, Gauge, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder, SharedString, Unit,
    counter, gauge, histogram,
};

use crate::error::SyncErrorKind;
use crate::types::{Family, TriggerKind};

const SUCCESS_LABEL: &str = "success";

/// Process-scoped metric handles injected into the scheduling components.
#[derive(Clone)]
pub struct SyncMetrics {
    known_repos: Gauge,
    update_queue_length: Gauge,
    sched_loops: Counter,
    sched_error: Counter,
    sched_deferred: Counter,
    auto_fetch: Counter,
    manual_fetch: Counter,
    sync_attempts: HashMap<(&'static str, TriggerKind), Counter>,
    sync_duration: HashMap<(bool, Family), Histogram>,
    purge_success: Counter,
    purge_failed: Counter,
}

impl SyncMetrics {
    /// Registers handles with the globally installed recorder (a no-op when none is set).
    pub fn new() -> Self {
        Self::register()
    }

    /// Registers handles with `recorder` only.
    pub fn with_recorder(recorder: &dyn Recorder) -> Self {
        metrics::with_local_recorder(recorder, Self::register)
    }

    fn register() -> Self {
        let outcomes = std::iter::once(SUCCESS_LABEL).chain(SyncErrorKind::ALL.map(|k| k.as_str()));

        let mut sync_attempts = HashMap::new();
        for outcome in outcomes {
            for trigger in [TriggerKind::Manual, TriggerKind::Auto] {
                sync_attempts.insert(
                    (outcome, trigger),
                    counter!(
                        "repo_updater_sync_attempts_total",
                        "outcome" => outcome,
                        "trigger" => trigger.as_str()
                    ),
                );
            }
        }

        let mut sync_duration = HashMap::new();
        for success in [true, false] {
            for family in Family::ALL {
                sync_duration.insert(
                    (success, family),
                    histogram!(
                        "repo_updater_sync_duration_seconds",
                        "success" => if success { "true" } else { "false" },
                        "family" => family.as_str()
                    ),
                );
            }
        }

        Self {
            known_repos: gauge!("repo_updater_sched_known_repos"),
            update_queue_length: gauge!("repo_updater_sched_update_queue_length"),
            sched_loops: counter!("repo_updater_sched_loops_total"),
            sched_error: counter!("repo_updater_sched_error_total"),
            sched_deferred: counter!("repo_updater_sched_deferred_total"),
            auto_fetch: counter!("repo_updater_sched_auto_fetch_total"),
            manual_fetch: counter!("repo_updater_sched_manual_fetch_total"),
            sync_attempts,
            sync_duration,
            purge_success: counter!("repo_updater_purge_success_total"),
            purge_failed: counter!("repo_updater_purge_failed_total"),
        }
    }

    pub fn set_known_repos(&self, count: usize) {
        self.known_repos.set(count as f64);
    }

    pub fn set_update_queue_length(&self, len: usize) {
        self.update_queue_length.set(len as f64);
    }

    pub fn scheduler_loop(&self) {
        self.sched_loops.increment(1);
    }

    pub fn scheduler_error(&self) {
        self.sched_error.increment(1);
    }

    pub fn deferred(&self) {
        self.sched_deferred.increment(1);
    }

    pub fn dispatched(&self, trigger: TriggerKind) {
        match trigger {
            TriggerKind::Auto => self.auto_fetch.increment(1),
            TriggerKind::Manual => self.manual_fetch.increment(1),
        }
    }

    /// `outcome` is `"success"` or a [`SyncErrorKind`] label.
    pub fn sync_attempt(&self, outcome: &str, trigger: TriggerKind) {
        if let Some(counter) = self
            .sync_attempts
            .iter()
            .find(|((label, t), _)| *label == outcome && *t == trigger)
            .map(|(_, counter)| counter)
        {
            counter.increment(1);
        }
    }

    pub fn sync_duration(&self, success: bool, family: Family, seconds: f64) {
        if let Some(histogram) = self.sync_duration.get(&(success, family)) {
            histogram.record(seconds);
        }
    }

    pub fn purge_succeeded(&self) {
        self.purge_success.increment(1);
    }

    pub fn purge_failed(&self) {
        self.purge_failed.increment(1);
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SyncMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMetrics").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct Samples(Mutex<Vec<f64>>);

impl HistogramFn for Samples {
    fn record(&self, value: f64) {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).push(value);
    }
}

#[derive(Debug, Default)]
struct CollectorState {
    counters: HashMap<Key, Arc<AtomicU64>>,
    gauges: HashMap<Key, Arc<AtomicU64>>,
    histograms: HashMap<Key, Arc<Samples>>,
}

/// In-memory [`Recorder`] for tests and diagnostics.
#[derive(Debug, Default, Clone)]
pub struct LocalCollector {
    state: Arc<Mutex<CollectorState>>,
}

impl LocalCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter; labels match regardless of order.
    pub fn counter(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .counters
            .iter()
            .find(|(key, _)| key_matches(key, name, labels))
            .map_or(0, |(_, value)| value.load(Ordering::Acquire))
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .gauges
            .iter()
            .find(|(key, _)| key_matches(key, name, &[]))
            .map(|(_, value)| f64::from_bits(value.load(Ordering::Acquire)))
    }

    pub fn histogram(&self, name: &str, labels: &[(&str, &str)]) -> Vec<f64> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .histograms
            .iter()
            .find(|(key, _)| key_matches(key, name, labels))
            .map(|(_, samples)| {
                samples
                    .0
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .clone()
            })
            .unwrap_or_default()
    }
}

fn key_matches(key: &Key, name: &str, labels: &[(&str, &str)]) -> bool {
    if key.name() != name {
        return false;
    }
    let mut actual: Vec<(&str, &str)> = key.labels().map(|l| (l.key(), l.value())).collect();
    let mut expected = labels.to_vec();
    actual.sort_unstable();
    expected.sort_unstable();
    actual == expected
}

impl Recorder for LocalCollector {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {
    }

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let value = state.counters.entry(key.clone()).or_default().clone();
        Counter::from_arc(value)
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let value = state
            .gauges
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0f64.to_bits())))
            .clone();
        Gauge::from_arc(value)
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let samples = state.histograms.entry(key.clone()).or_default().clone();
        Histogram::from_arc(samples)
    }
}
