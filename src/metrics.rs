//! Token usage counters
//!
//! Usage samples extracted from responses are handed to a [`UsageRecorder`].
//! [`UsageCounters`] forwards them to OpenTelemetry counters;
//! [`InMemoryUsage`] keeps running totals for tests and inspection.

use crate::attributes::UsageSample;
use opentelemetry::metrics::{Counter, Meter};
use opentelemetry::{global, KeyValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Receives token usage samples from instrumented calls.
///
/// Implementations must be thread-safe; samples may arrive from any thread
/// or task that drives an instrumented call.
pub trait UsageRecorder: Send + Sync {
    fn record(&self, sample: &UsageSample);
}

/// Monotonic OpenTelemetry counters, one per usage field.
///
/// Each field name maps to exactly one `u64` counter instrument, created on
/// first use and reused afterwards. Increments are labelled with the model.
pub struct UsageCounters {
    meter: Meter,
    counters: Mutex<HashMap<&'static str, Counter<u64>>>,
}

impl UsageCounters {
    pub fn new(meter: Meter) -> Self {
        Self {
            meter,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Counters backed by the globally installed meter provider.
    pub fn global(scope: impl Into<String>) -> Self {
        Self::new(global::meter(crate::telemetry::static_scope(scope)))
    }

    fn counter(&self, field: &'static str) -> Counter<u64> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters
            .entry(field)
            .or_insert_with(|| {
                tracing::debug!(field, "creating usage counter");
                self.meter
                    .u64_counter(field)
                    .with_description(format!("OpenAI {}", field))
                    .build()
            })
            .clone()
    }

    /// Number of distinct counter instruments created so far.
    pub fn instrument_count(&self) -> usize {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl UsageRecorder for UsageCounters {
    fn record(&self, sample: &UsageSample) {
        self.counter(sample.field)
            .add(sample.value, &[KeyValue::new("model", sample.model.clone())]);
    }
}

/// Running totals keyed by `(field, model)`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryUsage {
    totals: Arc<Mutex<HashMap<(String, String), u64>>>,
    samples: Arc<Mutex<usize>>,
}

impl InMemoryUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulated value for a field and model, zero if never recorded.
    pub fn total(&self, field: &str, model: &str) -> u64 {
        self.totals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(field.to_string(), model.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Number of samples received.
    pub fn sample_count(&self) -> usize {
        *self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl UsageRecorder for InMemoryUsage {
    fn record(&self, sample: &UsageSample) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        *totals
            .entry((sample.field.to_string(), sample.model.clone()))
            .or_insert(0) += sample.value;
        *self.samples.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }
}
