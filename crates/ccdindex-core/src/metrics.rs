//! Import metrics.
//!
//! Components receive an `Arc<dyn Metrics>` and never touch global state.
//! [`ImportMetrics`] records into OpenTelemetry instruments; which exporter
//! (OTLP, Prometheus, none) receives them is decided by the meter provider the
//! embedding process installs.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

use crate::types::ImportSource;

/// Result tag attached to a batch duration sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Success,
    Exception,
}

impl BatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Exception => "exception",
        }
    }
}

/// Metrics sink used by the import pipeline.
pub trait Metrics: Send + Sync {
    /// Gauge: latest committed height for a source.
    fn set_read_height(&self, height: u64, source: ImportSource);

    /// Counter: stored transaction events.
    fn inc_transaction_events(&self, count: u64, source: ImportSource);

    /// Timer: wall time of one batch.
    fn record_batch_duration(&self, source: ImportSource, elapsed: Duration, outcome: BatchOutcome);
}

/// Records a batch duration when dropped.
///
/// The sample is tagged [`BatchOutcome::Exception`] unless
/// [`BatchTimer::set_success`] was called, so early returns through `?` are
/// reported as failures.
pub struct BatchTimer {
    metrics: Arc<dyn Metrics>,
    source: ImportSource,
    started: Instant,
    outcome: BatchOutcome,
}

impl BatchTimer {
    pub fn start(metrics: Arc<dyn Metrics>, source: ImportSource) -> Self {
        Self {
            metrics,
            source,
            started: Instant::now(),
            outcome: BatchOutcome::Exception,
        }
    }

    pub fn set_success(&mut self) {
        self.outcome = BatchOutcome::Success;
    }

    pub fn set_exception(&mut self) {
        self.outcome = BatchOutcome::Exception;
    }
}

impl Drop for BatchTimer {
    fn drop(&mut self) {
        self.metrics
            .record_batch_duration(self.source, self.started.elapsed(), self.outcome);
    }
}

// ─── OpenTelemetry implementation ─────────────────────────────────────────────

/// [`Metrics`] backed by OpenTelemetry instruments.
///
/// Every sample carries a `source` attribute; batch durations also carry
/// `outcome`.
#[derive(Clone)]
pub struct ImportMetrics {
    read_height: Gauge<u64>,
    transaction_events: Counter<u64>,
    batch_duration: Histogram<f64>,
}

impl ImportMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            read_height: meter
                .u64_gauge("ccdindex.read_height")
                .with_description("Highest block height carrying a read marker")
                .build(),
            transaction_events: meter
                .u64_counter("ccdindex.transaction_events")
                .with_description("Transaction events and rejections stored")
                .build(),
            batch_duration: meter
                .f64_histogram("ccdindex.batch_duration")
                .with_description("Wall time of one import batch or block")
                .with_unit("s")
                .build(),
        }
    }

    /// Instruments registered with the global meter provider.
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter("ccdindex"))
    }
}

fn source_attr(source: ImportSource) -> KeyValue {
    KeyValue::new("source", source.as_str())
}

impl Metrics for ImportMetrics {
    fn set_read_height(&self, height: u64, source: ImportSource) {
        self.read_height.record(height, &[source_attr(source)]);
    }

    fn inc_transaction_events(&self, count: u64, source: ImportSource) {
        self.transaction_events.add(count, &[source_attr(source)]);
    }

    fn record_batch_duration(&self, source: ImportSource, elapsed: Duration, outcome: BatchOutcome) {
        self.batch_duration.record(
            elapsed.as_secs_f64(),
            &[
                source_attr(source),
                KeyValue::new("outcome", outcome.as_str()),
            ],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Outcomes(Mutex<Vec<(ImportSource, BatchOutcome)>>);

    impl Metrics for Outcomes {
        fn set_read_height(&self, _: u64, _: ImportSource) {}
        fn inc_transaction_events(&self, _: u64, _: ImportSource) {}
        fn record_batch_duration(&self, source: ImportSource, _: Duration, outcome: BatchOutcome) {
            self.0.lock().unwrap().push((source, outcome));
        }
    }

    #[test]
    fn timer_defaults_to_exception() {
        let metrics = Arc::new(Outcomes::default());
        {
            let _timer = BatchTimer::start(metrics.clone(), ImportSource::DatabaseImport);
        }
        {
            let mut timer = BatchTimer::start(metrics.clone(), ImportSource::NodeImport);
            timer.set_success();
        }
        assert_eq!(
            *metrics.0.lock().unwrap(),
            vec![
                (ImportSource::DatabaseImport, BatchOutcome::Exception),
                (ImportSource::NodeImport, BatchOutcome::Success),
            ]
        );
    }

    #[test]
    fn instruments_accept_samples_without_a_provider() {
        let metrics = ImportMetrics::global();
        metrics.set_read_height(42, ImportSource::DatabaseImport);
        metrics.inc_transaction_events(3, ImportSource::NodeImport);
        metrics.record_batch_duration(
            ImportSource::DatabaseImport,
            Duration::MAX,
            BatchOutcome::Success,
        );
    }
}
