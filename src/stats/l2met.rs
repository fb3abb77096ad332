//! l2met reporter: measurements become log lines.
//!
//! Counters log `count#name=value`, gauges `sample#name=value` and
//! histograms `measure#name=value`, with the statter tags as fields.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};

use super::{Reporter, StatsError};
use crate::logging::Logger;

/// Writes every measurement through a [`Logger`] at info level.
pub struct L2metReporter {
    inner: Arc<Inner>,
}

struct Inner {
    log: Logger,
    // Gauge values by key, so relative updates log the resulting value.
    gauges: Mutex<HashMap<Key, f64>>,
}

impl L2metReporter {
    pub fn new(log: Logger) -> Self {
        Self {
            inner: Arc::new(Inner {
                log,
                gauges: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl Inner {
    fn emit(&self, kind: &str, key: &Key, value: &str) {
        let line = format!("{kind}#{}={value}", key.name());
        let tags: Vec<(&str, &str)> = key.labels().map(|l| (l.key(), l.value())).collect();
        self.log.log(tracing::Level::INFO, &line, &tags);
    }

    fn update_gauge(&self, key: &Key, apply: impl FnOnce(f64) -> f64) {
        let value = {
            let mut gauges = match self.gauges.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            let slot = gauges.entry(key.clone()).or_insert(0.0);
            *slot = apply(*slot);
            *slot
        };
        self.emit("sample", key, &value.to_string());
    }
}

struct Handle {
    inner: Arc<Inner>,
    key: Key,
}

impl CounterFn for Handle {
    fn increment(&self, value: u64) {
        self.inner.emit("count", &self.key, &value.to_string());
    }

    fn absolute(&self, value: u64) {
        self.inner.update_gauge(&self.key, |_| value as f64);
    }
}

impl GaugeFn for Handle {
    fn increment(&self, value: f64) {
        self.inner.update_gauge(&self.key, |v| v + value);
    }

    fn decrement(&self, value: f64) {
        self.inner.update_gauge(&self.key, |v| v - value);
    }

    fn set(&self, value: f64) {
        self.inner.update_gauge(&self.key, |_| value);
    }
}

impl HistogramFn for Handle {
    fn record(&self, value: f64) {
        self.inner.emit("measure", &self.key, &value.to_string());
    }
}

impl L2metReporter {
    fn handle(&self, key: &Key) -> Arc<Handle> {
        Arc::new(Handle {
            inner: self.inner.clone(),
            key: key.clone(),
        })
    }
}

impl Recorder for L2metReporter {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
        Counter::from_arc(self.handle(key))
    }

    fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(self.handle(key))
    }

    fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(self.handle(key))
    }
}

impl Reporter for L2metReporter {
    fn close(&self) -> Result<(), StatsError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::logging::tests::Capture;
    use crate::logging::{acquire_logger, LoggerOptions};
    use crate::stats::Statter;

    fn statter() -> (Statter, Capture) {
        let capture = Capture::default();
        let log = acquire_logger(
            &LogConfig::default(),
            LoggerOptions {
                writer: Some(capture.make_writer()),
                ..Default::default()
            },
        )
        .unwrap()
        .resource;
        (Statter::new(Arc::new(L2metReporter::new(log))), capture)
    }

    #[test]
    fn test_measurement_kinds() {
        let (stats, capture) = statter();
        stats.counter("hits", 2);
        stats.gauge("workers", 4.0);
        stats.histogram("latency", 0.25);

        let output = capture.contents();
        assert!(output.contains("count#hits=2"), "{output}");
        assert!(output.contains("sample#workers=4"), "{output}");
        assert!(output.contains("measure#latency=0.25"), "{output}");
    }

    #[test]
    fn test_gauge_increments_accumulate() {
        let (stats, capture) = statter();
        let metadata = Metadata::new("test", metrics::Level::INFO, None);
        let gauge = stats
            .with("", [("svc", "api")])
            .reporter
            .register_gauge(&Key::from_name("queue"), &metadata);
        gauge.increment(2.0);
        gauge.increment(3.0);
        gauge.decrement(1.0);

        let output = capture.contents();
        assert!(output.contains("sample#queue=5"), "{output}");
        assert!(output.contains("sample#queue=4"), "{output}");
    }

    #[test]
    fn test_tags_become_fields() {
        let (stats, capture) = statter();
        stats.with("db", [("table", "users")]).counter("queries", 1);

        let output = capture.contents();
        assert!(output.contains("count#db.queries=1"), "{output}");
        assert!(output.contains("table=users"), "{output}");
    }
}
