//! Metrics reporting.
//!
//! # Responsibilities
//! - Select a metrics backend from the `stats.dsn` URI scheme
//! - Give services a [`Statter`] that prefixes and tags every measurement
//! - Flush and close the backend on release
//!
//! # Backends
//! - `` (empty): measurements are discarded
//! - `statsd://host:port?flushBytes=N&flushInterval=D`: DogStatsD lines over UDP
//! - `l2met://`: measurements written through the logger in l2met form
//! - `prometheus://[host:port]` (`prom`, `victoriametrics`, `vm`): text
//!   exposition, served on `/metrics` when a host is given
//!
//! # Design Decisions
//! - Every backend is a `metrics::Recorder`, wrapped by the [`Reporter`]
//!   trait so the statter can close it
//! - The statter never installs a global recorder; several can coexist
//! - Reporting failures after construction are logged, never returned

pub mod l2met;
pub mod prometheus;
pub mod runtime;
pub mod statsd;

use std::sync::Arc;
use std::time::Duration;

use metrics::{Key, Label, Level, Metadata, NoopRecorder, Recorder};
use thiserror::Error;
use url::Url;

use crate::config::StatsConfig;
use crate::logging::Logger;
use crate::observe::Acquired;
use crate::tags::{self, TagError};

pub use runtime::{spawn_runtime_collector, RUNTIME_INTERVAL};

/// Separator between prefix segments and the measurement name.
pub const PREFIX_SEPARATOR: &str = ".";

/// Errors produced while building or closing a statter.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("invalid stats dsn {dsn:?}: {source}")]
    InvalidDsn {
        dsn: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported stats backend {0:?}")]
    UnsupportedBackend(String),

    #[error("invalid stats option {name}={value:?}: {reason}")]
    InvalidOption {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid stats tags: {0}")]
    InvalidTags(#[from] TagError),

    #[error("{backend} backend requires a running tokio runtime")]
    NoRuntime { backend: &'static str },

    #[error("stats io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A metrics backend the statter reports into.
pub trait Reporter: Recorder + Send + Sync {
    /// Flush buffered measurements and stop background work.
    fn close(&self) -> Result<(), StatsError>;
}

impl Reporter for NoopRecorder {
    fn close(&self) -> Result<(), StatsError> {
        Ok(())
    }
}

/// Prefixed, tagged handle onto a [`Reporter`].
#[derive(Clone)]
pub struct Statter {
    reporter: Arc<dyn Reporter>,
    prefix: String,
    labels: Vec<Label>,
}

impl std::fmt::Debug for Statter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statter")
            .field("prefix", &self.prefix)
            .field("labels", &self.labels)
            .finish()
    }
}

impl Statter {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self {
            reporter,
            prefix: String::new(),
            labels: Vec::new(),
        }
    }

    /// A statter that discards every measurement.
    pub fn discard() -> Self {
        Self::new(Arc::new(NoopRecorder))
    }

    /// Return a statter sharing this reporter, with `prefix` appended to the
    /// current prefix and `tags` appended to the current tags.
    pub fn with<K, V>(&self, prefix: &str, tags: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let prefix = match (self.prefix.is_empty(), prefix.is_empty()) {
            (_, true) => self.prefix.clone(),
            (true, false) => prefix.to_string(),
            (false, false) => format!("{}{PREFIX_SEPARATOR}{prefix}", self.prefix),
        };
        let mut labels = self.labels.clone();
        labels.extend(
            tags.into_iter()
                .map(|(k, v)| Label::new(k.into(), v.into())),
        );
        Self {
            reporter: self.reporter.clone(),
            prefix,
            labels,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Increment the counter `name` by `value`.
    pub fn counter(&self, name: &str, value: u64) {
        let metadata = metadata();
        self.reporter
            .register_counter(&self.key(name), &metadata)
            .increment(value);
    }

    /// Set the gauge `name` to `value`.
    pub fn gauge(&self, name: &str, value: f64) {
        let metadata = metadata();
        self.reporter
            .register_gauge(&self.key(name), &metadata)
            .set(value);
    }

    /// Record `value` into the histogram `name`.
    pub fn histogram(&self, name: &str, value: f64) {
        let metadata = metadata();
        self.reporter
            .register_histogram(&self.key(name), &metadata)
            .record(value);
    }

    /// Record a duration, in seconds, into the histogram `name`.
    pub fn timing(&self, name: &str, duration: Duration) {
        self.histogram(name, duration.as_secs_f64());
    }

    /// Flush and close the underlying reporter.
    pub fn close(&self) -> Result<(), StatsError> {
        self.reporter.close()
    }

    fn key(&self, name: &str) -> Key {
        let name = if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}{PREFIX_SEPARATOR}{name}", self.prefix)
        };
        Key::from_parts(name, self.labels.clone())
    }
}

fn metadata() -> Metadata<'static> {
    Metadata::new(module_path!(), Level::INFO, Some(module_path!()))
}

/// Build a statter from the `stats.*` configuration.
///
/// The release action closes the reporter; close failures are logged.
pub fn acquire_statter(config: &StatsConfig, log: &Logger) -> Result<Acquired<Statter>, StatsError> {
    let tags = tags::parse(&config.tags)?;
    if config.dsn.is_empty() {
        return Ok(Acquired::bare(Statter::discard().with(&config.prefix, tags)));
    }

    let url = Url::parse(&config.dsn).map_err(|source| StatsError::InvalidDsn {
        dsn: config.dsn.clone(),
        source,
    })?;
    let interval = Duration::from_millis(config.interval_ms);

    let reporter: Arc<dyn Reporter> = match url.scheme() {
        "statsd" => Arc::new(statsd::StatsdReporter::connect(&url, interval, log.clone())?),
        "l2met" => Arc::new(l2met::L2metReporter::new(log.clone())),
        "prometheus" | "prom" | "victoriametrics" | "vm" => {
            Arc::new(prometheus::PrometheusReporter::serve(&url, log.clone())?)
        }
        scheme => return Err(StatsError::UnsupportedBackend(scheme.to_string())),
    };

    let statter = Statter::new(reporter).with(&config.prefix, tags);
    let closer = statter.clone();
    let log = log.clone();
    Ok(Acquired::with_release(statter, move || {
        if let Err(e) = closer.close() {
            log.log(
                tracing::Level::ERROR,
                "failed to close statter",
                &[("error", &e.to_string())],
            );
        }
    }))
}
