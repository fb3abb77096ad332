//! Service bootstrap: acquire logger, statter, profiler and tracer as one unit.
//!
//! # Responsibilities
//! - Run the acquisition stages in a fixed order (see [`sequencer`])
//! - Roll back everything already acquired when a stage fails
//! - Bundle the resources into an [`Observer`] with a single `close`
//!
//! # Design Decisions
//! - Release actions run in acquisition order unless
//!   [`Options::release_order`] says otherwise
//! - `close` drains the release list; calling it again does nothing
//! - No `Drop` teardown: shutdown is an explicit call from the binary
//! - Nothing here touches global state; the binary decides whether to
//!   install the logger or tracer provider globally

pub mod release;
pub mod sequencer;

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::InstrumentationScope;
use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::config::ObserveConfig;
use crate::logging::{LogError, Logger};
use crate::profiling::ProfileError;
use crate::stats::{StatsError, Statter};
use crate::trace::{SharedTracerProvider, TraceError};

pub use release::{Acquired, ReleaseAction, ReleaseList, ReleaseOrder, Stage};
pub use sequencer::{CliStages, Stages};

const NO_PROVIDER: &str = "calling tracer when no trace provider has been set";

/// The first stage that failed, with its cause.
#[derive(Debug, Error)]
pub enum ObserveError {
    #[error("failed to create logger: {0}")]
    Logger(#[source] LogError),

    #[error("failed to create statter: {0}")]
    Stats(#[source] StatsError),

    #[error("failed to create profiler: {0}")]
    Profiler(#[source] ProfileError),

    #[error("failed to create tracer: {0}")]
    Tracer(#[source] TraceError),
}

impl ObserveError {
    /// The stage that failed.
    pub fn stage(&self) -> Stage {
        match self {
            ObserveError::Logger(_) => Stage::Logger,
            ObserveError::Stats(_) => Stage::Stats,
            ObserveError::Profiler(_) => Stage::Profiler,
            ObserveError::Tracer(_) => Stage::Tracer,
        }
    }
}

/// Bootstrap options that do not come from flags.
#[derive(Default)]
pub struct Options {
    /// strftime layout of log timestamps.
    pub log_time_format: Option<String>,

    /// Prefix log lines with a cached timestamp.
    pub log_timestamps: bool,

    /// Context fields added to every log line, after `svc`.
    pub log_ctx: Vec<(String, String)>,

    /// Destination of log lines. Defaults to stdout.
    pub log_writer: Option<BoxMakeWriter>,

    /// Report tokio runtime stats every [`crate::stats::RUNTIME_INTERVAL`].
    /// The collector stops with the statter's release.
    pub stats_runtime: bool,

    /// Tags added to every measurement, after `svc`.
    pub stats_tags: Vec<(String, String)>,

    /// Resource attributes added to every trace, before `service.name`.
    pub tracing_attrs: Vec<opentelemetry::KeyValue>,

    /// Order of release actions on rollback and close.
    pub release_order: ReleaseOrder,
}

/// Logger, statter and tracer provider of a service, plus their teardown.
pub struct Observer {
    log: Logger,
    stats: Statter,
    trace_provider: Option<SharedTracerProvider>,
    releases: ReleaseList,
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("log", &self.log)
            .field("stats", &self.stats)
            .field("trace_provider", &self.trace_provider.is_some())
            .field("releases", &self.releases)
            .finish()
    }
}

impl Observer {
    /// Assemble an observer from resources acquired elsewhere.
    pub fn new(
        log: Logger,
        stats: Statter,
        trace_provider: Option<SharedTracerProvider>,
        releases: ReleaseList,
    ) -> Self {
        Self {
            log,
            stats,
            trace_provider,
            releases,
        }
    }

    /// Acquire every stage from `config` for `service`.
    pub async fn from_cli(
        config: &ObserveConfig,
        service: &str,
        opts: Options,
    ) -> Result<Self, ObserveError> {
        sequencer::acquire(&CliStages, config, service, opts).await
    }

    /// An observer that records nothing, for tests.
    ///
    /// Tracers come from the global provider, a no-op unless one was
    /// installed.
    pub fn fake() -> Self {
        Self::new(
            Logger::discard(),
            Statter::discard(),
            Some(std::sync::Arc::new(global::tracer_provider())),
            ReleaseList::default(),
        )
    }

    pub fn log(&self) -> &Logger {
        &self.log
    }

    pub fn stats(&self) -> &Statter {
        &self.stats
    }

    pub fn tracer_provider(&self) -> Option<&SharedTracerProvider> {
        self.trace_provider.as_ref()
    }

    /// Stages with a pending release action, in acquisition order.
    pub fn pending_releases(&self) -> Vec<Stage> {
        self.releases.stages()
    }

    /// A tracer named `name`.
    ///
    /// # Panics
    /// If the observer was built without a tracer provider.
    pub fn tracer(&self, name: impl Into<std::borrow::Cow<'static, str>>) -> BoxedTracer {
        self.tracer_with_scope(InstrumentationScope::builder(name).build())
    }

    /// A tracer for an instrumentation scope with version, schema or
    /// attributes.
    ///
    /// # Panics
    /// If the observer was built without a tracer provider.
    pub fn tracer_with_scope(&self, scope: InstrumentationScope) -> BoxedTracer {
        match &self.trace_provider {
            Some(provider) => BoxedTracer::new(provider.boxed_tracer(scope)),
            None => panic!("{NO_PROVIDER}"),
        }
    }

    /// Run every release action once. Later calls do nothing.
    pub fn close(&mut self) {
        let released = self.releases.release_all(&self.log);
        self.log.log(
            tracing::Level::DEBUG,
            "observer closed",
            &[("released", &released.to_string())],
        );
    }
}
