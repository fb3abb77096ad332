//! Ordered acquisition of the observability stages.
//!
//! # Data Flow
//! ```text
//! Logger ──▶ Stats ──▶ Profiler ──▶ Tracer ──▶ Observer
//!   │          │          │           │
//!   └──────────┴──────────┴───────────┴──▶ ReleaseList
//! ```
//!
//! A stage that fails releases everything already in the list, then its
//! error is returned with the stage attached. Later stages are never
//! attempted.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::SdkTracerProvider;
use opentelemetry_semantic_conventions::resource::SERVICE_NAME;

use super::{Acquired, ObserveError, Observer, Options, ReleaseList, Stage};
use crate::config::{LogConfig, ObserveConfig, ProfilingConfig, StatsConfig, TracingConfig};
use crate::logging::{self, LogError, Logger, LoggerOptions};
use crate::profiling::{self, ProfileError, Profiling};
use crate::stats::{self, StatsError, Statter, RUNTIME_INTERVAL};
use crate::trace::{self, ProfilingTracerProvider, SharedTracerProvider, TraceError};

/// The four acquisition stages.
///
/// [`CliStages`] builds real resources; tests substitute their own.
#[async_trait]
pub trait Stages: Send + Sync {
    async fn acquire_logger(
        &self,
        config: &LogConfig,
        opts: LoggerOptions,
    ) -> Result<Acquired<Logger>, LogError>;

    async fn acquire_statter(
        &self,
        config: &StatsConfig,
        log: &Logger,
    ) -> Result<Acquired<Statter>, StatsError>;

    async fn acquire_profiler(
        &self,
        config: &ProfilingConfig,
        service: &str,
        log: &Logger,
    ) -> Result<Acquired<Profiling>, ProfileError>;

    async fn acquire_tracer_provider(
        &self,
        config: &TracingConfig,
        log: &Logger,
        attrs: Vec<KeyValue>,
    ) -> Result<Acquired<SdkTracerProvider>, TraceError>;
}

/// Stages backed by the crate's own constructors.
#[derive(Debug, Clone, Copy, Default)]
pub struct CliStages;

#[async_trait]
impl Stages for CliStages {
    async fn acquire_logger(
        &self,
        config: &LogConfig,
        opts: LoggerOptions,
    ) -> Result<Acquired<Logger>, LogError> {
        logging::acquire_logger(config, opts)
    }

    async fn acquire_statter(
        &self,
        config: &StatsConfig,
        log: &Logger,
    ) -> Result<Acquired<Statter>, StatsError> {
        stats::acquire_statter(config, log)
    }

    async fn acquire_profiler(
        &self,
        config: &ProfilingConfig,
        service: &str,
        log: &Logger,
    ) -> Result<Acquired<Profiling>, ProfileError> {
        profiling::acquire_profiler(config, service, log)
    }

    async fn acquire_tracer_provider(
        &self,
        config: &TracingConfig,
        log: &Logger,
        attrs: Vec<KeyValue>,
    ) -> Result<Acquired<SdkTracerProvider>, TraceError> {
        trace::acquire_tracer_provider(config, log, attrs)
    }
}

/// Release everything acquired so far if `result` failed.
fn unwind<T, E>(
    result: Result<Acquired<T>, E>,
    stage: Stage,
    releases: &mut ReleaseList,
    log: &Logger,
) -> Result<T, E> {
    match result {
        Ok(acquired) => {
            releases.push_opt(stage, acquired.release);
            Ok(acquired.resource)
        }
        Err(e) => {
            log.log(
                tracing::Level::DEBUG,
                "stage failed, releasing acquired resources",
                &[("stage", stage.as_str())],
            );
            releases.release_all(log);
            Err(e)
        }
    }
}

/// Report runtime stats into the statter until its release runs.
fn with_runtime_collector(mut acquired: Acquired<Statter>) -> Acquired<Statter> {
    let Some(collector) = stats::spawn_runtime_collector(acquired.resource.clone(), RUNTIME_INTERVAL)
    else {
        return acquired;
    };
    let close = acquired.release.take();
    Acquired::with_release(acquired.resource, move || {
        collector.abort();
        if let Some(close) = close {
            close();
        }
    })
}

/// Run every stage in order and assemble an [`Observer`].
pub async fn acquire<S>(
    stages: &S,
    config: &ObserveConfig,
    service: &str,
    opts: Options,
) -> Result<Observer, ObserveError>
where
    S: Stages + ?Sized,
{
    let mut releases = ReleaseList::new(opts.release_order);

    let logger_opts = LoggerOptions {
        writer: opts.log_writer,
        timestamps: opts.log_timestamps,
        time_format: opts.log_time_format,
    };
    let logger = stages
        .acquire_logger(&config.log, logger_opts)
        .await
        .map_err(ObserveError::Logger)?;
    releases.push_opt(Stage::Logger, logger.release);
    let log = logger.resource.with([("svc", service)]).with(opts.log_ctx);

    let stats_tags = opts.stats_tags;
    let stats_runtime = opts.stats_runtime;
    let statter = unwind(
        stages.acquire_statter(&config.stats, &log).await.map(|acquired| {
            let acquired = Acquired {
                resource: acquired
                    .resource
                    .with("", [("svc", service)])
                    .with("", stats_tags),
                release: acquired.release,
            };
            if stats_runtime {
                with_runtime_collector(acquired)
            } else {
                acquired
            }
        }),
        Stage::Stats,
        &mut releases,
        &log,
    )
    .map_err(ObserveError::Stats)?;

    let profiling = unwind(
        stages.acquire_profiler(&config.profiling, service, &log).await,
        Stage::Profiler,
        &mut releases,
        &log,
    )
    .map_err(ObserveError::Profiler)?;

    let mut attrs = opts.tracing_attrs;
    attrs.push(KeyValue::new(SERVICE_NAME, service.to_string()));
    let provider = unwind(
        stages
            .acquire_tracer_provider(&config.tracing, &log, attrs)
            .await,
        Stage::Tracer,
        &mut releases,
        &log,
    )
    .map_err(ObserveError::Tracer)?;

    let provider: SharedTracerProvider = match profiling {
        Profiling::Present(_) => std::sync::Arc::new(ProfilingTracerProvider::new(provider)),
        Profiling::Absent => std::sync::Arc::new(provider),
    };

    Ok(Observer::new(log, statter, Some(provider), releases))
}
