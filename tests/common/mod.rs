//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use cmdkit::config::{LogConfig, ProfilingConfig, StatsConfig, TracingConfig};
use cmdkit::logging::{LogError, Logger, LoggerOptions};
use cmdkit::observe::{Acquired, Stage, Stages};
use cmdkit::profiling::{self, ProfileError, Profiler, Profiling};
use cmdkit::stats::{StatsError, Statter};
use cmdkit::trace::TraceError;

/// What a fake stage does when acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Succeed and report a release action.
    Release,
    /// Succeed without a release action. For the profiler: `Absent`.
    NoRelease,
    /// Succeed with a release action that panics.
    PanicOnRelease,
    /// Fail.
    Fail,
}

/// Record of stage attempts and release invocations.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    attempts: Arc<Mutex<Vec<Stage>>>,
    releases: Arc<Mutex<Vec<Stage>>>,
}

impl Journal {
    pub fn attempts(&self) -> Vec<Stage> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn releases(&self) -> Vec<Stage> {
        self.releases.lock().unwrap().clone()
    }

    fn attempt(&self, stage: Stage) {
        self.attempts.lock().unwrap().push(stage);
    }

    fn release_action(&self, stage: Stage, outcome: Outcome) -> impl FnOnce() + Send + 'static {
        let releases = self.releases.clone();
        move || {
            if outcome == Outcome::PanicOnRelease {
                panic!("{stage} release failed");
            }
            releases.lock().unwrap().push(stage);
        }
    }

    fn acquired<T>(&self, stage: Stage, outcome: Outcome, resource: T) -> Acquired<T> {
        match outcome {
            Outcome::NoRelease => Acquired::bare(resource),
            _ => Acquired::with_release(resource, self.release_action(stage, outcome)),
        }
    }
}

/// Stages that succeed or fail on demand without touching the network.
#[derive(Debug, Clone)]
pub struct FakeStages {
    pub logger: Outcome,
    pub stats: Outcome,
    pub profiler: Outcome,
    pub tracer: Outcome,
    pub journal: Journal,
    /// Receives every span the fake tracer provider finishes.
    pub spans: InMemorySpanExporter,
}

impl FakeStages {
    /// Every stage succeeds with a release action.
    pub fn all(outcome: Outcome) -> Self {
        Self {
            logger: outcome,
            stats: outcome,
            profiler: outcome,
            tracer: outcome,
            journal: Journal::default(),
            spans: InMemorySpanExporter::default(),
        }
    }
}

struct FakeProfiler {
    journal: Journal,
    outcome: Outcome,
}

impl Profiler for FakeProfiler {
    fn stop(&self) -> Result<(), ProfileError> {
        (self.journal.release_action(Stage::Profiler, self.outcome))();
        Ok(())
    }
}

#[async_trait]
impl Stages for FakeStages {
    async fn acquire_logger(
        &self,
        _config: &LogConfig,
        _opts: LoggerOptions,
    ) -> Result<Acquired<Logger>, LogError> {
        self.journal.attempt(Stage::Logger);
        if self.logger == Outcome::Fail {
            return Err(LogError::InvalidLevel("bogus".to_string()));
        }
        Ok(self.journal.acquired(Stage::Logger, self.logger, Logger::discard()))
    }

    async fn acquire_statter(
        &self,
        _config: &StatsConfig,
        _log: &Logger,
    ) -> Result<Acquired<Statter>, StatsError> {
        self.journal.attempt(Stage::Stats);
        if self.stats == Outcome::Fail {
            return Err(StatsError::UnsupportedBackend("fake".to_string()));
        }
        Ok(self.journal.acquired(Stage::Stats, self.stats, Statter::discard()))
    }

    async fn acquire_profiler(
        &self,
        _config: &ProfilingConfig,
        _service: &str,
        log: &Logger,
    ) -> Result<Acquired<Profiling>, ProfileError> {
        self.journal.attempt(Stage::Profiler);
        match self.profiler {
            Outcome::Fail => Err(ProfileError::ConflictingAuth),
            Outcome::NoRelease => Ok(Acquired::bare(Profiling::Absent)),
            outcome => {
                let profiler = Arc::new(FakeProfiler {
                    journal: self.journal.clone(),
                    outcome,
                });
                Ok(profiling::with_stop(profiler, log))
            }
        }
    }

    async fn acquire_tracer_provider(
        &self,
        _config: &TracingConfig,
        _log: &Logger,
        _attrs: Vec<KeyValue>,
    ) -> Result<Acquired<SdkTracerProvider>, TraceError> {
        self.journal.attempt(Stage::Tracer);
        if self.tracer == Outcome::Fail {
            return Err(TraceError::UnsupportedExporter("fake".to_string()));
        }
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(self.spans.clone())
            .build();
        Ok(self.journal.acquired(Stage::Tracer, self.tracer, provider))
    }
}

/// In-memory sink for log output.
#[derive(Clone, Default)]
pub struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    pub fn make_writer(&self) -> BoxMakeWriter {
        let sink = self.clone();
        BoxMakeWriter::new(move || sink.clone())
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A localhost port that was free a moment ago.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
