//! Prometheus text exposition.
//!
//! # Responsibilities
//! - Record measurements into a `metrics-exporter-prometheus` registry
//! - Serve the registry on `GET /metrics` when the DSN names a host
//!
//! # Design Decisions
//! - The listener runs as a tokio task; bind and serve errors are logged
//!   with `server=prometheus` and never stop the service
//! - Closing the reporter aborts the listener, so a rolled back bootstrap
//!   leaves no port bound
//! - The recorder is built without the exporter's own upkeep task; a
//!   thread drains histogram samples every [`UPKEEP_INTERVAL`] instead
//! - Metric names are sanitized by the exporter (`api.requests` is
//!   exposed as `api_requests`)

use std::net::SocketAddr;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use axum::{extract::State, routing::get, Router};
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tokio::net::TcpListener;
use tokio::task::AbortHandle;
use tower_http::timeout::TimeoutLayer;
use url::Url;

use super::{Reporter, StatsError};
use crate::logging::Logger;

/// Default exposition port when the DSN has a host but no port.
pub const DEFAULT_PORT: u16 = 9090;

/// Path the registry is served on.
pub const METRICS_PATH: &str = "/metrics";

/// Scrape request timeout.
pub const SCRAPE_TIMEOUT: Duration = Duration::from_secs(10);

/// How often histogram samples are drained into their summaries.
pub const UPKEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Records into a Prometheus registry.
pub struct PrometheusReporter {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
    listener: Mutex<Option<AbortHandle>>,
    stop: Mutex<Option<Sender<()>>>,
    upkeep: Mutex<Option<JoinHandle<()>>>,
}

impl PrometheusReporter {
    /// Build a registry with neither a listener nor an upkeep thread.
    pub fn new() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        Self {
            recorder,
            handle,
            listener: Mutex::new(None),
            stop: Mutex::new(None),
            upkeep: Mutex::new(None),
        }
    }

    /// Build a registry, start its upkeep thread and, if `dsn` names a
    /// host, serve it.
    pub fn serve(dsn: &Url, log: Logger) -> Result<Self, StatsError> {
        let reporter = Self::new().with_upkeep(UPKEEP_INTERVAL)?;
        let Some(host) = dsn.host_str().filter(|h| !h.is_empty()) else {
            return Ok(reporter);
        };

        // Dropping the reporter on this path disconnects the upkeep thread.
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| StatsError::NoRuntime { backend: "prometheus" })?;
        let addr = format!("{host}:{}", dsn.port().unwrap_or(DEFAULT_PORT));
        let task = runtime.spawn(run_listener(addr, reporter.handle(), log));
        if let Ok(mut listener) = reporter.listener.lock() {
            *listener = Some(task.abort_handle());
        }
        Ok(reporter)
    }

    /// Drain histogram samples every `interval` until closed or dropped.
    pub fn with_upkeep(self, interval: Duration) -> Result<Self, StatsError> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = self.handle();
        let upkeep = thread::Builder::new()
            .name("prometheus-upkeep".to_string())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    handle.run_upkeep();
                }
            })?;

        Ok(Self {
            stop: Mutex::new(Some(stop)),
            upkeep: Mutex::new(Some(upkeep)),
            ..self
        })
    }

    /// Handle onto the registry, for rendering.
    pub fn handle(&self) -> PrometheusHandle {
        self.handle.clone()
    }

    /// Render the registry in the text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for PrometheusReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the exposition router.
#[allow(deprecated)]
pub fn router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route(METRICS_PATH, get(metrics_handler))
        .with_state(handle)
        .layer(TimeoutLayer::new(SCRAPE_TIMEOUT))
}

async fn metrics_handler(State(handle): State<PrometheusHandle>) -> String {
    handle.render()
}

async fn run_listener(addr: String, handle: PrometheusHandle, log: Logger) {
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log.log(
                tracing::Level::ERROR,
                "failed to bind metrics listener",
                &[("server", "prometheus"), ("addr", &addr), ("error", &e.to_string())],
            );
            return;
        }
    };

    let bound = listener
        .local_addr()
        .map(|a: SocketAddr| a.to_string())
        .unwrap_or(addr);
    log.log(
        tracing::Level::INFO,
        "serving metrics",
        &[("server", "prometheus"), ("addr", &bound)],
    );

    if let Err(e) = axum::serve(listener, router(handle)).await {
        log.log(
            tracing::Level::ERROR,
            "metrics server stopped",
            &[("server", "prometheus"), ("error", &e.to_string())],
        );
    }
}

impl Recorder for PrometheusReporter {
    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.recorder.describe_counter(key, unit, description);
    }

    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.recorder.describe_gauge(key, unit, description);
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.recorder.describe_histogram(key, unit, description);
    }

    fn register_counter(&self, key: &Key, metadata: &Metadata<'_>) -> Counter {
        self.recorder.register_counter(key, metadata)
    }

    fn register_gauge(&self, key: &Key, metadata: &Metadata<'_>) -> Gauge {
        self.recorder.register_gauge(key, metadata)
    }

    fn register_histogram(&self, key: &Key, metadata: &Metadata<'_>) -> Histogram {
        self.recorder.register_histogram(key, metadata)
    }
}

impl Reporter for PrometheusReporter {
    /// Abort the listener and stop the upkeep thread after a last drain.
    fn close(&self) -> Result<(), StatsError> {
        let listener = self.listener.lock().ok().and_then(|mut l| l.take());
        if let Some(listener) = listener {
            listener.abort();
        }

        if let Ok(mut stop) = self.stop.lock() {
            stop.take();
        }
        let upkeep = self.upkeep.lock().ok().and_then(|mut u| u.take());
        if let Some(upkeep) = upkeep {
            if upkeep.join().is_err() {
                return Err(StatsError::Io(std::io::Error::other(
                    "prometheus upkeep thread panicked",
                )));
            }
        }
        self.handle.run_upkeep();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Statter;
    use std::sync::Arc;

    #[test]
    fn test_render_sanitizes_names() {
        let reporter = Arc::new(PrometheusReporter::new());
        let stats = Statter::new(reporter.clone()).with("api", [("env", "prod")]);
        stats.counter("requests", 3);
        stats.gauge("workers", 2.0);

        let body = reporter.render();
        assert!(body.contains("api_requests{env=\"prod\"} 3"), "{body}");
        assert!(body.contains("api_workers{env=\"prod\"} 2"), "{body}");
    }

    #[test]
    fn test_host_without_runtime_is_an_error() {
        let dsn = Url::parse("prometheus://127.0.0.1:0").unwrap();
        let err = PrometheusReporter::serve(&dsn, Logger::discard()).err().unwrap();
        assert!(matches!(err, StatsError::NoRuntime { .. }));
    }

    #[test]
    fn test_no_host_needs_no_runtime() {
        let dsn = Url::parse("prometheus://").unwrap();
        assert!(PrometheusReporter::serve(&dsn, Logger::discard()).is_ok());
    }

    fn upkeep_running(reporter: &PrometheusReporter) -> bool {
        reporter
            .upkeep
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    #[test]
    fn test_close_stops_upkeep_thread() {
        let dsn = Url::parse("prom://").unwrap();
        let reporter = PrometheusReporter::serve(&dsn, Logger::discard()).unwrap();
        assert!(upkeep_running(&reporter));

        let stats = Statter::new(Arc::new(reporter)).with("api", [("env", "prod")]);
        stats.histogram("latency", 0.25);
        stats.timing("request", Duration::from_millis(40));
        stats.close().unwrap();
        stats.close().unwrap();
    }

    #[test]
    fn test_upkeep_drains_on_interval() {
        let reporter = Arc::new(
            PrometheusReporter::new()
                .with_upkeep(Duration::from_millis(5))
                .unwrap(),
        );
        Statter::new(reporter.clone()).histogram("latency", 0.5);
        std::thread::sleep(Duration::from_millis(30));
        assert!(upkeep_running(&reporter));

        reporter.close().unwrap();
        assert!(reporter.upkeep.lock().unwrap().is_none());
        assert!(reporter.render().contains("latency_count 1"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_close_aborts_listener() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let dsn = Url::parse(&format!("prometheus://127.0.0.1:{port}")).unwrap();
        let reporter = PrometheusReporter::serve(&dsn, Logger::discard()).unwrap();

        let mut bound = false;
        for _ in 0..50 {
            if std::net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
                bound = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(bound, "listener never came up on {port}");

        reporter.close().unwrap();
        let mut released = false;
        for _ in 0..50 {
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(released, "listener still bound on {port}");
    }

    #[tokio::test]
    async fn test_bind_failure_is_logged_not_returned() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let dsn = Url::parse(&format!("vm://127.0.0.1:{port}")).unwrap();
        assert!(PrometheusReporter::serve(&dsn, Logger::discard()).is_ok());
    }
}
