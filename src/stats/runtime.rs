//! Tokio runtime stats collector.

use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::Statter;

/// How often runtime stats are sampled.
pub const RUNTIME_INTERVAL: Duration = Duration::from_secs(30);

/// Sample the runtime once into `stats`.
pub fn collect(stats: &Statter, runtime: &Handle, started: Instant) {
    let metrics = runtime.metrics();
    stats.gauge("runtime.workers", metrics.num_workers() as f64);
    stats.gauge("runtime.tasks.alive", metrics.num_alive_tasks() as f64);
    stats.gauge("runtime.queue.depth", metrics.global_queue_depth() as f64);
    stats.gauge("runtime.uptime", started.elapsed().as_secs_f64());
}

/// Spawn a task reporting runtime stats every `interval` for the life of the
/// runtime. Returns `None` outside a tokio runtime.
pub fn spawn_runtime_collector(stats: Statter, interval: Duration) -> Option<JoinHandle<()>> {
    let runtime = Handle::try_current().ok()?;
    let started = Instant::now();
    let task_runtime = runtime.clone();
    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            collect(&stats, &task_runtime, started);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::prometheus::PrometheusReporter;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_collector_reports_gauges() {
        let reporter = Arc::new(PrometheusReporter::new());
        let stats = Statter::new(reporter.clone());

        let task = spawn_runtime_collector(stats, Duration::from_millis(10)).expect("inside runtime");
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();

        let body = reporter.render();
        assert!(body.contains("runtime_workers"), "{body}");
        assert!(body.contains("runtime_tasks_alive"), "{body}");
        assert!(body.contains("runtime_uptime"), "{body}");
    }

    #[test]
    fn test_no_runtime_no_collector() {
        assert!(spawn_runtime_collector(Statter::discard(), RUNTIME_INTERVAL).is_none());
    }
}
