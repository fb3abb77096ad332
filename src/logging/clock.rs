//! Coarse cached clock for log timestamps.
//!
//! A background thread refreshes the current time every [`TICK`]; log lines
//! read the cached value instead of querying the system clock. Stopping the
//! ticker is the logger stage's release action.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Utc};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

use crate::observe::ReleaseAction;

/// Refresh period of the cached time.
pub const TICK: Duration = Duration::from_millis(10);

/// Default timestamp layout (RFC 3339, millisecond precision).
pub const DEFAULT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

struct ClockState {
    now_ms: AtomicI64,
    stopped: AtomicBool,
}

/// A [`FormatTime`] that prints the cached time with a strftime layout.
#[derive(Clone)]
pub struct CachedClock {
    state: Arc<ClockState>,
    format: Arc<str>,
}

impl CachedClock {
    /// Start the ticker thread.
    ///
    /// Returns the clock and the action that stops and joins the ticker.
    pub fn start(format: &str) -> std::io::Result<(Self, ReleaseAction)> {
        let state = Arc::new(ClockState {
            now_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            stopped: AtomicBool::new(false),
        });

        let ticker_state = state.clone();
        let handle = thread::Builder::new()
            .name("log-clock".to_string())
            .spawn(move || {
                while !ticker_state.stopped.load(Ordering::Acquire) {
                    thread::park_timeout(TICK);
                    ticker_state
                        .now_ms
                        .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
                }
            })?;

        let stop_state = state.clone();
        let stop: ReleaseAction = Box::new(move || {
            stop_state.stopped.store(true, Ordering::Release);
            handle.thread().unpark();
            let _ = handle.join();
        });

        let clock = Self {
            state,
            format: Arc::from(format),
        };
        Ok((clock, stop))
    }

    /// Whether the ticker has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.state.stopped.load(Ordering::Acquire)
    }

    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.state.now_ms.load(Ordering::Relaxed)).unwrap_or_default()
    }
}

impl FormatTime for CachedClock {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", self.now().format(&self.format))
    }
}

/// Check that a strftime layout only contains known specifiers.
pub fn is_valid_format(format: &str) -> bool {
    !StrftimeItems::new(format).any(|item| matches!(item, Item::Error))
}
