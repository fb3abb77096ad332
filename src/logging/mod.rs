//! Structured logging.
//!
//! # Responsibilities
//! - Build the service logger from the `log.*` flags
//! - Carry context fields (`svc`, `log.ctx`) onto every line
//! - Give later stages a logger to report through
//!
//! # Design Decisions
//! - Uses tracing crate for structured logging
//! - The logger owns a `tracing::Dispatch` instead of installing a global
//!   subscriber, so several observers can live in one process
//! - logfmt by default, JSON and colored console on demand; context pairs
//!   are written as top-level keys in every format
//! - Log level from flags, `RUST_LOG` overrides it

pub mod clock;
pub mod format;

use std::sync::Arc;

use thiserror::Error;
use tracing::dispatcher::{self, Dispatch, SetGlobalDefaultError};
use tracing::Level;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use self::format::{encode_ctx, LineFormat};

use crate::config::LogConfig;
use crate::observe::Acquired;
use crate::tags::{self, TagError};

pub use clock::{CachedClock, DEFAULT_TIME_FORMAT};

// The field name must match `format::CTX_FIELD`.
macro_rules! emit {
    ($level:expr, $ctx:expr, $msg:expr) => {
        match &$ctx {
            None => tracing::event!($level, "{}", $msg),
            Some(ctx) => tracing::event!($level, logger.ctx = %ctx, "{}", $msg),
        }
    };
}

/// Errors produced while building a logger.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("invalid log level {0:?}")]
    InvalidLevel(String),

    #[error("invalid log time format {0:?}")]
    InvalidTimeFormat(String),

    #[error("invalid log context: {0}")]
    InvalidContext(#[from] TagError),

    #[error("failed to start log clock: {0}")]
    Clock(#[from] std::io::Error),
}

/// Log output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Single-line `key=value` output without colors.
    Logfmt,
    /// One JSON object per line (machine-readable).
    Json,
    /// `key=value` output with a colored level (human-readable).
    Console,
}

impl LogFormat {
    /// Parse log format from string. Unknown formats fall back to logfmt.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "console" => LogFormat::Console,
            _ => LogFormat::Logfmt,
        }
    }
}

/// Parse a log level. Empty means `info`; `crit` is an alias of `error`.
pub fn parse_level(s: &str) -> Result<Level, LogError> {
    let lowered = s.trim().to_lowercase();
    match lowered.as_str() {
        "" => Ok(Level::INFO),
        "crit" => Ok(Level::ERROR),
        "trace" | "debug" | "info" | "warn" | "error" => lowered
            .parse::<Level>()
            .map_err(|_| LogError::InvalidLevel(s.to_string())),
        _ => Err(LogError::InvalidLevel(s.to_string())),
    }
}

/// Options that are not driven by flags.
#[derive(Default)]
pub struct LoggerOptions {
    /// Destination of log lines. Defaults to stdout.
    pub writer: Option<BoxMakeWriter>,

    /// Prefix lines with a timestamp from a [`CachedClock`].
    pub timestamps: bool,

    /// strftime layout of the timestamp. Defaults to [`DEFAULT_TIME_FORMAT`].
    pub time_format: Option<String>,
}

/// A structured logger bound to its own dispatcher.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    fields: Arc<[(String, String)]>,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").field("fields", &self.fields).finish()
    }
}

impl Logger {
    /// Wrap an existing dispatcher.
    pub fn new(dispatch: Dispatch) -> Self {
        Self {
            dispatch,
            fields: Arc::from(Vec::new()),
        }
    }

    /// A logger that drops every event.
    pub fn discard() -> Self {
        Self::new(Dispatch::none())
    }

    /// Return a logger that appends `fields` to this logger's context.
    pub fn with<K, V>(&self, fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged: Vec<(String, String)> = self.fields.to_vec();
        merged.extend(fields.into_iter().map(|(k, v)| (k.into(), v.into())));
        Self {
            dispatch: self.dispatch.clone(),
            fields: Arc::from(merged),
        }
    }

    /// Context fields carried by this logger.
    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// The underlying dispatcher.
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Run `f` with this logger as the thread's default subscriber, so plain
    /// `tracing` macros inside it land here.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        dispatcher::with_default(&self.dispatch, f)
    }

    /// Install this logger as the process-wide default subscriber.
    pub fn install(&self) -> Result<(), SetGlobalDefaultError> {
        dispatcher::set_global_default(self.dispatch.clone())
    }

    /// Emit `msg` at `level` with the context fields plus `extra`.
    pub fn log(&self, level: Level, msg: &str, extra: &[(&str, &str)]) {
        let ctx = self.render_ctx(extra);
        self.in_scope(|| {
            if level == Level::ERROR {
                emit!(Level::ERROR, ctx, msg);
            } else if level == Level::WARN {
                emit!(Level::WARN, ctx, msg);
            } else if level == Level::INFO {
                emit!(Level::INFO, ctx, msg);
            } else if level == Level::DEBUG {
                emit!(Level::DEBUG, ctx, msg);
            } else {
                emit!(Level::TRACE, ctx, msg);
            }
        });
    }

    pub fn trace(&self, msg: &str) {
        self.log(Level::TRACE, msg, &[]);
    }

    pub fn debug(&self, msg: &str) {
        self.log(Level::DEBUG, msg, &[]);
    }

    pub fn info(&self, msg: &str) {
        self.log(Level::INFO, msg, &[]);
    }

    pub fn warn(&self, msg: &str) {
        self.log(Level::WARN, msg, &[]);
    }

    pub fn error(&self, msg: &str) {
        self.log(Level::ERROR, msg, &[]);
    }

    fn render_ctx(&self, extra: &[(&str, &str)]) -> Option<String> {
        if self.fields.is_empty() && extra.is_empty() {
            return None;
        }
        let pairs: Vec<(&str, &str)> = self
            .fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .chain(extra.iter().copied())
            .collect();
        Some(encode_ctx(&pairs))
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Build a logger from the `log.*` configuration.
///
/// The release action, when present, stops the timestamp clock.
pub fn acquire_logger(config: &LogConfig, opts: LoggerOptions) -> Result<Acquired<Logger>, LogError> {
    let level = parse_level(&config.level)?;
    let ctx = tags::parse(&config.ctx)?;
    let format = LogFormat::parse(&config.format);

    let writer = opts
        .writer
        .unwrap_or_else(|| BoxMakeWriter::new(std::io::stdout));

    let (layer, release) = if opts.timestamps {
        let time_format = opts
            .time_format
            .unwrap_or_else(|| DEFAULT_TIME_FORMAT.to_string());
        if !clock::is_valid_format(&time_format) {
            return Err(LogError::InvalidTimeFormat(time_format));
        }
        let (clock, stop) = CachedClock::start(&time_format)?;
        (format_layer(format, writer, clock), Some(stop))
    } else {
        (format_layer(format, writer, ()), None)
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let subscriber = tracing_subscriber::registry().with(layer).with(filter);
    let logger = Logger::new(Dispatch::new(subscriber)).with(ctx);

    Ok(Acquired {
        resource: logger,
        release,
    })
}

fn format_layer<T>(format: LogFormat, writer: BoxMakeWriter, timer: T) -> BoxedLayer
where
    T: FormatTime + Send + Sync + 'static,
{
    fmt::layer()
        .with_writer(writer)
        .event_format(LineFormat::new(format, timer))
        .boxed()
}
