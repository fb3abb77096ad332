//! Line formats.
//!
//! A [`Logger`](super::Logger) ships its context pairs on the event as one
//! JSON-encoded field; [`LineFormat`] unpacks them again so each pair is
//! written as its own key.

use std::borrow::Cow;
use std::fmt::{self, Write as _};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

use super::LogFormat;

/// Event field carrying the encoded context pairs.
pub(crate) const CTX_FIELD: &str = "logger.ctx";

/// Encode context pairs for [`CTX_FIELD`].
pub(crate) fn encode_ctx(pairs: &[(&str, &str)]) -> String {
    serde_json::to_string(pairs).unwrap_or_default()
}

/// Writes one line per event as logfmt, JSON or colored console output.
pub struct LineFormat<T> {
    format: LogFormat,
    timer: T,
}

impl<T> LineFormat<T> {
    pub fn new(format: LogFormat, timer: T) -> Self {
        Self { format, timer }
    }
}

impl<S, N, T> FormatEvent<S, N> for LineFormat<T>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    T: FormatTime,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut ts = String::new();
        self.timer.format_time(&mut Writer::new(&mut ts))?;

        let mut fields = Fields::default();
        event.record(&mut fields);
        let level = *event.metadata().level();

        match self.format {
            LogFormat::Logfmt => write_logfmt(&mut writer, &ts, level, &fields)?,
            LogFormat::Json => write_json(&mut writer, &ts, level, &fields)?,
            LogFormat::Console => write_console(&mut writer, &ts, level, &fields)?,
        }
        writeln!(writer)
    }
}

#[derive(Default)]
struct Fields {
    message: String,
    pairs: Vec<(String, String)>,
}

impl Fields {
    fn push(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = value,
            CTX_FIELD => match serde_json::from_str::<Vec<(String, String)>>(&value) {
                Ok(pairs) => self.pairs.extend(pairs),
                Err(_) => self.pairs.push((name.to_string(), value)),
            },
            _ => self.pairs.push((name.to_string(), value)),
        }
    }
}

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.push(field.name(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.push(field.name(), format!("{value:?}"));
    }
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::ERROR => "error",
        Level::WARN => "warn",
        Level::INFO => "info",
        Level::DEBUG => "debug",
        _ => "trace",
    }
}

fn json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_default()
}

/// Quote a logfmt value when it would otherwise be ambiguous.
fn logfmt_value(v: &str) -> Cow<'_, str> {
    let plain = !v.is_empty()
        && !v
            .chars()
            .any(|c| c == ' ' || c == '=' || c == '"' || c.is_control());
    if plain {
        Cow::Borrowed(v)
    } else {
        Cow::Owned(json_string(v))
    }
}

fn write_logfmt(w: &mut Writer<'_>, ts: &str, level: Level, fields: &Fields) -> fmt::Result {
    if !ts.is_empty() {
        write!(w, "ts={} ", logfmt_value(ts))?;
    }
    write!(
        w,
        "lvl={} msg={}",
        level_name(level),
        logfmt_value(&fields.message)
    )?;
    for (k, v) in &fields.pairs {
        write!(w, " {k}={}", logfmt_value(v))?;
    }
    Ok(())
}

fn write_json(w: &mut Writer<'_>, ts: &str, level: Level, fields: &Fields) -> fmt::Result {
    w.write_char('{')?;
    if !ts.is_empty() {
        write!(w, "\"ts\":{},", json_string(ts))?;
    }
    write!(
        w,
        "\"lvl\":\"{}\",\"msg\":{}",
        level_name(level),
        json_string(&fields.message)
    )?;
    for (k, v) in &fields.pairs {
        write!(w, ",{}:{}", json_string(k), json_string(v))?;
    }
    w.write_char('}')
}

fn write_console(w: &mut Writer<'_>, ts: &str, level: Level, fields: &Fields) -> fmt::Result {
    let color = match level {
        Level::ERROR => "31",
        Level::WARN => "33",
        Level::INFO => "32",
        Level::DEBUG => "36",
        _ => "90",
    };
    if !ts.is_empty() {
        write!(w, "\x1b[2m{ts}\x1b[0m ")?;
    }
    write!(
        w,
        "\x1b[{color}m{:<5}\x1b[0m {}",
        level_name(level).to_uppercase(),
        fields.message
    )?;
    for (k, v) in &fields.pairs {
        write!(w, " \x1b[2m{k}=\x1b[0m{}", logfmt_value(v))?;
    }
    Ok(())
}
