//! StatsD reporter with DogStatsD-style tags.
//!
//! Lines are buffered and sent over UDP when the buffer would exceed
//! `flushBytes` or every `flushInterval`, whichever comes first.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};
use url::Url;

use super::{Reporter, StatsError};
use crate::cli::parse_duration;
use crate::logging::Logger;

/// Default packet size limit, sized to stay under a typical MTU.
pub const DEFAULT_FLUSH_BYTES: usize = 1432;

/// Default statsd port when the DSN has none.
pub const DEFAULT_PORT: u16 = 8125;

/// Buffers statsd lines and pushes them over UDP.
pub struct StatsdReporter {
    inner: Arc<Inner>,
    stop: Mutex<Option<Sender<()>>>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

struct Inner {
    socket: UdpSocket,
    buf: Mutex<String>,
    flush_bytes: usize,
    log: Logger,
}

impl StatsdReporter {
    /// Connect to the address in `dsn` and start the flusher thread.
    ///
    /// `flushInterval` in the DSN overrides `interval`.
    pub fn connect(dsn: &Url, interval: Duration, log: Logger) -> Result<Self, StatsError> {
        let mut flush_bytes = DEFAULT_FLUSH_BYTES;
        let mut flush_interval = interval;
        for (name, value) in dsn.query_pairs() {
            match name.as_ref() {
                "flushBytes" => {
                    flush_bytes = value.parse().map_err(|e: std::num::ParseIntError| {
                        StatsError::InvalidOption {
                            name: "flushBytes",
                            value: value.to_string(),
                            reason: e.to_string(),
                        }
                    })?;
                }
                "flushInterval" => {
                    flush_interval = parse_duration(&value).map_err(|reason| StatsError::InvalidOption {
                        name: "flushInterval",
                        value: value.to_string(),
                        reason,
                    })?;
                }
                _ => {}
            }
        }
        if flush_interval.is_zero() {
            return Err(StatsError::InvalidOption {
                name: "flushInterval",
                value: format!("{flush_interval:?}"),
                reason: "must be greater than zero".to_string(),
            });
        }

        let addr = resolve(dsn)?;
        let local = match addr {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(addr)?;

        let inner = Arc::new(Inner {
            socket,
            buf: Mutex::new(String::with_capacity(flush_bytes)),
            flush_bytes,
            log,
        });

        let (stop, stopped) = mpsc::channel::<()>();
        let flusher_inner = inner.clone();
        let flusher = thread::Builder::new()
            .name("statsd-flush".to_string())
            .spawn(move || {
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(flush_interval) {
                    flusher_inner.flush();
                }
                flusher_inner.flush();
            })?;

        Ok(Self {
            inner,
            stop: Mutex::new(Some(stop)),
            flusher: Mutex::new(Some(flusher)),
        })
    }

    fn handle(&self, key: &Key) -> Arc<Handle> {
        Arc::new(Handle {
            inner: self.inner.clone(),
            name: key.name().to_string(),
            tags: render_tags(key),
        })
    }
}

/// Resolve the collector address, preferring IPv4 when a name has both.
/// A DSN without a host targets localhost.
fn resolve(dsn: &Url) -> Result<SocketAddr, StatsError> {
    let addrs: Vec<SocketAddr> = match dsn.host_str().filter(|h| !h.is_empty()) {
        Some(_) => dsn.socket_addrs(|| Some(DEFAULT_PORT))?,
        None => ("localhost", dsn.port().unwrap_or(DEFAULT_PORT))
            .to_socket_addrs()?
            .collect(),
    };
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| StatsError::InvalidDsn {
            dsn: dsn.to_string(),
            source: url::ParseError::EmptyHost,
        })
}

fn render_tags(key: &Key) -> String {
    let tags: Vec<String> = key
        .labels()
        .map(|l| format!("{}:{}", l.key(), l.value()))
        .collect();
    if tags.is_empty() {
        String::new()
    } else {
        format!("|#{}", tags.join(","))
    }
}

impl Inner {
    fn write(&self, line: String) {
        let mut buf = match self.buf.lock() {
            Ok(b) => b,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !buf.is_empty() && buf.len() + line.len() + 1 > self.flush_bytes {
            self.send(&buf);
            buf.clear();
        }
        if !buf.is_empty() {
            buf.push('\n');
        }
        buf.push_str(&line);
    }

    fn flush(&self) {
        let mut buf = match self.buf.lock() {
            Ok(b) => b,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !buf.is_empty() {
            self.send(&buf);
            buf.clear();
        }
    }

    fn send(&self, payload: &str) {
        if let Err(e) = self.socket.send(payload.as_bytes()) {
            self.log.log(
                tracing::Level::ERROR,
                "statsd: failed to send",
                &[("error", &e.to_string())],
            );
        }
    }
}

struct Handle {
    inner: Arc<Inner>,
    name: String,
    tags: String,
}

impl Handle {
    fn write(&self, value: impl std::fmt::Display, kind: &str) {
        self.inner
            .write(format!("{}:{value}|{kind}{}", self.name, self.tags));
    }
}

impl CounterFn for Handle {
    fn increment(&self, value: u64) {
        self.write(value, "c");
    }

    fn absolute(&self, value: u64) {
        self.write(value, "g");
    }
}

impl GaugeFn for Handle {
    fn increment(&self, value: f64) {
        self.write(format!("+{value}"), "g");
    }

    fn decrement(&self, value: f64) {
        self.write(format!("-{value}"), "g");
    }

    fn set(&self, value: f64) {
        self.write(value, "g");
    }
}

impl HistogramFn for Handle {
    fn record(&self, value: f64) {
        self.write(value, "h");
    }
}

impl Recorder for StatsdReporter {
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

impl Reporter for StatsdReporter {
    /// Stop the flusher, which sends whatever is still buffered.
    fn close(&self) -> Result<(), StatsError> {
        if let Ok(mut stop) = self.stop.lock() {
            stop.take();
        }
        let flusher = match self.flusher.lock() {
            Ok(mut f) => f.take(),
            Err(_) => None,
        };
        if let Some(flusher) = flusher {
            if flusher.join().is_err() {
                self.inner.flush();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::Statter;

    fn receiver() -> (UdpSocket, Url) {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        let dsn = Url::parse(&format!("statsd://127.0.0.1:{port}?flushInterval=1h")).unwrap();
        (socket, dsn)
    }

    fn recv(socket: &UdpSocket) -> String {
        let mut buf = [0u8; 2048];
        let n = socket.recv(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[test]
    fn test_close_flushes_buffer() {
        let (socket, dsn) = receiver();
        let reporter = StatsdReporter::connect(&dsn, Duration::from_secs(1), Logger::discard()).unwrap();
        let stats = Statter::new(Arc::new(reporter)).with("api", [("env", "prod")]);

        stats.counter("requests", 1);
        stats.gauge("workers", 4.0);
        stats.histogram("latency", 0.5);
        stats.close().unwrap();

        assert_eq!(
            recv(&socket),
            "api.requests:1|c|#env:prod\napi.workers:4|g|#env:prod\napi.latency:0.5|h|#env:prod"
        );
    }

    #[test]
    fn test_flush_bytes_splits_packets() {
        let (socket, _) = receiver();
        let port = socket.local_addr().unwrap().port();
        let dsn = Url::parse(&format!("statsd://127.0.0.1:{port}?flushBytes=16&flushInterval=1h")).unwrap();
        let reporter = StatsdReporter::connect(&dsn, Duration::from_secs(1), Logger::discard()).unwrap();
        let stats = Statter::new(Arc::new(reporter));

        stats.counter("first", 1);
        stats.counter("second", 2);
        assert_eq!(recv(&socket), "first:1|c");

        stats.close().unwrap();
        assert_eq!(recv(&socket), "second:2|c");
    }

    #[test]
    fn test_rejects_bad_options() {
        let dsn = Url::parse("statsd://127.0.0.1:8125?flushBytes=lots").unwrap();
        let err = StatsdReporter::connect(&dsn, Duration::from_secs(1), Logger::discard())
            .err()
            .unwrap();
        assert!(matches!(err, StatsError::InvalidOption { name: "flushBytes", .. }));

        let dsn = Url::parse("statsd://127.0.0.1:8125?flushInterval=0s").unwrap();
        let err = StatsdReporter::connect(&dsn, Duration::from_secs(1), Logger::discard())
            .err()
            .unwrap();
        assert!(matches!(err, StatsError::InvalidOption { name: "flushInterval", .. }));

        let dsn = Url::parse("statsd://127.0.0.1:8125?flushInterval=99999999999999999999999h").unwrap();
        let err = StatsdReporter::connect(&dsn, Duration::from_secs(1), Logger::discard())
            .err()
            .unwrap();
        assert!(matches!(err, StatsError::InvalidOption { name: "flushInterval", .. }));
    }

    #[test]
    fn test_ipv6_collector() {
        let Ok(socket) = UdpSocket::bind("[::1]:0") else {
            // No IPv6 loopback on this host.
            return;
        };
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = socket.local_addr().unwrap().port();
        let dsn = Url::parse(&format!("statsd://[::1]:{port}?flushInterval=1h")).unwrap();

        let reporter = StatsdReporter::connect(&dsn, Duration::from_secs(1), Logger::discard()).unwrap();
        let stats = Statter::new(Arc::new(reporter));
        stats.counter("requests", 1);
        stats.close().unwrap();

        assert_eq!(recv(&socket), "requests:1|c");
    }

    #[test]
    fn test_second_close_is_harmless() {
        let (_socket, dsn) = receiver();
        let reporter = StatsdReporter::connect(&dsn, Duration::from_secs(1), Logger::discard()).unwrap();
        assert!(reporter.close().is_ok());
        assert!(reporter.close().is_ok());
    }
}
