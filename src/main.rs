//! Example service built on cmdkit.
//!
//! Parses the shared server and monitoring flags, bootstraps an
//! [`Observer`], serves a small HTTP endpoint and tears everything down on
//! SIGINT/SIGTERM.
//!
//! ```text
//! cmdkit --service=hello --port=8080 \
//!     --log.format=json --stats.dsn=prometheus://0.0.0.0:9090
//! ```

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{extract::State, routing::get, Router};
use clap::Parser;
use opentelemetry::trace::Tracer;
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;

use cmdkit::cli::{MonitoringArgs, ServerArgs};
use cmdkit::config::{load_config, validate_config, ObserveConfig};
use cmdkit::lifecycle::{wait_for_signals, Shutdown};
use cmdkit::observe::{Observer, Options};
use cmdkit::stats::Statter;

#[derive(Debug, Parser)]
#[command(name = "cmdkit", version, about = "Example service bootstrapped by cmdkit")]
struct Cli {
    /// Name the service reports as in logs, stats and traces.
    #[arg(long, env = "SERVICE", default_value = "cmdkit")]
    service: String,

    /// Read monitoring settings from a TOML file instead of flags.
    #[arg(long, env = "CONFIG")]
    config: Option<std::path::PathBuf>,

    #[command(flatten)]
    server: ServerArgs,

    #[command(flatten)]
    monitoring: MonitoringArgs,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => {
            let config = ObserveConfig::from(&cli.monitoring);
            if let Err(errors) = validate_config(&config) {
                for error in &errors {
                    eprintln!("invalid flag {error}");
                }
                return Err(format!("{} invalid flag(s)", errors.len()).into());
            }
            config
        }
    };

    let opts = Options {
        log_timestamps: true,
        stats_runtime: true,
        ..Default::default()
    };
    let mut observer = Observer::from_cli(&config, &cli.service, opts).await?;
    if let Err(e) = observer.log().install() {
        observer.log().warn(&format!("logger not installed globally: {e}"));
    }

    tracing::info!(service = %cli.service, port = cli.server.port, "service starting");

    let tracer = observer.tracer("cmdkit");
    tracer.in_span("startup", |_| {
        observer.stats().counter("startups", 1);
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cli.server.port));
    let listener = TcpListener::bind(addr).await?;
    let shutdown = Shutdown::new();
    let server = {
        let app = app(observer.stats().clone());
        let stopped = shutdown.signalled();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(stopped)
                .await
        })
    };
    tracing::info!(address = %addr, "listening");

    let signal = wait_for_signals().await?;
    tracing::info!(signal = %signal, "shutting down");
    shutdown.trigger();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "server error"),
        Err(e) => tracing::error!(error = %e, "server task failed"),
    }

    observer.close();
    Ok(())
}

#[allow(deprecated)]
fn app(stats: Statter) -> Router {
    Router::new()
        .route("/", get(hello))
        .with_state(stats)
        .layer(TimeoutLayer::new(Duration::from_secs(10)))
}

async fn hello(State(stats): State<Statter>) -> &'static str {
    let start = Instant::now();
    stats.counter("requests", 1);
    stats.timing("request.duration", start.elapsed());
    "hello\n"
}
