//! Distributed tracing.
//!
//! # Responsibilities
//! - Build an OpenTelemetry tracer provider from the `tracing.*` flags
//! - Export spans to Zipkin or an OTLP collector (HTTP or gRPC)
//! - Shut the provider down on release, flushing queued spans
//!
//! # Design Decisions
//! - No exporter configured yields a working provider that exports nothing
//! - Parent-based sampling: a sampled parent keeps its children, roots are
//!   sampled at `tracing.ratio`
//! - Endpoints without a scheme get `http://` when insecure, `https://`
//!   otherwise. `https` gRPC endpoints use TLS with the bundled webpki roots
//! - The provider is not installed globally; the observer hands out tracers

pub mod profiled;

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::global::ObjectSafeTracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig, WithTonicConfig};
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use thiserror::Error;
use tonic::metadata::{MetadataKey, MetadataMap, MetadataValue};
use tonic::transport::ClientTlsConfig;

use crate::config::TracingConfig;
use crate::logging::Logger;
use crate::observe::Acquired;
use crate::tags::{self, TagError};

pub use profiled::{ProfilingTracerProvider, PROFILE_ID_KEY};

/// A tracer provider with its concrete type erased.
pub type SharedTracerProvider = Arc<dyn ObjectSafeTracerProvider + Send + Sync>;

/// Path OTLP/HTTP collectors receive spans on.
pub const OTLP_HTTP_TRACES_PATH: &str = "/v1/traces";

/// Errors produced while building a tracer provider.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("unsupported tracing exporter {0:?}")]
    UnsupportedExporter(String),

    #[error("tracing ratio {0} is outside [0, 1]")]
    InvalidRatio(f64),

    #[error("invalid tracing tags: {0}")]
    InvalidTags(#[source] TagError),

    #[error("invalid tracing headers: {0}")]
    InvalidHeaders(#[source] TagError),

    #[error("invalid tracing header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("failed to build {exporter} exporter: {reason}")]
    Exporter {
        exporter: &'static str,
        reason: String,
    },
}

/// Span exporters selectable with `tracing.exporter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exporter {
    Zipkin,
    OtlpHttp,
    OtlpGrpc,
}

impl Exporter {
    /// Parse an exporter name. Empty means tracing is disabled.
    pub fn parse(s: &str) -> Result<Option<Self>, TraceError> {
        match s.trim().to_lowercase().as_str() {
            "" => Ok(None),
            "zipkin" => Ok(Some(Exporter::Zipkin)),
            "otlphttp" => Ok(Some(Exporter::OtlpHttp)),
            "otlpgrpc" => Ok(Some(Exporter::OtlpGrpc)),
            _ => Err(TraceError::UnsupportedExporter(s.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Exporter::Zipkin => "zipkin",
            Exporter::OtlpHttp => "otlphttp",
            Exporter::OtlpGrpc => "otlpgrpc",
        }
    }
}

/// Build a tracer provider from the `tracing.*` configuration.
///
/// `attrs` become resource attributes, followed by `tracing.tags`. The
/// release action shuts the provider down, logging any failure.
pub fn acquire_tracer_provider(
    config: &TracingConfig,
    log: &Logger,
    attrs: Vec<KeyValue>,
) -> Result<Acquired<SdkTracerProvider>, TraceError> {
    let exporter = Exporter::parse(&config.exporter)?;
    if !(0.0..=1.0).contains(&config.ratio) {
        return Err(TraceError::InvalidRatio(config.ratio));
    }
    let tags = tags::parse(&config.tags).map_err(TraceError::InvalidTags)?;
    let headers = tags::parse(&config.headers).map_err(TraceError::InvalidHeaders)?;

    let mut attributes = attrs;
    attributes.extend(tags.into_iter().map(|(k, v)| KeyValue::new(k, v)));
    let resource = Resource::builder_empty().with_attributes(attributes).build();

    let mut builder = SdkTracerProvider::builder()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(config.ratio))))
        .with_resource(resource);

    if let Some(exporter) = exporter {
        let endpoint = endpoint(exporter, &config.endpoint, config.endpoint_insecure);
        let fail = |reason: String| TraceError::Exporter {
            exporter: exporter.name(),
            reason,
        };
        builder = match exporter {
            Exporter::Zipkin => {
                let mut zipkin = opentelemetry_zipkin::ZipkinExporter::builder();
                if let Some(endpoint) = endpoint {
                    zipkin = zipkin.with_collector_endpoint(endpoint);
                }
                builder.with_batch_exporter(zipkin.build().map_err(|e| fail(e.to_string()))?)
            }
            Exporter::OtlpHttp => {
                let mut otlp = opentelemetry_otlp::SpanExporter::builder()
                    .with_http()
                    .with_headers(headers.into_iter().collect::<HashMap<_, _>>());
                if let Some(endpoint) = endpoint {
                    otlp = otlp.with_endpoint(endpoint);
                }
                builder.with_batch_exporter(otlp.build().map_err(|e| fail(e.to_string()))?)
            }
            Exporter::OtlpGrpc => {
                let mut otlp = opentelemetry_otlp::SpanExporter::builder()
                    .with_tonic()
                    .with_metadata(metadata(&headers)?);
                if let Some(tls) = grpc_tls(endpoint.as_deref()) {
                    otlp = otlp.with_tls_config(tls);
                }
                if let Some(endpoint) = endpoint {
                    otlp = otlp.with_endpoint(endpoint);
                }
                builder.with_batch_exporter(otlp.build().map_err(|e| fail(e.to_string()))?)
            }
        };
        log.log(
            tracing::Level::DEBUG,
            "tracing exporter configured",
            &[("exporter", exporter.name())],
        );
    }

    let provider = builder.build();
    let shutdown = provider.clone();
    let log = log.clone();
    Ok(Acquired::with_release(provider, move || {
        if let Err(e) = shutdown.shutdown() {
            log.log(
                tracing::Level::ERROR,
                "failed to shut down tracer provider",
                &[("error", &e.to_string())],
            );
        }
    }))
}

/// Normalize a configured endpoint. `None` keeps the exporter's default.
fn endpoint(exporter: Exporter, raw: &str, insecure: bool) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let mut endpoint = if raw.contains("://") {
        raw.to_string()
    } else if insecure {
        format!("http://{raw}")
    } else {
        format!("https://{raw}")
    };

    if exporter == Exporter::OtlpHttp {
        let has_path = endpoint
            .split_once("://")
            .map(|(_, rest)| rest.trim_end_matches('/').contains('/'))
            .unwrap_or(false);
        if !has_path {
            endpoint = format!("{}{OTLP_HTTP_TRACES_PATH}", endpoint.trim_end_matches('/'));
        }
    }
    Some(endpoint)
}

/// TLS settings for a gRPC endpoint. Only `https` endpoints get any.
fn grpc_tls(endpoint: Option<&str>) -> Option<ClientTlsConfig> {
    endpoint
        .filter(|e| e.starts_with("https://"))
        .map(|_| ClientTlsConfig::new().with_enabled_roots())
}

fn metadata(headers: &[(String, String)]) -> Result<MetadataMap, TraceError> {
    let mut map = MetadataMap::new();
    for (name, value) in headers {
        let invalid = |reason: String| TraceError::InvalidHeader {
            name: name.clone(),
            reason,
        };
        let key = MetadataKey::from_bytes(name.to_lowercase().as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let value = MetadataValue::try_from(value.as_str()).map_err(|e| invalid(e.to_string()))?;
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{Tracer as _, TracerProvider as _};

    fn config(exporter: &str) -> TracingConfig {
        TracingConfig {
            exporter: exporter.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_exporter_builds_provider() {
        let acquired = acquire_tracer_provider(&config(""), &Logger::discard(), Vec::new()).unwrap();
        let tracer = acquired.resource.tracer("test");
        tracer.in_span("noop", |_| {});
        acquired.release.expect("provider release")();
    }

    #[test]
    fn test_rejects_unknown_exporter() {
        let err = acquire_tracer_provider(&config("jaeger"), &Logger::discard(), Vec::new()).unwrap_err();
        assert!(matches!(err, TraceError::UnsupportedExporter(ref e) if e == "jaeger"));
    }

    #[test]
    fn test_rejects_bad_ratio_tags_and_headers() {
        let mut cfg = config("");
        cfg.ratio = 1.5;
        assert!(matches!(
            acquire_tracer_provider(&cfg, &Logger::discard(), Vec::new()),
            Err(TraceError::InvalidRatio(_))
        ));

        let mut cfg = config("");
        cfg.tags = vec!["broken".to_string()];
        assert!(matches!(
            acquire_tracer_provider(&cfg, &Logger::discard(), Vec::new()),
            Err(TraceError::InvalidTags(_))
        ));

        let mut cfg = config("otlphttp");
        cfg.headers = vec!["broken".to_string()];
        assert!(matches!(
            acquire_tracer_provider(&cfg, &Logger::discard(), Vec::new()),
            Err(TraceError::InvalidHeaders(_))
        ));
    }

    #[test]
    fn test_zipkin_exporter() {
        let mut cfg = config("zipkin");
        cfg.endpoint = "http://localhost:9411/api/v2/spans".to_string();
        let acquired = acquire_tracer_provider(&cfg, &Logger::discard(), Vec::new()).unwrap();
        assert!(acquired.release.is_some());
    }

    #[test]
    fn test_endpoint_normalization() {
        assert_eq!(endpoint(Exporter::Zipkin, "", false), None);
        assert_eq!(
            endpoint(Exporter::OtlpGrpc, "collector:4317", true),
            Some("http://collector:4317".to_string())
        );
        assert_eq!(
            endpoint(Exporter::OtlpGrpc, "collector:4317", false),
            Some("https://collector:4317".to_string())
        );
        assert_eq!(
            endpoint(Exporter::OtlpHttp, "collector:4318", true),
            Some("http://collector:4318/v1/traces".to_string())
        );
        assert_eq!(
            endpoint(Exporter::OtlpHttp, "https://collector:4318/custom", false),
            Some("https://collector:4318/custom".to_string())
        );
    }

    #[test]
    fn test_grpc_tls_follows_scheme() {
        let secure = endpoint(Exporter::OtlpGrpc, "collector:4317", false);
        assert!(grpc_tls(secure.as_deref()).is_some());

        let insecure = endpoint(Exporter::OtlpGrpc, "collector:4317", true);
        assert!(grpc_tls(insecure.as_deref()).is_none());
        assert!(grpc_tls(None).is_none());
    }

    #[tokio::test]
    async fn test_secure_grpc_exporter_builds() {
        let mut cfg = config("otlpgrpc");
        cfg.endpoint = "collector.example.com:4317".to_string();
        let acquired = acquire_tracer_provider(&cfg, &Logger::discard(), Vec::new()).unwrap();
        assert!(acquired.release.is_some());
    }

    #[test]
    fn test_grpc_metadata() {
        let map = metadata(&[("X-Api-Key".to_string(), "secret".to_string())]).unwrap();
        assert_eq!(map.get("x-api-key").unwrap(), "secret");

        let err = metadata(&[("bad key".to_string(), "v".to_string())]).unwrap_err();
        assert!(matches!(err, TraceError::InvalidHeader { .. }));
    }
}
