//! Tracer provider decorator linking root spans to profiles.
//!
//! Root spans get a `pyroscope.profile.id` attribute holding their span id,
//! so a trace UI can jump to the profile captured while the span ran.
//! Everything else is forwarded to the wrapped provider untouched.

use opentelemetry::trace::{SpanBuilder, TraceContextExt, Tracer, TracerProvider};
use opentelemetry::trace::{Span, SpanId};
use opentelemetry::{Context, InstrumentationScope, KeyValue};

/// Attribute carrying the profile id on root spans.
pub const PROFILE_ID_KEY: &str = "pyroscope.profile.id";

/// Wraps a [`TracerProvider`] so its tracers tag root spans.
#[derive(Debug, Clone)]
pub struct ProfilingTracerProvider<P> {
    inner: P,
}

impl<P> ProfilingTracerProvider<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: TracerProvider> TracerProvider for ProfilingTracerProvider<P> {
    type Tracer = ProfilingTracer<P::Tracer>;

    fn tracer_with_scope(&self, scope: InstrumentationScope) -> Self::Tracer {
        ProfilingTracer {
            inner: self.inner.tracer_with_scope(scope),
        }
    }
}

/// Tracer produced by [`ProfilingTracerProvider`].
#[derive(Debug, Clone)]
pub struct ProfilingTracer<T> {
    inner: T,
}

impl<T: Tracer> Tracer for ProfilingTracer<T> {
    type Span = T::Span;

    fn build_with_context(&self, builder: SpanBuilder, parent_cx: &Context) -> Self::Span {
        let mut span = self.inner.build_with_context(builder, parent_cx);
        if !parent_cx.has_active_span() {
            let span_id = span.span_context().span_id();
            if span_id != SpanId::INVALID {
                span.set_attribute(KeyValue::new(PROFILE_ID_KEY, span_id.to_string()));
            }
        }
        span
    }
}
