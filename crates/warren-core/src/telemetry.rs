//! Trace-context carrier for reconciles.
//!
//! Each reconcile runs inside a span. When the object being reconciled
//! carries a [`TRACE_CONTEXT_ANNOTATION`], the span resumes the trace
//! recorded there, so one trace follows a claim through every controller
//! that touches it. The backend is picked once at startup through the
//! [`Telemetry`] enum.

use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{TraceContextExt, Tracer as _, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use std::collections::HashMap;
use std::fmt;
use warren_api::keys::TRACE_CONTEXT_ANNOTATION;
use warren_api::ObjectMeta;

/// Instrumentation scope name.
pub const TRACER_NAME: &str = "warren";

/// Span attributes as key/value pairs.
pub type Attributes<'a> = &'a [(&'static str, String)];

/// Span lifecycle operations used by the controllers.
pub trait Instrumenter: Send + Sync {
    /// Start a span named `name` as a child of `parent`, or of the trace
    /// stored on `object` if it has one.
    fn start_span(
        &self,
        parent: &Context,
        object: Option<&ObjectMeta>,
        name: &'static str,
        attributes: Attributes<'_>,
    ) -> (Context, SpanCloser);

    /// Serialized propagation headers for `cx`, or an empty string when there
    /// is nothing to propagate.
    fn trace_context(&self, cx: &Context) -> String;

    fn add_event(&self, cx: &Context, name: &'static str, attributes: Attributes<'_>);

    fn is_recording(&self, cx: &Context) -> bool;
}

/// Ends its span when dropped.
#[must_use = "the span ends as soon as the closer is dropped"]
pub struct SpanCloser {
    cx: Option<Context>,
}

impl SpanCloser {
    fn noop() -> Self {
        Self { cx: None }
    }

    /// End the span now.
    pub fn close(mut self) {
        self.end();
    }

    fn end(&mut self) {
        if let Some(cx) = self.cx.take() {
            cx.span().end();
        }
    }
}

impl Drop for SpanCloser {
    fn drop(&mut self) {
        self.end();
    }
}

// ============================================================================
// No-op
// ============================================================================

/// Instrumenter that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInstrumenter;

impl Instrumenter for NoopInstrumenter {
    fn start_span(
        &self,
        parent: &Context,
        _object: Option<&ObjectMeta>,
        _name: &'static str,
        _attributes: Attributes<'_>,
    ) -> (Context, SpanCloser) {
        (parent.clone(), SpanCloser::noop())
    }

    fn trace_context(&self, _cx: &Context) -> String {
        String::new()
    }

    fn add_event(&self, _cx: &Context, _name: &'static str, _attributes: Attributes<'_>) {}

    fn is_recording(&self, _cx: &Context) -> bool {
        false
    }
}

// ============================================================================
// OpenTelemetry
// ============================================================================

/// Instrumenter backed by an OpenTelemetry tracer and the W3C trace-context
/// propagator.
pub struct OtelInstrumenter {
    tracer: SdkTracer,
    propagator: TraceContextPropagator,
}

impl OtelInstrumenter {
    pub fn new(provider: &SdkTracerProvider) -> Self {
        Self {
            tracer: provider.tracer(TRACER_NAME),
            propagator: TraceContextPropagator::new(),
        }
    }

    /// Resume the trace stored on `object`, falling back to `parent`.
    fn parent_context(&self, parent: &Context, object: Option<&ObjectMeta>) -> Context {
        let Some(raw) = object
            .and_then(|meta| meta.annotation(TRACE_CONTEXT_ANNOTATION))
            .filter(|raw| !raw.is_empty())
        else {
            return parent.clone();
        };

        match serde_json::from_str::<HashMap<String, String>>(raw) {
            Ok(carrier) => self.propagator.extract_with_context(parent, &carrier),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    annotation = raw,
                    "Ignoring malformed trace context annotation"
                );
                parent.clone()
            }
        }
    }
}

fn key_values(attributes: Attributes<'_>) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| KeyValue::new(*key, value.clone()))
        .collect()
}

impl Instrumenter for OtelInstrumenter {
    fn start_span(
        &self,
        parent: &Context,
        object: Option<&ObjectMeta>,
        name: &'static str,
        attributes: Attributes<'_>,
    ) -> (Context, SpanCloser) {
        let parent = self.parent_context(parent, object);
        let span = self
            .tracer
            .span_builder(name)
            .with_attributes(key_values(attributes))
            .start_with_context(&self.tracer, &parent);
        let cx = parent.with_span(span);
        (cx.clone(), SpanCloser { cx: Some(cx) })
    }

    fn trace_context(&self, cx: &Context) -> String {
        let mut carrier: HashMap<String, String> = HashMap::new();
        self.propagator.inject_context(cx, &mut carrier);
        if carrier.is_empty() {
            return String::new();
        }
        match serde_json::to_string(&carrier) {
            Ok(serialized) => serialized,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize trace context");
                String::new()
            }
        }
    }

    fn add_event(&self, cx: &Context, name: &'static str, attributes: Attributes<'_>) {
        cx.span().add_event(name, key_values(attributes));
    }

    fn is_recording(&self, cx: &Context) -> bool {
        cx.span().is_recording()
    }
}

// ============================================================================
// Selection
// ============================================================================

/// The instrumenter chosen at startup.
pub enum Telemetry {
    Noop(NoopInstrumenter),
    Otel(OtelInstrumenter),
}

impl Telemetry {
    pub fn noop() -> Self {
        Self::Noop(NoopInstrumenter)
    }

    pub fn otel(provider: &SdkTracerProvider) -> Self {
        Self::Otel(OtelInstrumenter::new(provider))
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Noop(_) => f.write_str("Telemetry::Noop"),
            Self::Otel(_) => f.write_str("Telemetry::Otel"),
        }
    }
}

impl Instrumenter for Telemetry {
    fn start_span(
        &self,
        parent: &Context,
        object: Option<&ObjectMeta>,
        name: &'static str,
        attributes: Attributes<'_>,
    ) -> (Context, SpanCloser) {
        match self {
            Self::Noop(i) => i.start_span(parent, object, name, attributes),
            Self::Otel(i) => i.start_span(parent, object, name, attributes),
        }
    }

    fn trace_context(&self, cx: &Context) -> String {
        match self {
            Self::Noop(i) => i.trace_context(cx),
            Self::Otel(i) => i.trace_context(cx),
        }
    }

    fn add_event(&self, cx: &Context, name: &'static str, attributes: Attributes<'_>) {
        match self {
            Self::Noop(i) => i.add_event(cx, name, attributes),
            Self::Otel(i) => i.add_event(cx, name, attributes),
        }
    }

    fn is_recording(&self, cx: &Context) -> bool {
        match self {
            Self::Noop(i) => i.is_recording(cx),
            Self::Otel(i) => i.is_recording(cx),
        }
    }
}
