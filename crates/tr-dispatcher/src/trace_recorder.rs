//! `TraceRecorder` contract: start/end spans and record retry-delay events.
//!
//! Spans are modeled with the `opentelemetry` crate rather than a bare
//! `tracing::Span`, because the Trace Window needs to hold a span open
//! across several iterations and close it explicitly on rollover — plain
//! `tracing` only supports the enter/exit guard pattern, which doesn't fit a
//! span that outlives the call that opened it.

use crate::model::AuthenticatedEnvironment;
use chrono::{DateTime, Utc};
use opentelemetry::trace::{
    Span, SpanBuilder, SpanContext, SpanId, SpanKind, Status, TraceContextExt, Tracer,
};
use opentelemetry::{global::BoxedTracer, Context, KeyValue};
use sha2::{Digest, Sha256};

/// A window's open span, plus the tracer needed to start the next one.
pub trait WindowSpan: Send {
    /// Record a transport exception on the current span without ending it.
    fn record_exception(&mut self, message: &str);

    /// Annotate the window's final counters and end the span.
    fn end(self: Box<Self>, successes: u64, failures: u64);
}

/// Starts window spans and records retry-delay events.
pub trait TraceRecorder: Send + Sync {
    fn start_window_span(&self, environment: &AuthenticatedEnvironment) -> Box<dyn WindowSpan>;

    /// Record a retry-delay event against a run's stored trace context.
    /// `span_id_seed` makes the event idempotent against duplicate
    /// deliveries: the same seed always yields the same span id.
    fn record_retry_event(
        &self,
        run_trace_context: &serde_json::Value,
        message: String,
        end_time: DateTime<Utc>,
        span_id_seed: &str,
    );
}

/// Deterministic 8-byte span id derived from `sha256(trace_id || seed)`,
/// truncated to the width the tracing format requires. Any stable hash
/// works here; sha256 is used because it's already a workspace dependency.
pub fn deterministic_span_id(trace_id: &str, seed: &str) -> SpanId {
    let mut hasher = Sha256::new();
    hasher.update(trace_id.as_bytes());
    hasher.update(seed.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    SpanId::from_bytes(bytes)
}

/// `opentelemetry`-backed implementation.
pub struct OtelTraceRecorder {
    tracer: BoxedTracer,
}

impl OtelTraceRecorder {
    pub fn new() -> Self {
        Self {
            tracer: opentelemetry::global::tracer("tasks-dispatcher"),
        }
    }
}

impl Default for OtelTraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

struct OtelWindowSpan {
    span: opentelemetry::global::BoxedSpan,
}

impl WindowSpan for OtelWindowSpan {
    fn record_exception(&mut self, message: &str) {
        self.span.add_event(
            "exception",
            vec![KeyValue::new("exception.message", message.to_string())],
        );
        self.span.set_status(Status::error(message.to_string()));
    }

    fn end(mut self: Box<Self>, successes: u64, failures: u64) {
        self.span
            .set_attribute(KeyValue::new("tasks.period.successes", successes as i64));
        self.span
            .set_attribute(KeyValue::new("tasks.period.failures", failures as i64));
        self.span.end();
    }
}

impl TraceRecorder for OtelTraceRecorder {
    fn start_window_span(&self, environment: &AuthenticatedEnvironment) -> Box<dyn WindowSpan> {
        let builder = SpanBuilder::from_name("tasks.dispatch.window")
            .with_kind(SpanKind::Consumer)
            .with_attributes(vec![
                KeyValue::new("environment.id", environment.environment_id.to_string()),
                KeyValue::new("organization.id", environment.organization_id.to_string()),
                KeyValue::new("project.id", environment.project_id.to_string()),
            ]);
        let span = self.tracer.build(builder);
        Box::new(OtelWindowSpan { span })
    }

    fn record_retry_event(
        &self,
        run_trace_context: &serde_json::Value,
        message: String,
        end_time: DateTime<Utc>,
        span_id_seed: &str,
    ) {
        let trace_id = run_trace_context
            .get("traceId")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let span_id = deterministic_span_id(trace_id, span_id_seed);

        let parent_trace_id = opentelemetry::trace::TraceId::from_hex(trace_id)
            .unwrap_or(opentelemetry::trace::TraceId::INVALID);
        let parent_context = Context::current().with_remote_span_context(SpanContext::new(
            parent_trace_id,
            span_id,
            Default::default(),
            false,
            Default::default(),
        ));

        let builder = SpanBuilder::from_name(message).with_span_id(span_id);
        let mut span = self.tracer.build_with_context(builder, &parent_context);
        span.set_attribute(KeyValue::new("style.icon", "schedule-attempt"));
        span.end_with_timestamp(end_time.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_span_id_is_stable() {
        let a = deterministic_span_id("abc123", "retry-2");
        let b = deterministic_span_id("abc123", "retry-2");
        assert_eq!(a, b);
        let c = deterministic_span_id("abc123", "retry-3");
        assert_ne!(a, c);
    }
}
