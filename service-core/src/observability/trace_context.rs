//! W3C Trace Context propagation for outbound collaborator calls.
//!
//! Job binaries call the payment processor and the notification service over
//! HTTP. These helpers attach `traceparent`/`tracestate` from the current span
//! and the job's correlation id so a charge can be followed across systems.
//!
//! See: https://www.w3.org/TR/trace-context/

use opentelemetry::trace::TraceContextExt;
use reqwest::header::HeaderMap;
use tracing::Span;
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Header name for W3C traceparent
pub const TRACEPARENT_HEADER: &str = "traceparent";

/// Header name for W3C tracestate
pub const TRACESTATE_HEADER: &str = "tracestate";

/// Header carrying the job run correlation id
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Inject current trace context into HTTP request headers.
pub fn inject_trace_context(headers: &mut HeaderMap) {
    let span = Span::current();
    let context = span.context();
    let otel_span = context.span();
    let span_context = otel_span.span_context();

    if span_context.is_valid() {
        // Format: version-trace_id-span_id-trace_flags
        let traceparent = format!(
            "00-{}-{}-{:02x}",
            span_context.trace_id(),
            span_context.span_id(),
            span_context.trace_flags().to_u8()
        );

        if let Ok(value) = traceparent.parse() {
            headers.insert(TRACEPARENT_HEADER, value);
        }

        let tracestate_str = span_context.trace_state().header();
        if !tracestate_str.is_empty()
            && let Ok(value) = tracestate_str.parse()
        {
            headers.insert(TRACESTATE_HEADER, value);
        }
    }
}

/// Inject trace context and an optional correlation id into headers.
pub fn inject_trace_headers(headers: &mut HeaderMap, correlation_id: Option<&str>) {
    inject_trace_context(headers);

    if let Some(id) = correlation_id
        && let Ok(value) = id.parse()
    {
        headers.insert(CORRELATION_ID_HEADER, value);
    }
}

/// Wraps a `reqwest::RequestBuilder` and injects trace headers on send.
pub struct TracedRequest {
    request: reqwest::RequestBuilder,
    correlation_id: Option<String>,
}

impl TracedRequest {
    pub fn new(request: reqwest::RequestBuilder) -> Self {
        Self {
            request,
            correlation_id: None,
        }
    }

    pub fn json<T: serde::Serialize + ?Sized>(self, json: &T) -> Self {
        Self {
            request: self.request.json(json),
            ..self
        }
    }

    pub fn bearer_auth<T: std::fmt::Display>(self, token: T) -> Self {
        Self {
            request: self.request.bearer_auth(token),
            ..self
        }
    }

    /// Tag the request with the job's correlation id.
    pub fn correlation_id(self, id: Option<&str>) -> Self {
        Self {
            correlation_id: id.map(str::to_string),
            ..self
        }
    }

    pub async fn send(self) -> Result<reqwest::Response, reqwest::Error> {
        let mut headers = HeaderMap::new();
        inject_trace_headers(&mut headers, self.correlation_id.as_deref());

        self.request.headers(headers).send().await
    }
}

/// Extension trait for reqwest::Client to create traced requests.
pub trait TracedClientExt {
    fn traced_post(&self, url: &str) -> TracedRequest;
}

impl TracedClientExt for reqwest::Client {
    fn traced_post(&self, url: &str) -> TracedRequest {
        TracedRequest::new(self.post(url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_empty_context() {
        let mut headers = HeaderMap::new();
        inject_trace_context(&mut headers);
        // Without an active span, headers should be empty
        assert!(headers.is_empty());
    }

    #[test]
    fn test_inject_correlation_id() {
        let mut headers = HeaderMap::new();
        inject_trace_headers(&mut headers, Some("run-7f3a"));

        assert_eq!(
            headers
                .get(CORRELATION_ID_HEADER)
                .and_then(|v| v.to_str().ok()),
            Some("run-7f3a")
        );
        assert!(headers.get(TRACEPARENT_HEADER).is_none());
    }

    #[test]
    fn test_invalid_correlation_id_is_dropped() {
        let mut headers = HeaderMap::new();
        inject_trace_headers(&mut headers, Some("bad\nvalue"));
        assert!(headers.is_empty());
    }
}
