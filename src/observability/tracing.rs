//! Per-request spans for the sidecar.
//!
//! When tracing is enabled every proxied request runs inside a
//! `mesh.request` span. The routing decision and upstream are recorded on
//! the span as they become known, and the latency when it finishes.

use std::time::Instant;

use tracing::field::Empty;
use tracing::Span;

/// Timing annotations for one request.
#[derive(Debug)]
pub struct RequestTrace {
    span: Span,
    start: Instant,
}

impl RequestTrace {
    /// Open a span, or a disabled one when tracing is off.
    pub fn start(enabled: bool, request_id: &str, direction: &'static str, service: &str) -> Self {
        let span = if enabled {
            tracing::info_span!(
                "mesh.request",
                request_id = %request_id,
                direction,
                service = %service,
                version = Empty,
                strategy = Empty,
                upstream = Empty,
                status = Empty,
                latency_ms = Empty,
            )
        } else {
            Span::none()
        };
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn start_time(&self) -> Instant {
        self.start
    }

    pub fn record_route(&self, version: Option<&str>, strategy: &str) {
        self.span.record("version", version.unwrap_or(""));
        self.span.record("strategy", strategy);
    }

    pub fn record_upstream(&self, upstream: &str) {
        self.span.record("upstream", upstream);
    }

    /// Close out the request with its final status.
    pub fn finish(self, status: u16) {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.span.record("status", status);
        self.span.record("latency_ms", latency_ms);
        self.span.in_scope(|| tracing::debug!(status, latency_ms, "Request finished"));
    }
}
