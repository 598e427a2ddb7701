//! Request metadata the sidecar reads before forwarding.
//!
//! # Responsibilities
//! - Request ID header (assigned by the tower-http request-id layers)
//! - Caller deadline header, tightening the configured forward timeout
//! - Target service for the egress listener, taken from `Host`
//! - Hop-by-hop header stripping before a request is forwarded

use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

/// Correlation header set on every proxied request and response.
pub const X_REQUEST_ID: &str = "x-request-id";

/// Caller-supplied forward deadline, in milliseconds.
pub const X_MESH_TIMEOUT_MS: &str = "x-mesh-timeout-ms";

/// Request ID as assigned by the request-id layer.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string()
}

/// Stamp a fresh request ID unless the request already carries one.
///
/// Calls made through the mesh client never pass the request-id layer.
pub fn ensure_request_id(headers: &mut HeaderMap) {
    if headers.contains_key(X_REQUEST_ID) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        headers.insert(X_REQUEST_ID, value);
    }
}

/// Effective forward deadline: the configured ceiling, lowered by the caller.
///
/// A zero or unparsable caller value is ignored.
pub fn forward_deadline(headers: &HeaderMap, ceiling: Duration) -> Duration {
    headers
        .get(X_MESH_TIMEOUT_MS)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(|ms| Duration::from_millis(ms).min(ceiling))
        .unwrap_or(ceiling)
}

/// Logical service named by the `Host` header, port stripped.
pub fn target_service(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?.trim();
    let name = match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    };
    (!name.is_empty()).then(|| name.to_ascii_lowercase())
}

/// Remove headers that only apply to a single connection.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop_by_hop: [HeaderName; 7] = [
        header::CONNECTION,
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ];
    for name in hop_by_hop {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_request_id_keeps_existing_value() {
        let mut headers = HeaderMap::new();
        ensure_request_id(&mut headers);
        let assigned = request_id(&headers);
        assert!(Uuid::parse_str(&assigned).is_ok());

        ensure_request_id(&mut headers);
        assert_eq!(request_id(&headers), assigned);
    }

    #[test]
    fn caller_deadline_only_tightens() {
        let ceiling = Duration::from_millis(1000);
        let mut headers = HeaderMap::new();
        assert_eq!(forward_deadline(&headers, ceiling), ceiling);

        headers.insert(X_MESH_TIMEOUT_MS, HeaderValue::from_static("250"));
        assert_eq!(forward_deadline(&headers, ceiling), Duration::from_millis(250));

        headers.insert(X_MESH_TIMEOUT_MS, HeaderValue::from_static("5000"));
        assert_eq!(forward_deadline(&headers, ceiling), ceiling);

        headers.insert(X_MESH_TIMEOUT_MS, HeaderValue::from_static("0"));
        assert_eq!(forward_deadline(&headers, ceiling), ceiling);
    }

    #[test]
    fn target_service_strips_port() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("User-Service:8080"));
        assert_eq!(target_service(&headers).as_deref(), Some("user-service"));

        headers.insert(header::HOST, HeaderValue::from_static("orders"));
        assert_eq!(target_service(&headers).as_deref(), Some("orders"));

        headers.remove(header::HOST);
        assert_eq!(target_service(&headers), None);
    }

    #[test]
    fn hop_by_hop_headers_are_removed() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert(X_REQUEST_ID, HeaderValue::from_static("abc"));
        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(request_id(&headers), "abc");
    }
}
