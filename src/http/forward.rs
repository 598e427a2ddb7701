//! Upstream forwarding with a deadline.
//!
//! One forward is one attempt: transport errors and deadline expiry are
//! returned to the caller and never retried here.

use std::str::FromStr;
use std::time::Duration;

use axum::{
    body::Body,
    http::{
        header,
        uri::{Authority, PathAndQuery, Scheme},
        Request, Response, Uri, Version,
    },
};
use hyper::body::Incoming;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::error::{MeshError, Result};
use crate::http::request::strip_hop_by_hop;

/// Shared HTTP/1.1 client used by the ingress and egress paths.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Body>,
}

impl Forwarder {
    pub fn new() -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { client }
    }

    /// Send `request` to `authority`, keeping its path and query.
    pub async fn forward(
        &self,
        request: Request<Body>,
        authority: &str,
        deadline: Duration,
    ) -> Result<Response<Body>> {
        let forward_error = |reason: String| MeshError::Forward {
            target: authority.to_string(),
            reason,
        };

        let (mut parts, body) = request.into_parts();
        let upstream = Authority::from_str(authority).map_err(|e| forward_error(e.to_string()))?;
        let path_and_query = parts
            .uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        parts.uri = Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(upstream)
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| forward_error(e.to_string()))?;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        // The client fills Host in from the rewritten URI.
        parts.headers.remove(header::HOST);

        let request = Request::from_parts(parts, body);
        match tokio::time::timeout(deadline, self.client.request(request)).await {
            Err(_) => Err(MeshError::ForwardTimeout(authority.to_string())),
            Ok(Err(e)) => Err(forward_error(e.to_string())),
            Ok(Ok(response)) => Ok(into_downstream(response)),
        }
    }
}

fn into_downstream(response: Response<Incoming>) -> Response<Body> {
    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, Body::new(body))
}

impl Default for Forwarder {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a forward result counts as a success for breakers and canary stats.
///
/// 4xx is the caller's fault and counts as success.
pub fn is_success(result: &Result<Response<Body>>) -> bool {
    matches!(result, Ok(response) if !response.status().is_server_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn unreachable_upstream_is_a_forward_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = Forwarder::new();
        let request = Request::get("/ping").body(Body::empty()).unwrap();
        let result = forwarder
            .forward(request, &addr.to_string(), Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(MeshError::Forward { .. })));
        assert!(!is_success(&result));
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and never answer.
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let forwarder = Forwarder::new();
        let request = Request::get("/").body(Body::empty()).unwrap();
        let result = forwarder
            .forward(request, &addr.to_string(), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(MeshError::ForwardTimeout(_))));
    }

    #[test]
    fn client_errors_count_as_success() {
        let not_found = Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Body::empty())
            .unwrap();
        assert!(is_success(&Ok(not_found)));

        let broken = Response::builder()
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::empty())
            .unwrap();
        assert!(!is_success(&Ok(broken)));
    }
}
