//! Error responses produced by the mesh itself.
//!
//! Every failure the sidecar or admin API generates carries an
//! `x-mesh-reason` header so callers can tell a tripped breaker from a
//! vanished backend without parsing the body.

use axum::{
    http::HeaderValue,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::error::MeshError;

pub const X_MESH_REASON: &str = "x-mesh-reason";

impl IntoResponse for MeshError {
    fn into_response(self) -> Response {
        error_response(&self)
    }
}

pub fn error_response(err: &MeshError) -> Response {
    let body = Json(json!({
        "error": err.reason(),
        "message": err.to_string(),
    }));
    let mut response = (err.status_code(), body).into_response();
    response
        .headers_mut()
        .insert(X_MESH_REASON, HeaderValue::from_static(err.reason()));
    response
}
