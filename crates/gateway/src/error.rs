//! HTTP error mapping (§6/§7): the single place a `kilnforge_core::Error`
//! becomes a status code and a sanitized JSON body.
//!
//! Routing, auth and concrete resource schemas are out of scope (§1); this
//! is the one piece of the HTTP surface every service shell needs
//! regardless, since every handler in every shell eventually returns one
//! of these.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kilnforge_core::Error;
use serde_json::json;

/// Wraps a [`kilnforge_core::Error`] so this crate can implement
/// [`IntoResponse`] for it — the orphan rule forbids implementing a
/// foreign trait directly on a foreign type.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(json!({ "error": self.0.public_message() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404() {
        let resp = ApiError::from(Error::NotFound("project x/y".into())).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unavailable_maps_to_503() {
        let resp = ApiError::from(Error::Unavailable("etcd down".into())).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn internal_errors_dont_leak_detail() {
        let resp = ApiError::from(Error::Coordination("dial tcp refused".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
