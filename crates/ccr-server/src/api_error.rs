//! Maps [`ProxyError`] onto the client-visible HTTP error body (§7): a small
//! `axum::response::IntoResponse` wrapper, the same "newtype the core error
//! at the HTTP boundary" shape `goose-server` uses for its own route errors.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use ccr_core::errors::ProxyError;
use serde_json::json;

pub struct ApiError(pub ProxyError);

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = json!({
            "type": "error",
            "error": {
                "type": self.0.wire_type(),
                "message": self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
