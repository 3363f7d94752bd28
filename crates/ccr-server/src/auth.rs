//! Request authentication middleware (§6 "Authentication"), grounded on
//! `goose-server`'s `middleware::from_fn_with_state`-based `check_token`:
//! when `APIKEY` is configured, every non-public request must carry it via
//! `Authorization: Bearer` or `x-api-key`; otherwise the proxy falls back to
//! an Origin allow-list, since it's expected to run unauthenticated on
//! loopback behind a trusted editor/CLI.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::Response;

use crate::app_state::AppState;

const PUBLIC_PREFIXES: &[&str] = &["/health", "/ui"];

fn is_public(path: &str) -> bool {
    path == "/" || PUBLIC_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Constant-time byte comparison. No `subtle` dependency is carried anywhere
/// in this codebase's stack, so this folds the comparison by hand instead of
/// short-circuiting on the first mismatching byte.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

fn extract_presented_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

fn origin_allowed(headers: &HeaderMap, port: u16, allowed_origins: &[String]) -> bool {
    let Some(origin) = headers.get(axum::http::header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        // No Origin header means a same-origin (non-browser) request.
        return true;
    };
    let loopback_http = format!("http://127.0.0.1:{port}");
    let loopback_localhost = format!("http://localhost:{port}");
    origin == loopback_http
        || origin == loopback_localhost
        || allowed_origins.iter().any(|allowed| allowed == origin)
}

pub async fn check_auth(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if is_public(request.uri().path()) {
        return Ok(next.run(request).await);
    }

    let config = state.config();
    let headers = request.headers();

    let authorized = match config.api_key() {
        Some(expected) => extract_presented_key(headers)
            .map(|presented| constant_time_eq(&presented, expected))
            .unwrap_or(false),
        None => origin_allowed(headers, config.port(), config.allowed_origins()),
    };

    if authorized {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}
