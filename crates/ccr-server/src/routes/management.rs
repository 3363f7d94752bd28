//! Management surface (§6): config inspection/reload, transformer listing,
//! and placeholder endpoints for the rest of the original tool's operator
//! surface (`restart`, `logs`, `update`, the `/ui` SPA). SPEC_FULL keeps
//! these paths reserved "so the core does not shadow them," not fully
//! implemented; each stub below does the smallest real thing it can
//! (config is actually inspectable/reloadable, transformer names are the
//! registry's real built-ins) and the rest acknowledge the call without
//! pretending to perform process management this core doesn't own.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use ccr_core::config::Config;

use crate::api_error::ApiError;
use crate::app_state::AppState;

/// Redacts provider API keys before a config snapshot leaves the process.
fn redact_config(config: &Config) -> Value {
    let mut providers = Vec::new();
    for provider in config.providers() {
        providers.push(json!({
            "name": provider.name,
            "api_base_url": provider.api_base_url,
            "models": provider.models,
            "disabled": provider.disabled,
        }));
    }
    json!({
        "providers": providers,
        "router": {
            "default": config.router().default,
        },
        "port": config.port(),
        "host": config.host(),
    })
}

async fn get_config(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(redact_config(&state.config()))
}

async fn reload_config(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let content = body.to_string();
    let new_config = Config::from_str(&content)
        .map_err(|err| ApiError(ccr_core::errors::ProxyError::config(err.to_string())))?;
    state.reload_config(new_config)?;
    Ok(Json(json!({"status": "reloaded"})))
}

async fn restart() -> Json<Value> {
    Json(json!({"status": "acknowledged", "note": "process restart is managed externally"}))
}

async fn get_logs() -> Json<Value> {
    Json(json!({"lines": [], "note": "log retrieval is not served by this core"}))
}

async fn delete_logs() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn list_transformers() -> Json<Value> {
    Json(json!({
        "builtin": ["anthropic", "openai", "maxtoken", "tooluse", "reasoning"],
    }))
}

async fn update_check() -> Json<Value> {
    Json(json!({"update_available": false}))
}

async fn update_perform() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(json!({"status": "not_supported"})),
    )
}

async fn ui_fallback() -> (StatusCode, Json<Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "no bundled UI assets in this core"})),
    )
}

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/config", get(get_config).post(reload_config))
        .route("/api/restart", post(restart))
        .route("/api/logs", get(get_logs).delete(delete_logs))
        .route("/api/transformers", get(list_transformers))
        .route("/api/update/check", get(update_check))
        .route("/api/update/perform", post(update_perform))
        .route("/ui/{*path}", get(ui_fallback))
}
