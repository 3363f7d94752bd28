//! Route composition, grounded on `goose-server/src/routes/mod.rs`'s
//! `configure(state)` merging multiple route modules into one `Router`.

pub mod health;
pub mod management;
pub mod messages;

use std::sync::Arc;

use axum::Router;

use crate::app_state::AppState;

pub fn configure(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::routes())
        .merge(messages::routes())
        .merge(management::routes())
        .with_state(state)
}
