pub mod broadcaster;
pub mod whip;

use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub resources: usize,
    pub channels: usize,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        resources: state.registry.len(),
        channels: state.broadcaster.as_ref().map_or(0, |b| b.channel_count()),
    })
}
