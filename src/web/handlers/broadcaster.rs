//! Viewer-side broadcaster handlers

use axum::{
    extract::{Path, State},
    http::{
        header::{CONTENT_TYPE, LOCATION},
        HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::broadcaster::{Broadcaster, ChannelInfo};
use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::webrtc::signaling::{ViewerAnswerRequest, ViewerCandidateRequest};

fn broadcaster(state: &AppState) -> Result<&Arc<Broadcaster>> {
    state
        .broadcaster
        .as_ref()
        .ok_or_else(|| AppError::NotFound("broadcaster disabled".into()))
}

/// GET /channel
pub async fn list_channels(State(state): State<Arc<AppState>>) -> Result<Json<Vec<ChannelInfo>>> {
    Ok(Json(broadcaster(&state)?.list_channels()))
}

/// GET /channel/:channel_id
pub async fn get_manifest(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Result<Response> {
    let xml = broadcaster(&state)?.generate_manifest(&channel_id)?;
    Ok(([(CONTENT_TYPE, "application/dash+xml")], xml).into_response())
}

/// POST /channel/:channel_id
pub async fn create_viewer(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
) -> Result<Response> {
    let broadcaster = broadcaster(&state)?;
    let (viewer_id, offer) = broadcaster.create_viewer(&channel_id).await?;

    let location = format!("{}/{}", broadcaster.channel_url(&channel_id), viewer_id);
    let location = HeaderValue::from_str(&location)
        .map_err(|e| AppError::Internal(format!("Invalid header value: {}", e)))?;

    let mut response = (StatusCode::CREATED, Json(offer)).into_response();
    response.headers_mut().insert(LOCATION, location);
    Ok(response)
}

/// PUT /channel/:channel_id/:viewer_id
pub async fn viewer_answer(
    State(state): State<Arc<AppState>>,
    Path((channel_id, viewer_id)): Path<(String, String)>,
    Json(request): Json<ViewerAnswerRequest>,
) -> Result<StatusCode> {
    broadcaster(&state)?
        .viewer_answer(&channel_id, &viewer_id, request.answer)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PATCH /channel/:channel_id/:viewer_id
pub async fn viewer_candidate(
    State(state): State<Arc<AppState>>,
    Path((channel_id, viewer_id)): Path<(String, String)>,
    Json(request): Json<ViewerCandidateRequest>,
) -> Result<StatusCode> {
    broadcaster(&state)?
        .viewer_candidate(&channel_id, &viewer_id, request.candidate)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// DELETE /channel/:channel_id/:viewer_id
pub async fn remove_viewer(
    State(state): State<Arc<AppState>>,
    Path((channel_id, viewer_id)): Path<(String, String)>,
) -> Result<&'static str> {
    broadcaster(&state)?.remove_viewer(&channel_id, &viewer_id).await?;
    Ok("OK")
}
