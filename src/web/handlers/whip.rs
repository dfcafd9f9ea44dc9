//! WHIP endpoint handlers

use axum::{
    extract::{Path, Query, State},
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE, ETAG, IF_MATCH, LINK, LOCATION},
        HeaderMap, HeaderValue, StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::whip::links;
use crate::whip::ResourceParams;

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| AppError::Internal(format!("Invalid header value: {}", e)))
}

fn authorization(headers: &HeaderMap) -> Option<&str> {
    headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
}

fn append_links(headers: &mut HeaderMap, entries: &[String]) -> Result<()> {
    for entry in entries {
        headers.append(LINK, header_value(entry)?);
    }
    Ok(())
}

/// POST {prefix}/whip/:type
pub async fn create_resource(
    State(state): State<Arc<AppState>>,
    Path(resource_type): Path<String>,
    Query(params): Query<ResourceParams>,
    headers: HeaderMap,
    body: String,
) -> Result<Response> {
    let config = state.config.get();
    let (resource, answer) = state.registry.create(&resource_type, &params, body).await?;

    let location = format!(
        "{}{}",
        config.web.server_address(),
        resource.locator(&config.web.normalized_prefix())
    );
    let etag = format!("\"{}\"", resource.etag().await);

    let mut entries = links::ice_server_links(
        resource.ice_servers(),
        config.whip.api_key.as_deref(),
        authorization(&headers),
    );
    entries.extend(resource.protocol_extensions());

    let mut response = (StatusCode::CREATED, answer).into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/sdp"));
    response_headers.insert(LOCATION, header_value(&location)?);
    response_headers.insert(ETAG, header_value(&etag)?);
    append_links(response_headers, &entries)?;

    Ok(response)
}

/// OPTIONS {prefix}/whip/:type
pub async fn resource_options(
    State(state): State<Arc<AppState>>,
    Path(_resource_type): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let config = state.config.get();
    let entries = links::ice_server_links(
        state.registry.ice_servers(),
        config.whip.api_key.as_deref(),
        authorization(&headers),
    );

    let mut response = StatusCode::NO_CONTENT.into_response();
    append_links(response.headers_mut(), &entries)?;
    Ok(response)
}

/// GET {prefix}/whip
pub async fn list_resources(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    let prefix = state.config.get().web.normalized_prefix();
    Json(state.registry.list(&prefix))
}

/// PATCH {prefix}/whip/:type/:id
pub async fn patch_resource(
    State(state): State<Arc<AppState>>,
    Path((_resource_type, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: String,
) -> Result<Response> {
    let presented = headers
        .get(IF_MATCH)
        .or_else(|| headers.get(ETAG))
        .and_then(|v| v.to_str().ok());

    let etag = state.registry.patch(&id, &body, presented).await?;
    Ok((StatusCode::NO_CONTENT, [(ETAG, format!("\"{}\"", etag))]).into_response())
}

/// DELETE {prefix}/whip/:type/:id
pub async fn delete_resource(
    State(state): State<Arc<AppState>>,
    Path((_resource_type, id)): Path<(String, String)>,
) -> Result<&'static str> {
    state.registry.delete(&id).await?;
    Ok("OK")
}

/// GET/HEAD/POST/PUT on a resource URL
pub async fn reserved() -> AppError {
    AppError::MethodNotAllowed
}
