use axum::{
    http::header::{ETAG, LINK, LOCATION},
    routing::{get, patch, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use crate::state::AppState;

/// Mount `routes` under `path`, or at the root when the path is empty
fn mount(router: Router<Arc<AppState>>, path: &str, routes: Router<Arc<AppState>>) -> Router<Arc<AppState>> {
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        router.merge(routes)
    } else {
        router.nest(path, routes)
    }
}

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let config = state.config.get();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([LOCATION, ETAG, LINK]);

    let whip_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/whip", get(handlers::whip::list_resources))
        .route(
            "/whip/:type",
            post(handlers::whip::create_resource).options(handlers::whip::resource_options),
        )
        .route(
            "/whip/:type/:id",
            patch(handlers::whip::patch_resource)
                .delete(handlers::whip::delete_resource)
                .get(handlers::whip::reserved)
                .head(handlers::whip::reserved)
                .post(handlers::whip::reserved)
                .put(handlers::whip::reserved),
        );

    let mut router = mount(Router::new(), &config.web.normalized_prefix(), whip_routes);

    if state.broadcaster.is_some() {
        let broadcaster_routes = Router::new()
            .route("/channel", get(handlers::broadcaster::list_channels))
            .route(
                "/channel/:channel_id",
                get(handlers::broadcaster::get_manifest).post(handlers::broadcaster::create_viewer),
            )
            .route(
                "/channel/:channel_id/:viewer_id",
                put(handlers::broadcaster::viewer_answer)
                    .patch(handlers::broadcaster::viewer_candidate)
                    .delete(handlers::broadcaster::remove_viewer),
            );
        router = mount(router, &config.broadcaster.normalized_path(), broadcaster_routes);
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
