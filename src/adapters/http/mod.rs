pub mod routes;
pub mod state;
pub mod ws;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::adapters::http::state::HttpState;
use crate::adapters::http::ws::ws_handler;

const TEST_IMAGE_LIMIT: usize = 32 * 1024 * 1024;

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/status", get(routes::status))
        .route("/api/cameras", get(routes::list_cameras).post(routes::register_camera))
        .route("/api/cameras/:id", put(routes::update_camera).delete(routes::remove_camera))
        .route("/api/cameras/:id/start", post(routes::start))
        .route("/api/cameras/:id/stop", post(routes::stop))
        .route("/api/cameras/:id/pause", post(routes::pause))
        .route("/api/cameras/:id/resume", post(routes::resume))
        .route("/api/cameras/:id/trigger", post(routes::trigger))
        .route("/api/models", get(routes::list_models).post(routes::register_model))
        .route("/api/models/:id", put(routes::update_model).delete(routes::remove_model))
        .route(
            "/api/models/:id/test",
            post(routes::test_model).layer(DefaultBodyLimit::max(TEST_IMAGE_LIMIT)),
        )
        .route("/api/actions", get(routes::get_actions).put(routes::apply_actions))
        .route("/api/actions/:kind/test", post(routes::test_action))
        .route("/ws/stream", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
