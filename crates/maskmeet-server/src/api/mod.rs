mod meetings;
mod overlays;
mod users;
pub mod validate;

use crate::state::AppState;
use crate::ws;
use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(|| async { "OK" }))
        // User routes
        .route("/api/create-user", post(users::create_user))
        .route("/api/get-user-data", get(users::get_user_data))
        .route("/api/update-user-name", put(users::update_user_name))
        .route("/api/delete-user", delete(users::delete_user))
        // Overlay routes
        .route("/api/get-all-overlays", get(overlays::get_all_overlays))
        .route("/api/upload-overlay", post(overlays::upload_overlay))
        .route("/api/delete_overlay/{id}", delete(overlays::delete_overlay))
        // Meeting routes
        .route("/api/schedule-meeting", post(meetings::schedule_meeting))
        .route("/api/get-all-meetings", get(meetings::get_all_meetings))
        .route("/api/update-meeting/{id}", put(meetings::update_meeting))
        .route("/api/delete-meeting/{id}", delete(meetings::delete_meeting))
        // Signalling endpoint
        .route("/ws", get(ws::handler::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
