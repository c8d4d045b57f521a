pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::chat::handlers as chat;
use crate::pipeline::handlers as pipeline;
use crate::state::AppState;
use crate::upload::handlers as upload;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Videos
        .route(
            "/api/v1/videos/:id/status",
            get(pipeline::handle_video_status),
        )
        .route(
            "/api/v1/videos/:id/confirm-upload",
            post(pipeline::handle_confirm_upload),
        )
        .route("/api/v1/videos/:id/retry", post(pipeline::handle_retry))
        // Server-side imports
        .route("/api/v1/videos/:id/import", post(upload::handle_import))
        .route(
            "/api/v1/videos/:id/upload",
            get(upload::handle_upload_status),
        )
        .route(
            "/api/v1/videos/:id/upload/pause",
            post(upload::handle_upload_pause),
        )
        .route(
            "/api/v1/videos/:id/upload/resume",
            post(upload::handle_upload_resume),
        )
        .route(
            "/api/v1/videos/:id/upload/cancel",
            post(upload::handle_upload_cancel),
        )
        // Pipeline operations
        .route(
            "/api/v1/recovery/sweep",
            post(pipeline::handle_recovery_sweep),
        )
        .route("/api/v1/events", post(pipeline::handle_pipeline_event))
        // Chat
        .route(
            "/api/v1/chat/sessions/:id/messages",
            post(chat::handle_chat_message),
        )
        .with_state(state)
}
