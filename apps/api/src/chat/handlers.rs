use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::chat::{answer_question, ChatAnswer};
use crate::errors::AppError;
use crate::retrieval::RetrievalEngine;
use crate::state::AppState;

/// Upper bound on caller-supplied `top_k`, to keep prompts a sane size.
const MAX_TOP_K: usize = 20;

#[derive(Deserialize)]
pub struct ChatMessageRequest {
    pub message: String,
    pub top_k: Option<usize>,
}

/// POST /api/v1/chat/sessions/:id/messages
pub async fn handle_chat_message(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<ChatMessageRequest>,
) -> Result<Json<ChatAnswer>, AppError> {
    let top_k = match req.top_k {
        Some(0) => return Err(AppError::Validation("top_k must be at least 1".to_string())),
        Some(k) => k.min(MAX_TOP_K),
        None => state.config.retrieval_top_k,
    };

    let engine = RetrievalEngine::new(state.embedder.clone());
    let answer = answer_question(
        state.store.as_ref(),
        &engine,
        state.llm.as_ref(),
        session_id,
        &req.message,
        top_k,
    )
    .await?;
    Ok(Json(answer))
}
