// Retrieval-augmented answers over a chat session's videos.

pub mod handlers;
pub mod prompts;

use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::errors::AppError;
use crate::llm_client::ChatModel;
use crate::pipeline::store::VideoStore;
use crate::retrieval::RetrievalEngine;

const NO_CONTENT_ANSWER: &str = "None of the videos in this conversation have finished \
     processing yet, so there is nothing to answer from. Try again once they are ready.";

#[derive(Debug, Clone, Serialize)]
pub struct ChatSource {
    pub chunk_id: Uuid,
    pub video_id: Uuid,
    pub text: String,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub score: f32,
}

/// Per-answer spend, split by provider, for the cost calculator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChatUsage {
    pub embedding_model: Option<String>,
    pub embedding_calls: u32,
    pub embedding_tokens: u32,
    pub chat_model: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatAnswer {
    pub session_id: Uuid,
    pub answer: String,
    pub sources: Vec<ChatSource>,
    pub usage: ChatUsage,
}

pub async fn answer_question(
    store: &dyn VideoStore,
    engine: &RetrievalEngine,
    llm: &dyn ChatModel,
    session_id: Uuid,
    question: &str,
    top_k: usize,
) -> Result<ChatAnswer, AppError> {
    if question.trim().is_empty() {
        return Err(AppError::Validation("Message must not be empty".to_string()));
    }

    let session = store
        .get_chat_session(session_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Chat session {session_id} not found")))?;

    let candidates = store
        .chunks_for_scope(session.creator_id, &session.video_ids)
        .await?;

    if candidates.is_empty() {
        info!("Chat session {} has no embedded content yet", session_id);
        return Ok(ChatAnswer {
            session_id,
            answer: NO_CONTENT_ANSWER.to_string(),
            sources: Vec::new(),
            usage: ChatUsage::default(),
        });
    }

    let retrieved = engine.retrieve(question, &candidates, Some(top_k)).await?;

    let prompt = prompts::build_answer_prompt(question, &retrieved.chunks);
    let response = llm
        .call(&prompt, &prompts::system_prompt())
        .await
        .map_err(|e| AppError::Llm(e.to_string()))?;
    let answer = response
        .text()
        .ok_or_else(|| AppError::Llm("Model returned no text".to_string()))?;

    info!(
        "Answered chat session {} from {} of {} chunks",
        session_id,
        retrieved.chunks.len(),
        candidates.len()
    );

    Ok(ChatAnswer {
        session_id,
        answer,
        sources: retrieved
            .chunks
            .into_iter()
            .map(|s| ChatSource {
                chunk_id: s.chunk.id,
                video_id: s.chunk.video_id,
                text: s.chunk.text,
                start_time: s.chunk.start_time,
                end_time: s.chunk.end_time,
                score: s.score,
            })
            .collect(),
        usage: ChatUsage {
            embedding_model: Some(retrieved.usage.embedding_model),
            embedding_calls: retrieved.usage.embedding_calls,
            embedding_tokens: retrieved.usage.embedding_tokens,
            chat_model: Some(llm.model_name().to_string()),
            input_tokens: response.usage.input_tokens,
            output_tokens: response.usage.output_tokens,
        },
    })
}
