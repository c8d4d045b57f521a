use crate::llm_client::prompts::GROUNDING_INSTRUCTION;
use crate::retrieval::ScoredChunk;

pub fn system_prompt() -> String {
    format!(
        "You are the assistant for a video creator. You answer questions about the \
         creator's own videos using excerpts from their transcripts. {GROUNDING_INSTRUCTION}"
    )
}

/// `[mm:ss]` or `[h:mm:ss]` for a transcript offset in seconds.
pub fn format_timestamp(seconds: f64) -> String {
    let total = seconds.max(0.0).floor() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{h}:{m:02}:{s:02}")
    } else {
        format!("{m:02}:{s:02}")
    }
}

pub fn build_answer_prompt(question: &str, excerpts: &[ScoredChunk]) -> String {
    let mut prompt = String::from("Transcript excerpts:\n\n");
    for (i, scored) in excerpts.iter().enumerate() {
        let chunk = &scored.chunk;
        let at = match (chunk.start_time, chunk.end_time) {
            (Some(start), Some(end)) => {
                format!(" ({}-{})", format_timestamp(start), format_timestamp(end))
            }
            (Some(start), None) => format!(" ({})", format_timestamp(start)),
            _ => String::new(),
        };
        prompt.push_str(&format!(
            "[{}] video {}{}:\n{}\n\n",
            i + 1,
            chunk.video_id,
            at,
            chunk.text.trim()
        ));
    }
    prompt.push_str(&format!("Question: {}", question.trim()));
    prompt
}
