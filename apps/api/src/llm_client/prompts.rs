// Shared prompt fragments. Feature-specific prompts live next to the feature
// (see `chat/prompts.rs`).

/// Appended to every system prompt that answers from retrieved context.
pub const GROUNDING_INSTRUCTION: &str = "\
    Answer only from the numbered transcript excerpts provided. \
    If the excerpts do not contain the answer, say so plainly instead of guessing. \
    When you use an excerpt, cite it by its number in square brackets, e.g. [2].";
