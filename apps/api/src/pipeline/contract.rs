//! Chunk/embedding completion contract.
//!
//! Defines what "chunked", "embedded" and "ready" mean in terms of persisted
//! rows. Both the recovery sweep and the embedding stage read these
//! predicates, so the two can never disagree about whether work is done.

use serde::Serialize;

use crate::models::chunk::NewChunk;
use crate::models::video::TranscriptSegment;

/// Counts of the downstream artifacts that exist for one video.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactSummary {
    pub has_transcript: bool,
    pub chunk_count: i64,
    pub embedded_chunk_count: i64,
}

impl ArtifactSummary {
    pub fn is_chunked(&self) -> bool {
        self.chunk_count > 0
    }

    pub fn is_embedded(&self) -> bool {
        self.embedded_chunk_count > 0
    }

    /// Every chunk has its vector. A video with no chunks is only complete
    /// when it is trivially empty, which the caller must establish separately.
    pub fn all_embedded(&self) -> bool {
        self.chunk_count > 0 && self.embedded_chunk_count >= self.chunk_count
    }
}

/// Splits a transcript into chunks of at most `max_chars` characters.
///
/// When timestamped segments are available, chunks are built on segment
/// boundaries and carry the start of their first segment and the end of their
/// last. A single segment longer than `max_chars` becomes its own chunk.
/// Without segments, the plain text is packed word by word and chunks carry
/// no timing. An empty transcript produces no chunks.
pub fn chunk_transcript(
    transcript: &str,
    segments: &[TranscriptSegment],
    max_chars: usize,
) -> Vec<NewChunk> {
    let max_chars = max_chars.max(1);
    if segments.iter().any(|s| !s.text.trim().is_empty()) {
        chunk_segments(segments, max_chars)
    } else {
        chunk_words(transcript, max_chars)
    }
}

fn chunk_segments(segments: &[TranscriptSegment], max_chars: usize) -> Vec<NewChunk> {
    let mut chunks = Vec::new();
    let mut buf = String::new();
    let mut span: Option<(f64, f64)> = None;

    for segment in segments {
        let text = segment.text.trim();
        if text.is_empty() {
            continue;
        }
        if !buf.is_empty() && buf.len() + 1 + text.len() > max_chars {
            push_chunk(&mut chunks, &mut buf, span.take());
        }
        if !buf.is_empty() {
            buf.push(' ');
        }
        buf.push_str(text);
        span = Some(match span {
            Some((start, _)) => (start, segment.end),
            None => (segment.start, segment.end),
        });
    }
    push_chunk(&mut chunks, &mut buf, span);
    chunks
}

fn chunk_words(text: &str, max_chars: usize) -> Vec<NewChunk> {
    let mut chunks = Vec::new();
    let mut buf = String::new();

    for word in text.split_whitespace() {
        if !buf.is_empty() && buf.len() + 1 + word.len() > max_chars {
            push_chunk(&mut chunks, &mut buf, None);
        }
        if !buf.is_empty() {
            buf.push(' ');
        }
        buf.push_str(word);
    }
    push_chunk(&mut chunks, &mut buf, None);
    chunks
}

fn push_chunk(chunks: &mut Vec<NewChunk>, buf: &mut String, span: Option<(f64, f64)>) {
    if buf.is_empty() {
        return;
    }
    chunks.push(NewChunk {
        chunk_index: chunks.len() as i32,
        text: std::mem::take(buf),
        start_time: span.map(|(start, _)| start),
        end_time: span.map(|(_, end)| end),
    });
}
