//! Server-sent event framing of completions.
//!
//! A completion is split into word increments that concatenate back to the
//! exact content. Chat streams open with a role chunk and close with an
//! empty delta carrying `finish_reason: "stop"`; every stream ends with the
//! `[DONE]` sentinel.

use crate::openai::{
    ChatChunkChoice, ChatCompletionChunk, ChatDelta, TextChoice, TextCompletion,
};
use serde_json::Value;

/// Payload of the terminating event.
pub const DONE: &str = "[DONE]";

/// One `data:` event of a stream.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Chat(ChatCompletionChunk),
    Text(TextCompletion),
    /// Verbatim scripted event
    Raw(Value),
    Done,
}

impl StreamFrame {
    /// Text placed after `data: `.
    pub fn data(&self) -> Result<String, serde_json::Error> {
        match self {
            StreamFrame::Chat(chunk) => serde_json::to_string(chunk),
            StreamFrame::Text(chunk) => serde_json::to_string(chunk),
            StreamFrame::Raw(value) => serde_json::to_string(value),
            StreamFrame::Done => Ok(DONE.to_string()),
        }
    }
}

/// Identity shared by every chunk of one stream.
#[derive(Debug, Clone)]
pub struct StreamHeader {
    pub id: String,
    pub created: i64,
    pub model: String,
}

/// Split `content` into word increments.
///
/// Each increment is a word plus the whitespace that follows it; whitespace
/// before the first word stays on the first increment.
pub fn split_increments(content: &str) -> Vec<&str> {
    let mut increments = Vec::new();
    let mut start = 0;
    let mut in_word = false;
    let mut seen_word = false;

    for (i, ch) in content.char_indices() {
        if ch.is_whitespace() {
            in_word = false;
            continue;
        }
        if !in_word {
            if seen_word {
                increments.push(&content[start..i]);
                start = i;
            }
            seen_word = true;
            in_word = true;
        }
    }

    if start < content.len() {
        increments.push(&content[start..]);
    }
    increments
}

pub fn chat_frames(header: &StreamHeader, content: &str) -> Vec<StreamFrame> {
    let chunk = |delta: ChatDelta, finish_reason: Option<&str>| {
        StreamFrame::Chat(ChatCompletionChunk {
            id: header.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: header.created,
            model: header.model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(String::from),
            }],
        })
    };

    let mut frames = vec![chunk(
        ChatDelta {
            role: Some("assistant".to_string()),
            content: Some(String::new()),
        },
        None,
    )];

    frames.extend(split_increments(content).into_iter().map(|piece| {
        chunk(
            ChatDelta {
                role: None,
                content: Some(piece.to_string()),
            },
            None,
        )
    }));

    frames.push(chunk(ChatDelta::default(), Some("stop")));
    frames.push(StreamFrame::Done);
    frames
}

pub fn text_frames(header: &StreamHeader, content: &str) -> Vec<StreamFrame> {
    let chunk = |text: &str, finish_reason: Option<&str>| {
        StreamFrame::Text(TextCompletion {
            id: header.id.clone(),
            object: "text_completion".to_string(),
            created: header.created,
            model: header.model.clone(),
            choices: vec![TextChoice {
                text: text.to_string(),
                index: 0,
                logprobs: None,
                finish_reason: finish_reason.map(String::from),
            }],
            usage: None,
        })
    };

    let mut frames: Vec<StreamFrame> = split_increments(content)
        .into_iter()
        .map(|piece| chunk(piece, None))
        .collect();

    frames.push(chunk("", Some("stop")));
    frames.push(StreamFrame::Done);
    frames
}

/// Scripted events, emitted as given.
pub fn raw_frames(events: &[Value]) -> Vec<StreamFrame> {
    events
        .iter()
        .cloned()
        .map(StreamFrame::Raw)
        .chain(std::iter::once(StreamFrame::Done))
        .collect()
}
