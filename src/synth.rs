//! Provider-shaped response bodies built from scripted content.

use crate::openai::{
    ChatChoice, ChatCompletion, ChatMessage, Model, ModelList, TextChoice, TextCompletion, Usage,
};
use crate::request::RequestDescriptor;
use crate::stream::{self, StreamFrame, StreamHeader};
use chrono::Utc;
use rand::Rng;

/// Builds completions, streams and model objects.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    default_chat_model: String,
    default_completion_model: String,
}

impl Default for Synthesizer {
    fn default() -> Self {
        Self::new("gpt-4", "gpt-3.5-turbo-instruct")
    }
}

impl Synthesizer {
    pub fn new(
        default_chat_model: impl Into<String>,
        default_completion_model: impl Into<String>,
    ) -> Self {
        Self {
            default_chat_model: default_chat_model.into(),
            default_completion_model: default_completion_model.into(),
        }
    }

    pub fn chat_model(&self, req: &RequestDescriptor) -> String {
        req.model()
            .unwrap_or(self.default_chat_model.as_str())
            .to_string()
    }

    pub fn completion_model(&self, req: &RequestDescriptor) -> String {
        req.model()
            .unwrap_or(self.default_completion_model.as_str())
            .to_string()
    }

    pub fn chat_completion(&self, req: &RequestDescriptor, content: &str) -> ChatCompletion {
        ChatCompletion {
            id: generate_id("chatcmpl-"),
            object: "chat.completion".to_string(),
            created: now(),
            model: self.chat_model(req),
            choices: vec![ChatChoice {
                index: 0,
                message: ChatMessage {
                    role: "assistant".to_string(),
                    content: content.to_string(),
                },
                finish_reason: "stop".to_string(),
            }],
            usage: usage(&req.prompt_text(), content),
        }
    }

    pub fn text_completion(&self, req: &RequestDescriptor, content: &str) -> TextCompletion {
        TextCompletion {
            id: generate_id("cmpl-"),
            object: "text_completion".to_string(),
            created: now(),
            model: self.completion_model(req),
            choices: vec![TextChoice {
                text: content.to_string(),
                index: 0,
                logprobs: None,
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(usage(&req.prompt_text(), content)),
        }
    }

    pub fn chat_stream(&self, req: &RequestDescriptor, content: &str) -> Vec<StreamFrame> {
        let header = StreamHeader {
            id: generate_id("chatcmpl-"),
            created: now(),
            model: self.chat_model(req),
        };
        stream::chat_frames(&header, content)
    }

    pub fn text_stream(&self, req: &RequestDescriptor, content: &str) -> Vec<StreamFrame> {
        let header = StreamHeader {
            id: generate_id("cmpl-"),
            created: now(),
            model: self.completion_model(req),
        };
        stream::text_frames(&header, content)
    }

    pub fn model_object(&self, id: &str) -> Model {
        Model {
            id: id.to_string(),
            object: "model".to_string(),
            created: now(),
            owned_by: "openai".to_string(),
        }
    }

    /// Model list whose ids are `content` split on commas and whitespace.
    /// Empty content lists the two default models.
    pub fn model_list(&self, content: &str) -> ModelList {
        let mut ids: Vec<&str> = content
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|id| !id.is_empty())
            .collect();
        if ids.is_empty() {
            ids = vec![
                self.default_chat_model.as_str(),
                self.default_completion_model.as_str(),
            ];
        }

        ModelList {
            object: "list".to_string(),
            data: ids.into_iter().map(|id| self.model_object(id)).collect(),
        }
    }
}

/// Rough token count: a quarter of the characters, rounded up.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.chars().count();
    u32::try_from(chars.div_ceil(4)).unwrap_or(u32::MAX)
}

pub fn usage(prompt: &str, completion: &str) -> Usage {
    let prompt_tokens = estimate_tokens(prompt).max(1);
    let completion_tokens = estimate_tokens(completion);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens.saturating_add(completion_tokens),
    }
}

/// `prefix` followed by 24 random hex digits.
pub fn generate_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    format!("{prefix}{:08x}{:016x}", rng.gen::<u32>(), rng.gen::<u64>())
}

fn now() -> i64 {
    Utc::now().timestamp()
}
