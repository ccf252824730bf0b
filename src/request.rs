//! Inbound request description.
//!
//! The HTTP layer reduces every request to a [`RequestDescriptor`] before any
//! script logic runs.

use serde_json::Value;
use std::collections::HashMap;

/// The API surface a request targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    /// `/v1/completions` and the `/v1/responses` alias.
    Completions,
    ModelList,
    ModelRetrieve(String),
    Other,
}

impl Endpoint {
    pub fn from_path(path: &str) -> Self {
        match path.trim_end_matches('/') {
            "/v1/chat/completions" => Endpoint::ChatCompletions,
            "/v1/completions" | "/v1/responses" => Endpoint::Completions,
            "/v1/models" => Endpoint::ModelList,
            other => match other.strip_prefix("/v1/models/") {
                Some(id) if !id.is_empty() && !id.contains('/') => {
                    Endpoint::ModelRetrieve(id.to_string())
                }
                _ => Endpoint::Other,
            },
        }
    }

    /// Endpoints that produce model output and accept simple-format scripts.
    pub fn is_generation(&self) -> bool {
        matches!(self, Endpoint::ChatCompletions | Endpoint::Completions)
    }
}

/// Everything the matching engine knows about a request.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    /// Parsed JSON body, `None` when absent or not JSON.
    pub body: Option<Value>,
    pub token: String,
}

impl RequestDescriptor {
    pub fn new(method: &str, path: &str, body: Option<Value>, token: &str) -> Self {
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            query: HashMap::new(),
            body,
            token: token.to_string(),
        }
    }

    pub fn with_query(mut self, query_string: Option<&str>) -> Self {
        self.query = parse_query_string(query_string.unwrap_or(""));
        self
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::from_path(&self.path)
    }

    pub fn model(&self) -> Option<&str> {
        self.body.as_ref()?.get("model")?.as_str()
    }

    pub fn wants_stream(&self) -> bool {
        self.body
            .as_ref()
            .and_then(|b| b.get("stream"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Text of the most recent user turn, or the prompt for completion calls.
    pub fn user_text(&self) -> String {
        let Some(body) = &self.body else {
            return String::new();
        };

        if let Some(messages) = body.get("messages").and_then(Value::as_array) {
            let last_user = messages
                .iter()
                .rev()
                .find(|m| m.get("role").and_then(Value::as_str) == Some("user"));
            if let Some(message) = last_user {
                return content_text(message.get("content"));
            }
        }

        for key in ["prompt", "input"] {
            if let Some(value) = body.get(key) {
                let text = content_text(Some(value));
                if !text.is_empty() {
                    return text;
                }
            }
        }

        String::new()
    }

    /// All conversation text, used for prompt token estimates.
    pub fn prompt_text(&self) -> String {
        let Some(body) = &self.body else {
            return String::new();
        };

        let mut parts = Vec::new();
        if let Some(messages) = body.get("messages").and_then(Value::as_array) {
            parts.extend(messages.iter().map(|m| content_text(m.get("content"))));
        }
        for key in ["prompt", "input"] {
            parts.push(content_text(body.get(key)));
        }
        parts.retain(|p| !p.is_empty());
        parts.join("\n")
    }
}

/// Flatten a message `content` (string, list of strings, or list of parts).
fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(part) => match part.get("text") {
                    Some(Value::String(s)) => Some(s.clone()),
                    _ => part.get("content").map(|c| content_text(Some(c))),
                },
                _ => None,
            })
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Parse a query string into key-value pairs.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for part in query.split('&') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((key, value)) => params.insert(percent_decode(key), percent_decode(value)),
            None => params.insert(percent_decode(part), String::new()),
        };
    }

    params
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            b => out.push(b),
        }
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}
