//! Request handling core.
//!
//! [`Emulator`] turns a [`RequestDescriptor`] into a [`Reply`]: it picks the
//! caller's session, runs the matching pass, and renders whatever was
//! selected in the shape the targeted endpoint expects.

use crate::config::{EmulatorConfig, GlobalSettings};
use crate::error::{ApiError, ScriptError};
use crate::matcher::MatchContext;
use crate::policy::Fallback;
use crate::request::{Endpoint, RequestDescriptor};
use crate::script::{RuleBody, RuleResponse, ScriptDefinition, SimpleReply};
use crate::store::{LoadSummary, Selection, SessionRegistry};
use crate::stream::{self, StreamFrame};
use crate::synth::Synthesizer;
use crate::template::{TemplateContext, TemplateEngine};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// HTTP-agnostic response.
#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: ReplyBody,
}

#[derive(Debug)]
pub enum ReplyBody {
    Json(Value),
    Text(String),
    /// Server-sent events, `pace` apart
    Stream {
        frames: Vec<StreamFrame>,
        pace: Duration,
    },
}

impl Reply {
    pub fn json<T: Serialize>(status: u16, body: &T) -> Result<Self, ApiError> {
        Ok(Self {
            status,
            headers: Vec::new(),
            body: ReplyBody::Json(serde_json::to_value(body)?),
        })
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ReplyBody::Text(body.into()),
        }
    }

    fn stream(status: u16, frames: Vec<StreamFrame>, pace: Duration) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: ReplyBody::Stream { frames, pace },
        }
    }

    pub fn with_headers(mut self, headers: &[(String, String)]) -> Self {
        self.headers.extend(headers.iter().cloned());
        self
    }
}

impl From<ApiError> for Reply {
    fn from(err: ApiError) -> Self {
        Self {
            status: err.status(),
            headers: Vec::new(),
            body: ReplyBody::Json(serde_json::to_value(err.to_body()).unwrap_or_default()),
        }
    }
}

/// Request counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RequestCounters {
    pub total: u64,
    pub matched: u64,
    pub unmatched: u64,
}

/// The emulator: sessions, synthesis and counters.
pub struct Emulator {
    settings: GlobalSettings,
    api_keys: HashSet<String>,
    sessions: SessionRegistry,
    synthesizer: Synthesizer,
    templates: TemplateEngine,
    requests_total: AtomicU64,
    requests_matched: AtomicU64,
    requests_unmatched: AtomicU64,
}

impl Emulator {
    pub fn new(config: &EmulatorConfig) -> anyhow::Result<Self> {
        let preload = config.preload_script()?;
        let settings = config.settings.clone();

        info!(
            api_keys = config.auth.api_keys.len(),
            preload = preload.is_some(),
            debug_state = settings.debug_state,
            "LLM emulator initialized"
        );

        Ok(Self {
            synthesizer: Synthesizer::new(
                settings.default_chat_model.clone(),
                settings.default_completion_model.clone(),
            ),
            settings,
            api_keys: config.auth.api_keys.iter().cloned().collect(),
            sessions: SessionRegistry::new(preload),
            templates: TemplateEngine::new(),
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        })
    }

    pub fn settings(&self) -> &GlobalSettings {
        &self.settings
    }

    pub fn counters(&self) -> RequestCounters {
        RequestCounters {
            total: self.requests_total.load(Ordering::Relaxed),
            matched: self.requests_matched.load(Ordering::Relaxed),
            unmatched: self.requests_unmatched.load(Ordering::Relaxed),
        }
    }

    /// Resolve the caller's token from an `Authorization` header value.
    pub fn authenticate(&self, authorization: Option<&str>) -> Result<String, ApiError> {
        let token = authorization
            .and_then(|value| {
                let (scheme, token) = value.trim().split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
            })
            .filter(|token| !token.is_empty())
            .ok_or(ApiError::Unauthorized)?;

        if !self.api_keys.is_empty() && !self.api_keys.contains(token) {
            return Err(ApiError::Unauthorized);
        }
        Ok(token.to_string())
    }

    /// Parse and install a script for `token`.
    pub async fn load_script(&self, token: &str, body: &[u8]) -> Result<LoadSummary, ScriptError> {
        let def = ScriptDefinition::from_json(body)?;
        let store = self.sessions.store_for(token).await;

        match store.load(&def).await {
            Ok(summary) => {
                info!(
                    rules = summary.rules,
                    responses = summary.responses,
                    extended = summary.extended,
                    "Script loaded"
                );
                Ok(summary)
            }
            Err(e) => {
                warn!(error = %e, "Rejected script");
                Err(e)
            }
        }
    }

    /// Return `token` to its initial state.
    pub async fn reset(&self, token: &str) {
        if self.sessions.reset(token).await {
            debug!("Session reset");
        }
    }

    /// Debug view of the caller's session and the global counters.
    pub async fn state(&self, token: &str) -> Result<Value, ApiError> {
        if !self.settings.debug_state {
            return Err(ApiError::Forbidden);
        }

        let script = match self.sessions.get(token).await {
            Some(store) => store.snapshot().await,
            None => None,
        };

        Ok(json!({
            "script": serde_json::to_value(script)?,
            "requests": serde_json::to_value(self.counters())?,
            "sessions": self.sessions.len().await,
        }))
    }

    /// Handle one API request.
    pub async fn handle(&self, req: &RequestDescriptor) -> Reply {
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let selection = match self.sessions.for_request(&req.token).await {
            Some(store) => store.select(req).await,
            None => Selection::no_script(),
        };

        let result = match selection {
            Selection::Rule {
                rule_id,
                response,
                context,
            } => {
                self.requests_matched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_matches {
                    info!(
                        rule_id = %rule_id,
                        method = %req.method,
                        path = %req.path,
                        "Request matched rule"
                    );
                }

                if let Some(delay) = &response.delay {
                    let delay = delay.calculate();
                    if !delay.is_zero() {
                        debug!(
                            rule_id = %rule_id,
                            delay_ms = delay.as_millis() as u64,
                            "Applying delay"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }

                self.render_rule(req, &response, &context)
            }

            Selection::Simple { index, reply } => {
                self.requests_matched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_matches {
                    info!(
                        entry = index,
                        method = %req.method,
                        path = %req.path,
                        "Request matched scripted response"
                    );
                }

                match reply {
                    SimpleReply::Content(content) => self.render_content(req, 200, &content),
                    SimpleReply::Error(err) => Err(err.into()),
                }
            }

            Selection::Unmatched {
                reason,
                policy,
                default_content,
            } => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                if self.settings.log_unmatched {
                    warn!(
                        reason = %reason,
                        method = %req.method,
                        path = %req.path,
                        "No matching script entry"
                    );
                }

                match policy.decide(reason, default_content.as_deref()) {
                    Fallback::Content(content) => self.render_content(req, 200, &content),
                    Fallback::Error(err) => Err(err),
                }
            }
        };

        result.unwrap_or_else(|err| {
            let scripted = matches!(err, ApiError::Unmatched(_) | ApiError::Simulated { .. });
            if !scripted && err.status() >= 500 {
                warn!(error = %err, path = %req.path, "Failed to build response");
            }
            Reply::from(err)
        })
    }

    fn render_rule(
        &self,
        req: &RequestDescriptor,
        response: &RuleResponse,
        match_ctx: &MatchContext,
    ) -> Result<Reply, ApiError> {
        let ctx = response
            .template
            .then(|| TemplateContext::new(req, match_ctx));
        let text = |s: &str| match &ctx {
            Some(ctx) => self.templates.render(s, ctx),
            None => Ok(s.to_string()),
        };
        let value = |v: &Value| match &ctx {
            Some(ctx) => self.templates.render_json(v, ctx),
            None => Ok(v.clone()),
        };

        let reply = match &response.body {
            RuleBody::Empty => Reply::text(response.status, ""),
            RuleBody::Content(content) => {
                self.render_content(req, response.status, &text(content)?)?
            }
            RuleBody::Json(body) => Reply::json(response.status, &value(body)?)?,
            RuleBody::Error(message) => {
                let status = if response.status >= 400 {
                    response.status
                } else {
                    500
                };
                Reply::from(ApiError::Simulated {
                    status,
                    message: text(message)?,
                    error_type: None,
                    param: None,
                    code: None,
                })
            }
            RuleBody::Sse(events) => {
                let events = events.iter().map(&value).collect::<Result<Vec<_>, _>>()?;
                Reply::stream(response.status, stream::raw_frames(&events), self.pace())
            }
        };

        Ok(reply.with_headers(&response.headers))
    }

    /// Wrap plain content in the envelope of the targeted endpoint.
    fn render_content(
        &self,
        req: &RequestDescriptor,
        status: u16,
        content: &str,
    ) -> Result<Reply, ApiError> {
        if status >= 400 {
            return Err(ApiError::Simulated {
                status,
                message: content.to_string(),
                error_type: None,
                param: None,
                code: None,
            });
        }

        let synth = &self.synthesizer;
        match req.endpoint() {
            Endpoint::ChatCompletions if req.wants_stream() => {
                Ok(Reply::stream(status, synth.chat_stream(req, content), self.pace()))
            }
            Endpoint::ChatCompletions => Reply::json(status, &synth.chat_completion(req, content)),
            Endpoint::Completions if req.wants_stream() => {
                Ok(Reply::stream(status, synth.text_stream(req, content), self.pace()))
            }
            Endpoint::Completions => Reply::json(status, &synth.text_completion(req, content)),
            Endpoint::ModelList => Reply::json(status, &synth.model_list(content)),
            Endpoint::ModelRetrieve(id) => {
                let model_id = match content.trim() {
                    "" => id.as_str(),
                    named => named,
                };
                Reply::json(status, &synth.model_object(model_id))
            }
            Endpoint::Other => Ok(Reply::text(status, content)),
        }
    }

    fn pace(&self) -> Duration {
        Duration::from_millis(self.settings.stream_chunk_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emulator() -> Emulator {
        Emulator::new(&EmulatorConfig::default()).unwrap()
    }

    fn chat(token: &str, text: &str) -> RequestDescriptor {
        RequestDescriptor::new(
            "POST",
            "/v1/chat/completions",
            Some(json!({"model": "gpt-4", "messages": [{"role": "user", "content": text}]})),
            token,
        )
    }

    fn json_body(reply: &Reply) -> &Value {
        match &reply.body {
            ReplyBody::Json(value) => value,
            other => panic!("Expected JSON body, got {other:?}"),
        }
    }

    async fn load(emulator: &Emulator, token: &str, script: Value) {
        emulator
            .load_script(token, script.to_string().as_bytes())
            .await
            .unwrap();
    }

    #[test]
    fn test_authenticate() {
        let emulator = emulator();
        assert_eq!(emulator.authenticate(Some("Bearer sk-1")).unwrap(), "sk-1");
        assert_eq!(emulator.authenticate(Some("bearer  sk-2 ")).unwrap(), "sk-2");
        assert!(emulator.authenticate(None).is_err());
        assert!(emulator.authenticate(Some("Bearer ")).is_err());
        assert!(emulator.authenticate(Some("Basic abc")).is_err());
        assert!(emulator.authenticate(Some("sk-1")).is_err());
    }

    #[test]
    fn test_authenticate_allowlist() {
        let mut config = EmulatorConfig::default();
        config.auth.api_keys = vec!["sk-allowed".to_string()];
        let emulator = Emulator::new(&config).unwrap();

        assert!(emulator.authenticate(Some("Bearer sk-allowed")).is_ok());
        let err = emulator.authenticate(Some("Bearer sk-other")).unwrap_err();
        assert_eq!(err.status(), 401);
    }

    #[tokio::test]
    async fn test_simple_content_is_chat_completion() {
        let emulator = emulator();
        load(&emulator, "t", json!({"responses": ["Hello!"]})).await;

        let reply = emulator.handle(&chat("t", "hi")).await;
        assert_eq!(reply.status, 200);
        let body = json_body(&reply);
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["choices"][0]["message"]["content"], "Hello!");
        assert!(body["usage"]["total_tokens"].as_u64().unwrap() > 0);

        let counters = emulator.counters();
        assert_eq!((counters.total, counters.matched, counters.unmatched), (1, 1, 0));
    }

    #[tokio::test]
    async fn test_simulated_error_entry() {
        let emulator = emulator();
        load(
            &emulator,
            "t",
            json!({"responses": [{"error": "Rate limited", "status": 429}]}),
        )
        .await;

        let reply = emulator.handle(&chat("t", "hi")).await;
        assert_eq!(reply.status, 429);
        let body = json_body(&reply);
        assert_eq!(body["error"]["message"], "Rate limited");
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert!(body["error"]["param"].is_null());
        assert!(body["error"]["code"].is_null());
    }

    #[tokio::test]
    async fn test_unmatched_policies() {
        let emulator = emulator();
        let reply = emulator.handle(&chat("none", "hi")).await;
        assert_eq!(reply.status, 500);
        assert_eq!(json_body(&reply)["error"]["code"], "no_matching_rule");

        load(
            &emulator,
            "t",
            json!({"responses": ["A"], "defaults": {"on_unmatched": "default", "content": "fallback"}}),
        )
        .await;
        emulator.handle(&chat("t", "1")).await;
        let reply = emulator.handle(&chat("t", "2")).await;
        assert_eq!(reply.status, 200);
        assert_eq!(json_body(&reply)["choices"][0]["message"]["content"], "fallback");
        assert_eq!(emulator.counters().unmatched, 2);
    }

    #[tokio::test]
    async fn test_streaming_reply() {
        let emulator = emulator();
        load(&emulator, "t", json!({"responses": ["Streaming response works!"]})).await;

        let mut req = chat("t", "hi");
        req.body.as_mut().unwrap()["stream"] = json!(true);

        let reply = emulator.handle(&req).await;
        match reply.body {
            ReplyBody::Stream { frames, pace } => {
                assert!(pace.is_zero());
                assert!(matches!(frames.last(), Some(StreamFrame::Done)));
                let content: String = frames
                    .iter()
                    .filter_map(|f| match f {
                        StreamFrame::Chat(c) => c.choices[0].delta.content.clone(),
                        _ => None,
                    })
                    .collect();
                assert_eq!(content, "Streaming response works!");
            }
            other => panic!("Expected stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rule_content_by_endpoint() {
        let emulator = emulator();
        load(
            &emulator,
            "t",
            json!({"rules": [
                {"match": {"path": "/v1/responses"}, "response": {"content": "This is a test response."}},
                {"match": {"path": "/v1/models/{id}"}, "response": {"content": "gpt-4"}},
                {"match": {"path": "/v1/models"}, "response": {"content": "a, b"}},
                {"match": {"path": "/v1/other"}, "response": {"content": "plain", "headers": {"x-test": "1"}}}
            ]}),
        )
        .await;

        let req = RequestDescriptor::new("POST", "/v1/responses", Some(json!({"input": "x"})), "t");
        let reply = emulator.handle(&req).await;
        assert_eq!(json_body(&reply)["choices"][0]["text"], "This is a test response.");

        let req = RequestDescriptor::new("GET", "/v1/models/gpt-4", None, "t");
        let reply = emulator.handle(&req).await;
        assert_eq!(json_body(&reply)["id"], "gpt-4");
        assert_eq!(json_body(&reply)["object"], "model");

        let req = RequestDescriptor::new("GET", "/v1/models", None, "t");
        let reply = emulator.handle(&req).await;
        assert_eq!(json_body(&reply)["data"][1]["id"], "b");

        let req = RequestDescriptor::new("GET", "/v1/other", None, "t");
        let reply = emulator.handle(&req).await;
        assert!(matches!(&reply.body, ReplyBody::Text(t) if t == "plain"));
        assert_eq!(reply.headers, [("x-test".to_string(), "1".to_string())]);
    }

    #[tokio::test]
    async fn test_rule_content_with_error_status() {
        let emulator = emulator();
        load(
            &emulator,
            "t",
            json!({"rules": [{"match": {}, "response": {"status": 503, "content": "overloaded"}}]}),
        )
        .await;

        let reply = emulator.handle(&chat("t", "hi")).await;
        assert_eq!(reply.status, 503);
        assert_eq!(json_body(&reply)["error"]["message"], "overloaded");
        assert_eq!(json_body(&reply)["error"]["type"], "server_error");
    }

    #[tokio::test]
    async fn test_templated_rule() {
        let emulator = emulator();
        load(
            &emulator,
            "t",
            json!({"rules": [{
                "match": {"pattern": "weather in (?P<city>\\w+)"},
                "response": {"content": "Sunny in {{captures.city}} for {{model}}", "template": true}
            }]}),
        )
        .await;

        let reply = emulator.handle(&chat("t", "What's the weather in Oslo?")).await;
        assert_eq!(
            json_body(&reply)["choices"][0]["message"]["content"],
            "Sunny in Oslo for gpt-4"
        );
    }

    #[tokio::test]
    async fn test_sse_rule() {
        let emulator = emulator();
        load(
            &emulator,
            "t",
            json!({"rules": [{"match": {}, "response": {"sse": [{"data": {"n": 1}}, {"data": {"n": 2}}]}}]}),
        )
        .await;

        let reply = emulator.handle(&chat("t", "x")).await;
        match reply.body {
            ReplyBody::Stream { frames, .. } => {
                let data: Vec<String> = frames.iter().map(|f| f.data().unwrap()).collect();
                assert_eq!(data, [r#"{"n":1}"#, r#"{"n":2}"#, "[DONE]"]);
            }
            other => panic!("Expected stream, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_state_requires_debug() {
        let emulator = emulator();
        assert_eq!(emulator.state("t").await.unwrap_err().status(), 403);

        let mut config = EmulatorConfig::default();
        config.settings.debug_state = true;
        let emulator = Emulator::new(&config).unwrap();
        load(&emulator, "t", json!({"responses": ["A", "B"]})).await;
        emulator.handle(&chat("t", "x")).await;

        let state = emulator.state("t").await.unwrap();
        assert_eq!(state["script"]["responses"], 2);
        assert_eq!(state["script"]["cursor"], 1);
        assert_eq!(state["requests"]["matched"], 1);
    }

    #[tokio::test]
    async fn test_reset_drops_script() {
        let emulator = emulator();
        load(&emulator, "t", json!({"responses": ["A"]})).await;
        emulator.reset("t").await;

        let reply = emulator.handle(&chat("t", "x")).await;
        assert_eq!(reply.status, 500);
        assert!(json_body(&reply)["error"]["message"]
            .as_str()
            .unwrap()
            .contains("no script loaded"));
    }
}
