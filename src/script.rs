//! Script definitions.
//!
//! A script is what a test posts to `/_emulator/script`: either a simple
//! list/map of responses, a list of structural rules, or both. Definitions
//! are compiled into a [`Script`] before they replace anything, so a
//! malformed script never becomes active.
//!
//! # Example
//!
//! ```json
//! {
//!   "reset": true,
//!   "responses": [
//!     "Default first response",
//!     {"match": "help", "response": "How can I help?"},
//!     {"match": "error", "error": "Something went wrong", "status": 500}
//!   ],
//!   "rules": [{
//!     "match": {"method": "GET", "path": "/v1/models"},
//!     "times": 1,
//!     "response": {"status": 200, "json": {"object": "list", "data": []}}
//!   }],
//!   "defaults": {"on_unmatched": "error"}
//! }
//! ```

use crate::error::{ApiError, ScriptError};
use crate::matcher::{compile_pattern, RulePredicate};
use crate::policy::{ExhaustedPolicy, UnmatchedPolicy};
use crate::template;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Body of a script load request.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ScriptDefinition {
    /// Replace the active script (`true`) or extend it (`false`)
    #[serde(default)]
    pub reset: bool,

    /// Simple-format responses
    #[serde(default)]
    pub responses: Option<ResponsesDefinition>,

    /// Rule-format entries, evaluated before simple responses
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,

    #[serde(default)]
    pub defaults: Defaults,
}

impl ScriptDefinition {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ScriptError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The shapes accepted under `responses`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsesDefinition {
    /// A single completion text
    Single(String),
    /// Ordered entries consumed by position or pattern
    Sequence(Vec<EntryDefinition>),
    /// Pattern to completion text, evaluated in insertion order
    Patterns(serde_json::Map<String, Value>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryDefinition {
    Text(String),
    Object(EntryObject),
}

/// Object form of a list entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntryObject {
    #[serde(rename = "match", default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub response: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(rename = "type", default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

/// A structural rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleDefinition {
    /// Identifier used in logs and state reports
    #[serde(default)]
    pub id: Option<String>,

    #[serde(rename = "match", default)]
    pub request: RuleMatchDefinition,

    /// Maximum number of matches (absent = unbounded)
    #[serde(default)]
    pub times: Option<u32>,

    pub response: RuleResponseDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct RuleMatchDefinition {
    #[serde(default)]
    pub method: Option<String>,

    /// Exact path, `{param}` template, or glob
    #[serde(default)]
    pub path: Option<String>,

    /// Body sub-match
    #[serde(default)]
    pub json: Option<Value>,

    /// JSON path expressions and expected values
    #[serde(default)]
    pub json_path: BTreeMap<String, Value>,

    /// Regex tested against the user text
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleResponseDefinition {
    #[serde(default = "default_status")]
    pub status: u16,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub json: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub sse: Option<Vec<SseEventDefinition>>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Render `content`/`json` strings as Handlebars templates
    #[serde(default)]
    pub template: bool,
    #[serde(default)]
    pub delay: Option<DelayConfig>,
}

fn default_status() -> u16 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SseEventDefinition {
    pub data: Value,
}

/// Delay/latency simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DelayConfig {
    /// Fixed delay in milliseconds
    #[serde(default)]
    pub fixed_ms: u64,

    /// Minimum delay for random range (ms)
    #[serde(default)]
    pub min_ms: u64,

    /// Maximum delay for random range (ms)
    #[serde(default)]
    pub max_ms: u64,
}

impl DelayConfig {
    /// Calculate the actual delay to apply.
    pub fn calculate(&self) -> Duration {
        if self.fixed_ms > 0 {
            return Duration::from_millis(self.fixed_ms);
        }
        if self.max_ms > self.min_ms {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            return Duration::from_millis(rng.gen_range(self.min_ms..=self.max_ms));
        }
        Duration::from_millis(self.min_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Defaults {
    #[serde(default)]
    pub on_unmatched: UnmatchedPolicy,

    #[serde(default)]
    pub on_exhausted: ExhaustedPolicy,

    /// Served by the `default` unmatched policy
    #[serde(default)]
    pub content: Option<String>,
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

/// A validated, ready-to-match script.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub rules: Vec<Rule>,
    pub simple: Option<SimpleScript>,
    pub defaults: Defaults,
}

#[derive(Debug, Clone)]
pub enum SimpleScript {
    /// Entries consumed at most once, in order
    Sequence(Vec<ResponseSpec>),
    /// Independently evaluated patterns, never consumed
    Patterns(Vec<PatternEntry>),
}

impl SimpleScript {
    pub fn len(&self) -> usize {
        match self {
            SimpleScript::Sequence(entries) => entries.len(),
            SimpleScript::Patterns(patterns) => patterns.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct PatternEntry {
    pub pattern: Regex,
    pub content: String,
}

/// One entry of an ordered response list.
#[derive(Debug, Clone)]
pub enum ResponseSpec {
    /// Served to whichever request reaches it
    Positional(SimpleReply),
    /// Served only to a request whose user text matches
    Keyed { pattern: Regex, reply: SimpleReply },
}

impl ResponseSpec {
    pub fn accepts(&self, user_text: &str) -> bool {
        match self {
            ResponseSpec::Positional(_) => true,
            ResponseSpec::Keyed { pattern, .. } => {
                !user_text.is_empty() && pattern.is_match(user_text)
            }
        }
    }

    pub fn reply(&self) -> &SimpleReply {
        match self {
            ResponseSpec::Positional(reply) | ResponseSpec::Keyed { reply, .. } => reply,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SimpleReply {
    Content(String),
    Error(SimulatedError),
}

/// An operator-declared provider failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedError {
    pub status: u16,
    pub message: String,
    pub error_type: Option<String>,
    pub param: Option<String>,
    pub code: Option<String>,
}

impl SimulatedError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            error_type: None,
            param: None,
            code: None,
        }
    }
}

impl From<SimulatedError> for ApiError {
    fn from(err: SimulatedError) -> Self {
        ApiError::Simulated {
            status: err.status,
            message: err.message,
            error_type: err.error_type,
            param: err.param,
            code: err.code,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub predicate: RulePredicate,
    pub times: Option<u32>,
    pub response: RuleResponse,
}

#[derive(Debug, Clone)]
pub struct RuleResponse {
    pub status: u16,
    pub body: RuleBody,
    pub headers: Vec<(String, String)>,
    pub template: bool,
    pub delay: Option<DelayConfig>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RuleBody {
    Empty,
    /// Synthesized into the endpoint's canonical envelope
    Content(String),
    /// Returned verbatim
    Json(Value),
    /// Error envelope with the rule's status
    Error(String),
    /// Verbatim event stream
    Sse(Vec<Value>),
}

impl Script {
    /// Validate and compile a definition.
    pub fn compile(def: &ScriptDefinition) -> Result<Self, ScriptError> {
        if def.defaults.on_unmatched == UnmatchedPolicy::Default && def.defaults.content.is_none()
        {
            return Err(ScriptError::invalid(
                "defaults",
                "`on_unmatched: default` requires `content`",
            ));
        }

        let rules = def
            .rules
            .iter()
            .enumerate()
            .map(|(i, rule)| compile_rule(i, rule))
            .collect::<Result<Vec<_>, _>>()?;

        let simple = def.responses.as_ref().map(compile_responses).transpose()?;

        Ok(Self {
            rules,
            simple,
            defaults: def.defaults.clone(),
        })
    }

    /// Append `other` to this script. Defaults are taken from `other`.
    pub fn extend(&self, other: Script) -> Result<Self, ScriptError> {
        let mut rules = self.rules.clone();
        rules.extend(other.rules);

        let simple = match (self.simple.clone(), other.simple) {
            (None, simple) | (simple, None) => simple,
            (Some(SimpleScript::Sequence(mut a)), Some(SimpleScript::Sequence(b))) => {
                a.extend(b);
                Some(SimpleScript::Sequence(a))
            }
            (Some(SimpleScript::Patterns(mut a)), Some(SimpleScript::Patterns(b))) => {
                a.extend(b);
                Some(SimpleScript::Patterns(a))
            }
            _ => {
                return Err(ScriptError::invalid(
                    "responses",
                    "cannot extend an ordered list with a pattern map (or the reverse); use `reset: true`",
                ))
            }
        };

        Ok(Self {
            rules,
            simple,
            defaults: other.defaults,
        })
    }

    pub fn sequence(&self) -> Option<&[ResponseSpec]> {
        match &self.simple {
            Some(SimpleScript::Sequence(entries)) => Some(entries),
            _ => None,
        }
    }

    pub fn response_count(&self) -> usize {
        self.simple.as_ref().map_or(0, SimpleScript::len)
    }
}

fn compile_responses(def: &ResponsesDefinition) -> Result<SimpleScript, ScriptError> {
    match def {
        ResponsesDefinition::Single(content) => Ok(SimpleScript::Sequence(vec![
            ResponseSpec::Positional(SimpleReply::Content(content.clone())),
        ])),
        ResponsesDefinition::Sequence(entries) => entries
            .iter()
            .enumerate()
            .map(|(i, entry)| compile_entry(i, entry))
            .collect::<Result<Vec<_>, _>>()
            .map(SimpleScript::Sequence),
        ResponsesDefinition::Patterns(map) => map
            .iter()
            .map(|(pattern, content)| match content {
                Value::String(content) => Ok(PatternEntry {
                    pattern: compile_pattern(pattern)?,
                    content: content.clone(),
                }),
                _ => Err(ScriptError::invalid(
                    format!("responses[{pattern:?}]"),
                    "pattern responses must be strings",
                )),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(SimpleScript::Patterns),
    }
}

fn compile_entry(index: usize, entry: &EntryDefinition) -> Result<ResponseSpec, ScriptError> {
    let location = format!("responses[{index}]");
    let obj = match entry {
        EntryDefinition::Text(content) => {
            return Ok(ResponseSpec::Positional(SimpleReply::Content(content.clone())))
        }
        EntryDefinition::Object(obj) => obj,
    };

    let reply = match (&obj.content, &obj.response, &obj.error) {
        (Some(text), None, None) | (None, Some(text), None) => {
            if obj.status.is_some() || obj.error_type.is_some() || obj.code.is_some() {
                return Err(ScriptError::invalid(
                    location,
                    "`status`, `type` and `code` only apply to `error` entries",
                ));
            }
            SimpleReply::Content(text.clone())
        }
        (None, None, Some(message)) => {
            let status = obj.status.unwrap_or(500);
            if !(400..=599).contains(&status) {
                return Err(ScriptError::invalid(
                    location,
                    format!("error status must be 400-599, got {status}"),
                ));
            }
            SimpleReply::Error(SimulatedError {
                status,
                message: message.clone(),
                error_type: obj.error_type.clone(),
                param: None,
                code: obj.code.clone(),
            })
        }
        (None, None, None) => {
            return Err(ScriptError::invalid(
                location,
                "entry needs one of `content`, `response` or `error`",
            ))
        }
        _ => {
            return Err(ScriptError::invalid(
                location,
                "`content`, `response` and `error` are mutually exclusive",
            ))
        }
    };

    match &obj.pattern {
        Some(pattern) => Ok(ResponseSpec::Keyed {
            pattern: compile_pattern(pattern)?,
            reply,
        }),
        None => Ok(ResponseSpec::Positional(reply)),
    }
}

fn compile_rule(index: usize, def: &RuleDefinition) -> Result<Rule, ScriptError> {
    let location = format!("rules[{index}]");

    if def.times == Some(0) {
        return Err(ScriptError::invalid(
            location,
            "`times` must be positive (omit it for unlimited)",
        ));
    }

    let response = &def.response;
    if !(100..=599).contains(&response.status) {
        return Err(ScriptError::invalid(
            location,
            format!("invalid status code: {}", response.status),
        ));
    }

    let mut bodies = Vec::new();
    if let Some(content) = &response.content {
        bodies.push(RuleBody::Content(content.clone()));
    }
    if let Some(json) = &response.json {
        bodies.push(RuleBody::Json(json.clone()));
    }
    if let Some(error) = &response.error {
        bodies.push(RuleBody::Error(error.clone()));
    }
    if let Some(events) = &response.sse {
        bodies.push(RuleBody::Sse(events.iter().map(|e| e.data.clone()).collect()));
    }
    if bodies.len() > 1 {
        return Err(ScriptError::invalid(
            location,
            "`content`, `json`, `error` and `sse` are mutually exclusive",
        ));
    }

    let body = bodies.pop().unwrap_or(RuleBody::Empty);
    if response.template {
        let checked = match &body {
            RuleBody::Empty => Ok(()),
            RuleBody::Content(text) | RuleBody::Error(text) => template::check(text),
            RuleBody::Json(value) => template::check_json(value),
            RuleBody::Sse(events) => events.iter().try_for_each(template::check_json),
        };
        checked.map_err(|source| ScriptError::InvalidTemplate {
            location: location.clone(),
            source,
        })?;
    }

    Ok(Rule {
        id: def.id.clone().unwrap_or_else(|| format!("rule-{index}")),
        predicate: RulePredicate::compile(&def.request, &location)?,
        times: def.times,
        response: RuleResponse {
            status: response.status,
            body,
            headers: response
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            template: response.template,
            delay: response.delay.clone(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(value: Value) -> Result<Script, ScriptError> {
        let def: ScriptDefinition = serde_json::from_value(value)?;
        Script::compile(&def)
    }

    #[test]
    fn test_parse_sequential_responses() {
        let script = compile(json!({
            "reset": true,
            "responses": ["First response", "Second response", "Third response"],
            "defaults": {"on_unmatched": "error"}
        }))
        .unwrap();

        let entries = script.sequence().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(matches!(
            entries[1].reply(),
            SimpleReply::Content(c) if c == "Second response"
        ));
        assert_eq!(script.defaults.on_unmatched, UnmatchedPolicy::Error);
    }

    #[test]
    fn test_parse_single_string() {
        let script = compile(json!({"responses": "Only one"})).unwrap();
        assert_eq!(script.response_count(), 1);
    }

    #[test]
    fn test_pattern_map_keeps_insertion_order() {
        let script = compile(json!({
            "responses": {
                ".*hello.*": "Hi there!",
                ".*weather.*": "It's sunny today!",
                "\\d+\\s*\\+\\s*\\d+": "I can't do math!",
                "bye": "Goodbye!"
            }
        }))
        .unwrap();

        match script.simple {
            Some(SimpleScript::Patterns(patterns)) => {
                let contents: Vec<_> = patterns.iter().map(|p| p.content.as_str()).collect();
                assert_eq!(
                    contents,
                    ["Hi there!", "It's sunny today!", "I can't do math!", "Goodbye!"]
                );
            }
            _ => panic!("Expected pattern map"),
        }
    }

    #[test]
    fn test_parse_mixed_entries() {
        let script = compile(json!({
            "responses": [
                "Default first response",
                {"match": "help", "response": "How can I help?"},
                {"match": "error", "error": "Something went wrong", "status": 503},
                {"error": "Rate limited", "status": 429, "type": "rate_limit_error"}
            ]
        }))
        .unwrap();

        let entries = script.sequence().unwrap();
        assert!(matches!(entries[0], ResponseSpec::Positional(_)));
        assert!(entries[1].accepts("I need HELP"));
        assert!(!entries[1].accepts("Random message"));
        match entries[2].reply() {
            SimpleReply::Error(err) => {
                assert_eq!(err.status, 503);
                assert_eq!(err.message, "Something went wrong");
            }
            SimpleReply::Content(_) => panic!("Expected error entry"),
        }
        assert!(matches!(entries[3], ResponseSpec::Positional(SimpleReply::Error(_))));
    }

    #[test]
    fn test_error_entry_defaults_to_500() {
        let script = compile(json!({"responses": [{"match": "x", "error": "boom"}]})).unwrap();
        match script.sequence().unwrap()[0].reply() {
            SimpleReply::Error(err) => assert_eq!(err.status, 500),
            SimpleReply::Content(_) => panic!("Expected error entry"),
        }
    }

    #[test]
    fn test_ambiguous_entry_is_rejected() {
        let err = compile(json!({
            "responses": [{"match": "x", "response": "a", "error": "b"}]
        }))
        .unwrap_err();
        assert!(err.to_string().contains("responses[0]"));

        assert!(compile(json!({"responses": [{"match": "x"}]})).is_err());
        assert!(compile(json!({"responses": [{"response": "a", "status": 404}]})).is_err());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        assert!(compile(json!({"responses": ["a"], "bogus": true})).is_err());
        assert!(compile(json!({
            "rules": [{"match": {"method": "GET", "verb": "x"}, "response": {"status": 200}}]
        }))
        .is_err());
    }

    #[test]
    fn test_invalid_regex_is_rejected() {
        let err = compile(json!({"responses": {"(unclosed": "x"}})).unwrap_err();
        assert!(matches!(err, ScriptError::InvalidPattern { .. }));

        let err = compile(json!({"responses": [{"match": "[z-a]", "response": "x"}]})).unwrap_err();
        assert!(matches!(err, ScriptError::InvalidPattern { .. }));
    }

    #[test]
    fn test_parse_rules() {
        let script = compile(json!({
            "rules": [{
                "match": {"method": "GET", "path": "/v1/models"},
                "times": 1,
                "response": {
                    "status": 200,
                    "json": {"object": "list", "data": []}
                }
            }, {
                "id": "chat",
                "match": {"method": "POST", "path": "/v1/responses"},
                "response": {"content": "This is a test response."}
            }]
        }))
        .unwrap();

        assert_eq!(script.rules.len(), 2);
        assert_eq!(script.rules[0].id, "rule-0");
        assert_eq!(script.rules[0].times, Some(1));
        assert!(matches!(script.rules[0].response.body, RuleBody::Json(_)));
        assert_eq!(script.rules[1].id, "chat");
        assert_eq!(script.rules[1].times, None);
        assert_eq!(script.rules[1].response.status, 200);
    }

    #[test]
    fn test_rule_validation() {
        let zero_times = compile(json!({
            "rules": [{"match": {}, "times": 0, "response": {"content": "x"}}]
        }));
        assert!(zero_times.is_err());

        let two_bodies = compile(json!({
            "rules": [{"match": {}, "response": {"content": "x", "json": {}}}]
        }));
        assert!(two_bodies.is_err());

        let bad_status = compile(json!({
            "rules": [{"match": {}, "response": {"status": 700}}]
        }));
        assert!(bad_status.is_err());
    }

    #[test]
    fn test_malformed_template_rejected() {
        let broken = compile(json!({
            "rules": [{"match": {}, "times": 1, "response": {"content": "{{#if}}broken", "template": true}}],
            "responses": ["fallback"]
        }));
        assert!(matches!(broken, Err(ScriptError::InvalidTemplate { .. })));

        let nested = compile(json!({
            "rules": [{"match": {}, "response": {"json": {"a": ["{{#each}}"]}, "template": true}}]
        }));
        assert!(matches!(nested, Err(ScriptError::InvalidTemplate { .. })));

        let events = compile(json!({
            "rules": [{"match": {}, "response": {"sse": [{"data": {"t": "{{/if}}"}}], "template": true}}]
        }));
        assert!(matches!(events, Err(ScriptError::InvalidTemplate { .. })));

        // Without `template` the text is served as written
        let literal = compile(json!({
            "rules": [{"match": {}, "response": {"content": "{{#if}}broken"}}]
        }));
        assert!(literal.is_ok());

        let valid = compile(json!({
            "rules": [{"match": {}, "response": {"content": "Hi {{upper prompt}}", "template": true}}]
        }));
        assert!(valid.is_ok());
    }

    #[test]
    fn test_default_policy_requires_content() {
        assert!(compile(json!({"defaults": {"on_unmatched": "default"}})).is_err());
        let script = compile(json!({
            "defaults": {"on_unmatched": "default", "content": "fallback", "on_exhausted": "wrap"}
        }))
        .unwrap();
        assert_eq!(script.defaults.on_exhausted, ExhaustedPolicy::Wrap);
    }

    #[test]
    fn test_extend_appends_entries() {
        let first = compile(json!({"responses": ["A"], "rules": [{"match": {}, "response": {}}]}))
            .unwrap();
        let second = compile(json!({"responses": ["B", "C"]})).unwrap();

        let merged = first.extend(second).unwrap();
        assert_eq!(merged.response_count(), 3);
        assert_eq!(merged.rules.len(), 1);

        let patterns = compile(json!({"responses": {"x": "y"}})).unwrap();
        assert!(merged.extend(patterns).is_err());
    }

    #[test]
    fn test_delay_calculation() {
        let fixed = DelayConfig {
            fixed_ms: 100,
            min_ms: 0,
            max_ms: 0,
        };
        assert_eq!(fixed.calculate(), Duration::from_millis(100));

        let range = DelayConfig {
            fixed_ms: 0,
            min_ms: 50,
            max_ms: 150,
        };
        let delay = range.calculate().as_millis();
        assert!((50..=150).contains(&delay));
    }
}
