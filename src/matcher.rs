//! Request matching logic.
//!
//! Compiles rule predicates at load time and evaluates them against
//! inbound [`RequestDescriptor`]s.

use crate::error::ScriptError;
use crate::request::RequestDescriptor;
use crate::script::{PatternEntry, RuleMatchDefinition};
use regex::{Regex, RegexBuilder};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Context captured during matching (for template variables).
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Path parameters extracted from template matching
    pub path_params: HashMap<String, String>,
    /// Regex capture groups from the `pattern` predicate
    pub captures: HashMap<String, String>,
}

/// Compile a user-text pattern. Patterns are case-insensitive.
pub fn compile_pattern(pattern: &str) -> Result<Regex, ScriptError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| ScriptError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Index of the first pattern, in declaration order, that matches `text`.
pub fn first_pattern_match(patterns: &[PatternEntry], text: &str) -> Option<usize> {
    if text.is_empty() {
        return None;
    }
    patterns.iter().position(|p| p.pattern.is_match(text))
}

/// Structural predicate of a rule. All present fields must hold.
#[derive(Debug, Clone, Default)]
pub struct RulePredicate {
    method: Option<String>,
    path: Option<CompiledPathMatcher>,
    json: Option<Map<String, Value>>,
    json_path: Vec<(String, Value)>,
    pattern: Option<Regex>,
}

#[derive(Debug, Clone)]
enum CompiledPathMatcher {
    Exact(String),
    Template(PathTemplate),
    Glob(globset::GlobMatcher),
}

#[derive(Debug, Clone)]
struct PathTemplate {
    segments: Vec<TemplateSegment>,
}

#[derive(Debug, Clone)]
enum TemplateSegment {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    fn parse(template: &str) -> Self {
        let segments = template
            .split('/')
            .map(|segment| {
                match segment
                    .strip_prefix('{')
                    .and_then(|rest| rest.strip_suffix('}'))
                {
                    Some(name) => TemplateSegment::Param(name.to_string()),
                    None => TemplateSegment::Literal(segment.to_string()),
                }
            })
            .collect();

        Self { segments }
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = path.split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                TemplateSegment::Literal(lit) if lit == part => {}
                TemplateSegment::Literal(_) => return None,
                TemplateSegment::Param(_) if part.is_empty() => return None,
                TemplateSegment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }

        Some(params)
    }
}

impl CompiledPathMatcher {
    fn compile(path: &str) -> Result<Self, ScriptError> {
        if path.contains('{') {
            return Ok(CompiledPathMatcher::Template(PathTemplate::parse(path)));
        }
        if path.contains(['*', '?', '[']) {
            let glob = globset::Glob::new(path).map_err(|source| ScriptError::InvalidGlob {
                pattern: path.to_string(),
                source,
            })?;
            return Ok(CompiledPathMatcher::Glob(glob.compile_matcher()));
        }
        Ok(CompiledPathMatcher::Exact(path.to_string()))
    }

    fn matches(&self, path: &str, context: &mut MatchContext) -> bool {
        match self {
            CompiledPathMatcher::Exact(value) => path == value,
            CompiledPathMatcher::Glob(glob) => glob.is_match(path),
            CompiledPathMatcher::Template(template) => match template.matches(path) {
                Some(params) => {
                    context.path_params = params;
                    true
                }
                None => false,
            },
        }
    }
}

impl RulePredicate {
    /// Compile a predicate; every regex, glob and JSON path is checked here.
    pub fn compile(def: &RuleMatchDefinition, location: &str) -> Result<Self, ScriptError> {
        let json = match &def.json {
            None => None,
            Some(Value::Object(map)) => Some(map.clone()),
            Some(_) => {
                return Err(ScriptError::invalid(
                    format!("{location}.match.json"),
                    "must be a JSON object",
                ))
            }
        };

        for expr in def.json_path.keys() {
            validate_json_path(expr)?;
        }

        Ok(Self {
            method: def.method.as_ref().map(|m| m.to_uppercase()),
            path: def
                .path
                .as_deref()
                .map(CompiledPathMatcher::compile)
                .transpose()?,
            json,
            json_path: def
                .json_path
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            pattern: def.pattern.as_deref().map(compile_pattern).transpose()?,
        })
    }

    /// Evaluate against a request. `user_text` is the extracted user turn.
    pub fn evaluate(&self, req: &RequestDescriptor, user_text: &str) -> Option<MatchContext> {
        let mut context = MatchContext::default();

        // Check method
        if let Some(method) = &self.method {
            if !method.eq_ignore_ascii_case(&req.method) {
                return None;
            }
        }

        // Check path
        if let Some(path_matcher) = &self.path {
            if !path_matcher.matches(&req.path, &mut context) {
                return None;
            }
        }

        // Check body sub-match
        if let Some(expected) = &self.json {
            if !expected.is_empty() {
                let body = req.body.as_ref()?;
                if !json_contains_map(body, expected) {
                    return None;
                }
            }
        }

        if !self.json_path.is_empty() {
            let body = req.body.as_ref()?;
            if !matches_json_paths(body, &self.json_path) {
                return None;
            }
        }

        // Check user text pattern
        if let Some(regex) = &self.pattern {
            if user_text.is_empty() {
                return None;
            }
            let captures = regex.captures(user_text)?;
            for (i, cap) in captures.iter().enumerate().skip(1) {
                if let Some(m) = cap {
                    context.captures.insert(i.to_string(), m.as_str().to_string());
                }
            }
            for name in regex.capture_names().flatten() {
                if let Some(m) = captures.name(name) {
                    context.captures.insert(name.to_string(), m.as_str().to_string());
                }
            }
        }

        Some(context)
    }
}

/// True when every key of `expected` is present in `actual` with an equal
/// value. Nested objects are compared the same way; extra keys are ignored.
pub fn json_contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(_), Value::Object(subset)) => json_contains_map(actual, subset),
        _ => actual == expected,
    }
}

fn json_contains_map(actual: &Value, subset: &Map<String, Value>) -> bool {
    let Value::Object(target) = actual else {
        return false;
    };
    subset.iter().all(|(key, expected)| {
        target
            .get(key)
            .is_some_and(|value| json_contains(value, expected))
    })
}

fn validate_json_path(expr: &str) -> Result<(), ScriptError> {
    use jsonpath_rust::JsonPath;

    let parsed: Result<JsonPath, _> = JsonPath::try_from(expr);
    parsed
        .map(|_| ())
        .map_err(|e| ScriptError::InvalidJsonPath {
            expr: expr.to_string(),
            reason: e.to_string(),
        })
}

fn matches_json_paths(json: &Value, expressions: &[(String, Value)]) -> bool {
    use jsonpath_rust::JsonPath;

    for (path_expr, expected) in expressions {
        let path: JsonPath = match JsonPath::try_from(path_expr.as_str()) {
            Ok(p) => p,
            Err(_) => return false,
        };

        let found = path.find(json);

        // A null expectation only asks for the path to resolve
        let matches = match (&found, expected) {
            (Value::Null, _) => false,
            (Value::Array(items), Value::Null) => !items.is_empty(),
            (_, Value::Null) => true,
            (Value::Array(items), _) => items.contains(expected) || found == *expected,
            _ => found == *expected,
        };
        if !matches {
            return false;
        }
    }
    true
}
