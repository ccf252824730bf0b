//! Handlebars rendering of templated rule responses.
//!
//! A rule with `template: true` has its `content`, `error` and every string
//! inside `json` or `sse` rendered with the request in scope. Templates are
//! parsed when the script loads, so only rendering can fail per request.
//!
//! | Variable        | Value                                       |
//! |-----------------|---------------------------------------------|
//! | `path.*`        | parameters of a `{param}` rule path         |
//! | `query.*`       | query string parameters                     |
//! | `captures.*`    | groups of the rule's `pattern` (by index or name) |
//! | `method`        | request method                              |
//! | `request_path`  | request path                                |
//! | `model`         | `model` field of the body                   |
//! | `prompt`        | latest user text                            |
//! | `json`          | request body                                |

use crate::matcher::MatchContext;
use crate::request::RequestDescriptor;
use handlebars::{Handlebars, RenderError, Template, TemplateError};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
}

/// Variables visible to a template.
#[derive(Debug, Serialize)]
pub struct TemplateContext {
    pub path: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub captures: HashMap<String, String>,
    pub method: String,
    pub request_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

impl TemplateContext {
    pub fn new(req: &RequestDescriptor, match_ctx: &MatchContext) -> Self {
        Self {
            path: match_ctx.path_params.clone(),
            query: req.query.clone(),
            captures: match_ctx.captures.clone(),
            method: req.method.clone(),
            request_path: req.path.clone(),
            model: req.model().map(String::from),
            prompt: req.user_text(),
            json: req.body.clone(),
        }
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Output is JSON or plain text, never HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self { handlebars }
    }

    pub fn render(&self, template: &str, ctx: &TemplateContext) -> Result<String, RenderError> {
        self.handlebars.render_template(template, ctx)
    }

    /// Render every string inside `value`. Keys are left as they are.
    pub fn render_json(&self, value: &Value, ctx: &TemplateContext) -> Result<Value, RenderError> {
        match value {
            Value::String(s) if s.contains("{{") => Ok(Value::String(self.render(s, ctx)?)),
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_json(v, ctx))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut rendered = serde_json::Map::new();
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_json(v, ctx)?);
                }
                Ok(Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }
}

/// Parse `template` without rendering it.
pub fn check(template: &str) -> Result<(), TemplateError> {
    Template::compile(template).map(|_| ())
}

/// Parse every string inside `value` that [`TemplateEngine::render_json`]
/// would render.
pub fn check_json(value: &Value) -> Result<(), TemplateError> {
    match value {
        Value::String(s) if s.contains("{{") => check(s),
        Value::Array(items) => items.iter().try_for_each(check_json),
        Value::Object(obj) => obj.values().try_for_each(check_json),
        _ => Ok(()),
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

// Custom Handlebars helpers

/// `{{json value}}` writes the value as compact JSON.
fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value()).unwrap_or(&Value::Null);
    out.write(&serde_json::to_string(value).unwrap_or_default())?;
    Ok(())
}

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let uuid = format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        rng.gen::<u32>(),
        rng.gen::<u16>(),
        rng.gen::<u16>() & 0x0fff,
        (rng.gen::<u16>() & 0x3fff) | 0x8000,
        rng.gen::<u64>() & 0xffffffffffff,
    );
    out.write(&uuid)?;
    Ok(())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use chrono::Utc;

    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    let now = Utc::now();
    out.write(&now.format(format).to_string())?;
    Ok(())
}

fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let min = h
        .param(0)
        .and_then(|v| v.value().as_i64())
        .unwrap_or(0);
    let max = h
        .param(1)
        .and_then(|v| v.value().as_i64())
        .unwrap_or(100);

    let (min, max) = if min <= max { (min, max) } else { (max, min) };
    let value = rand::thread_rng().gen_range(min..=max);
    out.write(&value.to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value());
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match value {
        Some(v) if !v.is_null() => {
            if let Some(s) = v.as_str() {
                if !s.is_empty() {
                    out.write(s)?;
                    return Ok(());
                }
            } else {
                out.write(&v.to_string())?;
                return Ok(());
            }
        }
        _ => {}
    }

    out.write(default)?;
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}
