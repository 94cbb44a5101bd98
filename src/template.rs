//! Template rendering capability.
//!
//! Uses Handlebars in strict mode: a template referring to a variable that is
//! not in the context fails instead of rendering an empty string. Renderers are
//! driven exclusively by the rendering worker (see [`crate::render`]).

use crate::error::{EngineError, Result};
use crate::matcher::MatchContext;
use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext};
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// A template engine that may only be used from one thread at a time.
pub trait Renderer: Send + 'static {
    /// Render `template` against `context`.
    fn render(&mut self, template: &str, context: &Value) -> Result<String>;

    /// Render every string leaf of a JSON value that uses template syntax.
    fn render_json(&mut self, value: &Value, context: &Value) -> Result<Value> {
        match value {
            Value::String(s) if s.contains("{{") => Ok(Value::String(self.render(s, context)?)),
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_json(v, context))
                .collect::<Result<Vec<_>>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut rendered = Map::new();
                for (k, v) in obj {
                    rendered.insert(k.clone(), self.render_json(v, context)?);
                }
                Ok(Value::Object(rendered))
            }
            _ => Ok(value.clone()),
        }
    }
}

/// Handlebars-backed renderer with the mock helpers registered.
pub struct HandlebarsRenderer {
    handlebars: Handlebars<'static>,
}

impl HandlebarsRenderer {
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));

        // Bodies are not HTML
        handlebars.register_escape_fn(handlebars::no_escape);
        handlebars.set_strict_mode(true);

        Self { handlebars }
    }
}

impl Default for HandlebarsRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for HandlebarsRenderer {
    fn render(&mut self, template: &str, context: &Value) -> Result<String> {
        self.handlebars
            .render_template(template, context)
            .map_err(|e| EngineError::TemplateRender(e.to_string()))
    }
}

/// Variables visible to a template.
///
/// Dataset variables sit at the top level; request fields are namespaced and
/// win on name clashes.
#[derive(Debug, Default, Serialize)]
pub struct TemplateContext {
    /// Dataset row variables
    #[serde(flatten)]
    pub vars: Map<String, Value>,
    /// Path parameters from URL template matching
    pub path: HashMap<String, String>,
    /// Query parameters
    pub query: HashMap<String, String>,
    /// Request headers
    pub headers: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
    /// Request method
    pub method: String,
    /// Request path
    pub request_path: String,
    /// Request body (as string, if text)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Request body as JSON (if parseable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
    /// Message handed over by a consume role
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed: Option<Value>,
}

impl TemplateContext {
    pub fn for_request(
        match_ctx: &MatchContext,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        body: Option<&[u8]>,
    ) -> Self {
        let body_str = body
            .filter(|b| !b.is_empty())
            .and_then(|b| std::str::from_utf8(b).ok())
            .map(String::from);
        let json = body_str.as_ref().and_then(|s| serde_json::from_str(s).ok());

        Self {
            vars: Map::new(),
            path: match_ctx.path_params.clone(),
            query: match_ctx.query_params.clone(),
            headers: headers.clone(),
            captures: match_ctx.captures.clone(),
            method: method.to_string(),
            request_path: path.to_string(),
            body: body_str,
            json,
            consumed: None,
        }
    }

    pub fn with_vars(mut self, vars: &Map<String, Value>) -> Self {
        self.vars = vars.clone();
        self
    }

    pub fn with_consumed(mut self, consumed: Value) -> Self {
        self.consumed = Some(consumed);
        self
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

// Helpers. Each writes its result straight to the output.

fn str_param<'a>(h: &'a Helper, index: usize) -> &'a str {
    h.param(index).and_then(|p| p.value().as_str()).unwrap_or("")
}

/// `{{json value}}`: the value as compact JSON, strings quoted.
fn json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let value = h
        .param(0)
        .map(|p| p.value().to_string())
        .unwrap_or_else(|| "null".to_string());
    out.write(&value)?;
    Ok(())
}

/// `{{uuid}}`: a random version 4 UUID.
fn uuid_helper(
    _: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let mut bytes: [u8; 16] = rand::random();
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    out.write(&format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))?;
    Ok(())
}

/// `{{now}}` or `{{now "%H:%M"}}`: current UTC time.
fn now_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let format = match str_param(h, 0) {
        "" => "%Y-%m-%dT%H:%M:%S%.3fZ",
        custom => custom,
    };
    out.write(&chrono::Utc::now().format(format).to_string())?;
    Ok(())
}

/// `{{random min max}}`: an integer in `min..=max`, 0..=100 by default.
fn random_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    let bound = |i: usize, default: i64| {
        h.param(i)
            .and_then(|p| p.value().as_i64())
            .unwrap_or(default)
    };
    let (min, max) = (bound(0, 0), bound(1, 100));
    let value = if min < max {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    out.write(&value.to_string())?;
    Ok(())
}

fn upper_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&str_param(h, 0).to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    out.write(&str_param(h, 0).to_lowercase())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request_context(match_ctx: &MatchContext) -> TemplateContext {
        TemplateContext::for_request(match_ctx, "GET", "/users/123", &HashMap::new(), None)
    }

    #[test]
    fn test_simple_template() {
        let mut renderer = HandlebarsRenderer::new();
        let mut ctx = MatchContext::default();
        ctx.path_params.insert("id".to_string(), "123".to_string());

        let result = renderer
            .render("User ID: {{path.id}}", &request_context(&ctx).to_value())
            .unwrap();

        assert_eq!(result, "User ID: 123");
    }

    #[test]
    fn test_missing_variable_fails() {
        let mut renderer = HandlebarsRenderer::new();
        let ctx = MatchContext::default();

        let err = renderer
            .render("Hello {{nobody}}", &request_context(&ctx).to_value())
            .unwrap_err();

        assert!(matches!(err, EngineError::TemplateRender(_)));
    }

    #[test]
    fn test_dataset_vars_and_request_fields() {
        let mut renderer = HandlebarsRenderer::new();
        let mut vars = Map::new();
        vars.insert("name".to_string(), json!("Ada"));
        vars.insert("method".to_string(), json!("shadowed"));

        let ctx = request_context(&MatchContext::default()).with_vars(&vars);
        let result = renderer
            .render("{{name}} via {{method}}", &ctx.to_value())
            .unwrap();

        assert_eq!(result, "Ada via GET");
    }

    #[test]
    fn test_request_body_json() {
        let mut renderer = HandlebarsRenderer::new();
        let body = br#"{"name":"John"}"#;
        let ctx = TemplateContext::for_request(
            &MatchContext::default(),
            "POST",
            "/users",
            &HashMap::new(),
            Some(body),
        );

        let result = renderer.render("Name: {{json.name}}", &ctx.to_value()).unwrap();
        assert_eq!(result, "Name: John");
    }

    #[test]
    fn test_consumed_message() {
        let mut renderer = HandlebarsRenderer::new();
        let ctx = TemplateContext::default().with_consumed(json!({"value": "hi", "key": "k1"}));

        let result = renderer
            .render("{{consumed.key}}={{consumed.value}}", &ctx.to_value())
            .unwrap();
        assert_eq!(result, "k1=hi");
    }

    #[test]
    fn test_uuid_helper() {
        let mut renderer = HandlebarsRenderer::new();
        let result = renderer.render("ID: {{uuid}}", &json!({})).unwrap();

        let uuid = &result[4..];
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.chars().nth(8), Some('-'));
    }

    #[test]
    fn test_upper_lower_helpers() {
        let mut renderer = HandlebarsRenderer::new();
        let result = renderer
            .render(
                "Upper: {{upper name}}, Lower: {{lower name}}",
                &json!({"name": "John"}),
            )
            .unwrap();

        assert_eq!(result, "Upper: JOHN, Lower: john");
    }

    #[test]
    fn test_json_random_and_now_helpers() {
        let mut renderer = HandlebarsRenderer::new();
        let ctx = json!({"name": "Ada", "tags": ["a", "b"]});

        let result = renderer.render("{{json name}} {{json tags}}", &ctx).unwrap();
        assert_eq!(result, r#""Ada" ["a","b"]"#);

        let n: i64 = renderer.render("{{random 5 7}}", &ctx).unwrap().parse().unwrap();
        assert!((5..=7).contains(&n));
        assert_eq!(renderer.render("{{random 3 3}}", &ctx).unwrap(), "3");

        let year = renderer.render(r#"{{now "%Y"}}"#, &ctx).unwrap();
        assert_eq!(year.len(), 4);
    }

    #[test]
    fn test_render_json() {
        let mut renderer = HandlebarsRenderer::new();
        let mut ctx = MatchContext::default();
        ctx.path_params.insert("id".to_string(), "123".to_string());

        let json = json!({
            "id": "{{path.id}}",
            "name": "User {{path.id}}",
            "static": "no template",
            "count": 3
        });

        let result = renderer
            .render_json(&json, &request_context(&ctx).to_value())
            .unwrap();

        assert_eq!(result["id"], "123");
        assert_eq!(result["name"], "User 123");
        assert_eq!(result["static"], "no template");
        assert_eq!(result["count"], 3);
    }
}
