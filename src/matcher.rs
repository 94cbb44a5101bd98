//! Request matching logic.
//!
//! Matches incoming requests against endpoint definitions. Endpoints are tried
//! in declaration order and the first match wins.

use crate::config::{BodyMatcher, EndpointConfig, HeaderMatcher, PathMatcher, QueryMatcher};
use crate::error::{EngineError, Result};
use crate::schema;
use regex::Regex;
use std::collections::HashMap;

/// Context captured during matching (for template variables).
#[derive(Debug, Clone, Default)]
pub struct MatchContext {
    /// Path parameters extracted from template matching
    pub path_params: HashMap<String, String>,
    /// Query parameters
    pub query_params: HashMap<String, String>,
    /// Regex capture groups
    pub captures: HashMap<String, String>,
}

/// Result of matching a request against the endpoint set.
#[derive(Debug)]
pub struct MatchResult {
    /// Index of the matched endpoint
    pub index: usize,
    /// Context captured during matching
    pub context: MatchContext,
}

/// Request matcher engine.
pub struct Matcher {
    endpoints: Vec<CompiledEndpoint>,
}

struct CompiledEndpoint {
    /// Uppercased method, `*` matches any
    method: String,
    path: CompiledPathMatcher,
    query: Vec<(String, CompiledValueMatcher)>,
    headers: Vec<(String, CompiledValueMatcher)>,
    body: Option<CompiledBodyMatcher>,
}

enum CompiledPathMatcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
    Glob(globset::GlobMatcher),
    Template(PathTemplate),
}

enum CompiledValueMatcher {
    Exact(String),
    Regex(Regex),
    Present,
    Absent,
    Contains(String),
}

enum CompiledBodyMatcher {
    Exact(String),
    Regex(Regex),
    JsonPath(HashMap<String, serde_json::Value>),
    Contains(String),
    Json,
    Schema(serde_json::Value),
    Empty,
}

struct PathTemplate {
    segments: Vec<TemplateSegment>,
}

enum TemplateSegment {
    Literal(String),
    Param(String),
}

impl PathTemplate {
    fn parse(template: &str) -> Self {
        let mut segments = Vec::new();
        let mut current = String::new();
        let mut in_param = false;
        let mut param_name = String::new();

        for ch in template.chars() {
            if ch == '{' && !in_param {
                if !current.is_empty() {
                    segments.push(TemplateSegment::Literal(std::mem::take(&mut current)));
                }
                in_param = true;
                param_name.clear();
            } else if ch == '}' && in_param {
                segments.push(TemplateSegment::Param(std::mem::take(&mut param_name)));
                in_param = false;
            } else if in_param {
                param_name.push(ch);
            } else {
                current.push(ch);
            }
        }

        if !current.is_empty() {
            segments.push(TemplateSegment::Literal(current));
        }

        Self { segments }
    }

    fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        let mut remaining = path;

        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                TemplateSegment::Literal(lit) => {
                    remaining = remaining.strip_prefix(lit.as_str())?;
                }
                TemplateSegment::Param(name) => {
                    // A parameter runs up to the following literal, or to the
                    // next slash when it is the last segment.
                    let end_pos = match self.segments.get(i + 1) {
                        Some(TemplateSegment::Literal(next_lit)) => {
                            remaining.find(next_lit.as_str())?
                        }
                        _ => remaining.find('/').unwrap_or(remaining.len()),
                    };

                    if end_pos == 0 {
                        return None;
                    }

                    params.insert(name.clone(), remaining[..end_pos].to_string());
                    remaining = &remaining[end_pos..];
                }
            }
        }

        // Must consume entire path
        if remaining.is_empty() {
            Some(params)
        } else {
            None
        }
    }
}

fn compile_regex(pattern: &str, owner: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| EngineError::config(format!("{}: invalid regex: {}", owner, e)))
}

impl Matcher {
    /// Compile matchers for the given endpoints.
    pub fn new(endpoints: &[EndpointConfig]) -> Result<Self> {
        let endpoints = endpoints
            .iter()
            .map(compile_endpoint)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { endpoints })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Find the first matching endpoint for a request.
    pub fn find_match(
        &self,
        method: &str,
        path: &str,
        query_string: Option<&str>,
        headers: &HashMap<String, String>,
        body: Option<&[u8]>,
    ) -> Option<MatchResult> {
        let query_params = parse_query_string(query_string.unwrap_or(""));

        self.endpoints.iter().enumerate().find_map(|(index, endpoint)| {
            self.matches_request(endpoint, method, path, &query_params, headers, body)
                .map(|context| MatchResult { index, context })
        })
    }

    fn matches_request(
        &self,
        endpoint: &CompiledEndpoint,
        method: &str,
        path: &str,
        query_params: &HashMap<String, String>,
        headers: &HashMap<String, String>,
        body: Option<&[u8]>,
    ) -> Option<MatchContext> {
        let mut context = MatchContext::default();

        // Check method
        if endpoint.method != "*" && !endpoint.method.eq_ignore_ascii_case(method) {
            return None;
        }

        // Check path
        if !self.matches_path(&endpoint.path, path, &mut context) {
            return None;
        }

        // Check query parameters
        for (name, qm) in &endpoint.query {
            if !matches_value(query_params.get(name), qm) {
                return None;
            }
        }
        context.query_params = query_params.clone();

        // Check headers (case-insensitive names)
        for (name, hm) in &endpoint.headers {
            let header_value = headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v);
            if !matches_value(header_value, hm) {
                return None;
            }
        }

        // Check body
        if let Some(bm) = &endpoint.body {
            if !self.matches_body(body, bm) {
                return None;
            }
        }

        Some(context)
    }

    fn matches_path(
        &self,
        matcher: &CompiledPathMatcher,
        path: &str,
        context: &mut MatchContext,
    ) -> bool {
        match matcher {
            CompiledPathMatcher::Exact(value) => path == value,
            CompiledPathMatcher::Prefix(value) => path.starts_with(value.as_str()),
            CompiledPathMatcher::Regex(regex) => {
                let Some(captures) = regex.captures(path) else {
                    return false;
                };
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
                true
            }
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

    fn matches_body(&self, body: Option<&[u8]>, matcher: &CompiledBodyMatcher) -> bool {
        let body_str = body.and_then(|b| std::str::from_utf8(b).ok());

        match matcher {
            CompiledBodyMatcher::Exact(value) => body_str == Some(value.as_str()),
            CompiledBodyMatcher::Regex(regex) => {
                body_str.map(|bs| regex.is_match(bs)).unwrap_or(false)
            }
            CompiledBodyMatcher::JsonPath(expressions) => body_str
                .and_then(|bs| serde_json::from_str::<serde_json::Value>(bs).ok())
                .map(|json| matches_json_paths(&json, expressions))
                .unwrap_or(false),
            CompiledBodyMatcher::Contains(value) => {
                body_str.map(|bs| bs.contains(value.as_str())).unwrap_or(false)
            }
            CompiledBodyMatcher::Json => body_str
                .map(|bs| serde_json::from_str::<serde_json::Value>(bs).is_ok())
                .unwrap_or(false),
            CompiledBodyMatcher::Schema(shape) => body_str
                .and_then(|bs| serde_json::from_str::<serde_json::Value>(bs).ok())
                .map(|json| schema::validate(shape, &json).is_ok())
                .unwrap_or(false),
            CompiledBodyMatcher::Empty => body.map(|b| b.is_empty()).unwrap_or(true),
        }
    }
}

fn compile_endpoint(endpoint: &EndpointConfig) -> Result<CompiledEndpoint> {
    let label = endpoint.label();
    let path = match endpoint.path.matcher() {
        PathMatcher::Exact { value } => CompiledPathMatcher::Exact(value),
        PathMatcher::Prefix { value } => CompiledPathMatcher::Prefix(value),
        PathMatcher::Regex { pattern } => {
            CompiledPathMatcher::Regex(compile_regex(&pattern, &label)?)
        }
        PathMatcher::Glob { pattern } => {
            let glob = globset::Glob::new(&pattern)
                .map_err(|e| EngineError::config(format!("{}: invalid glob: {}", label, e)))?;
            CompiledPathMatcher::Glob(glob.compile_matcher())
        }
        PathMatcher::Template { template } => {
            CompiledPathMatcher::Template(PathTemplate::parse(&template))
        }
    };

    let query = endpoint
        .query
        .iter()
        .map(|(name, qm)| {
            let compiled = match qm {
                QueryMatcher::Exact { value } => CompiledValueMatcher::Exact(value.clone()),
                QueryMatcher::Regex { pattern } => {
                    CompiledValueMatcher::Regex(compile_regex(pattern, &label)?)
                }
                QueryMatcher::Present => CompiledValueMatcher::Present,
                QueryMatcher::Absent => CompiledValueMatcher::Absent,
            };
            Ok((name.clone(), compiled))
        })
        .collect::<Result<Vec<_>>>()?;

    let headers = endpoint
        .headers
        .iter()
        .map(|(name, hm)| {
            let compiled = match hm {
                HeaderMatcher::Exact { value } => CompiledValueMatcher::Exact(value.clone()),
                HeaderMatcher::Regex { pattern } => {
                    CompiledValueMatcher::Regex(compile_regex(pattern, &label)?)
                }
                HeaderMatcher::Present => CompiledValueMatcher::Present,
                HeaderMatcher::Absent => CompiledValueMatcher::Absent,
                HeaderMatcher::Contains { value } => CompiledValueMatcher::Contains(value.clone()),
            };
            Ok((name.clone(), compiled))
        })
        .collect::<Result<Vec<_>>>()?;

    let body = match &endpoint.body {
        None => None,
        Some(BodyMatcher::Exact { value }) => Some(CompiledBodyMatcher::Exact(value.clone())),
        Some(BodyMatcher::Regex { pattern }) => {
            Some(CompiledBodyMatcher::Regex(compile_regex(pattern, &label)?))
        }
        Some(BodyMatcher::JsonPath { expressions }) => {
            Some(CompiledBodyMatcher::JsonPath(expressions.clone()))
        }
        Some(BodyMatcher::Contains { value }) => Some(CompiledBodyMatcher::Contains(value.clone())),
        Some(BodyMatcher::Json) => Some(CompiledBodyMatcher::Json),
        Some(BodyMatcher::Schema { schema }) => Some(CompiledBodyMatcher::Schema(schema.clone())),
        Some(BodyMatcher::Empty) => Some(CompiledBodyMatcher::Empty),
    };

    Ok(CompiledEndpoint {
        method: endpoint.method.to_uppercase(),
        path,
        query,
        headers,
        body,
    })
}

fn matches_value(value: Option<&String>, matcher: &CompiledValueMatcher) -> bool {
    match matcher {
        CompiledValueMatcher::Exact(expected) => value == Some(expected),
        CompiledValueMatcher::Regex(regex) => value.map(|v| regex.is_match(v)).unwrap_or(false),
        CompiledValueMatcher::Present => value.is_some(),
        CompiledValueMatcher::Absent => value.is_none(),
        CompiledValueMatcher::Contains(needle) => {
            value.map(|v| v.contains(needle.as_str())).unwrap_or(false)
        }
    }
}

fn matches_json_paths(
    json: &serde_json::Value,
    expressions: &HashMap<String, serde_json::Value>,
) -> bool {
    use jsonpath_rust::JsonPath;

    for (path_expr, expected) in expressions {
        let path = match JsonPath::try_from(path_expr.as_str()) {
            Ok(p) => p,
            Err(_) => return false,
        };

        let results = path.find(json);

        // A null expectation only requires the path to resolve
        let matches = if expected.is_null() {
            !results.is_null()
        } else {
            results == *expected
        };
        if !matches {
            return false;
        }
    }
    true
}

/// Parse a query string into key-value pairs.
pub fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((key, value)) => (urlencoding_decode(key), urlencoding_decode(value)),
            None => (urlencoding_decode(part), String::new()),
        })
        .collect()
}

/// Percent-decode a query component (`+` is a space).
fn urlencoding_decode(s: &str) -> String {
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
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}
