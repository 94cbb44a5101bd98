//! Response selection for matched endpoints.
//!
//! Each endpoint owns a cursor over its response set and, optionally, one over
//! its dataset. Both sit behind a per-endpoint lock that is only held while
//! indices are picked; rendering happens after the lock is released, so a
//! cancelled request can never leave a cursor half-advanced.

use crate::config::{EndpointConfig, ResponseBody, ResponseDefinition, TagFallback};
use crate::dataset::{load_rows, DatasetCursor, DatasetRow, Tagged};
use crate::error::{EngineError, Result};
use crate::render::{PendingRender, RenderHandle, RenderInput, RenderOutput};
use crate::template::TemplateContext;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

struct Cursors {
    responses: DatasetCursor<ResponseDefinition>,
    dataset: Option<DatasetCursor<DatasetRow>>,
}

/// Runtime state of one endpoint.
pub struct EndpointState {
    label: String,
    multi: bool,
    tag_fallback: TagFallback,
    cursors: Mutex<Cursors>,
}

/// Cursor positions, as reported by the management surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorPositions {
    pub responses: usize,
    pub dataset: Option<usize>,
}

/// Variants picked for one request.
#[derive(Debug, Clone)]
pub struct Selection {
    pub response: ResponseDefinition,
    pub response_index: usize,
    pub row: Option<DatasetRow>,
    pub row_index: Option<usize>,
}

impl EndpointState {
    pub fn from_config(
        endpoint: &EndpointConfig,
        default_fallback: TagFallback,
        base_dir: Option<&Path>,
    ) -> Result<Self> {
        let responses: Vec<ResponseDefinition> = endpoint
            .response
            .resolve()
            .into_iter()
            .map(|mut response| {
                response.body = response.body.map(|body| body.rebased(base_dir));
                response
            })
            .collect();
        if responses.is_empty() {
            return Err(EngineError::config(format!(
                "endpoint {}: response list cannot be empty",
                endpoint.label()
            )));
        }

        let dataset = match &endpoint.dataset {
            Some(config) => Some(DatasetCursor::new(
                load_rows(config, base_dir)?,
                endpoint.dataset_looped,
            )),
            None => None,
        };

        Ok(Self {
            label: endpoint.label(),
            multi: responses.len() > 1,
            tag_fallback: endpoint.tag_fallback.unwrap_or(default_fallback),
            cursors: Mutex::new(Cursors {
                responses: DatasetCursor::new(responses, endpoint.multi_responses_looped),
                dataset,
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn tag_fallback(&self) -> TagFallback {
        self.tag_fallback
    }

    fn lock(&self) -> MutexGuard<'_, Cursors> {
        // Cursor updates cannot panic half-way, so a poisoned lock is still consistent.
        match self.cursors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pick the response and dataset row for one request, advancing the
    /// sequential cursors exactly once each. Tag lookups for both sets are
    /// resolved first, so a failed pick leaves every cursor where it was.
    pub fn pick(&self, tags: &[String]) -> Result<Selection> {
        let mut cursors = self.lock();

        // A single response is always itself
        let response_tags: &[String] = if self.multi { tags } else { &[] };
        let response_plan =
            plan_variant(&cursors.responses, response_tags, self.tag_fallback, &self.label)?;
        let row_plan = match cursors.dataset.as_ref() {
            Some(dataset) => Some(plan_variant(dataset, tags, self.tag_fallback, &self.label)?),
            None => None,
        };

        let (response, response_index) =
            take_variant(&mut cursors.responses, response_plan, &self.label)?;
        let (row, row_index) = match (cursors.dataset.as_mut(), row_plan) {
            (Some(dataset), Some(plan)) => {
                let (row, index) = take_variant(dataset, plan, &self.label)?;
                (Some(row), Some(index))
            }
            _ => (None, None),
        };

        Ok(Selection {
            response,
            response_index,
            row,
            row_index,
        })
    }

    /// Rewind both cursors.
    pub fn reset(&self) {
        let mut cursors = self.lock();
        cursors.responses.reset();
        if let Some(dataset) = cursors.dataset.as_mut() {
            dataset.reset();
        }
    }

    pub fn positions(&self) -> CursorPositions {
        let cursors = self.lock();
        CursorPositions {
            responses: cursors.responses.position(),
            dataset: cursors.dataset.as_ref().map(|d| d.position()),
        }
    }

    /// Look up a response by tag without touching the cursor.
    pub fn response_by_tag(&self, tag: &str) -> Result<(ResponseDefinition, usize)> {
        let cursors = self.lock();
        cursors.responses.by_tag(tag).map(|(r, i)| (r.clone(), i))
    }
}

/// How one variant set will be read for a request.
enum Plan<T> {
    Tagged(T, usize),
    Next,
}

/// Tag lookup when a hint is present and the set carries tags, sequential
/// otherwise. Never moves the cursor.
fn plan_variant<T: Tagged + Clone>(
    cursor: &DatasetCursor<T>,
    tags: &[String],
    fallback: TagFallback,
    label: &str,
) -> Result<Plan<T>> {
    let tagged = cursor.items().iter().any(|item| item.tag().is_some());
    if tags.is_empty() || !tagged {
        return Ok(Plan::Next);
    }
    match (cursor.by_tags(tags), fallback) {
        (Ok((item, index)), _) => Ok(Plan::Tagged(item.clone(), index)),
        (Err(e), TagFallback::Fail) => Err(e),
        (Err(e), TagFallback::Sequential) => {
            debug!(endpoint = %label, error = %e, "Tag not found, falling back to sequence");
            Ok(Plan::Next)
        }
    }
}

fn take_variant<T: Tagged + Clone>(
    cursor: &mut DatasetCursor<T>,
    plan: Plan<T>,
    label: &str,
) -> Result<(T, usize)> {
    match plan {
        Plan::Tagged(item, index) => Ok((item, index)),
        Plan::Next => cursor
            .next()
            .map(|(item, index)| (item.clone(), index))
            .ok_or_else(|| EngineError::config(format!("{}: empty variant set", label))),
    }
}

/// A response ready to be written out.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedResponse {
    pub status: u16,
    /// Lowercased header names
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub response_index: usize,
    pub tag: Option<String>,
    /// Actor name or produce tag to fire once the response is sent
    pub trigger: Option<String>,
}

/// Turns selections into concrete responses.
#[derive(Clone)]
pub struct ResponseSelector {
    renderer: RenderHandle,
    default_headers: HashMap<String, String>,
    default_content_type: String,
}

impl ResponseSelector {
    pub fn new(
        renderer: RenderHandle,
        default_headers: &HashMap<String, String>,
        default_content_type: &str,
    ) -> Self {
        Self {
            renderer,
            default_headers: default_headers
                .iter()
                .map(|(k, v)| (k.to_lowercase(), v.clone()))
                .collect(),
            default_content_type: default_content_type.to_string(),
        }
    }

    /// Select and build the response for one request.
    pub async fn select(
        &self,
        endpoint: &EndpointState,
        context: TemplateContext,
        tags: &[String],
    ) -> Result<RenderedResponse> {
        let selection = endpoint.pick(tags)?;
        debug!(
            endpoint = %endpoint.label(),
            response = selection.response_index,
            row = ?selection.row_index,
            "Selected response"
        );

        let context = match &selection.row {
            Some(row) => context.with_vars(&row.vars),
            None => context,
        };
        self.build(selection.response, selection.response_index, &context.to_value())
            .await
    }

    async fn build(
        &self,
        response: ResponseDefinition,
        response_index: usize,
        context: &Value,
    ) -> Result<RenderedResponse> {
        let mut headers = self.default_headers.clone();

        // Queue body and header jobs back to back, then wait for both.
        let pending_body = match &response.body {
            Some(body) if response.template => self.enqueue_body(body, context)?,
            _ => None,
        };
        let templated_headers =
            response.template && response.headers.values().any(|v| v.contains("{{"));
        let pending_headers = if templated_headers {
            let map: Map<String, Value> = response
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            Some(self.renderer.enqueue(RenderInput::Json(Value::Object(map)), context.clone())?)
        } else {
            None
        };

        let body = match (pending_body, &response.body) {
            (Some(pending), _) => match pending.wait().await? {
                RenderOutput::Text(text) => text.into_bytes(),
                RenderOutput::Json(value) => serde_json::to_vec(&value)
                    .map_err(|e| EngineError::TemplateRender(e.to_string()))?,
            },
            (None, Some(body)) => body_bytes(body)?,
            (None, None) => Vec::new(),
        };

        match pending_headers {
            Some(pending) => {
                if let RenderOutput::Json(Value::Object(rendered)) = pending.wait().await? {
                    for (name, value) in rendered {
                        let value = match value {
                            Value::String(s) => s,
                            other => other.to_string(),
                        };
                        headers.insert(name.to_lowercase(), value);
                    }
                }
            }
            None => {
                for (name, value) in &response.headers {
                    headers.insert(name.to_lowercase(), value.clone());
                }
            }
        }

        if !headers.contains_key("content-type") {
            let content_type = response
                .body
                .as_ref()
                .map(|b| b.content_type().to_string())
                .unwrap_or_else(|| self.default_content_type.clone());
            headers.insert("content-type".to_string(), content_type);
        }

        Ok(RenderedResponse {
            status: response.status,
            headers,
            body,
            response_index,
            tag: response.tag,
            trigger: response.trigger_async_producer,
        })
    }

    fn enqueue_body(&self, body: &ResponseBody, context: &Value) -> Result<Option<PendingRender>> {
        let input = match body {
            ResponseBody::Text { content } if !content.contains("{{") => return Ok(None),
            ResponseBody::Text { content } => RenderInput::Text(content.clone()),
            ResponseBody::Json { content } => RenderInput::Json(content.clone()),
            // Binary or plain files go out as they are
            ResponseBody::File { .. } => match String::from_utf8(body_bytes(body)?) {
                Ok(text) if text.contains("{{") => RenderInput::Text(text),
                _ => return Ok(None),
            },
            // Binary bodies are never templated
            ResponseBody::Base64 { .. } => return Ok(None),
        };
        self.renderer.enqueue(input, context.clone()).map(Some)
    }
}

fn body_bytes(body: &ResponseBody) -> Result<Vec<u8>> {
    body.to_bytes()
        .map_err(|e| EngineError::TemplateRender(format!("response body: {}", e)))
}
