//! HTTP interaction handling.
//!
//! One [`HttpService`] per configured HTTP service: match the request, apply
//! the performance profile, select the response, fire async triggers.

use crate::actor::ActorRegistry;
use crate::config::{GlobalSettings, HttpServiceConfig};
use crate::dataset::split_tags;
use crate::error::{EngineError, Result};
use crate::matcher::Matcher;
use crate::performance::{Fault, PerformanceEvaluator, PerformanceProfile, ProfileSet};
use crate::selector::{CursorPositions, EndpointState, RenderedResponse, ResponseSelector};
use crate::template::TemplateContext;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Engine-wide active tags, changed at runtime by the management surface.
pub type ActiveTags = Arc<RwLock<Vec<String>>>;

/// An inbound request, already detached from the transport.
#[derive(Debug, Clone, Default)]
pub struct MockRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl MockRequest {
    pub fn new(method: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query: &str) -> Self {
        self.query = Some(query.to_string());
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// A response to write back.
#[derive(Debug, Clone, PartialEq)]
pub struct MockResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl MockResponse {
    /// A JSON error body such as `{"error": "unmocked", ...}`.
    pub fn error(status: u16, error: &str, message: &str) -> Self {
        let body = serde_json::json!({ "error": error, "message": message });
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            status,
            headers,
            body: body.to_string().into_bytes(),
        }
    }

    /// A response with no body, used for injected faults.
    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: Vec::new(),
        }
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl From<RenderedResponse> for MockResponse {
    fn from(rendered: RenderedResponse) -> Self {
        Self {
            status: rendered.status,
            headers: rendered.headers,
            body: rendered.body,
        }
    }
}

/// What the transport should do with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpOutcome {
    Respond(MockResponse),
    /// Pass the request through to this upstream URL
    Forward { target: String },
    /// Drop the connection without a response
    Abort(Fault),
}

impl HttpOutcome {
    pub fn response(&self) -> Option<&MockResponse> {
        match self {
            HttpOutcome::Respond(response) => Some(response),
            _ => None,
        }
    }
}

/// Request counters for one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HttpStats {
    pub total: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub faulted: u64,
}

#[derive(Debug, Default)]
struct HttpCounters {
    total: AtomicU64,
    matched: AtomicU64,
    unmatched: AtomicU64,
    faulted: AtomicU64,
}

struct HttpEndpoint {
    id: Option<String>,
    state: EndpointState,
    profile: Option<Arc<PerformanceProfile>>,
}

/// Collaborators shared by every HTTP service of one engine.
#[derive(Clone)]
pub struct HttpDeps {
    pub selector: ResponseSelector,
    pub evaluator: PerformanceEvaluator,
    pub profiles: ProfileSet,
    pub active_tags: ActiveTags,
    pub actors: Arc<ActorRegistry>,
}

/// Runtime for one HTTP service.
pub struct HttpService {
    name: String,
    config: HttpServiceConfig,
    matcher: Matcher,
    endpoints: Vec<HttpEndpoint>,
    tag_header: String,
    log_matches: bool,
    log_unmatched: bool,
    deps: HttpDeps,
    counters: HttpCounters,
}

impl HttpService {
    pub fn build(
        config: &HttpServiceConfig,
        globals: &GlobalSettings,
        base_dir: Option<&Path>,
        deps: HttpDeps,
    ) -> Result<Self> {
        let name = config.service_name();
        let matcher = Matcher::new(&config.endpoints)?;
        let endpoints = config
            .endpoints
            .iter()
            .map(|endpoint| {
                Ok(HttpEndpoint {
                    id: endpoint.id.clone(),
                    state: EndpointState::from_config(endpoint, globals.tag_fallback, base_dir)?,
                    profile: deps.profiles.resolve(
                        endpoint.performance_profile.as_deref(),
                        config.performance_profile.as_deref(),
                    )?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            service = %name,
            endpoints = endpoints.len(),
            fallback = ?config.fallback_to,
            "HTTP service initialized"
        );

        Ok(Self {
            name,
            config: config.clone(),
            matcher,
            endpoints,
            tag_header: globals.tag_header.clone(),
            log_matches: globals.log_matches,
            log_unmatched: globals.log_unmatched,
            deps,
            counters: HttpCounters::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &HttpServiceConfig {
        &self.config
    }

    /// Handle one request.
    pub async fn handle(&self, request: &MockRequest) -> HttpOutcome {
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let body = (!request.body.is_empty()).then_some(request.body.as_slice());
        let Some(found) = self.matcher.find_match(
            &request.method,
            &request.path,
            request.query.as_deref(),
            &request.headers,
            body,
        ) else {
            return self.unmatched(request);
        };

        self.counters.matched.fetch_add(1, Ordering::Relaxed);
        let endpoint = &self.endpoints[found.index];
        if self.log_matches {
            info!(
                service = %self.name,
                endpoint = %endpoint.state.label(),
                method = %request.method,
                path = %request.path,
                "Request matched"
            );
        }

        // Performance profile: delay first, then the fault short-circuit
        if let Some(profile) = &endpoint.profile {
            let outcome = self.deps.evaluator.evaluate(profile);
            if !outcome.delay.is_zero() {
                debug!(
                    endpoint = %endpoint.state.label(),
                    delay_ms = outcome.delay.as_millis() as u64,
                    "Applying delay"
                );
                tokio::time::sleep(outcome.delay).await;
            }
            if let Some(fault) = outcome.fault {
                self.counters.faulted.fetch_add(1, Ordering::Relaxed);
                info!(
                    service = %self.name,
                    endpoint = %endpoint.state.label(),
                    profile = %profile.name,
                    %fault,
                    "Fault injected"
                );
                return match fault {
                    Fault::Status(status) => HttpOutcome::Respond(MockResponse::empty(status)),
                    Fault::Empty | Fault::Pass => HttpOutcome::Respond(MockResponse::empty(200)),
                    Fault::ConnectionReset | Fault::ConnectionClosed => HttpOutcome::Abort(fault),
                };
            }
        }

        let context = TemplateContext::for_request(
            &found.context,
            &request.method,
            &request.path,
            &request.headers,
            body,
        );
        let tags = self.tag_hints(request);

        match self.deps.selector.select(&endpoint.state, context, &tags).await {
            Ok(rendered) => {
                if let Some(target) = &rendered.trigger {
                    // Fire-and-forget; the response goes out regardless
                    if let Err(e) = self.deps.actors.trigger(target) {
                        warn!(
                            service = %self.name,
                            trigger = %target,
                            error = %e,
                            "Async trigger failed"
                        );
                    }
                }
                HttpOutcome::Respond(rendered.into())
            }
            Err(e) => {
                warn!(
                    service = %self.name,
                    endpoint = %endpoint.state.label(),
                    error = %e,
                    "Response selection failed"
                );
                HttpOutcome::Respond(error_response(&e))
            }
        }
    }

    fn unmatched(&self, request: &MockRequest) -> HttpOutcome {
        self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
        if self.log_unmatched {
            info!(
                service = %self.name,
                method = %request.method,
                path = %request.path,
                "No matching endpoint"
            );
        }

        match &self.config.fallback_to {
            Some(upstream) => {
                let mut target = format!("{}{}", upstream.trim_end_matches('/'), request.path);
                if let Some(query) = request.query.as_deref().filter(|q| !q.is_empty()) {
                    target.push('?');
                    target.push_str(query);
                }
                HttpOutcome::Forward { target }
            }
            None => HttpOutcome::Respond(MockResponse::error(
                404,
                "unmocked",
                "No matching endpoint found",
            )),
        }
    }

    /// Tag hints from the request header first, then the engine's active tags.
    fn tag_hints(&self, request: &MockRequest) -> Vec<String> {
        let mut tags = request
            .header(&self.tag_header)
            .map(split_tags)
            .unwrap_or_default();
        if let Ok(active) = self.deps.active_tags.read() {
            tags.extend(active.iter().cloned());
        }
        tags
    }

    pub fn stats(&self) -> HttpStats {
        HttpStats {
            total: self.counters.total.load(Ordering::Relaxed),
            matched: self.counters.matched.load(Ordering::Relaxed),
            unmatched: self.counters.unmatched.load(Ordering::Relaxed),
            faulted: self.counters.faulted.load(Ordering::Relaxed),
        }
    }

    fn endpoint(&self, key: &str) -> Result<&HttpEndpoint> {
        self.endpoints
            .iter()
            .find(|e| e.id.as_deref() == Some(key) || e.state.label() == key)
            .ok_or_else(|| EngineError::config(format!("{}: unknown endpoint {}", self.name, key)))
    }

    /// Rewind one endpoint, or every endpoint of the service.
    pub fn reset(&self, endpoint: Option<&str>) -> Result<()> {
        match endpoint {
            Some(key) => self.endpoint(key)?.state.reset(),
            None => self.endpoints.iter().for_each(|e| e.state.reset()),
        }
        Ok(())
    }

    /// Cursor positions keyed by endpoint label.
    pub fn cursor_positions(&self) -> Vec<(String, CursorPositions)> {
        self.endpoints
            .iter()
            .map(|e| (e.state.label().to_string(), e.state.positions()))
            .collect()
    }

    pub fn response_by_tag(&self, endpoint: &str, tag: &str) -> Result<usize> {
        self.endpoint(endpoint)?
            .state
            .response_by_tag(tag)
            .map(|(_, index)| index)
    }
}

fn error_response(error: &EngineError) -> MockResponse {
    match error {
        EngineError::TemplateRender(msg) => MockResponse::error(500, "template_render_error", msg),
        EngineError::TagNotFound(tag) => {
            MockResponse::error(404, "tag_not_found", &format!("No response tagged {}", tag))
        }
        EngineError::EngineStopped => {
            MockResponse::error(503, "engine_stopped", "Engine is shutting down")
        }
        other => MockResponse::error(500, "internal_error", &other.to_string()),
    }
}
