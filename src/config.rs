//! Declarative service definitions.
//!
//! Defines HTTP services (endpoints, matchers, response sets), async services
//! (broker actors), datasets, and performance profiles.

use crate::dataset::{check_tags, Tagged};
use crate::error::EngineError;
use crate::performance::Fault;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Root of a service definition.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MockConfig {
    /// HTTP and async services to impersonate
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,

    /// Global settings
    #[serde(default)]
    pub globals: GlobalSettings,

    /// Named performance profiles
    #[serde(default)]
    pub performance_profiles: HashMap<String, PerformanceProfileConfig>,

    /// Directory relative dataset and body files are resolved against
    #[serde(skip)]
    pub base_dir: Option<PathBuf>,
}

impl MockConfig {
    /// Load configuration from a YAML or JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let mut config: Self = if is_json {
            serde_json::from_str(&content)?
        } else {
            serde_yaml::from_str(&content)?
        };
        config.base_dir = path.parent().map(Path::to_path_buf);
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML definition.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn http_services(&self) -> impl Iterator<Item = &HttpServiceConfig> {
        self.services.iter().filter_map(|s| match s {
            ServiceDefinition::Http(http) => Some(http),
            ServiceDefinition::Async(_) => None,
        })
    }

    pub fn async_services(&self) -> impl Iterator<Item = &AsyncServiceConfig> {
        self.services.iter().filter_map(|s| match s {
            ServiceDefinition::Async(svc) => Some(svc),
            ServiceDefinition::Http(_) => None,
        })
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, profile) in &self.performance_profiles {
            profile
                .validate()
                .map_err(|e| EngineError::config(format!("performance profile {}: {}", name, e)))?;
        }
        self.check_profile_ref(self.globals.performance_profile.as_deref(), "globals")?;

        let mut http_names = HashSet::new();
        for (i, service) in self.http_services().enumerate() {
            let name = service.service_name();
            if !http_names.insert(name.clone()) {
                return Err(EngineError::config(format!("duplicate HTTP service {}", name)));
            }
            service
                .validate()
                .map_err(|e| EngineError::config(format!("HTTP service {}: {}", i, e)))?;
            self.check_profile_ref(service.performance_profile.as_deref(), &name)?;
            for endpoint in &service.endpoints {
                self.check_profile_ref(endpoint.performance_profile.as_deref(), &endpoint.label())?;
            }
        }

        let mut actor_names = HashSet::new();
        let mut producers = HashSet::new();
        let mut produce_tags: HashSet<String> = HashSet::new();
        for service in self.async_services() {
            let name = service.service_name();
            self.check_profile_ref(service.performance_profile.as_deref(), &name)?;
            for actor in &service.actors {
                if !actor_names.insert(actor.name.as_str()) {
                    return Err(EngineError::config(format!("duplicate actor name {}", actor.name)));
                }
                actor
                    .validate()
                    .map_err(|e| EngineError::config(format!("actor {}: {}", actor.name, e)))?;
                self.check_profile_ref(actor.performance_profile.as_deref(), &actor.name)?;
                if actor.produce.is_some() {
                    producers.insert(actor.name.as_str());
                }
                produce_tags.extend(actor.produce_entries().into_iter().filter_map(|e| e.tag));
            }
        }

        for service in self.http_services() {
            for endpoint in &service.endpoints {
                for response in endpoint.response.resolve() {
                    if let Some(target) = &response.trigger_async_producer {
                        if !producers.contains(target.as_str())
                            && !produce_tags.contains(target.as_str())
                        {
                            return Err(EngineError::config(format!(
                                "endpoint {}: unknown async producer {}",
                                endpoint.label(),
                                target
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn check_profile_ref(&self, name: Option<&str>, owner: &str) -> Result<(), EngineError> {
        match name {
            Some(name) if !self.performance_profiles.contains_key(name) => Err(
                EngineError::config(format!("{}: unknown performance profile {}", owner, name)),
            ),
            _ => Ok(()),
        }
    }
}

/// One impersonated service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceDefinition {
    Http(HttpServiceConfig),
    Async(AsyncServiceConfig),
}

/// An HTTP service listening on one port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpServiceConfig {
    /// Optional name (defaults to `hostname:port`)
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_hostname")]
    pub hostname: String,

    pub port: u16,

    #[serde(default)]
    pub ssl: bool,

    #[serde(default)]
    pub ssl_cert_file: Option<String>,

    #[serde(default)]
    pub ssl_key_file: Option<String>,

    /// Endpoints, matched in declaration order
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,

    #[serde(default)]
    pub performance_profile: Option<String>,

    /// Upstream base URL unmatched requests are forwarded to
    #[serde(default)]
    pub fallback_to: Option<String>,
}

fn default_hostname() -> String {
    "localhost".to_string()
}

impl HttpServiceConfig {
    pub fn service_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.hostname, self.port))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ssl && (self.ssl_cert_file.is_none() || self.ssl_key_file.is_none()) {
            anyhow::bail!("ssl requires ssl_cert_file and ssl_key_file");
        }
        for endpoint in &self.endpoints {
            endpoint
                .validate()
                .map_err(|e| anyhow::anyhow!("endpoint {}: {}", endpoint.label(), e))?;
        }
        Ok(())
    }
}

/// One HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointConfig {
    /// Identifier used by the management surface
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub comment: Option<String>,

    pub path: PathSpec,

    #[serde(default = "default_method")]
    pub method: String,

    /// Query parameter matching
    #[serde(default)]
    pub query: HashMap<String, QueryMatcher>,

    /// Header matching
    #[serde(default)]
    pub headers: HashMap<String, HeaderMatcher>,

    /// Body matching
    #[serde(default)]
    pub body: Option<BodyMatcher>,

    pub response: ResponseConfig,

    #[serde(default)]
    pub dataset: Option<DatasetConfig>,

    #[serde(default = "default_true")]
    pub multi_responses_looped: bool,

    #[serde(default = "default_true")]
    pub dataset_looped: bool,

    #[serde(default)]
    pub performance_profile: Option<String>,

    /// Overrides the global tag fallback policy
    #[serde(default)]
    pub tag_fallback: Option<TagFallback>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_true() -> bool {
    true
}

impl EndpointConfig {
    pub fn label(&self) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("{} {}", self.method, self.path))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.path.matcher().validate()?;
        for (name, qm) in &self.query {
            if let QueryMatcher::Regex { pattern } = qm {
                regex::Regex::new(pattern)
                    .map_err(|e| anyhow::anyhow!("query {}: invalid regex: {}", name, e))?;
            }
        }
        for (name, hm) in &self.headers {
            if let HeaderMatcher::Regex { pattern } = hm {
                regex::Regex::new(pattern)
                    .map_err(|e| anyhow::anyhow!("header {}: invalid regex: {}", name, e))?;
            }
        }
        if let Some(BodyMatcher::Regex { pattern }) = &self.body {
            regex::Regex::new(pattern).map_err(|e| anyhow::anyhow!("body: invalid regex: {}", e))?;
        }

        let responses = self.response.resolve();
        if responses.is_empty() {
            anyhow::bail!("response list cannot be empty");
        }
        for response in &responses {
            response.validate()?;
        }
        check_tags(responses.iter().filter_map(|r| r.tag()), "responses")?;

        if let Some(DatasetConfig::Inline(rows)) = &self.dataset {
            if rows.is_empty() {
                anyhow::bail!("dataset cannot be empty");
            }
        }
        Ok(())
    }
}

/// Path matching: a plain string or a typed matcher.
///
/// Plain strings containing `{name}` segments are path templates, anything
/// else is an exact match.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSpec {
    Plain(String),
    Typed(PathMatcher),
}

impl PathSpec {
    pub fn matcher(&self) -> PathMatcher {
        match self {
            PathSpec::Plain(path) if path.contains('{') => PathMatcher::Template {
                template: path.clone(),
            },
            PathSpec::Plain(path) => PathMatcher::Exact { value: path.clone() },
            PathSpec::Typed(matcher) => matcher.clone(),
        }
    }
}

impl std::fmt::Display for PathSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathSpec::Plain(path) => f.write_str(path),
            PathSpec::Typed(PathMatcher::Exact { value })
            | PathSpec::Typed(PathMatcher::Prefix { value }) => f.write_str(value),
            PathSpec::Typed(PathMatcher::Regex { pattern })
            | PathSpec::Typed(PathMatcher::Glob { pattern }) => f.write_str(pattern),
            PathSpec::Typed(PathMatcher::Template { template }) => f.write_str(template),
        }
    }
}

/// Path matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PathMatcher {
    /// Exact path match
    Exact { value: String },
    /// Path prefix match
    Prefix { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Glob pattern match
    Glob { pattern: String },
    /// Path with parameters (e.g., /users/{id})
    Template { template: String },
}

impl PathMatcher {
    /// Validate the path matcher.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self {
            PathMatcher::Regex { pattern } => {
                regex::Regex::new(pattern).map_err(|e| anyhow::anyhow!("Invalid regex: {}", e))?;
            }
            PathMatcher::Glob { pattern } => {
                globset::Glob::new(pattern).map_err(|e| anyhow::anyhow!("Invalid glob: {}", e))?;
            }
            _ => {}
        }
        Ok(())
    }
}

/// Query parameter matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueryMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Parameter must be present (any value)
    Present,
    /// Parameter must be absent
    Absent,
}

/// Header matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeaderMatcher {
    /// Exact value match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// Header must be present (any value)
    Present,
    /// Header must be absent
    Absent,
    /// Value must contain substring
    Contains { value: String },
}

/// Body matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BodyMatcher {
    /// Exact body match
    Exact { value: String },
    /// Regex pattern match
    Regex { pattern: String },
    /// JSON path matching
    JsonPath {
        /// JSON path expressions and expected values
        expressions: HashMap<String, serde_json::Value>,
    },
    /// Body must contain substring
    Contains { value: String },
    /// Body must be valid JSON (any structure)
    Json,
    /// Body must be JSON of the declared shape
    Schema { schema: serde_json::Value },
    /// Body must be empty
    Empty,
}

/// Response set as written: a bare string, one response, or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseConfig {
    Text(String),
    Multi(Vec<ResponseItem>),
    Single(ResponseDefinition),
}

/// One entry of a response list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseItem {
    Text(String),
    Full(ResponseDefinition),
}

impl ResponseConfig {
    /// Flatten into the ordered list of concrete responses.
    pub fn resolve(&self) -> Vec<ResponseDefinition> {
        match self {
            ResponseConfig::Text(body) => vec![ResponseDefinition::text(body)],
            ResponseConfig::Single(response) => vec![response.clone()],
            ResponseConfig::Multi(items) => items
                .iter()
                .map(|item| match item {
                    ResponseItem::Text(body) => ResponseDefinition::text(body),
                    ResponseItem::Full(response) => response.clone(),
                })
                .collect(),
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, ResponseConfig::Multi(_))
    }
}

/// Response definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponseDefinition {
    /// HTTP status code
    #[serde(default = "default_status")]
    pub status: u16,

    /// Response headers
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Response body
    #[serde(default)]
    pub body: Option<ResponseBody>,

    /// Whether body and headers are templates. Base64 bodies never are.
    #[serde(default = "default_true")]
    pub template: bool,

    /// Tag for out-of-band selection
    #[serde(default)]
    pub tag: Option<String>,

    /// Actor name or produce tag to fire after responding
    #[serde(default)]
    pub trigger_async_producer: Option<String>,
}

fn default_status() -> u16 {
    200
}

impl ResponseDefinition {
    /// A 200 text response; templating is on when the text uses template syntax.
    pub fn text(body: &str) -> Self {
        Self {
            status: default_status(),
            headers: HashMap::new(),
            body: Some(ResponseBody::Text {
                content: body.to_string(),
            }),
            template: body.contains("{{"),
            tag: None,
            trigger_async_producer: None,
        }
    }

    /// Validate the response definition.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.status < 100 || self.status > 599 {
            anyhow::bail!("Invalid status code: {}", self.status);
        }
        Ok(())
    }
}

impl Tagged for ResponseDefinition {
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

/// Response body configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Plain text body
    Text { content: String },
    /// JSON body
    Json { content: serde_json::Value },
    /// Base64 encoded binary
    Base64 { content: String },
    /// Load from file
    File { path: String },
}

impl ResponseBody {
    /// Get the body content as bytes.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        match self {
            ResponseBody::Text { content } => Ok(content.as_bytes().to_vec()),
            ResponseBody::Json { content } => Ok(serde_json::to_string(content)?.into_bytes()),
            ResponseBody::Base64 { content } => {
                use base64::Engine;
                base64::engine::general_purpose::STANDARD
                    .decode(content)
                    .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))
            }
            ResponseBody::File { path } => std::fs::read(path)
                .map_err(|e| anyhow::anyhow!("Failed to read file {}: {}", path, e)),
        }
    }

    /// Get content type for this body.
    pub fn content_type(&self) -> &'static str {
        match self {
            ResponseBody::Text { .. } => "text/plain",
            ResponseBody::Json { .. } => "application/json",
            ResponseBody::Base64 { .. } => "application/octet-stream",
            ResponseBody::File { .. } => "application/octet-stream",
        }
    }

    /// Resolve a relative file path against `base_dir`.
    pub fn rebased(&self, base_dir: Option<&Path>) -> Self {
        match (self, base_dir) {
            (ResponseBody::File { path }, Some(dir)) if Path::new(path).is_relative() => {
                ResponseBody::File {
                    path: dir.join(path).to_string_lossy().into_owned(),
                }
            }
            _ => self.clone(),
        }
    }
}

/// Dataset source: inline rows or a JSON/YAML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DatasetConfig {
    Inline(Vec<serde_json::Value>),
    File(String),
}

/// What happens when a tag hint matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TagFallback {
    /// Serve the next variant in sequence
    #[default]
    Sequential,
    /// Answer with a `tag_not_found` error
    Fail,
}

/// A named performance profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PerformanceProfileConfig {
    /// Share of interactions that are degraded (0.0 - 1.0)
    pub ratio: f64,

    /// Delay applied to degraded interactions
    #[serde(default)]
    pub delay_ms: u64,

    /// Fault name -> weight
    #[serde(default)]
    pub faults: HashMap<String, f64>,
}

impl PerformanceProfileConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.ratio) {
            anyhow::bail!("ratio must be between 0.0 and 1.0, got {}", self.ratio);
        }
        for (name, weight) in &self.faults {
            if !weight.is_finite() || *weight < 0.0 {
                anyhow::bail!("fault {} has invalid weight {}", name, weight);
            }
            name.parse::<Fault>().map_err(|e| anyhow::anyhow!("{}", e))?;
        }
        Ok(())
    }
}

/// Global settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GlobalSettings {
    /// Headers added to every HTTP response (endpoint headers win)
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Default performance profile
    #[serde(default)]
    pub performance_profile: Option<String>,

    #[serde(default)]
    pub tag_fallback: TagFallback,

    /// Request header carrying a per-request tag hint
    #[serde(default = "default_tag_header")]
    pub tag_header: String,

    /// Log all matched endpoints
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log unmatched requests
    #[serde(default = "default_true")]
    pub log_unmatched: bool,

    /// Default content type for responses
    #[serde(default = "default_content_type")]
    pub default_content_type: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            headers: HashMap::new(),
            performance_profile: None,
            tag_fallback: TagFallback::default(),
            tag_header: default_tag_header(),
            log_matches: true,
            log_unmatched: true,
            default_content_type: default_content_type(),
        }
    }
}

fn default_tag_header() -> String {
    "x-mock-tag".to_string()
}

fn default_content_type() -> String {
    "application/json".to_string()
}

/// A broker-backed service whose behavior is driven by actors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AsyncServiceConfig {
    #[serde(default)]
    pub name: Option<String>,

    /// Broker transport type (e.g. `memory`)
    #[serde(default = "default_broker")]
    pub broker: String,

    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub ssl: bool,

    #[serde(default)]
    pub performance_profile: Option<String>,

    #[serde(default)]
    pub actors: Vec<ActorConfig>,
}

fn default_broker() -> String {
    "memory".to_string()
}

impl AsyncServiceConfig {
    pub fn service_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}@{}", self.broker, self.address))
    }
}

/// An independently scheduled producer and/or consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActorConfig {
    pub name: String,

    #[serde(default)]
    pub dataset: Option<DatasetConfig>,

    #[serde(default)]
    pub produce: Option<ProduceSpec>,

    #[serde(default)]
    pub consume: Option<ConsumeConfig>,

    /// Pause between iterations; a producer without one only fires on triggers
    #[serde(default)]
    pub delay_ms: Option<u64>,

    /// Stop after this many iterations
    #[serde(default)]
    pub limit: Option<u64>,

    #[serde(default = "default_true")]
    pub multi_payloads_looped: bool,

    #[serde(default = "default_true")]
    pub dataset_looped: bool,

    #[serde(default)]
    pub performance_profile: Option<String>,
}

impl ActorConfig {
    pub fn produce_entries(&self) -> Vec<ProduceConfig> {
        match &self.produce {
            None => Vec::new(),
            Some(ProduceSpec::Single(entry)) => vec![entry.clone()],
            Some(ProduceSpec::Multi(entries)) => entries.clone(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("actor name cannot be empty");
        }
        if self.produce.is_none() && self.consume.is_none() {
            anyhow::bail!("actor needs a produce or consume role");
        }
        if let Some(ProduceSpec::Multi(entries)) = &self.produce {
            if entries.is_empty() {
                anyhow::bail!("produce list cannot be empty");
            }
        }
        let entries = self.produce_entries();
        check_tags(entries.iter().filter_map(|e| e.tag.as_deref()), "produce")?;
        if let Some(consume) = &self.consume {
            if consume.capture == 0 {
                anyhow::bail!("capture must be at least 1");
            }
            if let Some(pattern) = &consume.value {
                regex::Regex::new(pattern)
                    .map_err(|e| anyhow::anyhow!("consume value: invalid regex: {}", e))?;
            }
        }
        if let Some(DatasetConfig::Inline(rows)) = &self.dataset {
            if rows.is_empty() {
                anyhow::bail!("dataset cannot be empty");
            }
        }
        Ok(())
    }
}

/// One produce entry or a list walked in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProduceSpec {
    Multi(Vec<ProduceConfig>),
    Single(ProduceConfig),
}

/// A message to send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProduceConfig {
    pub queue: String,

    /// Message value template
    pub value: String,

    #[serde(default)]
    pub key: Option<String>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Broker-specific properties (e.g. AMQP delivery mode)
    #[serde(default)]
    pub properties: HashMap<String, serde_json::Value>,

    #[serde(default)]
    pub tag: Option<String>,
}

impl Tagged for ProduceConfig {
    fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }
}

/// Where and what to consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsumeConfig {
    pub queue: String,

    #[serde(default)]
    pub group: Option<String>,

    /// Only messages with this key
    #[serde(default)]
    pub key: Option<String>,

    /// Only messages whose value matches this regex
    #[serde(default)]
    pub value: Option<String>,

    /// Only messages carrying these header values
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Declared payload shape
    #[serde(default)]
    pub schema: Option<serde_json::Value>,

    /// Messages taken per iteration and kept in history
    #[serde(default = "default_capture")]
    pub capture: usize,
}

fn default_capture() -> usize {
    1
}
