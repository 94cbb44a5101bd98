//! The mock engine: one instance per loaded definition.
//!
//! Holds every piece of runtime state (cursors, counters, the rendering
//! worker, actor tasks). There are no process-wide singletons; two engines
//! built from the same definition never share state.

use crate::actor::{ActorDeps, ActorRegistry, ActorState, ActorStats};
use crate::broker::{BrokerMessage, BrokerTransport, MemoryBroker};
use crate::config::MockConfig;
use crate::error::{EngineError, Result};
use crate::http::{ActiveTags, HttpDeps, HttpOutcome, HttpService, HttpStats, MockRequest};
use crate::performance::{
    PerformanceEvaluator, ProfileSet, RandomSource, SeededRandom, ThreadRandom,
};
use crate::render::RenderCoordinator;
use crate::selector::{CursorPositions, ResponseSelector};
use crate::template::{HandlebarsRenderer, Renderer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::info;

/// Builds a [`MockEngine`] from a validated definition.
pub struct EngineBuilder {
    config: MockConfig,
    renderer: Option<Box<dyn Renderer>>,
    random: Arc<dyn RandomSource>,
    transports: HashMap<String, Arc<dyn BrokerTransport>>,
    memory: Arc<MemoryBroker>,
    active_tags: Vec<String>,
}

impl EngineBuilder {
    pub fn new(config: MockConfig) -> Self {
        let memory = Arc::new(MemoryBroker::new());
        let mut transports: HashMap<String, Arc<dyn BrokerTransport>> = HashMap::new();
        transports.insert("memory".to_string(), memory.clone());
        Self {
            config,
            renderer: None,
            random: Arc::new(ThreadRandom),
            transports,
            memory,
            active_tags: Vec::new(),
        }
    }

    /// Replace the Handlebars renderer.
    pub fn renderer(mut self, renderer: Box<dyn Renderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Random source for performance profiles.
    pub fn random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Reproducible performance profiles.
    pub fn seed(self, seed: u64) -> Self {
        self.random(Arc::new(SeededRandom::new(seed)))
    }

    /// Register the transport for async services of type `kind`.
    pub fn transport(mut self, kind: &str, transport: Arc<dyn BrokerTransport>) -> Self {
        self.transports.insert(kind.to_string(), transport);
        self
    }

    pub fn active_tags(mut self, tags: Vec<String>) -> Self {
        self.active_tags = tags;
        self
    }

    pub fn build(self) -> Result<MockEngine> {
        let config = self.config;
        config.validate()?;

        let profiles = ProfileSet::from_config(
            &config.performance_profiles,
            config.globals.performance_profile.as_deref(),
        )?;
        let evaluator = PerformanceEvaluator::new(self.random);
        let coordinator = RenderCoordinator::new();
        let base_dir = config.base_dir.as_deref();

        let mut actors = ActorRegistry::new();
        for service in config.async_services() {
            let name = service.service_name();
            let transport = self.transports.get(&service.broker).cloned().ok_or_else(|| {
                EngineError::config(format!(
                    "async service {}: unknown broker type {}",
                    name, service.broker
                ))
            })?;
            for actor in &service.actors {
                let profile = profiles.resolve(
                    actor.performance_profile.as_deref(),
                    service.performance_profile.as_deref(),
                )?;
                let deps = ActorDeps {
                    transport: transport.clone(),
                    renderer: coordinator.handle(),
                    evaluator: evaluator.clone(),
                    profile,
                };
                actors.add(&name, actor, deps, base_dir)?;
            }
        }
        let actors = Arc::new(actors);

        let active_tags: ActiveTags = Arc::new(RwLock::new(self.active_tags));
        let deps = HttpDeps {
            selector: ResponseSelector::new(
                coordinator.handle(),
                &config.globals.headers,
                &config.globals.default_content_type,
            ),
            evaluator,
            profiles,
            active_tags: active_tags.clone(),
            actors: actors.clone(),
        };
        let mut http = Vec::new();
        let mut http_by_name = HashMap::new();
        for service in config.http_services() {
            let service = HttpService::build(service, &config.globals, base_dir, deps.clone())?;
            http_by_name.insert(service.name().to_string(), http.len());
            http.push(Arc::new(service));
        }

        info!(
            http_services = http.len(),
            actors = actors.len(),
            profiles = config.performance_profiles.len(),
            "Mock engine built"
        );

        Ok(MockEngine {
            renderer: Mutex::new(Some(
                self.renderer
                    .unwrap_or_else(|| Box::new(HandlebarsRenderer::new())),
            )),
            config,
            coordinator,
            http,
            http_by_name,
            actors,
            active_tags,
            transports: self.transports,
            memory: self.memory,
            started: AtomicBool::new(false),
        })
    }
}

/// A running (or runnable) service virtualization engine.
pub struct MockEngine {
    config: MockConfig,
    coordinator: RenderCoordinator,
    renderer: Mutex<Option<Box<dyn Renderer>>>,
    http: Vec<Arc<HttpService>>,
    http_by_name: HashMap<String, usize>,
    actors: Arc<ActorRegistry>,
    active_tags: ActiveTags,
    transports: HashMap<String, Arc<dyn BrokerTransport>>,
    memory: Arc<MemoryBroker>,
    started: AtomicBool,
}

impl MockEngine {
    pub fn builder(config: MockConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Start the rendering worker and every actor.
    ///
    /// Must be called from within a tokio runtime. The engine only counts as
    /// started once both have come up, so a start refused for a missing
    /// runtime can be retried.
    pub fn start(&self) -> Result<()> {
        let mut renderer = match self.renderer.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.started.load(Ordering::Acquire) {
            return Err(EngineError::AlreadyStarted);
        }
        tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::config(format!("the engine needs a tokio runtime: {}", e)))?;

        let renderer = renderer
            .take()
            .ok_or_else(|| EngineError::config("rendering worker failed to start earlier"))?;
        self.coordinator.start(renderer)?;
        self.actors.start()?;
        self.started.store(true, Ordering::Release);
        info!("Mock engine started");
        Ok(())
    }

    /// Stop actors, then drain and stop the rendering worker.
    pub async fn stop(&self) {
        self.actors.stop().await;
        self.coordinator.shutdown().await;
        info!("Mock engine stopped");
    }

    pub fn config(&self) -> &MockConfig {
        &self.config
    }

    pub fn http_services(&self) -> impl Iterator<Item = &Arc<HttpService>> {
        self.http.iter()
    }

    pub fn http_service(&self, name: &str) -> Result<&Arc<HttpService>> {
        self.http_by_name
            .get(name)
            .map(|&i| &self.http[i])
            .ok_or_else(|| EngineError::config(format!("unknown HTTP service {}", name)))
    }

    /// Handle one request addressed to the named HTTP service.
    pub async fn handle(&self, service: &str, request: &MockRequest) -> Result<HttpOutcome> {
        Ok(self.http_service(service)?.handle(request).await)
    }

    // Management surface

    pub fn set_active_tags(&self, tags: Vec<String>) {
        info!(tags = ?tags, "Active tags changed");
        match self.active_tags.write() {
            Ok(mut active) => *active = tags,
            Err(poisoned) => *poisoned.into_inner() = tags,
        }
    }

    pub fn active_tags(&self) -> Vec<String> {
        self.active_tags
            .read()
            .map(|tags| tags.clone())
            .unwrap_or_default()
    }

    /// Rewind one endpoint, or every endpoint of the service.
    pub fn reset_datasets(&self, service: &str, endpoint: Option<&str>) -> Result<()> {
        self.http_service(service)?.reset(endpoint)
    }

    /// Rewind every endpoint and every actor.
    pub fn reset_all_datasets(&self) -> Result<()> {
        for service in &self.http {
            service.reset(None)?;
        }
        self.actors.reset_datasets(None)
    }

    pub fn reset_actor_datasets(&self, actor: &str) -> Result<()> {
        self.actors.reset_datasets(Some(actor))
    }

    pub fn cursor_positions(&self, service: &str) -> Result<Vec<(String, CursorPositions)>> {
        Ok(self.http_service(service)?.cursor_positions())
    }

    /// Index of the response tagged `tag`; never moves the cursor.
    pub fn response_by_tag(&self, service: &str, endpoint: &str, tag: &str) -> Result<usize> {
        self.http_service(service)?.response_by_tag(endpoint, tag)
    }

    pub fn http_stats(&self, service: &str) -> Result<HttpStats> {
        Ok(self.http_service(service)?.stats())
    }

    pub async fn trigger_actor(&self, name: &str, tag: Option<&str>) -> Result<()> {
        self.actors.trigger_actor(name, tag).await
    }

    pub fn actor_state(&self, name: &str) -> Result<ActorState> {
        self.actors.state(name)
    }

    pub fn actor_stats(&self, name: &str) -> Result<ActorStats> {
        self.actors.stats(name)
    }

    pub fn captured_messages(&self, name: &str) -> Result<Vec<BrokerMessage>> {
        self.actors.captured(name)
    }

    pub async fn wait_for_actor(&self, name: &str, state: ActorState) -> Result<ActorState> {
        self.actors.wait_for_state(name, state).await
    }

    pub fn transport(&self, kind: &str) -> Option<Arc<dyn BrokerTransport>> {
        self.transports.get(kind).cloned()
    }

    /// The bundled in-memory broker.
    pub fn memory_broker(&self) -> &Arc<MemoryBroker> {
        &self.memory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::performance::SequenceRandom;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn engine(yaml: &str) -> MockEngine {
        let config = MockConfig::from_yaml(yaml).unwrap();
        let engine = MockEngine::builder(config).build().unwrap();
        engine.start().unwrap();
        engine
    }

    async fn body(engine: &MockEngine, service: &str, request: MockRequest) -> String {
        match engine.handle(service, &request).await.unwrap() {
            HttpOutcome::Respond(response) => response.body_text(),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    async fn get(engine: &MockEngine, path: &str) -> String {
        body(engine, "api", MockRequest::new("GET", path)).await
    }

    const SEQUENCES: &str = r#"
services:
  - type: http
    name: api
    port: 8001
    endpoints:
      - id: sticky
        path: /sticky
        multi_responses_looped: false
        response: [A, B, C]
      - id: looped
        path: /looped
        response: [A, B, C]
      - id: tagged
        path: /tagged
        response:
          - {tag: red, body: {type: text, content: R}}
          - {tag: green, body: {type: text, content: G}}
          - {tag: blue, body: {type: text, content: B}}
"#;

    #[tokio::test]
    async fn test_non_looping_returns_sticky_end() {
        let engine = engine(SEQUENCES);
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(get(&engine, "/sticky").await);
        }
        assert_eq!(seen, ["A", "B", "C", "C", "C"]);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_looping_returns_k_minus_one_mod_n() {
        let engine = engine(SEQUENCES);
        let variants = ["A", "B", "C"];
        for k in 1..=10usize {
            assert_eq!(get(&engine, "/looped").await, variants[(k - 1) % 3]);
        }
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_tag_lookup_keeps_cursor() {
        let engine = engine(SEQUENCES);
        get(&engine, "/tagged").await;
        get(&engine, "/tagged").await;

        assert_eq!(engine.response_by_tag("api", "tagged", "red").unwrap(), 0);
        engine.set_active_tags(vec!["red".to_string()]);
        assert_eq!(get(&engine, "/tagged").await, "R");
        engine.set_active_tags(Vec::new());

        let positions = engine.cursor_positions("api").unwrap();
        let tagged = positions.iter().find(|(label, _)| label == "tagged").unwrap();
        assert_eq!(tagged.1.responses, 2);
        assert_eq!(get(&engine, "/tagged").await, "B");
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_reset_datasets_rewinds() {
        let engine = engine(SEQUENCES);
        get(&engine, "/sticky").await;
        get(&engine, "/sticky").await;
        engine.reset_datasets("api", Some("sticky")).unwrap();
        assert_eq!(get(&engine, "/sticky").await, "A");

        get(&engine, "/looped").await;
        engine.reset_all_datasets().unwrap();
        assert_eq!(get(&engine, "/looped").await, "A");
        engine.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_non_looping_requests_are_exactly_once() {
        let responses: Vec<String> = (0..40).map(|i| format!("\"v{}\"", i)).collect();
        let yaml = format!(
            r#"
services:
  - type: http
    name: api
    port: 8001
    endpoints:
      - path: /burst
        multi_responses_looped: false
        response: [{}]
"#,
            responses.join(", ")
        );
        let engine = Arc::new(engine(&yaml));

        let tasks: Vec<_> = (0..40)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { get(&engine, "/burst").await })
            })
            .collect();
        let mut seen = Vec::new();
        for task in tasks {
            seen.push(task.await.unwrap());
        }
        seen.sort();
        let mut expected: Vec<String> = (0..40).map(|i| format!("v{}", i)).collect();
        expected.sort();
        assert_eq!(seen, expected);

        // Exhausted: the last variant sticks
        assert_eq!(get(&engine, "/burst").await, "v39");
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_503_profile_always_faults() {
        let engine = engine(
            r#"
performance_profiles:
  outage:
    ratio: 1.0
    delay_ms: 0
    faults: {"503": 1.0}
services:
  - type: http
    name: api
    port: 8001
    endpoints:
      - path: /x
        performance_profile: outage
        response: normal
"#,
        );
        for _ in 0..20 {
            let outcome = engine.handle("api", &MockRequest::new("GET", "/x")).await.unwrap();
            let response = outcome.response().unwrap();
            assert_eq!(response.status, 503);
            assert_ne!(response.body_text(), "normal");
        }
        assert_eq!(engine.http_stats("api").unwrap().faulted, 20);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_global_profile_with_injected_random() {
        let config = MockConfig::from_yaml(
            r#"
globals:
  performance_profile: half
performance_profiles:
  half:
    ratio: 0.5
    faults: {EMPTY: 1.0}
services:
  - type: http
    name: api
    port: 8001
    endpoints:
      - path: /x
        response: full
"#,
        )
        .unwrap();
        let engine = MockEngine::builder(config)
            .random(Arc::new(SequenceRandom::new(vec![0.7, 0.2, 0.0])))
            .build()
            .unwrap();
        engine.start().unwrap();

        assert_eq!(get(&engine, "/x").await, "full");
        assert_eq!(get(&engine, "/x").await, "");
        engine.stop().await;
    }

    const ASYNC: &str = r#"
services:
  - type: http
    name: api
    port: 8001
    endpoints:
      - path: /orders
        method: POST
        response:
          status: 202
          trigger_async_producer: order-created
  - type: async
    name: bus
    broker: memory
    actors:
      - name: ticker
        delay_ms: 0
        limit: 2
        produce: {queue: ticks, value: tick}
      - name: notifier
        produce:
          - {queue: notifications, value: created, tag: order-created}
      - name: validator
        consume:
          queue: inbound
          schema: {type: object, required: [id]}
"#;

    #[tokio::test]
    async fn test_produce_limit_then_trigger_rejected() {
        let engine = engine(ASYNC);
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            engine.wait_for_actor("ticker", ActorState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(state, ActorState::Stopped);
        assert_eq!(engine.memory_broker().depth("ticks").await, 2);

        let err = assert_err!(engine.trigger_actor("ticker", None).await);
        assert_eq!(err, EngineError::ActorStopped("ticker".to_string()));
        assert_eq!(engine.memory_broker().depth("ticks").await, 2);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_http_response_triggers_producer() {
        let engine = engine(ASYNC);
        let outcome = engine
            .handle("api", &MockRequest::new("POST", "/orders"))
            .await
            .unwrap();
        assert_eq!(outcome.response().unwrap().status, 202);

        let transport = engine.transport("memory").unwrap();
        let message = transport
            .receive("notifications", Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.value, "created");
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_message_does_not_stop_consumer() {
        let engine = engine(ASYNC);
        let broker = engine.memory_broker().clone();
        broker.send("inbound", BrokerMessage::new("{broken")).await.unwrap();
        broker.send("inbound", BrokerMessage::new(r#"{"id": 1}"#)).await.unwrap();

        for _ in 0..200 {
            if engine.actor_stats("validator").unwrap().consumed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let stats = engine.actor_stats("validator").unwrap();
        assert_eq!((stats.rejected, stats.consumed), (1, 1));
        assert_eq!(engine.actor_state("validator").unwrap(), ActorState::Running);
        assert_eq!(engine.captured_messages("validator").unwrap().len(), 1);
        engine.stop().await;
        assert_eq!(engine.actor_state("validator").unwrap(), ActorState::Stopped);
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let engine = engine(
            r#"
services:
  - type: http
    name: api
    port: 8001
    endpoints:
      - path: /hi
        response: "Hi {{method}}"
"#,
        );
        assert_eq!(engine.start(), Err(EngineError::AlreadyStarted));
        assert_eq!(get(&engine, "/hi").await, "Hi GET");

        engine.stop().await;
        let outcome = assert_ok!(engine.handle("api", &MockRequest::new("GET", "/hi")).await);
        assert_eq!(outcome.response().unwrap().status, 503);
        assert!(engine.handle("nope", &MockRequest::new("GET", "/")).await.is_err());
    }

    #[test]
    fn test_start_outside_runtime_can_be_retried() {
        let config = MockConfig::from_yaml(SEQUENCES).unwrap();
        let engine = MockEngine::builder(config).build().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::Configuration(_))));

        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            engine.start().unwrap();
            assert_eq!(get(&engine, "/sticky").await, "A");
            assert_eq!(engine.start(), Err(EngineError::AlreadyStarted));
            engine.stop().await;
        });
    }

    #[test]
    fn test_unknown_broker_type_is_configuration_error() {
        let config = MockConfig::from_yaml(
            r#"
services:
  - type: async
    broker: kafka
    address: localhost:9092
    actors:
      - name: p
        produce: {queue: q, value: v}
"#,
        )
        .unwrap();
        let err = MockEngine::builder(config).build().err().unwrap();
        assert!(matches!(err, EngineError::Configuration(ref m) if m.contains("kafka")));
    }

    #[tokio::test]
    async fn test_registered_transport_is_used() {
        let config = MockConfig::from_yaml(
            r#"
services:
  - type: async
    broker: kafka
    actors:
      - name: p
        produce: {queue: q, value: v}
"#,
        )
        .unwrap();
        let kafka = Arc::new(MemoryBroker::new());
        let engine = MockEngine::builder(config)
            .transport("kafka", kafka.clone())
            .build()
            .unwrap();
        engine.start().unwrap();
        engine.trigger_actor("p", None).await.unwrap();
        assert_eq!(kafka.depth("q").await, 1);
        assert_eq!(engine.memory_broker().depth("q").await, 0);
        engine.stop().await;
    }

    #[test]
    fn test_sample_config_builds() {
        let config = MockConfig::from_yaml(include_str!("../demos/sample-config.yaml")).unwrap();
        assert_eq!(config.http_services().count(), 2);
        let engine = MockEngine::builder(config).build().unwrap();
        assert_eq!(engine.http_services().count(), 2);
        assert_eq!(engine.actor_state("payment-relay").unwrap(), ActorState::Idle);
    }

    #[tokio::test]
    async fn test_file_config_with_dataset_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("users.yaml"),
            "- {name: Ada}\n- {name: Linus, tag: kernel}\n",
        )
        .unwrap();
        let config_path = dir.path().join("mock.yaml");
        std::fs::write(
            &config_path,
            r#"
services:
  - type: http
    name: api
    port: 8001
    endpoints:
      - path: /user
        dataset: users.yaml
        response: "{{name}}"
"#,
        )
        .unwrap();

        let config = MockConfig::from_file(&config_path).unwrap();
        let engine = MockEngine::builder(config).build().unwrap();
        engine.start().unwrap();

        assert_eq!(get(&engine, "/user").await, "Ada");
        let tagged = MockRequest::new("GET", "/user").with_header("x-mock-tag", "kernel");
        assert_eq!(body(&engine, "api", tagged).await, "Linus");
        assert_eq!(get(&engine, "/user").await, "Linus");
        engine.stop().await;
    }
}
