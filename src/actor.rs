//! Async actor scheduler.
//!
//! Every configured actor runs as its own tokio task. An actor owns its
//! cursors and counters; the outside world talks to it through a command
//! channel (manual triggers, dataset resets) and observes it through a
//! state watch. All actors share one shutdown signal.
//!
//! ```text
//! Idle -> Running -> Stopping -> Stopped
//! ```

use crate::broker::{BrokerMessage, BrokerTransport};
use crate::config::{ActorConfig, ConsumeConfig, ProduceConfig};
use crate::dataset::{load_rows, DatasetCursor, DatasetRow};
use crate::error::{EngineError, Result};
use crate::performance::{Fault, Outcome, PerformanceEvaluator, PerformanceProfile};
use crate::render::{PendingRender, RenderHandle, RenderInput, RenderOutput};
use crate::schema;
use crate::template::TemplateContext;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How long one consume poll waits before pending commands are looked at.
const CONSUME_POLL: Duration = Duration::from_millis(100);

/// Retry pause after a broker failure when the actor has no delay of its own.
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle of one actor. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Counters for one actor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActorStats {
    pub sent: u64,
    pub consumed: u64,
    /// Consumed messages dropped by schema validation
    pub rejected: u64,
    /// Iterations degraded into a skipped send
    pub faulted: u64,
    /// Broker and rendering failures
    pub errors: u64,
}

#[derive(Debug, Default)]
struct ActorCounters {
    sent: AtomicU64,
    consumed: AtomicU64,
    rejected: AtomicU64,
    faulted: AtomicU64,
    errors: AtomicU64,
}

impl ActorCounters {
    fn snapshot(&self) -> ActorStats {
        ActorStats {
            sent: self.sent.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

enum ActorCommand {
    /// Produce once, optionally picking the payload by tag
    Trigger {
        tag: Option<String>,
        reply: Option<oneshot::Sender<Result<()>>>,
    },
    ResetDatasets,
}

/// Shared collaborators every actor needs.
#[derive(Clone)]
pub struct ActorDeps {
    pub transport: Arc<dyn BrokerTransport>,
    pub renderer: RenderHandle,
    pub evaluator: PerformanceEvaluator,
    pub profile: Option<Arc<PerformanceProfile>>,
}

#[derive(Clone)]
struct ConsumeSpec {
    queue: String,
    group: Option<String>,
    key: Option<String>,
    value: Option<Regex>,
    headers: HashMap<String, String>,
    schema: Option<Value>,
    capture: usize,
}

impl ConsumeSpec {
    fn from_config(config: &ConsumeConfig) -> Result<Self> {
        let value = config
            .value
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                EngineError::config(format!("consume {}: invalid regex: {}", config.queue, e))
            })?;
        Ok(Self {
            queue: config.queue.clone(),
            group: config.group.clone(),
            key: config.key.clone(),
            value,
            headers: config.headers.clone(),
            schema: config.schema.clone(),
            capture: config.capture.max(1),
        })
    }

    fn accepts(&self, message: &BrokerMessage) -> bool {
        if let Some(key) = &self.key {
            if message.key.as_deref() != Some(key.as_str()) {
                return false;
            }
        }
        if let Some(pattern) = &self.value {
            if !pattern.is_match(&message.value) {
                return false;
            }
        }
        self.headers
            .iter()
            .all(|(name, value)| message.headers.get(name) == Some(value))
    }
}

struct ActorSlot {
    name: String,
    tx: mpsc::UnboundedSender<ActorCommand>,
    state: watch::Receiver<ActorState>,
    counters: Arc<ActorCounters>,
    history: Arc<Mutex<VecDeque<BrokerMessage>>>,
    runner: Mutex<Option<ActorRunner>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// All actors of an engine instance.
pub struct ActorRegistry {
    actors: Vec<ActorSlot>,
    by_name: HashMap<String, usize>,
    by_tag: HashMap<String, usize>,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
}

impl Default for ActorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActorRegistry {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            actors: Vec::new(),
            by_name: HashMap::new(),
            by_tag: HashMap::new(),
            shutdown,
            started: AtomicBool::new(false),
        }
    }

    /// Register an actor in the `Idle` state.
    pub fn add(
        &mut self,
        service: &str,
        config: &ActorConfig,
        deps: ActorDeps,
        base_dir: Option<&Path>,
    ) -> Result<()> {
        if self.by_name.contains_key(&config.name) {
            return Err(EngineError::config(format!("duplicate actor name {}", config.name)));
        }

        let entries = config.produce_entries();
        let tags: Vec<String> = entries.iter().filter_map(|e| e.tag.clone()).collect();
        let produce = if entries.is_empty() {
            None
        } else {
            Some(DatasetCursor::new(entries, config.multi_payloads_looped))
        };
        let dataset = config
            .dataset
            .as_ref()
            .map(|d| load_rows(d, base_dir))
            .transpose()?
            .map(|rows| DatasetCursor::new(rows, config.dataset_looped));
        let consume = config
            .consume
            .as_ref()
            .map(ConsumeSpec::from_config)
            .transpose()?;

        let (tx, commands) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ActorState::Idle);
        let counters = Arc::new(ActorCounters::default());
        let history = Arc::new(Mutex::new(VecDeque::new()));

        let runner = ActorRunner {
            name: config.name.clone(),
            service: service.to_string(),
            produce,
            dataset,
            consume,
            delay: config.delay_ms.map(Duration::from_millis),
            limit: config.limit,
            iterations: 0,
            deps,
            commands,
            state: state_tx,
            shutdown: self.shutdown.subscribe(),
            counters: counters.clone(),
            history: history.clone(),
        };

        let index = self.actors.len();
        self.by_name.insert(config.name.clone(), index);
        for tag in tags {
            self.by_tag.entry(tag).or_insert(index);
        }
        self.actors.push(ActorSlot {
            name: config.name.clone(),
            tx,
            state: state_rx,
            counters,
            history,
            runner: Mutex::new(Some(runner)),
            task: Mutex::new(None),
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actors.iter().map(|a| a.name.as_str())
    }

    /// Spawn one task per actor. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| EngineError::config(format!("actors need a tokio runtime: {}", e)))?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyStarted);
        }
        for slot in &self.actors {
            if let Some(runner) = lock(&slot.runner).take() {
                *lock(&slot.task) = Some(runtime.spawn(runner.run()));
            }
        }
        info!(actors = self.actors.len(), "Actors started");
        Ok(())
    }

    /// Signal shutdown and wait for every actor to stop.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        for slot in &self.actors {
            // Never started: nothing to wait for
            if let Some(runner) = lock(&slot.runner).take() {
                runner.state.send_replace(ActorState::Stopped);
            }
            let task = lock(&slot.task).take();
            if let Some(task) = task {
                if let Err(e) = task.await {
                    warn!(actor = %slot.name, error = %e, "Actor task failed");
                }
            }
        }
    }

    fn slot(&self, name: &str) -> Result<&ActorSlot> {
        self.by_name
            .get(name)
            .map(|&i| &self.actors[i])
            .ok_or_else(|| EngineError::ActorNotFound(name.to_string()))
    }

    /// Resolve an actor name or produce tag to the actor and payload tag.
    fn resolve(&self, target: &str) -> Result<(&ActorSlot, Option<String>)> {
        if let Ok(slot) = self.slot(target) {
            return Ok((slot, None));
        }
        self.by_tag
            .get(target)
            .map(|&i| (&self.actors[i], Some(target.to_string())))
            .ok_or_else(|| EngineError::ActorNotFound(target.to_string()))
    }

    fn send(slot: &ActorSlot, command: ActorCommand) -> Result<()> {
        if matches!(*slot.state.borrow(), ActorState::Stopping | ActorState::Stopped) {
            return Err(EngineError::ActorStopped(slot.name.clone()));
        }
        slot.tx
            .send(command)
            .map_err(|_| EngineError::ActorStopped(slot.name.clone()))
    }

    /// Fire-and-forget trigger by actor name or produce tag.
    pub fn trigger(&self, target: &str) -> Result<()> {
        let (slot, tag) = self.resolve(target)?;
        Self::send(slot, ActorCommand::Trigger { tag, reply: None })
    }

    /// Trigger one produce iteration and wait until it has been sent.
    pub async fn trigger_actor(&self, name: &str, tag: Option<&str>) -> Result<()> {
        let slot = self.slot(name)?;
        let (reply, rx) = oneshot::channel();
        Self::send(
            slot,
            ActorCommand::Trigger {
                tag: tag.map(String::from),
                reply: Some(reply),
            },
        )?;
        rx.await
            .map_err(|_| EngineError::ActorStopped(name.to_string()))?
    }

    /// Rewind payload and dataset cursors of one actor, or all of them.
    pub fn reset_datasets(&self, name: Option<&str>) -> Result<()> {
        match name {
            Some(name) => Self::send(self.slot(name)?, ActorCommand::ResetDatasets),
            None => {
                for slot in &self.actors {
                    // Stopped actors have nothing left to reset
                    let _ = Self::send(slot, ActorCommand::ResetDatasets);
                }
                Ok(())
            }
        }
    }

    pub fn state(&self, name: &str) -> Result<ActorState> {
        Ok(*self.slot(name)?.state.borrow())
    }

    pub fn stats(&self, name: &str) -> Result<ActorStats> {
        Ok(self.slot(name)?.counters.snapshot())
    }

    /// The last `capture` messages the actor consumed, oldest first.
    pub fn captured(&self, name: &str) -> Result<Vec<BrokerMessage>> {
        Ok(lock(&self.slot(name)?.history).iter().cloned().collect())
    }

    /// Wait until the actor reaches `state` (or `Stopped`).
    pub async fn wait_for_state(&self, name: &str, state: ActorState) -> Result<ActorState> {
        let mut rx = self.slot(name)?.state.clone();
        let reached = rx
            .wait_for(|s| *s == state || *s == ActorState::Stopped)
            .await
            .map(|s| *s)
            .unwrap_or(ActorState::Stopped);
        Ok(reached)
    }
}

struct ActorRunner {
    name: String,
    service: String,
    produce: Option<DatasetCursor<ProduceConfig>>,
    dataset: Option<DatasetCursor<DatasetRow>>,
    consume: Option<ConsumeSpec>,
    delay: Option<Duration>,
    limit: Option<u64>,
    iterations: u64,
    deps: ActorDeps,
    commands: mpsc::UnboundedReceiver<ActorCommand>,
    state: watch::Sender<ActorState>,
    shutdown: watch::Receiver<bool>,
    counters: Arc<ActorCounters>,
    history: Arc<Mutex<VecDeque<BrokerMessage>>>,
}

async fn tick(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}

impl ActorRunner {
    async fn run(mut self) {
        self.set_state(ActorState::Running);
        info!(
            actor = %self.name,
            service = %self.service,
            produce = self.produce.is_some(),
            consume = ?self.consume.as_ref().map(|c| c.queue.as_str()),
            group = ?self.consume.as_ref().and_then(|c| c.group.as_deref()),
            "Actor running"
        );

        let reason = match self.consume.clone() {
            Some(spec) => self.consume_loop(&spec).await,
            None => self.produce_loop().await,
        };

        self.set_state(ActorState::Stopping);
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let ActorCommand::Trigger {
                reply: Some(reply), ..
            } = command
            {
                let _ = reply.send(Err(EngineError::ActorStopped(self.name.clone())));
            }
        }
        self.set_state(ActorState::Stopped);
        info!(
            actor = %self.name,
            reason,
            iterations = self.iterations,
            "Actor stopped"
        );
    }

    fn set_state(&self, state: ActorState) {
        self.state.send_replace(state);
        debug!(actor = %self.name, ?state, "Actor state changed");
    }

    fn limit_reached(&self) -> bool {
        self.limit.map(|l| self.iterations >= l).unwrap_or(false)
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep unless shutdown arrives first. Returns `false` on shutdown.
    async fn pause(&mut self, duration: Duration) -> bool {
        if self.shutting_down() {
            return false;
        }
        tokio::select! {
            _ = self.shutdown.changed() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn retry_backoff(&self) -> Duration {
        self.delay
            .filter(|d| !d.is_zero())
            .unwrap_or(RETRY_BACKOFF)
    }

    async fn produce_loop(&mut self) -> &'static str {
        let delay = self.delay;
        loop {
            if self.limit_reached() {
                return "limit";
            }
            if self.shutting_down() {
                return "shutdown";
            }
            tokio::select! {
                biased;
                _ = self.shutdown.changed() => return "shutdown",
                Some(command) = self.commands.recv() => self.handle_command(command).await,
                _ = tick(delay) => {
                    if let Err(e) = self.produce_once(None, None).await {
                        warn!(actor = %self.name, error = %e, "Produce iteration failed");
                    }
                }
            }
        }
    }

    async fn consume_loop(&mut self, spec: &ConsumeSpec) -> &'static str {
        loop {
            if self.limit_reached() {
                return "limit";
            }
            if self.shutting_down() {
                return "shutdown";
            }

            let received = tokio::select! {
                biased;
                _ = self.shutdown.changed() => return "shutdown",
                received = self.deps.transport.receive(&spec.queue, CONSUME_POLL) => received,
            };

            match received {
                Ok(Some(first)) => {
                    let batch = self.collect_batch(spec, first).await;
                    self.process_batch(spec, batch).await;
                    if let Some(delay) = self.delay.filter(|d| !d.is_zero()) {
                        if !self.pause(delay).await {
                            return "shutdown";
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(actor = %self.name, queue = %spec.queue, error = %e, "Receive failed");
                    let backoff = self.retry_backoff();
                    if !self.pause(backoff).await {
                        return "shutdown";
                    }
                }
            }

            while let Ok(command) = self.commands.try_recv() {
                self.handle_command(command).await;
            }
        }
    }

    async fn handle_command(&mut self, command: ActorCommand) {
        match command {
            ActorCommand::Trigger { tag, reply } => {
                debug!(actor = %self.name, tag = ?tag, "Trigger received");
                let result = self.produce_once(tag.as_deref(), None).await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            warn!(actor = %self.name, error = %e, "Triggered produce failed");
                        }
                    }
                }
            }
            ActorCommand::ResetDatasets => {
                if let Some(produce) = self.produce.as_mut() {
                    produce.reset();
                }
                if let Some(dataset) = self.dataset.as_mut() {
                    dataset.reset();
                }
                debug!(actor = %self.name, "Datasets reset");
            }
        }
    }

    async fn collect_batch(
        &mut self,
        spec: &ConsumeSpec,
        first: BrokerMessage,
    ) -> Vec<BrokerMessage> {
        let remaining = self
            .limit
            .map(|l| l.saturating_sub(self.iterations) as usize)
            .unwrap_or(usize::MAX);
        let want = spec.capture.min(remaining.max(1));
        let mut batch = vec![first];
        while batch.len() < want {
            match self.deps.transport.receive(&spec.queue, Duration::ZERO).await {
                Ok(Some(message)) => batch.push(message),
                _ => break,
            }
        }
        batch
    }

    async fn process_batch(&mut self, spec: &ConsumeSpec, batch: Vec<BrokerMessage>) {
        for message in batch {
            if !spec.accepts(&message) {
                debug!(actor = %self.name, queue = %spec.queue, "Message filtered out");
                continue;
            }

            let json = match &spec.schema {
                Some(shape) => match schema::validate_str(shape, &message.value) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            actor = %self.name,
                            queue = %spec.queue,
                            error = %e,
                            "Consumed message rejected"
                        );
                        continue;
                    }
                },
                None => serde_json::from_str::<Value>(&message.value).ok(),
            };

            self.counters.consumed.fetch_add(1, Ordering::Relaxed);
            self.iterations += 1;
            debug!(actor = %self.name, queue = %spec.queue, key = ?message.key, "Message consumed");

            {
                let mut history = lock(&self.history);
                history.push_back(message.clone());
                while history.len() > spec.capture {
                    history.pop_front();
                }
            }

            if self.produce.is_some() {
                let consumed = json!({
                    "value": message.value,
                    "key": message.key,
                    "headers": message.headers,
                    "json": json,
                });
                if let Err(e) = self.produce_once(None, Some(consumed)).await {
                    warn!(actor = %self.name, error = %e, "Relay produce failed");
                }
            }
        }
    }

    /// Run one produce iteration. Consume-driven actors count consumed
    /// messages instead of sends towards their limit.
    async fn produce_once(&mut self, tag: Option<&str>, consumed: Option<Value>) -> Result<()> {
        let counts = self.consume.is_none();
        let Some(entries) = self.produce.as_mut() else {
            return Err(EngineError::config(format!("actor {} has no produce role", self.name)));
        };
        let entry = match tag {
            Some(tag) => entries.by_tag(tag)?.0.clone(),
            None => entries
                .next()
                .map(|(entry, _)| entry.clone())
                .ok_or_else(|| EngineError::config("empty produce list"))?,
        };
        let row = self
            .dataset
            .as_mut()
            .and_then(|d| d.next().map(|(row, _)| row.clone()));

        let outcome = match &self.deps.profile {
            Some(profile) => self.deps.evaluator.evaluate(profile),
            None => Outcome::unaffected(),
        };
        if !outcome.delay.is_zero() && !self.pause(outcome.delay).await {
            return Ok(());
        }
        let empty = match outcome.fault {
            Some(Fault::Empty) => true,
            Some(fault) => {
                self.counters.faulted.fetch_add(1, Ordering::Relaxed);
                if counts {
                    self.iterations += 1;
                }
                info!(
                    actor = %self.name,
                    queue = %entry.queue,
                    %fault,
                    "Fault injected, send skipped"
                );
                return Ok(());
            }
            None => false,
        };

        let mut context = TemplateContext::default();
        if let Some(row) = &row {
            context = context.with_vars(&row.vars);
        }
        if let Some(consumed) = consumed {
            context = context.with_consumed(consumed);
        }
        let message = match self.render_message(&entry, &context.to_value(), empty).await {
            Ok(message) => message,
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        };

        if self.send_with_retry(&entry.queue, message).await {
            self.counters.sent.fetch_add(1, Ordering::Relaxed);
            if counts {
                self.iterations += 1;
            }
            debug!(actor = %self.name, queue = %entry.queue, tag = ?entry.tag, "Message sent");
        }
        Ok(())
    }

    async fn render_message(
        &self,
        entry: &ProduceConfig,
        context: &Value,
        empty: bool,
    ) -> Result<BrokerMessage> {
        let renderer = &self.deps.renderer;
        let value_job = if empty {
            None
        } else {
            enqueue_templated(renderer, &entry.value, context)?
        };
        let key_job = match &entry.key {
            Some(key) => enqueue_templated(renderer, key, context)?,
            None => None,
        };
        let headers_job = if entry.headers.values().any(|v| v.contains("{{")) {
            let map: Map<String, Value> = entry
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            Some(renderer.enqueue(RenderInput::Json(Value::Object(map)), context.clone())?)
        } else {
            None
        };

        let value = if empty {
            String::new()
        } else {
            finish_text(value_job, &entry.value).await?
        };
        let key = match &entry.key {
            Some(key) => Some(finish_text(key_job, key).await?),
            None => None,
        };
        let headers = match headers_job {
            Some(job) => match job.wait().await? {
                RenderOutput::Json(Value::Object(map)) => map
                    .into_iter()
                    .map(|(k, v)| match v {
                        Value::String(s) => (k, s),
                        other => (k, other.to_string()),
                    })
                    .collect(),
                _ => entry.headers.clone(),
            },
            None => entry.headers.clone(),
        };

        Ok(BrokerMessage {
            key,
            value,
            headers,
            properties: entry.properties.clone(),
        })
    }

    /// Keep retrying the same message until it is sent or shutdown arrives.
    async fn send_with_retry(&mut self, queue: &str, message: BrokerMessage) -> bool {
        loop {
            match self.deps.transport.send(queue, message.clone()).await {
                Ok(()) => return true,
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(actor = %self.name, queue = %queue, error = %e, "Send failed, retrying");
                    let backoff = self.retry_backoff();
                    if !self.pause(backoff).await {
                        return false;
                    }
                }
            }
        }
    }
}

fn enqueue_templated(
    renderer: &RenderHandle,
    text: &str,
    context: &Value,
) -> Result<Option<PendingRender>> {
    if !text.contains("{{") {
        return Ok(None);
    }
    renderer
        .enqueue(RenderInput::Text(text.to_string()), context.clone())
        .map(Some)
}

async fn finish_text(job: Option<PendingRender>, raw: &str) -> Result<String> {
    match job {
        Some(job) => match job.wait().await? {
            RenderOutput::Text(text) => Ok(text),
            RenderOutput::Json(value) => Ok(value.to_string()),
        },
        None => Ok(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::PerformanceProfileConfig;
    use crate::render::RenderCoordinator;
    use crate::template::HandlebarsRenderer;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct Harness {
        _coordinator: RenderCoordinator,
        broker: Arc<MemoryBroker>,
        deps: ActorDeps,
    }

    fn harness() -> Harness {
        let coordinator = RenderCoordinator::new();
        coordinator
            .start(Box::new(HandlebarsRenderer::new()))
            .unwrap();
        let broker = Arc::new(MemoryBroker::new());
        let deps = ActorDeps {
            transport: broker.clone(),
            renderer: coordinator.handle(),
            evaluator: PerformanceEvaluator::default(),
            profile: None,
        };
        Harness {
            _coordinator: coordinator,
            broker,
            deps,
        }
    }

    fn actor(yaml: &str) -> ActorConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn registry(config: &ActorConfig, deps: ActorDeps) -> ActorRegistry {
        let mut registry = ActorRegistry::new();
        registry.add("svc", config, deps, None).unwrap();
        registry.start().unwrap();
        registry
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn wait_stopped(registry: &ActorRegistry, name: &str) {
        let state = tokio::time::timeout(
            Duration::from_secs(5),
            registry.wait_for_state(name, ActorState::Stopped),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(state, ActorState::Stopped);
    }

    #[tokio::test]
    async fn test_limit_stops_actor_and_rejects_triggers() {
        let h = harness();
        let config = actor(
            r#"
name: producer
delay_ms: 0
limit: 2
produce: {queue: out, value: hello}
"#,
        );
        let registry = registry(&config, h.deps.clone());

        wait_stopped(&registry, "producer").await;
        assert_eq!(h.broker.depth("out").await, 2);
        assert_eq!(registry.stats("producer").unwrap().sent, 2);

        let err = registry.trigger_actor("producer", None).await.unwrap_err();
        assert_eq!(err, EngineError::ActorStopped("producer".to_string()));
        assert!(registry.trigger("producer").is_err());
        assert_eq!(h.broker.depth("out").await, 2);
    }

    #[tokio::test]
    async fn test_trigger_only_producer() {
        let h = harness();
        let config = actor(
            r#"
name: on-demand
produce:
  - {queue: out, value: first, tag: a}
  - {queue: out, value: second, tag: b}
"#,
        );
        let registry = registry(&config, h.deps.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.broker.depth("out").await, 0);
        assert_eq!(registry.state("on-demand").unwrap(), ActorState::Running);

        registry.trigger_actor("on-demand", Some("b")).await.unwrap();
        registry.trigger_actor("on-demand", None).await.unwrap();
        let values: Vec<_> = h.broker.drain("out").await.into_iter().map(|m| m.value).collect();
        assert_eq!(values, ["second", "first"]);

        // Fire-and-forget by produce tag
        registry.trigger("b").unwrap();
        for _ in 0..200 {
            if h.broker.depth("out").await == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(h.broker.drain("out").await, vec![BrokerMessage::new("second")]);

        let err = registry.trigger_actor("on-demand", Some("zzz")).await.unwrap_err();
        assert_eq!(err, EngineError::TagNotFound("zzz".to_string()));
        assert_eq!(
            registry.trigger("nobody"),
            Err(EngineError::ActorNotFound("nobody".to_string()))
        );

        registry.stop().await;
        assert_eq!(registry.state("on-demand").unwrap(), ActorState::Stopped);
    }

    #[tokio::test]
    async fn test_dataset_templated_payloads() {
        let h = harness();
        let config = actor(
            r#"
name: events
delay_ms: 0
limit: 3
dataset:
  - {id: 1}
  - {id: 2}
produce:
  queue: events
  key: "event-{{id}}"
  value: "event {{id}}"
  headers: {x-id: "{{id}}"}
"#,
        );
        let registry = registry(&config, h.deps.clone());
        wait_stopped(&registry, "events").await;

        let messages = h.broker.drain("events").await;
        let values: Vec<_> = messages.iter().map(|m| m.value.as_str()).collect();
        assert_eq!(values, ["event 1", "event 2", "event 1"]);
        assert_eq!(messages[1].key.as_deref(), Some("event-2"));
        assert_eq!(messages[1].headers["x-id"], "2");
    }

    #[tokio::test]
    async fn test_schema_rejection_keeps_polling() {
        let h = harness();
        let config = actor(
            r#"
name: validator
consume:
  queue: in
  capture: 2
  schema:
    type: object
    required: [id]
"#,
        );
        let registry = registry(&config, h.deps.clone());

        h.broker.send("in", BrokerMessage::new("not json")).await.unwrap();
        h.broker.send("in", BrokerMessage::new(r#"{"name": "x"}"#)).await.unwrap();
        h.broker.send("in", BrokerMessage::new(r#"{"id": 7}"#)).await.unwrap();

        eventually(|| {
            let stats = registry.stats("validator").unwrap();
            stats.rejected == 2 && stats.consumed == 1
        })
        .await;
        assert_eq!(registry.state("validator").unwrap(), ActorState::Running);
        let captured = registry.captured("validator").unwrap();
        assert_eq!(captured, vec![BrokerMessage::new(r#"{"id": 7}"#)]);

        // Still polling after the rejections
        h.broker.send("in", BrokerMessage::new(r#"{"id": 8}"#)).await.unwrap();
        eventually(|| registry.stats("validator").unwrap().consumed == 2).await;
        assert_eq!(registry.captured("validator").unwrap().len(), 2);

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_value_pattern_filter() {
        let h = harness();
        let config = actor(
            r#"
name: audits
consume:
  queue: audit
  value: "^order-[0-9]+$"
"#,
        );
        let registry = registry(&config, h.deps.clone());

        h.broker.send("audit", BrokerMessage::new("order-abc")).await.unwrap();
        h.broker.send("audit", BrokerMessage::new("order-42")).await.unwrap();

        eventually(|| registry.stats("audits").unwrap().consumed == 1).await;
        assert_eq!(registry.captured("audits").unwrap(), vec![BrokerMessage::new("order-42")]);
        assert_eq!(h.broker.depth("audit").await, 0);
        assert_eq!(registry.stats("audits").unwrap().rejected, 0);

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_header_filter() {
        let h = harness();
        let config = actor(
            r#"
name: eu-only
consume:
  queue: events
  headers: {region: eu}
"#,
        );
        let registry = registry(&config, h.deps.clone());

        let us = BrokerMessage::new("one").with_header("region", "us");
        let bare = BrokerMessage::new("two");
        let eu = BrokerMessage::new("three").with_header("region", "eu");
        for message in [us, bare, eu.clone()] {
            h.broker.send("events", message).await.unwrap();
        }

        eventually(|| registry.stats("eu-only").unwrap().consumed == 1).await;
        assert_eq!(registry.captured("eu-only").unwrap(), vec![eu]);
        assert_eq!(h.broker.depth("events").await, 0);

        registry.stop().await;
    }

    #[tokio::test]
    async fn test_relay_chains_consumed_message() {
        let h = harness();
        let config = actor(
            r#"
name: relay
limit: 1
consume: {queue: orders, key: eu}
produce: {queue: audit, value: "seen {{consumed.value}} ({{consumed.json.id}})"}
"#,
        );
        let registry = registry(&config, h.deps.clone());

        h.broker
            .send("orders", BrokerMessage::new(r#"{"id": 1}"#).with_key("us"))
            .await
            .unwrap();
        h.broker
            .send("orders", BrokerMessage::new(r#"{"id": 2}"#).with_key("eu"))
            .await
            .unwrap();

        wait_stopped(&registry, "relay").await;
        let audit = h.broker.drain("audit").await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].value, r#"seen {"id": 2} (2)"#);
        assert_eq!(registry.stats("relay").unwrap().consumed, 1);
    }

    #[tokio::test]
    async fn test_fault_profile_skips_sends() {
        let h = harness();
        let mut faults = HashMap::new();
        faults.insert("503".to_string(), 1.0);
        let profile = PerformanceProfile::from_config(
            "down",
            &PerformanceProfileConfig {
                ratio: 1.0,
                delay_ms: 0,
                faults,
            },
        )
        .unwrap();
        let deps = ActorDeps {
            profile: Some(Arc::new(profile)),
            ..h.deps.clone()
        };
        let config = actor("{name: flaky, delay_ms: 0, limit: 2, produce: {queue: out, value: x}}");
        let registry = registry(&config, deps);

        wait_stopped(&registry, "flaky").await;
        let stats = registry.stats("flaky").unwrap();
        assert_eq!((stats.faulted, stats.sent), (2, 0));
        assert_eq!(h.broker.depth("out").await, 0);
    }

    struct FailingBroker {
        inner: MemoryBroker,
        failures_left: AtomicUsize,
    }

    #[async_trait]
    impl BrokerTransport for FailingBroker {
        async fn send(&self, queue: &str, message: BrokerMessage) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(EngineError::BrokerTransport("connection refused".to_string()));
            }
            self.inner.send(queue, message).await
        }

        async fn receive(&self, queue: &str, timeout: Duration) -> Result<Option<BrokerMessage>> {
            self.inner.receive(queue, timeout).await
        }
    }

    #[tokio::test]
    async fn test_send_failure_is_retried() {
        let h = harness();
        let broker = Arc::new(FailingBroker {
            inner: MemoryBroker::new(),
            failures_left: AtomicUsize::new(2),
        });
        let deps = ActorDeps {
            transport: broker.clone(),
            ..h.deps.clone()
        };
        let config = actor("{name: retry, delay_ms: 5, limit: 1, produce: {queue: out, value: x}}");
        let registry = registry(&config, deps);

        wait_stopped(&registry, "retry").await;
        let stats = registry.stats("retry").unwrap();
        assert_eq!((stats.sent, stats.errors), (1, 2));
        assert_eq!(broker.inner.depth("out").await, 1);
    }

    #[tokio::test]
    async fn test_reset_datasets_rewinds_payloads() {
        let h = harness();
        let config = actor(
            r#"
name: seq
multi_payloads_looped: false
produce:
  - {queue: out, value: one}
  - {queue: out, value: two}
"#,
        );
        let registry = registry(&config, h.deps.clone());

        registry.trigger_actor("seq", None).await.unwrap();
        registry.trigger_actor("seq", None).await.unwrap();
        registry.trigger_actor("seq", None).await.unwrap();
        registry.reset_datasets(Some("seq")).unwrap();
        registry.trigger_actor("seq", None).await.unwrap();

        let values: Vec<_> = h.broker.drain("out").await.into_iter().map(|m| m.value).collect();
        assert_eq!(values, ["one", "two", "two", "one"]);
        registry.stop().await;
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_idle() {
        let h = harness();
        let config = actor("{name: idle, produce: {queue: out, value: x}}");
        let mut registry = ActorRegistry::new();
        registry.add("svc", &config, h.deps.clone(), None).unwrap();
        assert_eq!(registry.state("idle").unwrap(), ActorState::Idle);
        assert!(registry.add("svc", &config, h.deps.clone(), None).is_err());

        registry.start().unwrap();
        assert_eq!(registry.start(), Err(EngineError::AlreadyStarted));
        registry.stop().await;
        assert_eq!(registry.state("idle").unwrap(), ActorState::Stopped);
    }
}
