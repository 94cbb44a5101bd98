//! Rendering coordinator.
//!
//! The template engine is owned by one dedicated worker thread. Callers talk
//! to it through an unbounded job queue and wait on a oneshot reply. Jobs are
//! rendered one at a time, strictly in the order they were enqueued.
//!
//! A caller that stops waiting (timeout or cancellation) does not withdraw its
//! job; the worker still renders it and the result is dropped.

use crate::error::{EngineError, Result};
use crate::template::Renderer;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Template input for one job.
#[derive(Debug, Clone)]
pub enum RenderInput {
    Text(String),
    /// Render every templated string leaf
    Json(Value),
}

/// Rendered output, same shape as the input.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutput {
    Text(String),
    Json(Value),
}

struct RenderJob {
    input: RenderInput,
    context: Value,
    reply: oneshot::Sender<Result<RenderOutput>>,
}

enum RenderCommand {
    Render(RenderJob),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable submission side of the coordinator.
#[derive(Clone)]
pub struct RenderHandle {
    tx: mpsc::UnboundedSender<RenderCommand>,
    stopped: Arc<AtomicBool>,
    rendered: Arc<AtomicU64>,
}

/// A submitted job awaiting its result.
pub struct PendingRender {
    rx: oneshot::Receiver<Result<RenderOutput>>,
}

impl PendingRender {
    pub async fn wait(self) -> Result<RenderOutput> {
        self.rx.await.map_err(|_| EngineError::EngineStopped)?
    }

    /// Wait at most `limit`; the job itself is not cancelled.
    pub async fn wait_timeout(self, limit: Duration) -> Result<RenderOutput> {
        tokio::time::timeout(limit, self.wait())
            .await
            .map_err(|_| EngineError::RenderTimeout(limit))?
    }
}

impl RenderHandle {
    /// Queue a job without waiting for it.
    pub fn enqueue(&self, input: RenderInput, context: Value) -> Result<PendingRender> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::EngineStopped);
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(RenderCommand::Render(RenderJob {
                input,
                context,
                reply,
            }))
            .map_err(|_| EngineError::EngineStopped)?;
        Ok(PendingRender { rx })
    }

    pub async fn render_text(&self, template: &str, context: &Value) -> Result<String> {
        match self
            .enqueue(RenderInput::Text(template.to_string()), context.clone())?
            .wait()
            .await?
        {
            RenderOutput::Text(text) => Ok(text),
            RenderOutput::Json(value) => Ok(value.to_string()),
        }
    }

    pub async fn render_json(&self, value: &Value, context: &Value) -> Result<Value> {
        match self
            .enqueue(RenderInput::Json(value.clone()), context.clone())?
            .wait()
            .await?
        {
            RenderOutput::Json(value) => Ok(value),
            RenderOutput::Text(text) => Ok(Value::String(text)),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Jobs the worker has completed so far.
    pub fn rendered_total(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }
}

/// Owns the job queue and the worker thread lifecycle.
pub struct RenderCoordinator {
    handle: RenderHandle,
    rx: Mutex<Option<mpsc::UnboundedReceiver<RenderCommand>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl RenderCoordinator {
    /// Create the queue. Jobs may be enqueued before the worker starts.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            handle: RenderHandle {
                tx,
                stopped: Arc::new(AtomicBool::new(false)),
                rendered: Arc::new(AtomicU64::new(0)),
            },
            rx: Mutex::new(Some(rx)),
            worker: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> RenderHandle {
        self.handle.clone()
    }

    /// Spawn the worker thread that owns `renderer`.
    pub fn start(&self, renderer: Box<dyn Renderer>) -> Result<()> {
        let rx = self
            .rx
            .lock()
            .map_err(|_| EngineError::EngineStopped)?
            .take()
            .ok_or(EngineError::AlreadyStarted)?;
        let rendered = self.handle.rendered.clone();

        let worker = std::thread::Builder::new()
            .name("render-worker".to_string())
            .spawn(move || run_worker(renderer, rx, rendered))
            .map_err(|e| EngineError::config(format!("failed to spawn rendering worker: {}", e)))?;

        if let Ok(mut slot) = self.worker.lock() {
            *slot = Some(worker);
        }
        info!("Rendering worker started");
        Ok(())
    }

    /// Stop accepting jobs, finish the ones already queued, then stop the worker.
    pub async fn shutdown(&self) {
        if self.handle.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        // Never started: fail whatever is queued.
        if let Some(mut rx) = self.rx.lock().ok().and_then(|mut slot| slot.take()) {
            rx.close();
            fail_remaining(&mut rx);
            return;
        }

        let (done_tx, done_rx) = oneshot::channel();
        if self.handle.tx.send(RenderCommand::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }

        let worker = self.worker.lock().ok().and_then(|mut slot| slot.take());
        if let Some(worker) = worker {
            let joined = tokio::task::spawn_blocking(move || worker.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("Rendering worker exited abnormally");
            }
        }
        info!(
            rendered = self.handle.rendered_total(),
            "Rendering worker stopped"
        );
    }
}

impl Default for RenderCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

fn run_worker(
    mut renderer: Box<dyn Renderer>,
    mut rx: mpsc::UnboundedReceiver<RenderCommand>,
    rendered: Arc<AtomicU64>,
) {
    let mut done = None;
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            RenderCommand::Render(job) => {
                let result = match &job.input {
                    RenderInput::Text(template) => renderer
                        .render(template, &job.context)
                        .map(RenderOutput::Text),
                    RenderInput::Json(value) => renderer
                        .render_json(value, &job.context)
                        .map(RenderOutput::Json),
                };
                if let Err(e) = &result {
                    debug!(error = %e, "Rendering job failed");
                }
                rendered.fetch_add(1, Ordering::Relaxed);
                // The caller may have given up; that is fine.
                let _ = job.reply.send(result);
            }
            RenderCommand::Shutdown(ack) => {
                done = Some(ack);
                break;
            }
        }
    }

    rx.close();
    fail_remaining(&mut rx);
    if let Some(ack) = done {
        let _ = ack.send(());
    }
}

fn fail_remaining(rx: &mut mpsc::UnboundedReceiver<RenderCommand>) {
    while let Ok(cmd) = rx.try_recv() {
        match cmd {
            RenderCommand::Render(job) => {
                let _ = job.reply.send(Err(EngineError::EngineStopped));
            }
            RenderCommand::Shutdown(ack) => {
                let _ = ack.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::HandlebarsRenderer;
    use futures_util::future::join_all;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    /// Renders `{{seq}}`-style jobs by echoing `seq` and records the order.
    struct RecordingRenderer {
        seen: Arc<Mutex<Vec<u64>>>,
        delay: Duration,
    }

    impl Renderer for RecordingRenderer {
        fn render(&mut self, _template: &str, context: &Value) -> Result<String> {
            std::thread::sleep(self.delay);
            let seq = context["seq"].as_u64().unwrap_or(u64::MAX);
            self.seen.lock().unwrap().push(seq);
            Ok(seq.to_string())
        }
    }

    fn recording(delay: Duration) -> (RenderCoordinator, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let coordinator = RenderCoordinator::new();
        coordinator
            .start(Box::new(RecordingRenderer {
                seen: seen.clone(),
                delay,
            }))
            .unwrap();
        (coordinator, seen)
    }

    #[tokio::test]
    async fn test_render_text_through_worker() {
        let coordinator = RenderCoordinator::new();
        coordinator.start(Box::new(HandlebarsRenderer::new())).unwrap();
        let handle = coordinator.handle();

        let text = handle
            .render_text("Hello {{name}}", &json!({"name": "Ada"}))
            .await
            .unwrap();
        assert_eq!(text, "Hello Ada");

        let value = handle
            .render_json(&json!({"greeting": "Hi {{name}}"}), &json!({"name": "Ada"}))
            .await
            .unwrap();
        assert_eq!(value["greeting"], "Hi Ada");

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_render_error_is_returned_to_caller() {
        let coordinator = RenderCoordinator::new();
        coordinator.start(Box::new(HandlebarsRenderer::new())).unwrap();

        let err = coordinator
            .handle()
            .render_text("{{missing}}", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::TemplateRender(_)));

        // Worker survives the failure
        assert_ok!(coordinator.handle().render_text("ok", &json!({})).await);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_jobs_complete_in_submission_order() {
        let (coordinator, seen) = recording(Duration::from_millis(1));
        let handle = coordinator.handle();

        let pending: Vec<_> = (0..50u64)
            .map(|seq| {
                handle
                    .enqueue(RenderInput::Text("{{seq}}".into()), json!({ "seq": seq }))
                    .unwrap()
            })
            .collect();
        let results = join_all(pending.into_iter().map(|p| p.wait())).await;

        for (seq, result) in results.into_iter().enumerate() {
            assert_eq!(result.unwrap(), RenderOutput::Text(seq.to_string()));
        }
        assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
        coordinator.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_get_their_own_result() {
        let (coordinator, seen) = recording(Duration::ZERO);

        let tasks: Vec<_> = (0..64u64)
            .map(|seq| {
                let handle = coordinator.handle();
                tokio::spawn(async move {
                    let text = handle
                        .render_text("{{seq}}", &json!({ "seq": seq }))
                        .await
                        .unwrap();
                    (seq, text)
                })
            })
            .collect();

        for task in tasks {
            let (seq, text) = task.await.unwrap();
            assert_eq!(text, seq.to_string());
        }
        assert_eq!(seen.lock().unwrap().len(), 64);
        assert_eq!(coordinator.handle().rendered_total(), 64);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_timed_out_job_is_still_rendered() {
        let (coordinator, seen) = recording(Duration::from_millis(100));
        let handle = coordinator.handle();

        let slow = handle
            .enqueue(RenderInput::Text("{{seq}}".into()), json!({"seq": 1}))
            .unwrap();
        let err = slow.wait_timeout(Duration::from_millis(5)).await.unwrap_err();
        assert_eq!(err, EngineError::RenderTimeout(Duration::from_millis(5)));

        let next = handle.render_text("{{seq}}", &json!({"seq": 2})).await.unwrap();
        assert_eq!(next, "2");
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_jobs_queued_before_start_are_served() {
        let coordinator = RenderCoordinator::new();
        let pending = coordinator
            .handle()
            .enqueue(RenderInput::Text("early {{x}}".into()), json!({"x": 1}))
            .unwrap();

        coordinator.start(Box::new(HandlebarsRenderer::new())).unwrap();
        assert_eq!(
            pending.wait().await.unwrap(),
            RenderOutput::Text("early 1".to_string())
        );
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_rejects() {
        let (coordinator, seen) = recording(Duration::from_millis(2));
        let handle = coordinator.handle();

        let queued: Vec<_> = (0..5u64)
            .map(|seq| {
                handle
                    .enqueue(RenderInput::Text(String::new()), json!({ "seq": seq }))
                    .unwrap()
            })
            .collect();
        coordinator.shutdown().await;

        for pending in queued {
            assert_ok!(pending.wait().await);
        }
        assert_eq!(seen.lock().unwrap().len(), 5);
        assert!(handle.is_stopped());
        assert_eq!(
            assert_err!(handle.render_text("late", &json!({})).await),
            EngineError::EngineStopped
        );
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let coordinator = RenderCoordinator::new();
        coordinator.start(Box::new(HandlebarsRenderer::new())).unwrap();
        assert_eq!(
            coordinator.start(Box::new(HandlebarsRenderer::new())).unwrap_err(),
            EngineError::AlreadyStarted
        );
        coordinator.shutdown().await;
    }
}
