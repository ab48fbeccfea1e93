//! Fan-out engine: validates a request and drives one delivery per entry.
//!
//! Two run modes:
//! - **standard**: `run` evaluates and delivers every entry with at most
//!   `concurrency` in flight and returns all outcomes in schedule order.
//! - **express**: `dispatch` spawns a detached notifier per entry on the
//!   engine's task tracker and returns before any of them finishes.
//!
//! A failing entry never touches its siblings. Shutdown cancels every wait.

use std::sync::Arc;
use std::time::Duration;

use chime_core::config::{ChimeConfig, RunMode};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;
use uuid::Uuid;

use crate::dispatch::Publisher;
use crate::error::ShapeError;
use crate::notify::DeliveryLog;
use crate::tasks::{DeliveryOutcome, RejectReason, RetryPolicy};
use crate::validate::{ValidatedRequest, validate};
use crate::worker::{DeliveryWorker, EntryContext};
use crate::workflow::Evaluator;

/// Engine settings, usually derived from [`ChimeConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Name of the request-level workflow.
    pub orchestrator: String,
    /// Name of the per-entry workflow.
    pub notifier: String,
    pub mode: RunMode,
    pub concurrency: usize,
    pub max_wait: Duration,
    pub retry: RetryPolicy,
}

impl EngineSettings {
    pub fn from_config(config: &ChimeConfig) -> Self {
        Self {
            orchestrator: config.app.orchestrator_workflow(),
            notifier: config.app.notifier_workflow(),
            mode: config.workflow.mode,
            concurrency: config.workflow.concurrency.max(1),
            max_wait: Duration::from_secs(config.workflow.max_wait_secs),
            retry: RetryPolicy::from_config(&config.workflow),
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self::from_config(&ChimeConfig::default())
    }
}

/// Result of a standard-mode run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub execution: String,
    pub outcomes: Vec<DeliveryOutcome>,
}

impl RunReport {
    pub fn published(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_published()).count()
    }

    pub fn rejected(&self) -> usize {
        self.outcomes.len() - self.published()
    }

    /// Any entry failed its own validation.
    pub fn has_invalid_entries(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.reason(), Some(RejectReason::Invalid(_))))
    }

    pub fn has_publish_failures(&self) -> bool {
        self.outcomes
            .iter()
            .any(|o| matches!(o.reason(), Some(RejectReason::PublishFailed(_))))
    }
}

/// Result of an express-mode dispatch.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchReceipt {
    pub execution: String,
    pub dispatched: usize,
    /// One notifier execution per schedule entry, in schedule order.
    pub notifiers: Vec<String>,
}

/// What `submit` did with a request.
#[derive(Debug, Clone)]
pub enum Submission {
    Completed(RunReport),
    Dispatched(DispatchReceipt),
}

/// The fan-out coordinator.
pub struct FanoutEngine {
    settings: EngineSettings,
    evaluator: Evaluator,
    worker: Arc<DeliveryWorker>,
    history: DeliveryLog,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl FanoutEngine {
    pub fn new(publisher: Arc<dyn Publisher>, settings: EngineSettings) -> Self {
        let history = DeliveryLog::new();
        let worker = DeliveryWorker::new(publisher, settings.retry, history.clone());
        tracing::info!(
            "⏰ Fan-out engine ready (mode={}, concurrency={}, max_wait={}s, retries={})",
            settings.mode,
            settings.concurrency,
            settings.max_wait.as_secs(),
            settings.retry.max_retries
        );
        Self {
            evaluator: Evaluator::new(settings.max_wait),
            settings,
            worker: Arc::new(worker),
            history,
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn from_config(config: &ChimeConfig, publisher: Arc<dyn Publisher>) -> Self {
        Self::new(publisher, EngineSettings::from_config(config))
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn history(&self) -> &DeliveryLog {
        &self.history
    }

    /// Detached notifiers still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// A token cancelled on engine shutdown; pass it to `run_with_cancel`.
    pub fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Shape-check a request without scheduling anything.
    pub fn validate(&self, request: &Value) -> Result<ValidatedRequest, ShapeError> {
        validate(request)
    }

    /// Run or dispatch according to `mode`.
    pub async fn submit(&self, request: &Value, mode: RunMode) -> Result<Submission, ShapeError> {
        match mode {
            RunMode::Standard => self
                .run(request, self.settings.concurrency)
                .await
                .map(Submission::Completed),
            RunMode::Express => self.dispatch(request).map(Submission::Dispatched),
        }
    }

    /// Standard mode: deliver every entry and return the outcomes.
    pub async fn run(&self, request: &Value, concurrency: usize) -> Result<RunReport, ShapeError> {
        self.run_with_cancel(request, concurrency, self.child_token())
            .await
    }

    /// Standard mode with a caller-owned cancellation token.
    ///
    /// Cancelling `cancel` aborts pending waits; those entries end up
    /// `Rejected(Cancelled)` and never publish.
    pub async fn run_with_cancel(
        &self,
        request: &Value,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<RunReport, ShapeError> {
        let request = self.accept(request)?;
        let execution = execution_id(&self.settings.orchestrator);
        let limit = concurrency.max(1);
        let span = tracing::info_span!(
            "execution",
            workflow = %self.settings.orchestrator,
            id = %execution
        );

        let ValidatedRequest {
            schedule,
            topic,
            message,
        } = request;

        async move {
            tracing::info!(
                "📨 Running {} entries for '{}' (concurrency {})",
                schedule.len(),
                topic,
                limit
            );

            // Completed entries free their slot at once; order is restored below.
            let units = schedule.into_iter().enumerate().map(|(index, entry)| {
                let ctx = EntryContext {
                    execution: execution.clone(),
                    index,
                    topic: topic.clone(),
                    message: message.clone(),
                };
                let evaluator = self.evaluator;
                let worker = self.worker.clone();
                let cancel = cancel.clone();
                async move { run_entry(&evaluator, &worker, &ctx, &entry, &cancel).await }
            });
            let mut outcomes: Vec<DeliveryOutcome> = stream::iter(units)
                .buffer_unordered(limit)
                .collect()
                .await;
            outcomes.sort_by_key(DeliveryOutcome::index);

            let report = RunReport {
                execution,
                outcomes,
            };
            tracing::info!(
                "✅ Execution finished: {} published, {} rejected",
                report.published(),
                report.rejected()
            );
            Ok(report)
        }
        .instrument(span)
        .await
    }

    /// Express mode: spawn one detached notifier per entry and return.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, request: &Value) -> Result<DispatchReceipt, ShapeError> {
        let request = self.accept(request)?;
        let execution = execution_id(&self.settings.orchestrator);
        if self.shutdown.is_cancelled() {
            tracing::warn!("⚠️ Dispatch after shutdown: {} entries will be cancelled", request.schedule.len());
        }

        let ValidatedRequest {
            schedule,
            topic,
            message,
        } = request;
        let mut notifiers = Vec::with_capacity(schedule.len());

        for (index, entry) in schedule.into_iter().enumerate() {
            let notifier = execution_id(&self.settings.notifier);
            let ctx = EntryContext {
                execution: notifier.clone(),
                index,
                topic: topic.clone(),
                message: message.clone(),
            };
            let evaluator = self.evaluator;
            let worker = self.worker.clone();
            let cancel = self.child_token();
            let span = tracing::info_span!(
                "notifier",
                workflow = %self.settings.notifier,
                id = %notifier,
                parent = %execution
            );

            self.tracker.spawn(
                async move {
                    run_entry(&evaluator, &worker, &ctx, &entry, &cancel).await;
                }
                .instrument(span),
            );
            notifiers.push(notifier);
        }

        tracing::info!(
            "🚀 Dispatched {} notifier(s) for '{}' [{}]",
            notifiers.len(),
            topic,
            execution
        );
        Ok(DispatchReceipt {
            execution,
            dispatched: notifiers.len(),
            notifiers,
        })
    }

    /// Wait for every detached notifier to finish on its own schedule.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Cancel every pending wait and wait for detached notifiers to exit.
    pub async fn shutdown(&self) {
        tracing::info!("🛑 Shutting down fan-out engine ({} in flight)", self.in_flight());
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn accept(&self, request: &Value) -> Result<ValidatedRequest, ShapeError> {
        validate(request).inspect_err(|e| {
            tracing::warn!("⚠️ Request rejected: invalid '{}'", e.field());
        })
    }
}

/// One notifier: evaluate the entry now, then wait and publish.
async fn run_entry(
    evaluator: &Evaluator,
    worker: &DeliveryWorker,
    ctx: &EntryContext,
    entry: &Value,
    cancel: &CancellationToken,
) -> DeliveryOutcome {
    let planned_at = Instant::now();
    let plan = evaluator.plan(entry, Utc::now());
    worker.deliver(ctx, plan, planned_at, cancel).await
}

fn execution_id(workflow: &str) -> String {
    format!("{}:{}", workflow, Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MemoryPublisher;
    use crate::error::{EntryError, PublishError};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn engine() -> (FanoutEngine, MemoryPublisher) {
        let memory = MemoryPublisher::new();
        let engine = FanoutEngine::new(Arc::new(memory.clone()), EngineSettings::default());
        (engine, memory)
    }

    fn request(schedule: Value) -> Value {
        json!({"Schedule": schedule, "Topic": {"ARN": "T"}, "Message": "m"})
    }

    #[tokio::test]
    async fn test_single_immediate_entry() {
        let (engine, memory) = engine();
        let report = engine.run(&request(json!([{"Delay": 0}])), 1).await.unwrap();

        assert_eq!(report.outcomes.len(), 1);
        assert!(report.outcomes[0].is_published());
        assert!(report.execution.starts_with("chime-state-machine-orchestrator:"));

        let messages = memory.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "T");
        let payload: Value = serde_json::from_str(&messages[0].payload).unwrap();
        assert_eq!(payload["message"], "m");
        assert!(payload["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_shape_error_publishes_nothing() {
        let (engine, memory) = engine();
        let err = engine.run(&request(json!({})), 1).await.unwrap_err();
        assert_eq!(err, ShapeError::Schedule);
        assert!(engine.dispatch(&request(json!("later"))).is_err());
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(memory.count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sibling_isolation() {
        let (engine, memory) = engine();
        let start = Instant::now();
        let report = engine
            .run(&request(json!([{"Delay": 2}, {"Delay": -1}])), 10)
            .await
            .unwrap();

        assert!(report.outcomes[0].is_published());
        assert_eq!(
            report.outcomes[1].reason(),
            Some(&RejectReason::Invalid(EntryError::NegativeDelay))
        );
        assert!(report.has_invalid_entries());
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(memory.count().await, 1);
    }

    #[tokio::test]
    async fn test_entry_level_rejections() {
        let (engine, memory) = engine();
        let report = engine
            .run(
                &request(json!([
                    {"Delay": 1, "Timestamp": "2030-01-01T00:00:00Z"},
                    {},
                    {"Delay": -5},
                    {"Timestamp": "2000-01-01T00:00:00Z"}
                ])),
                1,
            )
            .await
            .unwrap();

        let reasons: Vec<_> = report.outcomes.iter().map(|o| o.reason().cloned()).collect();
        assert_eq!(reasons[0], Some(RejectReason::Invalid(EntryError::BothPresent)));
        assert_eq!(reasons[1], Some(RejectReason::Invalid(EntryError::Missing)));
        assert_eq!(reasons[2], Some(RejectReason::Invalid(EntryError::NegativeDelay)));
        assert_eq!(reasons[3], None);
        assert_eq!(memory.count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_one_is_sequential() {
        let (engine, _) = engine();
        let start = Instant::now();
        let report = engine
            .run(&request(json!([{"Delay": 2}, {"Delay": 2}])), 1)
            .await
            .unwrap();
        assert_eq!(report.published(), 2);
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_waits_overlap() {
        let (engine, _) = engine();
        let start = Instant::now();
        let report = engine
            .run(&request(json!([{"Delay": 2}, {"Delay": 2}, {"Delay": 2}])), 10)
            .await
            .unwrap();
        assert_eq!(report.published(), 3);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_wait_does_not_block_siblings() {
        let (engine, memory) = engine();
        let report = engine
            .run(&request(json!([{"Delay": 5}, {"Delay": 0}])), 10)
            .await
            .unwrap();
        assert_eq!(report.published(), 2);

        let history = engine.history().recent(10).await;
        // most recent first: the delayed entry finished last
        assert_eq!(history[0].index, 0);
        assert_eq!(history[1].index, 1);
        assert_eq!(memory.count().await, 2);
        // outcomes stay in schedule order
        assert_eq!(report.outcomes[0].index(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_entry_frees_its_slot() {
        let (engine, _) = engine();
        let start = Instant::now();
        let report = engine
            .run(&request(json!([{"Delay": 100}, {"Delay": 0}, {"Delay": 1}])), 2)
            .await
            .unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(100) && elapsed < Duration::from_secs(101));
        let indexes: Vec<_> = report.outcomes.iter().map(DeliveryOutcome::index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);

        // newest first: the short entries published long before the 100s one
        let published: Vec<_> = engine
            .history()
            .recent(10)
            .await
            .iter()
            .map(|r| r.index)
            .collect();
        assert_eq!(published, vec![0, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_entries_do_not_wait() {
        let (engine, memory) = engine();
        let start = Instant::now();
        let report = engine
            .run(
                &request(json!([{"Delay": 0}, {"Timestamp": "2000-01-01T00:00:00Z"}])),
                1,
            )
            .await
            .unwrap();
        assert_eq!(report.published(), 2);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(memory.count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_timestamp_waits() {
        let (engine, _) = engine();
        let at = (Utc::now() + chrono::Duration::seconds(3)).to_rfc3339();
        let start = Instant::now();
        let report = engine
            .run(&request(json!([{ "Timestamp": at }])), 1)
            .await
            .unwrap();
        assert!(report.outcomes[0].is_published());
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_run() {
        let (engine, memory) = engine();
        let cancel = engine.child_token();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let report = engine
            .run_with_cancel(&request(json!([{"Delay": 0}, {"Delay": 30}])), 10, cancel)
            .await
            .unwrap();
        assert!(report.outcomes[0].is_published());
        assert_eq!(report.outcomes[1].reason(), Some(&RejectReason::Cancelled));
        assert_eq!(memory.count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_returns_before_delivery() {
        let (engine, memory) = engine();
        let receipt = engine
            .dispatch(&request(json!([{"Delay": 3}, {"Delay": -1}, {"Delay": 0}])))
            .unwrap();
        assert_eq!(receipt.dispatched, 3);
        assert!(receipt.notifiers[0].starts_with("chime-state-machine-notifier:"));
        assert_eq!(memory.count().await, 0);

        engine.drain().await;
        assert_eq!(memory.count().await, 2);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_detached_waits() {
        let (engine, memory) = engine();
        engine.dispatch(&request(json!([{"Delay": 600}]))).unwrap();
        tokio::task::yield_now().await;
        assert_eq!(engine.in_flight(), 1);

        engine.shutdown().await;
        assert_eq!(engine.in_flight(), 0);
        assert_eq!(memory.count().await, 0);
    }

    #[tokio::test]
    async fn test_submit_follows_mode() {
        let (engine, memory) = engine();
        let req = request(json!([{"Delay": 0}]));

        match engine.submit(&req, RunMode::Standard).await.unwrap() {
            Submission::Completed(report) => assert_eq!(report.published(), 1),
            Submission::Dispatched(_) => panic!("standard mode must complete"),
        }
        match engine.submit(&req, RunMode::Express).await.unwrap() {
            Submission::Dispatched(receipt) => assert_eq!(receipt.dispatched, 1),
            Submission::Completed(_) => panic!("express mode must dispatch"),
        }
        engine.drain().await;
        assert_eq!(memory.count().await, 2);
    }

    /// Fails only the first publish.
    struct FailOnce {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Publisher for FailOnce {
        async fn publish(&self, _topic: &str, _payload: &str) -> Result<(), PublishError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(PublishError::Transport("down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_publish_failure_is_isolated() {
        let engine = FanoutEngine::new(
            Arc::new(FailOnce {
                calls: AtomicU32::new(0),
            }),
            EngineSettings::default(),
        );
        let report = engine
            .run(&request(json!([{"Delay": 0}, {"Delay": 0}])), 1)
            .await
            .unwrap();
        assert_eq!(report.outcomes[0].reason().map(RejectReason::kind), Some("publish_failed"));
        assert!(report.outcomes[1].is_published());
        assert!(report.has_publish_failures());
        assert!(!report.has_invalid_entries());
    }

    #[tokio::test]
    async fn test_wait_ceiling_from_settings() {
        let memory = MemoryPublisher::new();
        let settings = EngineSettings {
            max_wait: Duration::from_secs(10),
            ..EngineSettings::default()
        };
        let engine = FanoutEngine::new(Arc::new(memory.clone()), settings);
        let report = engine
            .run(&request(json!([{"Delay": 11}])), 1)
            .await
            .unwrap();
        assert!(matches!(
            report.outcomes[0].reason(),
            Some(RejectReason::Invalid(EntryError::WaitTooLong { .. }))
        ));
    }
}
