//! Delivery worker: waits out one entry's plan, then publishes.
//!
//! Waits are plain tokio timers raced against a cancellation token, so a
//! sleeping entry costs nothing and never holds up its siblings.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::dispatch::Publisher;
use crate::notify::{DeliveryLog, DeliveryRecord, Notification};
use crate::tasks::{DeliveryOutcome, EntryPlan, RejectReason, RetryPolicy};

/// Upper bound for a single timer, far beyond any configurable ceiling.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Identity and content of one entry's delivery.
#[derive(Debug, Clone)]
pub struct EntryContext {
    /// Execution the delivery belongs to (logged and recorded in history).
    pub execution: String,
    /// Position in the request's schedule.
    pub index: usize,
    pub topic: String,
    pub message: String,
}

/// Waits and publishes one entry at a time. Shared across entries.
pub struct DeliveryWorker {
    publisher: Arc<dyn Publisher>,
    retry: RetryPolicy,
    history: DeliveryLog,
}

impl DeliveryWorker {
    pub fn new(publisher: Arc<dyn Publisher>, retry: RetryPolicy, history: DeliveryLog) -> Self {
        Self {
            publisher,
            retry,
            history,
        }
    }

    /// Carry out `plan` for one entry. `planned_at` anchors `WaitSeconds`.
    pub async fn deliver(
        &self,
        entry: &EntryContext,
        plan: EntryPlan,
        planned_at: Instant,
        cancel: &CancellationToken,
    ) -> DeliveryOutcome {
        let index = entry.index;
        let deadline = match plan {
            EntryPlan::Reject(reason) => {
                tracing::warn!("⚠️ Entry {} rejected: {}", index, reason);
                return DeliveryOutcome::Rejected {
                    index,
                    reason: reason.into(),
                };
            }
            EntryPlan::Immediate => None,
            EntryPlan::WaitSeconds(secs) => Some(deadline_after(
                planned_at,
                Duration::from_secs(secs),
            )),
            EntryPlan::WaitUntil(at) => {
                let remaining = (at - Utc::now()).to_std().unwrap_or_default();
                Some(deadline_after(Instant::now(), remaining))
            }
        };

        if let Some(deadline) = deadline {
            tracing::info!(
                "⏳ Entry {} waiting {}s",
                index,
                deadline.saturating_duration_since(Instant::now()).as_secs()
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(index),
                _ = tokio::time::sleep_until(deadline) => {}
            }
        } else if cancel.is_cancelled() {
            return cancelled(index);
        }

        self.publish(entry, cancel).await
    }

    async fn publish(&self, entry: &EntryContext, cancel: &CancellationToken) -> DeliveryOutcome {
        let index = entry.index;
        let published_at = Utc::now();
        let payload = Notification::new(&entry.message, published_at).to_payload();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let error = match self.publisher.publish(&entry.topic, &payload).await {
                Ok(()) => {
                    tracing::info!("🔔 Entry {} published to '{}'", index, entry.topic);
                    self.record(entry, &payload, attempts, None).await;
                    return DeliveryOutcome::Published {
                        index,
                        published_at,
                    };
                }
                Err(e) => e,
            };

            if attempts > self.retry.max_retries {
                tracing::warn!(
                    "⚠️ Entry {} publish to '{}' failed after {} attempt(s): {}",
                    index,
                    entry.topic,
                    attempts,
                    error
                );
                self.record(entry, &payload, attempts, Some(error.to_string()))
                    .await;
                return DeliveryOutcome::Rejected {
                    index,
                    reason: RejectReason::PublishFailed(error),
                };
            }

            let backoff = self.retry.delay_for(attempts);
            tracing::warn!(
                "⚠️ Entry {} publish failed ({}), retrying in {}ms",
                index,
                error,
                backoff.as_millis()
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.record(entry, &payload, attempts, Some(error.to_string())).await;
                    return cancelled(index);
                }
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }

    async fn record(&self, entry: &EntryContext, payload: &str, attempts: u32, error: Option<String>) {
        self.history
            .record(DeliveryRecord {
                execution: entry.execution.clone(),
                index: entry.index,
                topic: entry.topic.clone(),
                payload: payload.to_string(),
                attempts,
                delivered: error.is_none(),
                error,
                at: Utc::now(),
            })
            .await;
    }
}

fn deadline_after(start: Instant, wait: Duration) -> Instant {
    start
        .checked_add(wait)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

fn cancelled(index: usize) -> DeliveryOutcome {
    tracing::info!("🛑 Entry {} cancelled before publish", index);
    DeliveryOutcome::Rejected {
        index,
        reason: RejectReason::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MemoryPublisher;
    use crate::error::{EntryError, PublishError};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` publishes, then succeeds.
    struct FlakyPublisher {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Publisher for FlakyPublisher {
        async fn publish(&self, _topic: &str, _payload: &str) -> Result<(), PublishError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(PublishError::Transport("broker down".into()))
            } else {
                Ok(())
            }
        }
    }

    fn entry() -> EntryContext {
        EntryContext {
            execution: "test-exec".into(),
            index: 0,
            topic: "T".into(),
            message: "m".into(),
        }
    }

    fn make_worker(publisher: Arc<dyn Publisher>, retry: RetryPolicy) -> (DeliveryWorker, DeliveryLog) {
        let history = DeliveryLog::new();
        (DeliveryWorker::new(publisher, retry, history.clone()), history)
    }

    #[tokio::test]
    async fn test_reject_never_publishes() {
        let memory = MemoryPublisher::new();
        let (worker, history) = make_worker(Arc::new(memory.clone()), RetryPolicy::default());
        let outcome = worker
            .deliver(
                &entry(),
                EntryPlan::Reject(EntryError::NegativeDelay),
                Instant::now(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(
            outcome.reason(),
            Some(&RejectReason::Invalid(EntryError::NegativeDelay))
        );
        assert_eq!(memory.count().await, 0);
        assert!(history.is_empty().await);
    }

    #[tokio::test]
    async fn test_immediate_publishes_payload() {
        let memory = MemoryPublisher::new();
        let (worker, history) = make_worker(Arc::new(memory.clone()), RetryPolicy::default());
        let outcome = worker
            .deliver(&entry(), EntryPlan::Immediate, Instant::now(), &CancellationToken::new())
            .await;
        assert!(outcome.is_published());

        let messages = memory.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "T");
        let payload: serde_json::Value = serde_json::from_str(&messages[0].payload).unwrap();
        assert_eq!(payload["message"], "m");
        assert!(payload["timestamp"].as_str().unwrap().ends_with('Z'));

        let recent = history.recent(10).await;
        assert_eq!(recent.len(), 1);
        assert!(recent[0].delivered);
        assert_eq!(recent[0].execution, "test-exec");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_seconds_counts_from_plan_creation() {
        let memory = MemoryPublisher::new();
        let (worker, _) = make_worker(Arc::new(memory.clone()), RetryPolicy::default());
        let planned_at = Instant::now();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let outcome = worker
            .deliver(&entry(), EntryPlan::WaitSeconds(2), planned_at, &CancellationToken::new())
            .await;
        assert!(outcome.is_published());
        let elapsed = planned_at.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_timestamp() {
        let memory = MemoryPublisher::new();
        let (worker, _) = make_worker(Arc::new(memory.clone()), RetryPolicy::default());
        let start = Instant::now();
        let at = Utc::now() + chrono::Duration::seconds(3);

        let outcome = worker
            .deliver(&entry(), EntryPlan::WaitUntil(at), start, &CancellationToken::new())
            .await;
        assert!(outcome.is_published());
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert_eq!(memory.count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_wait_skips_publish() {
        let memory = MemoryPublisher::new();
        let (worker, _) = make_worker(Arc::new(memory.clone()), RetryPolicy::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let outcome = worker
            .deliver(&entry(), EntryPlan::WaitSeconds(60), start, &cancel)
            .await;
        assert_eq!(outcome.reason(), Some(&RejectReason::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(memory.count().await, 0);
    }

    #[tokio::test]
    async fn test_publish_failure_is_terminal_without_retry() {
        let publisher = Arc::new(FlakyPublisher {
            failures: 1,
            calls: AtomicU32::new(0),
        });
        let (worker, history) = make_worker(publisher.clone(), RetryPolicy::default());
        let outcome = worker
            .deliver(&entry(), EntryPlan::Immediate, Instant::now(), &CancellationToken::new())
            .await;
        assert_eq!(
            outcome.reason(),
            Some(&RejectReason::PublishFailed(PublishError::Transport(
                "broker down".into()
            )))
        );
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
        assert!(!history.recent(1).await[0].delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_retry_recovers() {
        let publisher = Arc::new(FlakyPublisher {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let retry = RetryPolicy::new(2, Duration::from_millis(100));
        let (worker, history) = make_worker(publisher.clone(), retry);
        let outcome = worker
            .deliver(&entry(), EntryPlan::Immediate, Instant::now(), &CancellationToken::new())
            .await;
        assert!(outcome.is_published());
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(history.recent(1).await[0].attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_exhausted() {
        let publisher = Arc::new(FlakyPublisher {
            failures: 10,
            calls: AtomicU32::new(0),
        });
        let retry = RetryPolicy::new(1, Duration::from_millis(100));
        let (worker, _) = make_worker(publisher.clone(), retry);
        let outcome = worker
            .deliver(&entry(), EntryPlan::Immediate, Instant::now(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.reason().map(RejectReason::kind), Some("publish_failed"));
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 2);
    }
}
