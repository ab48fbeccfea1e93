//! Delivery data model: entry plans, per-entry outcomes, retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use crate::error::{EntryError, PublishError};

/// What a single schedule entry will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPlan {
    /// Invalid entry. No wait, no publish.
    Reject(EntryError),
    /// Publish right away.
    Immediate,
    /// Publish after this many seconds, counted from plan creation.
    WaitSeconds(u64),
    /// Publish once the wall clock reaches this instant.
    WaitUntil(DateTime<Utc>),
}

impl EntryPlan {
    pub fn is_reject(&self) -> bool {
        matches!(self, EntryPlan::Reject(_))
    }

    /// Seconds this plan waits as seen from `now`, rounded up; `None` for rejections.
    pub fn wait_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        match self {
            EntryPlan::Reject(_) => None,
            EntryPlan::Immediate => Some(0),
            EntryPlan::WaitSeconds(n) => Some(*n),
            EntryPlan::WaitUntil(at) => {
                let millis = (*at - now).num_milliseconds().max(0) as u64;
                Some(millis.div_ceil(1000))
            }
        }
    }
}

/// Why an entry ended without publishing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error(transparent)]
    Invalid(#[from] EntryError),
    #[error(transparent)]
    PublishFailed(#[from] PublishError),
    #[error("delivery cancelled before publish")]
    Cancelled,
}

impl RejectReason {
    pub fn kind(&self) -> &'static str {
        match self {
            RejectReason::Invalid(_) => "invalid",
            RejectReason::PublishFailed(_) => "publish_failed",
            RejectReason::Cancelled => "cancelled",
        }
    }
}

impl Serialize for RejectReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("RejectReason", 2)?;
        s.serialize_field("kind", self.kind())?;
        s.serialize_field("message", &self.to_string())?;
        s.end()
    }
}

/// Terminal result for one schedule entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Published {
        index: usize,
        published_at: DateTime<Utc>,
    },
    Rejected {
        index: usize,
        reason: RejectReason,
    },
}

impl DeliveryOutcome {
    /// Position of the entry in the request's schedule.
    pub fn index(&self) -> usize {
        match self {
            DeliveryOutcome::Published { index, .. } | DeliveryOutcome::Rejected { index, .. } => {
                *index
            }
        }
    }

    pub fn is_published(&self) -> bool {
        matches!(self, DeliveryOutcome::Published { .. })
    }

    pub fn reason(&self) -> Option<&RejectReason> {
        match self {
            DeliveryOutcome::Rejected { reason, .. } => Some(reason),
            DeliveryOutcome::Published { .. } => None,
        }
    }
}

/// Bounded publish retry. The default makes a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    pub fn from_config(config: &chime_core::config::WorkflowConfig) -> Self {
        Self::new(
            config.publish_retries,
            Duration::from_millis(config.retry_backoff_ms),
        )
    }

    /// Delay before the given retry (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.backoff.saturating_mul(retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        let outcome = DeliveryOutcome::Rejected {
            index: 1,
            reason: RejectReason::Invalid(EntryError::Missing),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["state"], "rejected");
        assert_eq!(json["index"], 1);
        assert_eq!(json["reason"]["kind"], "invalid");
        assert_eq!(
            json["reason"]["message"],
            "Must specify either 'Delay' or 'Timestamp'"
        );
    }

    #[test]
    fn test_published_serialization() {
        let at = "2026-10-19T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let outcome = DeliveryOutcome::Published {
            index: 0,
            published_at: at,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["state"], "published");
        assert!(json["published_at"].as_str().unwrap().starts_with("2026-10-19T12:00:00"));
        assert!(outcome.reason().is_none());
    }

    #[test]
    fn test_retry_backoff_is_linear() {
        let policy = RetryPolicy::new(3, Duration::from_millis(200));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(600));
        assert_eq!(RetryPolicy::default().max_retries, 0);
    }

    #[test]
    fn test_wait_secs() {
        let now = Utc::now();
        assert_eq!(EntryPlan::Immediate.wait_secs(now), Some(0));
        assert_eq!(EntryPlan::WaitSeconds(7).wait_secs(now), Some(7));
        assert_eq!(
            EntryPlan::WaitUntil(now + chrono::Duration::seconds(30)).wait_secs(now),
            Some(30)
        );
        assert_eq!(
            EntryPlan::WaitUntil(now + chrono::Duration::milliseconds(60_100)).wait_secs(now),
            Some(61)
        );
        assert_eq!(EntryPlan::Reject(EntryError::Missing).wait_secs(now), None);
    }
}
