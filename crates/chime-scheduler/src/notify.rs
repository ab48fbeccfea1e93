//! Published payload and delivery history.
//! History is an in-memory ring buffer without external storage.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// History capacity: the last 100 deliveries are kept.
pub const HISTORY_LIMIT: usize = 100;

/// The payload handed to the publisher for every delivered entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub message: String,
    /// RFC 3339, millisecond precision, `Z` suffix.
    pub timestamp: String,
}

impl Notification {
    pub fn new(message: &str, at: DateTime<Utc>) -> Self {
        Self {
            message: message.to_string(),
            timestamp: at.to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Wire form: `{"message": "...", "timestamp": "..."}`.
    pub fn to_payload(&self) -> String {
        serde_json::json!({
            "message": self.message,
            "timestamp": self.timestamp,
        })
        .to_string()
    }
}

/// One finished publish attempt chain.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    /// Notifier execution that produced this delivery.
    pub execution: String,
    pub index: usize,
    pub topic: String,
    pub payload: String,
    pub attempts: u32,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Shared delivery history. Cheap to clone.
#[derive(Clone, Default)]
pub struct DeliveryLog {
    records: Arc<Mutex<VecDeque<DeliveryRecord>>>,
}

impl DeliveryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery, evicting the oldest when full.
    pub async fn record(&self, record: DeliveryRecord) {
        let mut records = self.records.lock().await;
        records.push_back(record);
        while records.len() > HISTORY_LIMIT {
            records.pop_front();
        }
    }

    /// Most recent first.
    pub async fn recent(&self, limit: usize) -> Vec<DeliveryRecord> {
        let records = self.records.lock().await;
        records.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}
