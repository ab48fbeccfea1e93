//! Publish dispatch: sends payloads to the target behind a topic.
//! Supports: HTTP webhook, log sink, in-process memory sink.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chime_core::config::{TopicConfig, TopicKind};
use chime_core::error::{ChimeError, Result};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::PublishError;

/// The publish capability. Shared by every in-flight entry.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> std::result::Result<(), PublishError>;
}

/// A payload captured by [`MemoryPublisher`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: String,
}

/// Keeps every publish in memory. Accepts any topic.
#[derive(Clone, Default)]
pub struct MemoryPublisher {
    messages: Arc<Mutex<Vec<PublishedMessage>>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().await.clone()
    }

    pub async fn count(&self) -> usize {
        self.messages.lock().await.len()
    }
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&self, topic: &str, payload: &str) -> std::result::Result<(), PublishError> {
        self.messages.lock().await.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}

/// Where a topic's payloads go.
#[derive(Debug, Clone)]
pub enum TopicTarget {
    /// Generic HTTP webhook. POST with the payload as JSON body.
    Webhook {
        url: String,
        headers: Vec<(String, String)>,
    },
    /// Emit the payload as a log line.
    Log,
    /// Capture into the registry's memory sink.
    Memory,
}

impl TopicTarget {
    pub fn kind(&self) -> TopicKind {
        match self {
            TopicTarget::Webhook { .. } => TopicKind::Webhook,
            TopicTarget::Log => TopicKind::Log,
            TopicTarget::Memory => TopicKind::Memory,
        }
    }

    fn from_config(topic: &TopicConfig) -> Result<Self> {
        match topic.kind {
            TopicKind::Log => Ok(TopicTarget::Log),
            TopicKind::Memory => Ok(TopicTarget::Memory),
            TopicKind::Webhook => {
                let url = topic
                    .url
                    .clone()
                    .filter(|u| !u.trim().is_empty())
                    .ok_or_else(|| {
                        ChimeError::Config(format!("webhook topic '{}' needs a url", topic.arn))
                    })?;
                Ok(TopicTarget::Webhook {
                    url,
                    headers: topic.headers.clone(),
                })
            }
        }
    }
}

/// Topic name → target lookup, itself a [`Publisher`].
pub struct TopicRegistry {
    topics: HashMap<String, TopicTarget>,
    client: reqwest::Client,
    memory: MemoryPublisher,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self {
            topics: HashMap::new(),
            client: reqwest::Client::new(),
            memory: MemoryPublisher::new(),
        }
    }

    /// Build the registry from configured topics.
    pub fn from_config(topics: &[TopicConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for topic in topics {
            registry.register(&topic.arn, TopicTarget::from_config(topic)?);
        }
        tracing::info!("📮 Topic registry ready ({} topics)", registry.topics.len());
        Ok(registry)
    }

    pub fn register(&mut self, topic: &str, target: TopicTarget) {
        tracing::debug!("📮 Topic registered: {} ({:?})", topic, target.kind());
        self.topics.insert(topic.to_string(), target);
    }

    pub fn get(&self, topic: &str) -> Option<&TopicTarget> {
        self.topics.get(topic)
    }

    /// Topic names with their target kind, sorted by name.
    pub fn list(&self) -> Vec<(String, TopicKind)> {
        let mut topics: Vec<_> = self
            .topics
            .iter()
            .map(|(name, target)| (name.clone(), target.kind()))
            .collect();
        topics.sort_by(|a, b| a.0.cmp(&b.0));
        topics
    }

    /// The sink behind every `memory` topic.
    pub fn memory(&self) -> &MemoryPublisher {
        &self.memory
    }
}

impl Default for TopicRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Publisher for TopicRegistry {
    async fn publish(&self, topic: &str, payload: &str) -> std::result::Result<(), PublishError> {
        let target = self
            .topics
            .get(topic)
            .ok_or_else(|| PublishError::UnknownTopic(topic.to_string()))?;

        match target {
            TopicTarget::Webhook { url, headers } => {
                send_webhook(&self.client, url, headers, payload).await
            }
            TopicTarget::Log => {
                tracing::info!("📢 [{}] {}", topic, payload);
                Ok(())
            }
            TopicTarget::Memory => self.memory.publish(topic, payload).await,
        }
    }
}

/// Send the payload via generic HTTP webhook.
async fn send_webhook(
    client: &reqwest::Client,
    url: &str,
    headers: &[(String, String)],
    payload: &str,
) -> std::result::Result<(), PublishError> {
    let mut req = client
        .post(url)
        .header("Content-Type", "application/json")
        .body(payload.to_string())
        .timeout(std::time::Duration::from_secs(10));

    for (key, value) in headers {
        req = req.header(key.as_str(), value.as_str());
    }

    let resp = req
        .send()
        .await
        .map_err(|e| PublishError::Transport(format!("webhook send failed: {e}")))?;

    if resp.status().is_success() {
        tracing::info!("✅ Webhook delivered to {}", url);
        Ok(())
    } else {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(PublishError::Rejected { status, body })
    }
}
