//! Chime configuration system.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{ChimeError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChimeConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    /// Publish targets. Empty means the two default log topics.
    #[serde(default)]
    pub topics: Vec<TopicConfig>,
}

impl ChimeConfig {
    /// Load config from the default path (~/.chime/config.toml), or `CHIME_CONFIG`.
    pub fn load() -> Result<Self> {
        let path = Self::resolve_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ChimeError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ChimeError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| ChimeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Config path honoring the `CHIME_CONFIG` override.
    pub fn resolve_path() -> PathBuf {
        std::env::var("CHIME_CONFIG")
            .map(|p| PathBuf::from(shellexpand::tilde(&p).as_ref()))
            .unwrap_or_else(|_| Self::default_path())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Chime home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chime")
    }

    /// Configured topics, or `<app>-topic1` / `<app>-topic2` log topics when none are set.
    pub fn effective_topics(&self) -> Vec<TopicConfig> {
        if !self.topics.is_empty() {
            return self.topics.clone();
        }
        vec![
            TopicConfig::log(&format!("{}-topic1", self.app.id)),
            TopicConfig::log(&format!("{}-topic2", self.app.id)),
        ]
    }

    /// Reject configs that would only fail later at publish time.
    pub fn validate(&self) -> Result<()> {
        if self.app.id.trim().is_empty() {
            return Err(ChimeError::Config("app.id must not be empty".into()));
        }
        if self.workflow.concurrency == 0 {
            return Err(ChimeError::Config(
                "workflow.concurrency must be at least 1".into(),
            ));
        }
        let mut seen = HashSet::new();
        for topic in &self.topics {
            if !seen.insert(topic.arn.as_str()) {
                return Err(ChimeError::Config(format!(
                    "duplicate topic '{}'",
                    topic.arn
                )));
            }
            if topic.kind == TopicKind::Webhook
                && topic.url.as_deref().is_none_or(|u| u.trim().is_empty())
            {
                return Err(ChimeError::Config(format!(
                    "webhook topic '{}' needs a url",
                    topic.arn
                )));
            }
        }
        Ok(())
    }
}

/// Application identity. Prefixes workflow and topic names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_id")]
    pub id: String,
}

fn default_app_id() -> String { "chime".into() }

impl Default for AppConfig {
    fn default() -> Self {
        Self { id: default_app_id() }
    }
}

impl AppConfig {
    /// Name of the request-level workflow (validate + fan-out).
    pub fn orchestrator_workflow(&self) -> String {
        format!("{}-state-machine-orchestrator", self.id)
    }

    /// Name of the per-entry workflow (evaluate + wait + publish).
    pub fn notifier_workflow(&self) -> String {
        format!("{}-state-machine-notifier", self.id)
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

fn default_port() -> u16 { 3000 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

/// How a request's schedule is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Wait for every entry and return all outcomes.
    #[default]
    Standard,
    /// Spawn a detached notifier per entry and return at once.
    Express,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Standard => write!(f, "standard"),
            RunMode::Express => write!(f, "express"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" | "sync" => Ok(RunMode::Standard),
            "express" | "async" => Ok(RunMode::Express),
            other => Err(format!("unknown run mode '{other}' (expected standard or express)")),
        }
    }
}

/// Workflow execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub mode: RunMode,
    /// Max entries in flight in standard mode. 1 runs them strictly in order.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Entries that would wait longer than this are rejected up front.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
    /// Extra publish attempts after a failure. 0 disables retry.
    #[serde(default)]
    pub publish_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_concurrency() -> usize { 1 }
fn default_max_wait_secs() -> u64 { 365 * 24 * 60 * 60 }
fn default_retry_backoff_ms() -> u64 { 500 }

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::default(),
            concurrency: default_concurrency(),
            max_wait_secs: default_max_wait_secs(),
            publish_retries: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Kind of publish target behind a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicKind {
    /// Write the payload to the log.
    Log,
    /// POST the payload to an HTTP endpoint.
    Webhook,
    /// Keep the payload in process memory.
    Memory,
}

/// A named publish target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    pub arn: String,
    pub kind: TopicKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

impl TopicConfig {
    pub fn log(arn: &str) -> Self {
        Self {
            arn: arn.to_string(),
            kind: TopicKind::Log,
            url: None,
            headers: Vec::new(),
        }
    }

    pub fn memory(arn: &str) -> Self {
        Self {
            arn: arn.to_string(),
            kind: TopicKind::Memory,
            url: None,
            headers: Vec::new(),
        }
    }

    pub fn webhook(arn: &str, url: &str) -> Self {
        Self {
            arn: arn.to_string(),
            kind: TopicKind::Webhook,
            url: Some(url.to_string()),
            headers: Vec::new(),
        }
    }
}
