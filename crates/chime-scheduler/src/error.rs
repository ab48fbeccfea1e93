//! Error taxonomy: request shape, schedule entry, and publish failures.

/// Rejection payload for malformed requests. Returned verbatim to callers.
pub const REQUEST_FORMAT: &str = r#"the request must have the following format {"Schedule": [{"Timestamp"?: ..., "Delay"?: ...}], "Topic": {"ARN": "..."}, "Message": "..."}"#;

/// Top-level request failure. Fatal to the whole request; nothing is scheduled.
///
/// Every variant renders as [`REQUEST_FORMAT`]; the variant only records which
/// check tripped, for logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShapeError {
    #[error("{}", REQUEST_FORMAT)]
    Schedule,
    #[error("{}", REQUEST_FORMAT)]
    Topic,
    #[error("{}", REQUEST_FORMAT)]
    Message,
}

impl ShapeError {
    /// The request field that failed validation.
    pub fn field(&self) -> &'static str {
        match self {
            ShapeError::Schedule => "Schedule",
            ShapeError::Topic => "Topic.ARN",
            ShapeError::Message => "Message",
        }
    }
}

/// Per-entry failure. Only that entry is rejected; siblings proceed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("both 'Delay' and 'Timestamp' present")]
    BothPresent,
    #[error("Must specify either 'Delay' or 'Timestamp'")]
    Missing,
    #[error("'Delay' must not be negative")]
    NegativeDelay,
    #[error("wait of {requested_secs}s exceeds the maximum of {max_secs}s")]
    WaitTooLong { requested_secs: u64, max_secs: u64 },
}

/// Failure of the publish capability. Terminal for the entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),
    #[error("publish failed: {0}")]
    Transport(String),
    #[error("publish target returned {status}: {body}")]
    Rejected { status: u16, body: String },
}
