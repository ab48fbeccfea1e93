//! # Chime Scheduler
//!
//! Scheduled fan-out notifier: one request, one message, many delivery times.
//!
//! ## Design Principles
//! - No external queue or storage: waits are tokio timers
//! - Every entry is independent; a bad entry never blocks its siblings
//! - Evaluation is a first-match rule table, kept as data
//! - Cancellation reaches every pending wait
//!
//! ## Architecture
//! ```text
//! Request {Schedule, Topic.ARN, Message}
//!   └── validate (shape) ──✗──> ShapeError, nothing published
//!         └── FanoutEngine
//!               ├── standard: run(concurrency)  → RunReport (ordered outcomes)
//!               └── express:  dispatch()        → DispatchReceipt (detached notifiers)
//!                     └── per entry: Evaluator → EntryPlan → DeliveryWorker
//!                                                  ├── wait (Delay / Timestamp)
//!                                                  └── Publisher → TopicRegistry
//!                                                                   ├── Webhook (HTTP POST)
//!                                                                   ├── Log
//!                                                                   └── Memory
//! ```

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod notify;
pub mod tasks;
pub mod validate;
pub mod worker;
pub mod workflow;

pub use dispatch::{MemoryPublisher, PublishedMessage, Publisher, TopicRegistry, TopicTarget};
pub use engine::{DispatchReceipt, EngineSettings, FanoutEngine, RunReport, Submission};
pub use error::{EntryError, PublishError, REQUEST_FORMAT, ShapeError};
pub use notify::{DeliveryLog, DeliveryRecord, Notification};
pub use tasks::{DeliveryOutcome, EntryPlan, RejectReason, RetryPolicy};
pub use validate::{ValidatedRequest, validate};
pub use workflow::{Evaluator, evaluate};
