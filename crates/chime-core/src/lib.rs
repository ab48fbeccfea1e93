//! # Chime Core
//!
//! Configuration model and the shared error type. Everything else in the
//! workspace builds on these two modules.

pub mod config;
pub mod error;

pub use config::{ChimeConfig, RunMode, TopicConfig, TopicKind};
pub use error::{ChimeError, Result};
