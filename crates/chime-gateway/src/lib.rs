//! # Chime Gateway
//!
//! HTTP entry point: accepts fan-out requests and exposes delivery history.

pub mod routes;
pub mod server;

pub use server::{AppState, build_router, start};
