//! API route handlers for the gateway.

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
};
use chime_core::config::RunMode;
use chime_scheduler::{
    DispatchReceipt, REQUEST_FORMAT, RejectReason, RunReport, ShapeError, Submission,
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::server::AppState;

type Reply = (StatusCode, Json<Value>);

/// Health check endpoint.
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "chime-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// System information endpoint.
pub async fn system_info(State(state): State<Arc<AppState>>) -> Json<Value> {
    let settings = state.engine.settings();
    Json(json!({
        "app": state.config.app.id,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
        "workflows": {
            "orchestrator": settings.orchestrator,
            "notifier": settings.notifier,
        },
        "mode": settings.mode.to_string(),
        "concurrency": settings.concurrency,
        "max_wait_secs": settings.max_wait.as_secs(),
        "in_flight": state.engine.in_flight(),
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitQuery {
    /// `standard` or `express`; defaults to the configured mode.
    pub mode: Option<String>,
}

/// Accept a fan-out request. Standard mode answers once every entry is done;
/// express mode answers as soon as the notifiers are dispatched.
pub async fn submit_notification(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubmitQuery>,
    body: Bytes,
) -> Reply {
    let mode = match query.mode.as_deref() {
        Some(raw) => match raw.parse::<RunMode>() {
            Ok(mode) => mode,
            Err(e) => return bad_request(&e),
        },
        None => state.engine.settings().mode,
    };

    let Some(request) = unwrap_request(&body) else {
        tracing::warn!("⚠️ Request body is not JSON");
        return bad_request(REQUEST_FORMAT);
    };

    match state.engine.submit(&request, mode).await {
        Ok(Submission::Completed(report)) => completed(report),
        Ok(Submission::Dispatched(receipt)) => dispatched(receipt),
        Err(e) => shape_rejected(e),
    }
}

/// Parse the body, unwrapping a `{"body": ...}` envelope (object or JSON string).
fn unwrap_request(body: &[u8]) -> Option<Value> {
    let value: Value = serde_json::from_slice(body).ok()?;
    if value.get("Schedule").is_some() {
        return Some(value);
    }
    match value.get("body") {
        Some(Value::String(inner)) => serde_json::from_str(inner).ok(),
        Some(inner @ Value::Object(_)) => Some(inner.clone()),
        _ => Some(value),
    }
}

fn completed(report: RunReport) -> Reply {
    let status = if report.has_invalid_entries() {
        StatusCode::BAD_REQUEST
    } else if report.has_publish_failures() {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::OK
    };

    let mut body = json!({
        "ok": status == StatusCode::OK,
        "mode": RunMode::Standard.to_string(),
        "execution": report.execution,
        "published": report.published(),
        "rejected": report.rejected(),
        "outcomes": report.outcomes,
    });
    if status == StatusCode::BAD_REQUEST {
        let cause = report
            .outcomes
            .iter()
            .filter_map(|o| o.reason())
            .find(|r| matches!(r, RejectReason::Invalid(_)))
            .map(|r| r.to_string());
        body["error"] = json!("400");
        body["cause"] = json!(cause);
    }
    (status, Json(body))
}

fn dispatched(receipt: DispatchReceipt) -> Reply {
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "mode": RunMode::Express.to_string(),
            "execution": receipt.execution,
            "dispatched": receipt.dispatched,
            "notifiers": receipt.notifiers,
        })),
    )
}

fn shape_rejected(e: ShapeError) -> Reply {
    bad_request(&e.to_string())
}

fn bad_request(cause: &str) -> Reply {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"ok": false, "error": "400", "cause": cause})),
    )
}

#[derive(Debug, Default, Deserialize)]
pub struct DeliveriesQuery {
    pub limit: Option<usize>,
}

/// Recent deliveries, newest first.
pub async fn list_deliveries(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeliveriesQuery>,
) -> Json<Value> {
    let limit = query.limit.unwrap_or(20).min(chime_scheduler::notify::HISTORY_LIMIT);
    let deliveries = state.engine.history().recent(limit).await;
    Json(json!({"ok": true, "deliveries": deliveries}))
}

/// Configured topics and their target kinds.
pub async fn list_topics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let topics: Vec<Value> = state
        .registry
        .list()
        .into_iter()
        .map(|(arn, kind)| json!({"arn": arn, "kind": kind}))
        .collect();
    Json(json!({"ok": true, "topics": topics}))
}
