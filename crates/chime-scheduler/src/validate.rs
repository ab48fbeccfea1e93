//! Request shape validation.
//!
//! Checks run in a fixed order and stop at the first failure:
//! `Schedule` is an array, `Topic.ARN` is a string, `Message` is a string.
//! Entry contents are not inspected here; that is the evaluator's job.

use serde_json::Value;

use crate::error::ShapeError;

/// A request that passed shape validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    /// Raw schedule entries, in request order.
    pub schedule: Vec<Value>,
    /// Destination topic identifier.
    pub topic: String,
    pub message: String,
}

/// Validate an inbound request. Pure; calling it twice gives the same answer.
pub fn validate(request: &Value) -> Result<ValidatedRequest, ShapeError> {
    let schedule = request
        .get("Schedule")
        .and_then(Value::as_array)
        .ok_or(ShapeError::Schedule)?;

    let topic = request
        .get("Topic")
        .and_then(|t| t.get("ARN"))
        .and_then(Value::as_str)
        .ok_or(ShapeError::Topic)?;

    let message = request
        .get("Message")
        .and_then(Value::as_str)
        .ok_or(ShapeError::Message)?;

    Ok(ValidatedRequest {
        schedule: schedule.clone(),
        topic: topic.to_string(),
        message: message.to_string(),
    })
}
