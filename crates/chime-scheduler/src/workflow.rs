//! Schedule entry evaluation: the branch between delay, timestamp and error.
//!
//! ## Rule order
//! ```text
//! 1. Delay present AND Timestamp present     → Reject(BothPresent)
//! 2. Delay numeric AND Delay > 0             → WaitSeconds(Delay)
//! 3. Delay numeric AND Delay == 0            → Immediate
//! 4. Delay numeric AND Delay < 0             → Reject(NegativeDelay)
//! 5. Timestamp valid AND Timestamp >= now    → WaitUntil(Timestamp)
//! 6. Timestamp valid AND Timestamp < now     → Immediate
//!    otherwise                               → Reject(Missing)
//! ```
//! First match wins. The table is data (`RULES`) so the order stays auditable.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::EntryError;
use crate::tasks::EntryPlan;

/// Typed view of one raw schedule entry.
///
/// A key counts as present even when its value is `null`.
#[derive(Debug, Clone, Default, PartialEq)]
struct EntryFields {
    delay_present: bool,
    /// Set only when `Delay` is an integral JSON number.
    delay: Option<i64>,
    timestamp_present: bool,
    /// Set only when `Timestamp` is an RFC 3339 string.
    timestamp: Option<DateTime<Utc>>,
}

impl EntryFields {
    fn read(entry: &Value) -> Self {
        let delay = entry.get("Delay");
        let timestamp = entry.get("Timestamp");
        Self {
            delay_present: delay.is_some(),
            delay: delay.and_then(integral),
            timestamp_present: timestamp.is_some(),
            timestamp: timestamp
                .and_then(Value::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
        }
    }
}

fn integral(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.is_finite() && f.fract() == 0.0)
            .map(|f| f as i64)
    })
}

struct Rule {
    name: &'static str,
    when: fn(&EntryFields, DateTime<Utc>) -> bool,
    then: fn(&EntryFields) -> EntryPlan,
}

const RULES: [Rule; 6] = [
    Rule {
        name: "both-present",
        when: both_present,
        then: reject_both,
    },
    Rule {
        name: "delay-positive",
        when: delay_positive,
        then: wait_delay,
    },
    Rule {
        name: "delay-zero",
        when: delay_zero,
        then: immediate,
    },
    Rule {
        name: "delay-negative",
        when: delay_negative,
        then: reject_negative,
    },
    Rule {
        name: "timestamp-future",
        when: timestamp_not_before,
        then: wait_timestamp,
    },
    Rule {
        name: "timestamp-past",
        when: timestamp_before,
        then: immediate,
    },
];

const OTHERWISE: &str = "otherwise";

fn both_present(f: &EntryFields, _: DateTime<Utc>) -> bool {
    f.delay_present && f.timestamp_present
}

fn delay_positive(f: &EntryFields, _: DateTime<Utc>) -> bool {
    f.delay.is_some_and(|d| d > 0)
}

fn delay_zero(f: &EntryFields, _: DateTime<Utc>) -> bool {
    f.delay == Some(0)
}

fn delay_negative(f: &EntryFields, _: DateTime<Utc>) -> bool {
    f.delay.is_some_and(|d| d < 0)
}

fn timestamp_not_before(f: &EntryFields, now: DateTime<Utc>) -> bool {
    f.timestamp.is_some_and(|t| t >= now)
}

fn timestamp_before(f: &EntryFields, now: DateTime<Utc>) -> bool {
    f.timestamp.is_some_and(|t| t < now)
}

fn reject_both(_: &EntryFields) -> EntryPlan {
    EntryPlan::Reject(EntryError::BothPresent)
}

fn reject_negative(_: &EntryFields) -> EntryPlan {
    EntryPlan::Reject(EntryError::NegativeDelay)
}

fn immediate(_: &EntryFields) -> EntryPlan {
    EntryPlan::Immediate
}

fn wait_delay(f: &EntryFields) -> EntryPlan {
    match f.delay {
        Some(d) if d > 0 => EntryPlan::WaitSeconds(d as u64),
        _ => EntryPlan::Reject(EntryError::Missing),
    }
}

fn wait_timestamp(f: &EntryFields) -> EntryPlan {
    match f.timestamp {
        Some(t) => EntryPlan::WaitUntil(t),
        None => EntryPlan::Reject(EntryError::Missing),
    }
}

fn select(entry: &Value, now: DateTime<Utc>) -> (&'static str, EntryPlan) {
    let fields = EntryFields::read(entry);
    RULES
        .iter()
        .find(|rule| (rule.when)(&fields, now))
        .map(|rule| (rule.name, (rule.then)(&fields)))
        .unwrap_or((OTHERWISE, EntryPlan::Reject(EntryError::Missing)))
}

/// Classify one schedule entry relative to `now`.
pub fn evaluate(entry: &Value, now: DateTime<Utc>) -> EntryPlan {
    select(entry, now).1
}

/// Name of the rule that decides `entry`, or `"otherwise"`.
pub fn matched_rule(entry: &Value, now: DateTime<Utc>) -> &'static str {
    select(entry, now).0
}

/// Rule names in evaluation order.
pub fn rule_order() -> impl Iterator<Item = &'static str> {
    RULES.iter().map(|r| r.name).chain(std::iter::once(OTHERWISE))
}

/// [`evaluate`] plus the configured ceiling on how long an entry may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluator {
    max_wait: Duration,
}

impl Evaluator {
    pub fn new(max_wait: Duration) -> Self {
        Self { max_wait }
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn plan(&self, entry: &Value, now: DateTime<Utc>) -> EntryPlan {
        let (rule, plan) = select(entry, now);
        tracing::debug!("🧭 Entry {} matched rule '{}' → {:?}", entry, rule, plan);

        let max_secs = self.max_wait.as_secs();
        match plan.wait_secs(now) {
            Some(requested_secs) if requested_secs > max_secs => {
                EntryPlan::Reject(EntryError::WaitTooLong {
                    requested_secs,
                    max_secs,
                })
            }
            _ => plan,
        }
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new(Duration::from_secs(365 * 24 * 60 * 60))
    }
}
