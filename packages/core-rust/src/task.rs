//! Deferred and recurring task model.
//!
//! A [`Task`] is created from a validated [`ScheduleTaskRequest`] and only
//! ever moves forward through [`TaskStatus`]. Recurring work never rewrites
//! its own row: [`Task::successor`] produces a fresh row instead.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::recurrence::{next_occurrence, RecurrenceError};
use crate::schema::ValidationResult;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
///
/// `Scheduled -> (Queued) -> Completed | Failed | Cancelled`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Scheduled,
    Queued,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Queued => "queued",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns `true` for states a task never leaves.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "queued" => Ok(Self::Queued),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Unit of recurrence for rescheduled tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurringInterval {
    #[default]
    None,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl fmt::Display for RecurringInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Yearly => "yearly",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A persisted unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub name: String,
    pub payload: Value,
    pub status: TaskStatus,
    pub scheduled_at: DateTime<Utc>,
    pub recurring_interval: RecurringInterval,
    pub recurring_interval_count: u32,
    pub reschedule_centrally_on_success: bool,
    pub reschedule_centrally_on_failure: bool,
    pub handler_service_name: String,
    pub handler_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Builds a new `scheduled` task from a validated request.
    #[must_use]
    pub fn from_request(id: String, request: ScheduleTaskRequest, now: DateTime<Utc>) -> Self {
        let recurring_interval = request.recurring_interval.unwrap_or_default();
        let recurring = recurring_interval != RecurringInterval::None;
        Self {
            id,
            name: request.name,
            payload: request.payload,
            status: TaskStatus::Scheduled,
            scheduled_at: request.scheduled.0,
            recurring_interval,
            recurring_interval_count: request.recurring_interval_count.unwrap_or(1),
            reschedule_centrally_on_success: request
                .reschedule_centrally_on_success
                .unwrap_or(recurring),
            reschedule_centrally_on_failure: request
                .reschedule_centrally_on_failure
                .unwrap_or(false),
            handler_service_name: request.handler_service_name,
            handler_name: request.handler_name,
            idempotency_key: request.idempotency_key.filter(|k| !k.is_empty()),
            created_at: now,
            updated_at: now,
        }
    }

    /// Fully-qualified handler command, `<handlerServiceName>.<handlerName>`.
    #[must_use]
    pub fn handler_command(&self) -> String {
        format!("{}.{}", self.handler_service_name, self.handler_name)
    }

    /// Whether a run ending in `succeeded` should produce a successor row.
    #[must_use]
    pub fn reschedules_after(&self, succeeded: bool) -> bool {
        if succeeded {
            self.reschedule_centrally_on_success
        } else {
            self.reschedule_centrally_on_failure
        }
    }

    /// Builds the next row of a recurring task.
    ///
    /// The successor gets `new_id`, `scheduled` status, and a schedule
    /// advanced from this task's `scheduled_at`. Its idempotency key is
    /// suffixed with the new schedule so it never collides with the row it
    /// replaces, while a second reschedule of the same run still does.
    ///
    /// # Errors
    ///
    /// Returns a [`RecurrenceError`] if the interval is unsupported.
    pub fn successor(&self, new_id: String, now: DateTime<Utc>) -> Result<Self, RecurrenceError> {
        let scheduled_at = next_occurrence(
            self.scheduled_at,
            self.recurring_interval,
            self.recurring_interval_count,
        )?;
        let idempotency_key = self
            .idempotency_key
            .as_ref()
            .map(|key| format!("{key}@{}", scheduled_at.timestamp_millis()));

        Ok(Self {
            id: new_id,
            status: TaskStatus::Scheduled,
            scheduled_at,
            idempotency_key,
            created_at: now,
            updated_at: now,
            ..self.clone()
        })
    }

    /// Returns `true` if the task is at `status` and due at `now`.
    #[must_use]
    pub fn is_due(&self, status: TaskStatus, now: DateTime<Utc>) -> bool {
        self.status == status && self.scheduled_at <= now
    }
}

// ---------------------------------------------------------------------------
// ScheduleTaskRequest
// ---------------------------------------------------------------------------

/// A scheduled timestamp, accepted as RFC 3339 text or epoch milliseconds
/// and normalized to UTC at millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduledAt(pub DateTime<Utc>);

impl<'de> Deserialize<'de> for ScheduledAt {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Millis(i64),
            Text(String),
        }

        let parsed = match Raw::deserialize(deserializer)? {
            Raw::Millis(ms) => Utc
                .timestamp_millis_opt(ms)
                .single()
                .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {ms}")))?,
            Raw::Text(text) => DateTime::parse_from_rfc3339(&text)
                .map_err(|e| serde::de::Error::custom(format!("invalid timestamp {text:?}: {e}")))?
                .with_timezone(&Utc),
        };
        Ok(Self(parsed.trunc_subsecs(3)))
    }
}

/// Body of a schedule request. Unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScheduleTaskRequest {
    pub name: String,
    pub payload: Value,
    pub scheduled: ScheduledAt,
    #[serde(default)]
    pub recurring_interval: Option<RecurringInterval>,
    #[serde(default)]
    pub recurring_interval_count: Option<u32>,
    #[serde(default)]
    pub reschedule_centrally_on_success: Option<bool>,
    #[serde(default)]
    pub reschedule_centrally_on_failure: Option<bool>,
    pub handler_service_name: String,
    pub handler_name: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// A schedule request that failed schema validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("task validation failed: {}", errors.join("; "))]
pub struct TaskValidationError {
    pub errors: Vec<String>,
}

impl ScheduleTaskRequest {
    /// Parses and validates a raw JSON body against the task schema.
    ///
    /// # Errors
    ///
    /// Returns every violation found: structural errors from decoding
    /// (missing required field, unknown field, bad enum value) or semantic
    /// ones (blank names, a zero interval count, `none` as an interval).
    pub fn from_json(body: Value) -> Result<Self, TaskValidationError> {
        let request: Self = serde_json::from_value(body).map_err(|e| TaskValidationError {
            errors: vec![e.to_string()],
        })?;
        match request.validate() {
            ValidationResult::Valid => Ok(request),
            ValidationResult::Invalid { errors } => Err(TaskValidationError { errors }),
        }
    }

    /// Checks constraints that decoding alone cannot express.
    #[must_use]
    pub fn validate(&self) -> ValidationResult {
        let mut errors = Vec::new();
        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.handler_service_name.trim().is_empty() {
            errors.push("handlerServiceName must not be empty".to_string());
        }
        if self.handler_name.trim().is_empty() {
            errors.push("handlerName must not be empty".to_string());
        }
        if self.recurring_interval == Some(RecurringInterval::None) {
            errors.push("recurringInterval must be one of hourly, daily, weekly, monthly, yearly".to_string());
        }
        if self.recurring_interval_count == Some(0) {
            errors.push("recurringIntervalCount must be at least 1".to_string());
        }
        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid { errors }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
