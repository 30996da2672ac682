//! Validation results and the schemas a node publishes in its manifest.

use serde_json::{json, Value};

/// Name under which the task schema is published.
pub const TASK_SCHEMA_NAME: &str = "task";

/// Result of validating a payload against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// The payload conforms to the schema.
    Valid,
    /// The payload violates one or more schema constraints.
    Invalid {
        /// Human-readable descriptions of each validation failure.
        errors: Vec<String>,
    },
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// JSON schema for a schedule request, as published in the manifest.
///
/// Mirrors what [`crate::task::ScheduleTaskRequest::from_json`] enforces.
#[must_use]
pub fn task_schema() -> Value {
    json!({
        "type": "object",
        "required": ["name", "payload", "scheduled", "handlerServiceName", "handlerName"],
        "additionalProperties": false,
        "properties": {
            "name": { "type": "string", "minLength": 1 },
            "payload": { "type": "object" },
            "scheduled": { "type": ["string", "integer"] },
            "recurringInterval": {
                "type": "string",
                "enum": ["hourly", "daily", "weekly", "monthly", "yearly"]
            },
            "recurringIntervalCount": { "type": "integer", "minimum": 1 },
            "rescheduleCentrallyOnSuccess": { "type": "boolean" },
            "rescheduleCentrallyOnFailure": { "type": "boolean" },
            "handlerServiceName": { "type": "string", "minLength": 1 },
            "handlerName": { "type": "string", "minLength": 1 },
            "idempotencyKey": { "type": "string" }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_schema_lists_required_fields() {
        let schema = task_schema();
        let required: Vec<&str> = schema["required"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(Value::as_str)
            .collect();
        assert_eq!(
            required,
            ["name", "payload", "scheduled", "handlerServiceName", "handlerName"]
        );
        assert_eq!(schema["additionalProperties"], false);
    }

    #[test]
    fn validation_result_reports_validity() {
        assert!(ValidationResult::Valid.is_valid());
        assert!(!ValidationResult::Invalid { errors: vec!["x".into()] }.is_valid());
    }
}
