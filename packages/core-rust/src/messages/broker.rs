//! Broker message envelope and reply payloads.
//!
//! Requests travel as `{method, data}`. Replies are either
//! `{status: "ok", data}` or `{error: string}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Error text returned for a method the consumer does not know.
pub const METHOD_NOT_FOUND: &str = "Method not found";

/// Request envelope published to a service's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerEnvelope {
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

impl BrokerEnvelope {
    #[must_use]
    pub fn new(method: impl Into<String>, data: Value) -> Self {
        Self {
            method: method.into(),
            data,
        }
    }
}

/// Reply sent back on the caller's private reply queue.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerReply {
    /// Handler succeeded. The result travels untouched under `data`.
    Ok(Value),
    /// Handler failed, or the method was unknown.
    Error(String),
}

impl BrokerReply {
    #[must_use]
    pub fn method_not_found() -> Self {
        Self::Error(METHOD_NOT_FOUND.to_string())
    }

    /// Encodes the reply into its wire JSON shape.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Ok(data) => json!({ "status": "ok", "data": data }),
            Self::Error(error) => json!({ "error": error }),
        }
    }

    /// Decodes a wire reply. Only the envelope's own `status`, `data` and
    /// `error` keys are read; the handler's value is never inspected.
    /// Anything that is not one of the two reply shapes decodes as an error.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let mut fields = match value {
            Value::Object(fields) => fields,
            other => return Self::Error(format!("malformed broker reply: {other}")),
        };
        if fields.get("status").and_then(Value::as_str) == Some("ok") {
            return Self::Ok(fields.remove("data").unwrap_or(Value::Null));
        }
        match fields.remove("error") {
            Some(Value::String(error)) => Self::Error(error),
            _ => Self::Error(format!("malformed broker reply: {}", Value::Object(fields))),
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn envelope_defaults_missing_data_to_null() {
        let env: BrokerEnvelope = serde_json::from_value(json!({ "method": "ping" })).unwrap();
        assert_eq!(env.method, "ping");
        assert_eq!(env.data, Value::Null);
    }

    #[test]
    fn results_travel_under_data() {
        let wire = BrokerReply::Ok(json!({ "id": 7 })).into_value();
        assert_eq!(wire, json!({ "status": "ok", "data": { "id": 7 } }));
        assert_eq!(BrokerReply::from_value(wire), BrokerReply::Ok(json!({ "id": 7 })));
    }

    #[test]
    fn reserved_looking_fields_in_results_are_kept() {
        for data in [
            json!({ "status": "failed", "reason": "quota" }),
            json!({ "data": 5 }),
            json!({ "error": "none", "ok": true }),
            Value::Null,
        ] {
            let wire = BrokerReply::Ok(data.clone()).into_value();
            assert_eq!(BrokerReply::from_value(wire), BrokerReply::Ok(data));
        }
    }

    #[test]
    fn unknown_method_reply_shape() {
        let wire = BrokerReply::method_not_found().into_value();
        assert_eq!(wire, json!({ "error": "Method not found" }));
        assert_eq!(
            BrokerReply::from_value(wire),
            BrokerReply::Error(METHOD_NOT_FOUND.to_string())
        );
    }

    #[test]
    fn malformed_replies_are_errors() {
        assert!(matches!(BrokerReply::from_value(json!(3)), BrokerReply::Error(_)));
        assert!(matches!(
            BrokerReply::from_value(json!({ "status": "pending" })),
            BrokerReply::Error(_)
        ));
    }

    fn json_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[a-z]{0,8}".prop_map(Value::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map(
                    prop_oneof![
                        Just("status".to_string()),
                        Just("data".to_string()),
                        Just("error".to_string()),
                        "[a-z]{1,6}",
                    ],
                    inner,
                    0..4,
                )
                .prop_map(|fields| Value::Object(fields.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn ok_replies_round_trip_through_the_wire(data in json_value()) {
            let bytes = serde_json::to_vec(&BrokerReply::Ok(data.clone()).into_value()).unwrap();
            let wire: Value = serde_json::from_slice(&bytes).unwrap();
            prop_assert_eq!(BrokerReply::from_value(wire), BrokerReply::Ok(data));
        }

        #[test]
        fn error_replies_round_trip_through_the_wire(message in ".{0,32}") {
            let wire = BrokerReply::Error(message.clone()).into_value();
            prop_assert_eq!(BrokerReply::from_value(wire), BrokerReply::Error(message));
        }
    }
}
