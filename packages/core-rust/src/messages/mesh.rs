//! Peer mesh wire frames.
//!
//! Frames are JSON text messages internally tagged on `"type"`. Peer identity
//! is not part of any frame; it travels once, in the
//! [`SERVICE_NAME_HEADER`] of the connection handshake.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handshake header carrying the dialing peer's service name.
pub const SERVICE_NAME_HEADER: &str = "x-service-name";

/// A single frame on a mesh connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MeshFrame {
    Request(MeshRequest),
    Response(MeshResponse),
}

/// Asks the remote peer to execute one of its local commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshRequest {
    pub message_id: String,
    pub command_name: String,
    #[serde(default)]
    pub payload: Value,
}

/// Outcome of a [`MeshRequest`], correlated by `message_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshResponse {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MeshResponse {
    #[must_use]
    pub fn ok(message_id: String, response: Value) -> Self {
        Self {
            message_id,
            response: Some(response),
            error: None,
        }
    }

    #[must_use]
    pub fn err(message_id: String, error: impl Into<String>) -> Self {
        Self {
            message_id,
            response: None,
            error: Some(error.into()),
        }
    }

    /// Collapses the frame into a result. A frame with neither field set
    /// resolves to `null`.
    ///
    /// # Errors
    ///
    /// Returns the remote error text when `error` is present.
    pub fn into_result(self) -> Result<Value, String> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.response.unwrap_or(Value::Null)),
        }
    }
}

impl MeshFrame {
    /// Encodes the frame as a JSON string for a text message.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decodes a frame from JSON text or bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a well-formed frame.
    pub fn decode(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}
