//! Service manifests and the persisted service record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Machine-readable description of every command and schema a service exposes.
///
/// Uses `BTreeMap` so serialized manifests are byte-stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceManifest {
    /// Fully-qualified names of every registered command.
    #[serde(default)]
    pub command_list: Vec<String>,
    /// Human-readable description of each command's implementation.
    #[serde(default)]
    pub command_implementations: BTreeMap<String, String>,
    /// JSON schemas compiled by the service, keyed by schema name.
    #[serde(default)]
    pub schemas: BTreeMap<String, serde_json::Value>,
}

impl ServiceManifest {
    /// Returns `true` if `command` appears in the command list.
    #[must_use]
    pub fn exposes(&self, command: &str) -> bool {
        self.command_list.iter().any(|c| c == command)
    }
}

/// Payload of a `registerService` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistration {
    pub name: String,
    #[serde(default)]
    pub manifest: ServiceManifest,
}

/// A peer service as stored by the control node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub id: String,
    pub name: String,
    pub manifest: ServiceManifest,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
