//! Process-local command manifest.
//!
//! Accumulates every command registered on the bus, its description, and
//! every schema the process compiled. Readers get a cheap snapshot through
//! `ArcSwap`; writers go through `rcu` so concurrent registrations never
//! lose an entry.

use std::sync::Arc;

use arc_swap::ArcSwap;
use orbit_core::ServiceManifest;
use serde_json::Value;

pub struct CommandManifest {
    current: ArcSwap<ServiceManifest>,
}

impl CommandManifest {
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(ServiceManifest::default()),
        }
    }

    /// Records a command. Re-recording a name replaces its description.
    pub fn record_command(&self, name: &str, implementation: &str) {
        self.current.rcu(|manifest| {
            let mut next = ServiceManifest::clone(manifest);
            if !next.command_list.iter().any(|c| c == name) {
                next.command_list.push(name.to_string());
                next.command_list.sort();
            }
            next.command_implementations
                .insert(name.to_string(), implementation.to_string());
            next
        });
    }

    /// Records a compiled schema under `name`.
    pub fn record_schema(&self, name: &str, schema: &Value) {
        self.current.rcu(|manifest| {
            let mut next = ServiceManifest::clone(manifest);
            next.schemas.insert(name.to_string(), schema.clone());
            next
        });
    }

    /// Point-in-time copy of the manifest.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ServiceManifest> {
        self.current.load_full()
    }
}

impl Default for CommandManifest {
    fn default() -> Self {
        Self::new()
    }
}
