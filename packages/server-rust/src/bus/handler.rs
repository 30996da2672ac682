//! Command handlers and the per-process handler table.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::RouterError;

/// Result of running a command handler.
pub type HandlerResult = Result<Value, RouterError>;

/// Serializes a handler's typed output.
///
/// # Errors
///
/// Serialization failures surface as `Internal`.
pub fn json_result<T: serde::Serialize>(value: &T) -> HandlerResult {
    serde_json::to_value(value).map_err(|e| RouterError::Internal(e.into()))
}

/// A named unit of business logic reachable through the command bus.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Runs the handler against a JSON payload.
    async fn call(&self, payload: Value) -> HandlerResult;

    /// Text published in the manifest as this command's implementation.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

/// Adapts an async closure into a [`CommandHandler`].
pub struct FnHandler<F> {
    f: F,
    description: Option<String>,
}

impl<F> FnHandler<F> {
    /// Attaches the description published in the manifest.
    #[must_use]
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Wraps `f` as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler {
        f,
        description: None,
    }
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, payload: Value) -> HandlerResult {
        (self.f)(payload).await
    }

    fn describe(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| "async fn(payload) -> result".to_string())
    }
}

/// Fully-qualified command name to handler.
///
/// Shared by the bus (local dispatch), the mesh (inbound requests), and the
/// broker consumer (inbound envelopes). Lookups clone the `Arc` out of the
/// map so no shard lock is held across a handler's `.await`.
#[derive(Default)]
pub struct HandlerTable {
    handlers: DashMap<String, Arc<dyn CommandHandler>>,
}

impl HandlerTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `handler` under `name`, returning the handler it replaced.
    pub fn insert(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.insert(name.into(), handler)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Sorted list of every registered name.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the handler registered under `name`.
    ///
    /// # Errors
    ///
    /// Returns `CommandNotRegistered` if nothing is registered under `name`,
    /// otherwise whatever the handler returns.
    pub async fn dispatch(&self, name: &str, payload: Value) -> HandlerResult {
        let handler = self
            .get(name)
            .ok_or_else(|| RouterError::CommandNotRegistered {
                name: name.to_string(),
            })?;
        handler.call(payload).await
    }
}
