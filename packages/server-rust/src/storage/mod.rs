//! Persistence for the control node: the service catalogue and the task table.
//!
//! Two traits, each with an in-memory implementation and (feature `redb`)
//! an embedded single-file implementation:
//!
//! - [`ServiceStore`]: service records upserted by name
//! - [`TaskStore`]: task rows, with the "one `scheduled` task per
//!   idempotency key" rule enforced atomically on insert
//!
//! Both are used as `Arc<dyn ...>` and return `anyhow::Result`.

pub mod memory;
#[cfg(feature = "redb")]
pub mod redb;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orbit_core::{ServiceRecord, ServiceRegistration, Task, TaskStatus};

pub use memory::{MemoryServiceStore, MemoryTaskStore};

use crate::config::StorageConfig;

/// Persisted catalogue of peer services.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    /// Inserts a record for `registration.name`, or replaces the manifest of
    /// the existing one and bumps its `updated_at`.
    ///
    /// Returns the stored record and `true` if it was newly created.
    async fn upsert(
        &self,
        registration: ServiceRegistration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(ServiceRecord, bool)>;

    async fn get(&self, name: &str) -> anyhow::Result<Option<ServiceRecord>>;

    /// Every record, sorted by name.
    async fn list(&self) -> anyhow::Result<Vec<ServiceRecord>>;
}

/// Result of [`TaskStore::insert`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another `scheduled` task already holds the idempotency key.
    Conflict { existing_id: String },
}

/// Persisted task rows.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Inserts `task`. If it carries an idempotency key that a `scheduled`
    /// task already holds, nothing is written.
    async fn insert(&self, task: Task) -> anyhow::Result<InsertOutcome>;

    async fn get(&self, id: &str) -> anyhow::Result<Option<Task>>;

    /// Tasks at `status` (all tasks if `None`), ordered by `scheduled_at`.
    async fn list(&self, status: Option<TaskStatus>) -> anyhow::Result<Vec<Task>>;

    /// Tasks at `status` scheduled at or before `now`, ordered by
    /// `scheduled_at`.
    async fn due(&self, status: TaskStatus, now: DateTime<Utc>) -> anyhow::Result<Vec<Task>>;

    /// Moves a task from `from` to `to`. Returns `false` (and writes
    /// nothing) if the task is missing or not at `from`.
    async fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Removes every task at `status`, returning how many were removed.
    async fn delete_by_status(&self, status: TaskStatus) -> anyhow::Result<usize>;
}

/// The pair of stores a control node runs on.
#[derive(Clone)]
pub struct Stores {
    pub services: Arc<dyn ServiceStore>,
    pub tasks: Arc<dyn TaskStore>,
}

impl Stores {
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            services: Arc::new(MemoryServiceStore::new()),
            tasks: Arc::new(MemoryTaskStore::new()),
        }
    }

    /// Opens the stores described by `config`.
    ///
    /// # Errors
    ///
    /// Fails if the database file cannot be opened, or if `redb` storage is
    /// requested in a build without the `redb` feature.
    pub fn open(config: &StorageConfig) -> anyhow::Result<Self> {
        match config {
            StorageConfig::Memory => Ok(Self::in_memory()),
            #[cfg(feature = "redb")]
            StorageConfig::Redb { path } => {
                let store = Arc::new(redb::RedbStore::open(path)?);
                Ok(Self {
                    services: store.clone(),
                    tasks: store,
                })
            }
            #[cfg(not(feature = "redb"))]
            StorageConfig::Redb { path } => anyhow::bail!(
                "redb storage at {} requested but the `redb` feature is disabled",
                path.display()
            ),
        }
    }
}

/// Shared check used by every [`TaskStore`]: does `existing` block
/// inserting a task with `key`?
pub(crate) fn holds_key(existing: &Task, key: &str) -> bool {
    existing.status == TaskStatus::Scheduled && existing.idempotency_key.as_deref() == Some(key)
}
