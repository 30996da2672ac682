//! In-memory stores for tests and single-process deployments.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use orbit_core::{ServiceRecord, ServiceRegistration, Task, TaskStatus};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{holds_key, InsertOutcome, ServiceStore, TaskStore};

/// Service records keyed by name.
#[derive(Debug, Default)]
pub struct MemoryServiceStore {
    records: DashMap<String, ServiceRecord>,
}

impl MemoryServiceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServiceStore for MemoryServiceStore {
    async fn upsert(
        &self,
        registration: ServiceRegistration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(ServiceRecord, bool)> {
        let mut created = false;
        let record = self
            .records
            .entry(registration.name.clone())
            .and_modify(|record| {
                record.manifest = registration.manifest.clone();
                record.updated_at = now;
            })
            .or_insert_with(|| {
                created = true;
                ServiceRecord {
                    id: Uuid::new_v4().to_string(),
                    name: registration.name.clone(),
                    manifest: registration.manifest.clone(),
                    created_at: now,
                    updated_at: now,
                }
            })
            .clone();
        Ok((record, created))
    }

    async fn get(&self, name: &str) -> anyhow::Result<Option<ServiceRecord>> {
        Ok(self.records.get(name).map(|r| r.value().clone()))
    }

    async fn list(&self) -> anyhow::Result<Vec<ServiceRecord>> {
        let mut records: Vec<ServiceRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }
}

/// Task rows keyed by id. A single mutex keeps the idempotency check and
/// the insert atomic.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<BTreeMap<String, Task>>,
}

impl MemoryTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, keep: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.lock().values().filter(|t| keep(t)).cloned().collect();
        tasks.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: Task) -> anyhow::Result<InsertOutcome> {
        let mut tasks = self.tasks.lock();
        if let Some(key) = task.idempotency_key.as_deref() {
            if let Some(existing) = tasks.values().find(|t| holds_key(t, key)) {
                return Ok(InsertOutcome::Conflict {
                    existing_id: existing.id.clone(),
                });
            }
        }
        tasks.insert(task.id.clone(), task);
        Ok(InsertOutcome::Inserted)
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Task>> {
        Ok(self.tasks.lock().get(id).cloned())
    }

    async fn list(&self, status: Option<TaskStatus>) -> anyhow::Result<Vec<Task>> {
        Ok(self.collect(|t| status.map_or(true, |s| t.status == s)))
    }

    async fn due(&self, status: TaskStatus, now: DateTime<Utc>) -> anyhow::Result<Vec<Task>> {
        Ok(self.collect(|t| t.is_due(status, now)))
    }

    async fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(id) {
            Some(task) if task.status == from => {
                task.status = to;
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_by_status(&self, status: TaskStatus) -> anyhow::Result<usize> {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, t| t.status != status);
        Ok(before - tasks.len())
    }
}
