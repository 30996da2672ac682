//! Embedded single-file store backed by `redb`.
//!
//! Records are stored as JSON text in two tables: `services` keyed by
//! service name and `tasks` keyed by task id. Every operation runs in its
//! own transaction on the blocking pool, and the idempotency check shares
//! the insert's write transaction.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orbit_core::{ServiceRecord, ServiceRegistration, Task, TaskStatus};
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use super::{holds_key, InsertOutcome, ServiceStore, TaskStore};

const SERVICES: TableDefinition<&str, &str> = TableDefinition::new("services");
const TASKS: TableDefinition<&str, &str> = TableDefinition::new("tasks");

#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
}

impl RedbStore {
    /// Opens (or creates) the database at `path` and makes sure both tables
    /// exist.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or is not a `redb` database.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let db = Database::create(path)
            .with_context(|| format!("opening redb database at {}", path.display()))?;
        let txn = db.begin_write()?;
        {
            txn.open_table(SERVICES)?;
            txn.open_table(TASKS)?;
        }
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .context("redb task panicked")?
    }

    fn read_tasks(db: &Database, keep: impl Fn(&Task) -> bool) -> anyhow::Result<Vec<Task>> {
        let txn = db.begin_read()?;
        let table = txn.open_table(TASKS)?;
        let mut tasks = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let task: Task = serde_json::from_str(value.value())?;
            if keep(&task) {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| a.scheduled_at.cmp(&b.scheduled_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }
}

#[async_trait]
impl ServiceStore for RedbStore {
    async fn upsert(
        &self,
        registration: ServiceRegistration,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(ServiceRecord, bool)> {
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let outcome = {
                let mut table = txn.open_table(SERVICES)?;
                let existing: Option<ServiceRecord> = match table.get(registration.name.as_str())? {
                    Some(raw) => Some(serde_json::from_str(raw.value())?),
                    None => None,
                };
                let (record, created) = match existing {
                    Some(mut record) => {
                        record.manifest = registration.manifest;
                        record.updated_at = now;
                        (record, false)
                    }
                    None => (
                        ServiceRecord {
                            id: Uuid::new_v4().to_string(),
                            name: registration.name,
                            manifest: registration.manifest,
                            created_at: now,
                            updated_at: now,
                        },
                        true,
                    ),
                };
                let raw = serde_json::to_string(&record)?;
                table.insert(record.name.as_str(), raw.as_str())?;
                (record, created)
            };
            txn.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn get(&self, name: &str) -> anyhow::Result<Option<ServiceRecord>> {
        let name = name.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(SERVICES)?;
            let record = match table.get(name.as_str())? {
                Some(raw) => Some(serde_json::from_str(raw.value())?),
                None => None,
            };
            Ok(record)
        })
        .await
    }

    async fn list(&self) -> anyhow::Result<Vec<ServiceRecord>> {
        self.blocking(|db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(SERVICES)?;
            // Keys iterate in byte order, which is name order.
            let mut records = Vec::new();
            for entry in table.iter()? {
                let (_, raw) = entry?;
                records.push(serde_json::from_str(raw.value())?);
            }
            Ok(records)
        })
        .await
    }
}

#[async_trait]
impl TaskStore for RedbStore {
    async fn insert(&self, task: Task) -> anyhow::Result<InsertOutcome> {
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let outcome = {
                let mut table = txn.open_table(TASKS)?;
                let mut holder = None;
                if let Some(key) = task.idempotency_key.as_deref() {
                    for entry in table.iter()? {
                        let (_, raw) = entry?;
                        let existing: Task = serde_json::from_str(raw.value())?;
                        if holds_key(&existing, key) {
                            holder = Some(existing.id);
                            break;
                        }
                    }
                }
                match holder {
                    Some(existing_id) => InsertOutcome::Conflict { existing_id },
                    None => {
                        let raw = serde_json::to_string(&task)?;
                        table.insert(task.id.as_str(), raw.as_str())?;
                        InsertOutcome::Inserted
                    }
                }
            };
            txn.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Task>> {
        let id = id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read()?;
            let table = txn.open_table(TASKS)?;
            let task = match table.get(id.as_str())? {
                Some(raw) => Some(serde_json::from_str(raw.value())?),
                None => None,
            };
            Ok(task)
        })
        .await
    }

    async fn list(&self, status: Option<TaskStatus>) -> anyhow::Result<Vec<Task>> {
        self.blocking(move |db| Self::read_tasks(db, |t| status.map_or(true, |s| t.status == s)))
            .await
    }

    async fn due(&self, status: TaskStatus, now: DateTime<Utc>) -> anyhow::Result<Vec<Task>> {
        self.blocking(move |db| Self::read_tasks(db, |t| t.is_due(status, now)))
            .await
    }

    async fn transition(
        &self,
        id: &str,
        from: TaskStatus,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let id = id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let moved = {
                let mut table = txn.open_table(TASKS)?;
                let current: Option<Task> = match table.get(id.as_str())? {
                    Some(raw) => Some(serde_json::from_str(raw.value())?),
                    None => None,
                };
                match current {
                    Some(mut task) if task.status == from => {
                        task.status = to;
                        task.updated_at = now;
                        let raw = serde_json::to_string(&task)?;
                        table.insert(id.as_str(), raw.as_str())?;
                        true
                    }
                    _ => false,
                }
            };
            txn.commit()?;
            Ok(moved)
        })
        .await
    }

    async fn delete_by_status(&self, status: TaskStatus) -> anyhow::Result<usize> {
        self.blocking(move |db| {
            let txn = db.begin_write()?;
            let removed = {
                let mut table = txn.open_table(TASKS)?;
                let mut doomed = Vec::new();
                for entry in table.iter()? {
                    let (key, raw) = entry?;
                    let task: Task = serde_json::from_str(raw.value())?;
                    if task.status == status {
                        doomed.push(key.value().to_string());
                    }
                }
                for key in &doomed {
                    table.remove(key.as_str())?;
                }
                doomed.len()
            };
            txn.commit()?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::tests::{at, service_store_contract, task, task_store_contract};

    #[tokio::test]
    async fn redb_service_store_upserts_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("orbit.redb")).unwrap();
        service_store_contract(&store).await;
    }

    #[tokio::test]
    async fn redb_task_store_enforces_idempotency() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("orbit.redb")).unwrap();
        task_store_contract(&store).await;
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orbit.redb");
        {
            let store = RedbStore::open(&path).unwrap();
            store.insert(task("a", Some("nightly"), at(3))).await.unwrap();
        }

        let store = RedbStore::open(&path).unwrap();
        let reloaded = TaskStore::get(&store, "a").await.unwrap().unwrap();
        assert_eq!(reloaded.idempotency_key.as_deref(), Some("nightly"));
        assert_eq!(reloaded.scheduled_at, at(3));
        assert_eq!(
            store.insert(task("b", Some("nightly"), at(4))).await.unwrap(),
            InsertOutcome::Conflict { existing_id: "a".into() }
        );
    }
}
