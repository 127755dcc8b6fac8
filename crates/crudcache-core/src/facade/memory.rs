//! In-process backend for demos and tests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;

use super::backend::{Backend, BackendFamily};
use crate::api::ApiError;
use crate::models::Entity;
use crate::patch::{FieldUpdates, Intent, PatchEngine};

struct Table<E> {
    rows: Vec<E>,
    next_id: u64,
    failures_queued: usize,
}

/// Backend that keeps rows in memory and assigns sequential ids.
///
/// Clone is cheap and clones share rows. `fail_next` queues injected server
/// errors, and `with_latency` delays every call.
pub struct MemoryBackend<E> {
    table: Arc<Mutex<Table<E>>>,
    latency: Option<Duration>,
}

impl<E> Clone for MemoryBackend<E> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            latency: self.latency,
        }
    }
}

impl<E: Entity> Default for MemoryBackend<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> MemoryBackend<E> {
    pub fn new() -> Self {
        Self::with_rows(Vec::new())
    }

    /// Start with existing rows. New ids continue after the largest numeric id.
    pub fn with_rows(rows: Vec<E>) -> Self {
        let next_id = rows
            .iter()
            .filter_map(|row| row.id().parse::<u64>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        Self {
            table: Arc::new(Mutex::new(Table {
                rows,
                next_id,
                failures_queued: 0,
            })),
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next `count` calls fail with a server error.
    pub fn fail_next(&self, count: usize) {
        self.table().failures_queued += count;
    }

    /// Append rows, keeping generated ids above any numeric id seen.
    pub fn seed(&self, rows: impl IntoIterator<Item = E>) {
        let mut table = self.table();
        for row in rows {
            if let Ok(n) = row.id().parse::<u64>() {
                table.next_id = table.next_id.max(n + 1);
            }
            table.rows.push(row);
        }
    }

    pub fn rows(&self) -> Vec<E> {
        self.table().rows.clone()
    }

    fn table(&self) -> MutexGuard<'_, Table<E>> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn call<T>(&self, op: impl FnOnce(&mut Table<E>) -> Result<T>) -> Result<T> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut table = self.table();
        if table.failures_queued > 0 {
            table.failures_queued -= 1;
            return Err(ApiError::ServerError(format!("injected {} failure", E::KIND)).into());
        }
        op(&mut table)
    }

    fn not_found(id: &str) -> anyhow::Error {
        ApiError::NotFound(format!("{} {}", E::KIND, id)).into()
    }
}

impl<E: Entity> Backend<E> for MemoryBackend<E> {
    async fn fetch_all(&self) -> Result<Vec<E>> {
        self.call(|table| Ok(table.rows.clone())).await
    }

    async fn create(&self, draft: E::Draft) -> Result<E> {
        self.call(|table| {
            let entity = E::from_draft(table.next_id.to_string(), &draft);
            table.next_id += 1;
            table.rows.push(entity.clone());
            Ok(entity)
        })
        .await
    }

    async fn update(&self, entity: E) -> Result<E> {
        self.call(|table| {
            let row = table
                .rows
                .iter_mut()
                .find(|row| row.id() == entity.id())
                .ok_or_else(|| Self::not_found(entity.id()))?;
            *row = entity.clone();
            Ok(entity)
        })
        .await
    }

    async fn patch(&self, id: String, updates: FieldUpdates) -> Result<E> {
        self.call(|table| {
            let patched = PatchEngine::<E>::new().apply(&table.rows, Intent::patch_fields(id.clone(), updates));
            table.rows = patched.forward;
            table
                .rows
                .iter()
                .find(|row| row.id() == id)
                .cloned()
                .ok_or_else(|| Self::not_found(&id))
        })
        .await
    }

    async fn delete(&self, id: String) -> Result<()> {
        self.call(|table| {
            let index = table
                .rows
                .iter()
                .position(|row| row.id() == id)
                .ok_or_else(|| Self::not_found(&id))?;
            table.rows.remove(index);
            Ok(())
        })
        .await
    }
}

/// `BackendFamily` that hands out a fresh, empty `MemoryBackend` per entity type.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemory;

impl BackendFamily for InMemory {
    type Backend<E: Entity> = MemoryBackend<E>;

    fn backend<E: Entity>(&self) -> MemoryBackend<E> {
        MemoryBackend::new()
    }
}
