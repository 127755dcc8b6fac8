use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use super::backend::Backend;
use super::error::ValidationError;
use crate::cache::{ListSnapshot, QueryCache, QueryKey, Subscription};
use crate::models::Entity;
use crate::mutation::{is_placeholder_id, Mutation, MutationCoordinator, Pending, Settled};
use crate::patch::{Comparator, FieldUpdates, PatchEngine};
use crate::utils::contains_ignore_case;

/// List, lookup and CRUD operations for one entity type.
///
/// Reads come straight from the shared `QueryCache`; writes go through a
/// `MutationCoordinator`, so every subscriber sees optimistic changes.
pub struct EntityFacade<E, B> {
    key: QueryKey,
    coordinator: MutationCoordinator<E>,
    backend: Arc<B>,
}

impl<E, B> Clone for EntityFacade<E, B> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            coordinator: self.coordinator.clone(),
            backend: self.backend.clone(),
        }
    }
}

impl<E: Entity, B: Backend<E>> EntityFacade<E, B> {
    pub fn new(cache: QueryCache, backend: B) -> Self {
        Self::with_comparator(cache, backend, crate::patch::by_display_name::<E>)
    }

    /// Use a custom list order instead of case-insensitive display name.
    pub fn with_comparator(cache: QueryCache, backend: B, compare: Comparator<E>) -> Self {
        Self {
            key: QueryKey::list(E::KIND),
            coordinator: MutationCoordinator::with_engine(cache, PatchEngine::with_comparator(compare)),
            backend: Arc::new(backend),
        }
    }

    pub fn query_key(&self) -> &QueryKey {
        &self.key
    }

    pub fn coordinator(&self) -> &MutationCoordinator<E> {
        &self.coordinator
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn in_flight(&self) -> usize {
        self.coordinator.in_flight()
    }

    fn cache(&self) -> &QueryCache {
        self.coordinator.cache()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Current snapshot; empty until the list has been loaded.
    pub fn list(&self) -> ListSnapshot<E> {
        self.cache().get(&self.key).unwrap_or_default()
    }

    pub fn is_loaded(&self) -> bool {
        self.cache().get::<E>(&self.key).is_some()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ListSnapshot<E>) + Send + Sync + 'static,
    {
        self.cache().subscribe(&self.key, callback)
    }

    pub fn get_by_id(&self, id: &str) -> Option<E> {
        self.list().iter().find(|entity| entity.id() == id).cloned()
    }

    /// Entities whose display name contains `query`, ignoring case.
    /// A blank query returns the whole list; otherwise whitespace in the
    /// query is matched as typed.
    pub fn search(&self, query: &str) -> Vec<E> {
        let list = self.list();
        if query.trim().is_empty() {
            return list.to_vec();
        }
        list.iter()
            .filter(|entity| contains_ignore_case(entity.display_name(), query))
            .cloned()
            .collect()
    }

    /// True while `entity` is the optimistic copy of an unsaved create.
    pub fn is_pending(&self, entity: &E) -> bool {
        is_placeholder_id(entity.id())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Fetch the list from the backend and replace the cached snapshot.
    pub async fn refresh(&self) -> Result<ListSnapshot<E>> {
        let backend = self.backend.clone();
        self.coordinator
            .populate(&self.key, || async move { backend.fetch_all().await })
            .await
    }

    /// Return the cached list, refreshing first if it is missing or older
    /// than `max_age`.
    pub async fn ensure_fresh(&self, max_age: Duration) -> Result<ListSnapshot<E>> {
        if !self.cache().is_stale(&self.key, max_age) {
            if let Some(snapshot) = self.cache().get(&self.key) {
                debug!(query = %self.key, "using cached list");
                return Ok(snapshot);
            }
        }
        self.refresh().await
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Create from a draft. The entity appears immediately under a
    /// placeholder id; the handle resolves to the saved entity, or `None` if
    /// the server rejected it.
    pub fn create(&self, draft: E::Draft) -> Result<Pending<Option<E>>, ValidationError> {
        if E::draft_display_name(&draft).trim().is_empty() {
            return Err(ValidationError::EmptyName { kind: E::KIND });
        }
        Ok(self.run(Mutation::Create(draft)).map(saved_entity))
    }

    pub fn update(&self, entity: E) -> Result<Pending<Option<E>>, ValidationError> {
        self.check_id(entity.id())?;
        if entity.display_name().trim().is_empty() {
            return Err(ValidationError::EmptyName { kind: E::KIND });
        }
        Ok(self.run(Mutation::Update(entity)).map(saved_entity))
    }

    /// Change only the given fields of one entity.
    pub fn patch(
        &self,
        id: &str,
        updates: FieldUpdates,
    ) -> Result<Pending<Option<E>>, ValidationError> {
        self.check_id(id)?;
        if updates.keys().all(|field| field == "id") {
            return Err(ValidationError::EmptyPatch {
                kind: E::KIND,
                id: id.to_string(),
            });
        }
        let name_blanked = updates
            .get("name")
            .map(|name| name.as_str().map_or(true, |s| s.trim().is_empty()))
            .unwrap_or(false);
        if name_blanked {
            return Err(ValidationError::EmptyName { kind: E::KIND });
        }
        Ok(self
            .run(Mutation::Patch {
                id: id.to_string(),
                updates,
            })
            .map(saved_entity))
    }

    /// Delete by id. The handle resolves to `true` once the server confirms.
    pub fn delete(&self, id: &str) -> Result<Pending<bool>, ValidationError> {
        self.check_id(id)?;
        Ok(self
            .run(Mutation::Delete { id: id.to_string() })
            .map(|settled| matches!(settled, Some(Settled::Deleted { .. }))))
    }

    fn check_id(&self, id: &str) -> Result<(), ValidationError> {
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyId { kind: E::KIND });
        }
        if is_placeholder_id(id) {
            return Err(ValidationError::NotYetSaved {
                kind: E::KIND,
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn run(&self, mutation: Mutation<E>) -> Pending<Option<Settled<E>>> {
        let backend = self.backend.clone();
        self.coordinator
            .perform(&self.key, mutation, move |mutation| remote(backend, mutation))
    }
}

fn saved_entity<E>(settled: Option<Settled<E>>) -> Option<E> {
    settled.and_then(Settled::into_entity)
}

fn remote<E: Entity, B: Backend<E>>(
    backend: Arc<B>,
    mutation: Mutation<E>,
) -> BoxFuture<'static, Result<Option<E>>> {
    async move {
        match mutation {
            Mutation::Create(draft) => backend.create(draft).await.map(Some),
            Mutation::Update(entity) => backend.update(entity).await.map(Some),
            Mutation::Patch { id, updates } => backend.patch(id, updates).await.map(Some),
            Mutation::Delete { id } => backend.delete(id).await.map(|()| None),
        }
    }
    .boxed()
}
