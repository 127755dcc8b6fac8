use std::future::Future;

use anyhow::Result;

use crate::models::Entity;
use crate::patch::FieldUpdates;

/// Remote side of one entity type's list and mutations.
///
/// Returned futures must be `Send` so mutations can settle on any runtime
/// worker.
pub trait Backend<E: Entity>: Send + Sync + 'static {
    fn fetch_all(&self) -> impl Future<Output = Result<Vec<E>>> + Send;

    /// Create from a draft; resolves to the complete, server-assigned entity.
    fn create(&self, draft: E::Draft) -> impl Future<Output = Result<E>> + Send;

    fn update(&self, entity: E) -> impl Future<Output = Result<E>> + Send;

    fn patch(&self, id: String, updates: FieldUpdates) -> impl Future<Output = Result<E>> + Send;

    fn delete(&self, id: String) -> impl Future<Output = Result<()>> + Send;
}

/// Produces a backend for any entity type, so an application root can build
/// every façade from one transport.
pub trait BackendFamily {
    type Backend<E: Entity>: Backend<E>;

    fn backend<E: Entity>(&self) -> Self::Backend<E>;
}
