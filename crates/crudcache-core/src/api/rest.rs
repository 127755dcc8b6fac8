use std::marker::PhantomData;

use anyhow::Result;

use super::ApiClient;
use crate::facade::{Backend, BackendFamily};
use crate::models::Entity;
use crate::patch::FieldUpdates;

/// `Backend` for one entity type over its REST collection at `E::RESOURCE`.
pub struct RestBackend<E> {
    client: ApiClient,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for RestBackend<E> {
    fn clone(&self) -> Self {
        Self::new(self.client.clone())
    }
}

impl<E> RestBackend<E> {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            _entity: PhantomData,
        }
    }

    pub fn client(&self) -> &ApiClient {
        &self.client
    }
}

impl<E: Entity> RestBackend<E> {
    fn item_path(id: &str) -> String {
        format!("{}/{}", E::RESOURCE, id)
    }
}

impl<E: Entity> Backend<E> for RestBackend<E> {
    async fn fetch_all(&self) -> Result<Vec<E>> {
        self.client.get(E::RESOURCE).await
    }

    async fn create(&self, draft: E::Draft) -> Result<E> {
        self.client.post(E::RESOURCE, &draft).await
    }

    async fn update(&self, entity: E) -> Result<E> {
        self.client.put(&Self::item_path(entity.id()), &entity).await
    }

    async fn patch(&self, id: String, updates: FieldUpdates) -> Result<E> {
        self.client.patch(&Self::item_path(&id), &updates).await
    }

    async fn delete(&self, id: String) -> Result<()> {
        self.client.delete(&Self::item_path(&id)).await
    }
}

/// Every entity type shares one client and connection pool.
impl BackendFamily for ApiClient {
    type Backend<E: Entity> = RestBackend<E>;

    fn backend<E: Entity>(&self) -> RestBackend<E> {
        RestBackend::new(self.clone())
    }
}
