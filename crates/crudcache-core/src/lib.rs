//! crudcache-core - optimistic list caching for admin CRUD consoles.
//!
//! This crate holds the cached list queries of an admin console (states,
//! cities, companies, departments, skills, shifts) and applies every
//! create, update, patch or delete to the cached list before the server
//! answers. When the call settles the list is reconciled with the server's
//! entity, or the change is undone exactly.
//!
//! Layers, bottom up:
//!
//! - `cache`: `QueryCache`, snapshots per `QueryKey` with subscribers
//! - `patch`: `PatchEngine`, pure list patches with inverses
//! - `mutation`: `MutationCoordinator`, optimistic write, reconcile, rollback
//! - `facade`: `EntityFacade`, per-entity reads and validated mutations
//! - `api`: `ApiClient` and `RestBackend` for the admin REST service
//! - `console`: `Console`, every façade over one cache

pub mod api;
pub mod cache;
pub mod config;
pub mod console;
pub mod facade;
pub mod models;
pub mod mutation;
pub mod patch;
pub mod utils;

pub use api::{ApiClient, ApiError, RestBackend};
pub use cache::{ListSnapshot, QueryCache, QueryKey, Subscription};
pub use config::Config;
pub use console::Console;
pub use facade::{Backend, BackendFamily, EntityFacade, InMemory, MemoryBackend, ValidationError};
pub use models::Entity;
pub use mutation::{Mutation, MutationCoordinator, Pending, Settled};
pub use patch::{FieldUpdates, Intent, PatchEngine};
