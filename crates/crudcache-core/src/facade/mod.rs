//! Per-entity operation façades.
//!
//! An `EntityFacade` bundles the list query key, a `MutationCoordinator`
//! and a `Backend` for one entity type. Callers read lists, search and run
//! mutations through it without touching the cache directly.
//!
//! Two backends ship with the crate: `RestBackend` (in `api`) for the admin
//! REST service and `MemoryBackend` for demos and tests.

pub mod backend;
pub mod entity;
pub mod error;
pub mod memory;

pub use backend::{Backend, BackendFamily};
pub use entity::EntityFacade;
pub use error::ValidationError;
pub use memory::{InMemory, MemoryBackend};
