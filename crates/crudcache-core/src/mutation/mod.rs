//! Optimistic mutation coordination.
//!
//! This module provides the `MutationCoordinator`, the only writer to the
//! query cache. It applies a mutation's expected effect to the cached list
//! immediately, runs the remote call, then reconciles or rolls back.

pub mod coordinator;
pub mod pending;

pub use coordinator::{
    is_placeholder_id, Mutation, MutationCoordinator, MutationKind, PatchStatus, PendingPatch,
    Settled, PLACEHOLDER_PREFIX,
};
pub use pending::Pending;
