//! In-memory query cache for list results.
//!
//! This module provides the `QueryCache` that holds the last known
//! snapshot of every list query, keyed by `QueryKey`. Writes notify
//! subscribers synchronously, so any view bound to a key sees every change,
//! including optimistic ones.
//!
//! Nothing is persisted; a new process starts with an empty cache.

pub mod age;
pub mod store;

pub use age::age_display;
pub use store::{ListSnapshot, QueryCache, QueryKey, Subscription};
