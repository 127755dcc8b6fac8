//! REST API client module for the admin backend.
//!
//! This module provides the `ApiClient` for JSON requests against the admin
//! service and `RestBackend`, which maps each entity's list and mutations
//! onto its REST collection.
//!
//! Requests carry an optional bearer token; rate-limited requests are
//! retried with exponential backoff.

pub mod client;
pub mod error;
pub mod rest;

pub use client::ApiClient;
pub use error::ApiError;
pub use rest::RestBackend;
