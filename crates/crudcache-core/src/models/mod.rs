//! Data models for the reference entities managed by the console.
//!
//! This module contains the `Entity` trait every cached list item implements,
//! plus the concrete entity types:
//!
//! - `State`, `City`: geography reference data
//! - `Company`, `Department`: organization structure
//! - `Skill`, `Shift`: workforce scheduling data
//!
//! Each entity has a draft type (`NewState`, `NewCity`, ...) used as the
//! create payload, since the server assigns the identifier.

pub mod geography;
pub mod organization;
pub mod workforce;

use std::fmt::Debug;

use serde::{de::DeserializeOwned, Serialize};

pub use geography::{City, NewCity, NewState, State};
pub use organization::{Company, Department, NewCompany, NewDepartment};
pub use workforce::{NewShift, NewSkill, Shift, Skill};

/// Trait for records that live in a cached list query.
///
/// Implementors are plain serde structs; the field-patch machinery works on
/// their JSON object form, so every field must round-trip through
/// `serde_json::Value`.
pub trait Entity:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Create payload: every field except the identifier.
    type Draft: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Entity type name, used for query keys and log fields (e.g. "state").
    const KIND: &'static str;

    /// REST collection path segment (e.g. "states").
    const RESOURCE: &'static str;

    fn id(&self) -> &str;

    /// Field the lists are sorted and searched by.
    fn display_name(&self) -> &str;

    /// Build an entity from a draft and an identifier (a placeholder while
    /// the create call is in flight).
    fn from_draft(id: String, draft: &Self::Draft) -> Self;

    /// Display field of a draft, checked by the façades before a create.
    fn draft_display_name(draft: &Self::Draft) -> &str;
}
