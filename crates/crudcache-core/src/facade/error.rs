use thiserror::Error;

/// Caller misuse caught before a mutation reaches the coordinator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{kind} name must not be empty")]
    EmptyName { kind: &'static str },

    #[error("{kind} id must not be empty")]
    EmptyId { kind: &'static str },

    #[error("{kind} {id} is still being created")]
    NotYetSaved { kind: &'static str, id: String },

    #[error("patch for {kind} {id} has no fields")]
    EmptyPatch { kind: &'static str, id: String },
}
