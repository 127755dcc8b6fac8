/// Shallow field updates, keyed by wire (camelCase) field name.
pub type FieldUpdates = serde_json::Map<String, serde_json::Value>;

/// A transformation of one list snapshot, addressed by entity identifier.
///
/// `at` is a position hint used by inverses: the entity is placed at that
/// index before the list is re-sorted, which restores its exact original
/// position among entries that compare equal.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent<E> {
    Insert {
        entity: E,
        at: Option<usize>,
    },
    Replace {
        id: String,
        entity: E,
        at: Option<usize>,
    },
    Remove {
        id: String,
    },
    PatchFields {
        id: String,
        updates: FieldUpdates,
        at: Option<usize>,
    },
    Noop,
}

impl<E> Intent<E> {
    pub fn insert(entity: E) -> Self {
        Intent::Insert { entity, at: None }
    }

    pub fn replace(id: impl Into<String>, entity: E) -> Self {
        Intent::Replace {
            id: id.into(),
            entity,
            at: None,
        }
    }

    pub fn remove(id: impl Into<String>) -> Self {
        Intent::Remove { id: id.into() }
    }

    pub fn patch_fields(id: impl Into<String>, updates: FieldUpdates) -> Self {
        Intent::PatchFields {
            id: id.into(),
            updates,
            at: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Intent::Noop)
    }

    /// Short operation name for log fields
    pub fn name(&self) -> &'static str {
        match self {
            Intent::Insert { .. } => "insert",
            Intent::Replace { .. } => "replace",
            Intent::Remove { .. } => "remove",
            Intent::PatchFields { .. } => "patch_fields",
            Intent::Noop => "noop",
        }
    }
}
