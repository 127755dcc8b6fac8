use std::cmp::Ordering;

use serde_json::Value;
use tracing::debug;

use super::intent::{FieldUpdates, Intent};
use crate::models::Entity;
use crate::utils::cmp_ignore_case;

/// Total order used to keep a list sorted.
pub type Comparator<E> = fn(&E, &E) -> Ordering;

/// Case-insensitive order on the display field.
pub fn by_display_name<E: Entity>(a: &E, b: &E) -> Ordering {
    cmp_ignore_case(a.display_name(), b.display_name())
}

/// Result of applying an intent: the new list and the intent that undoes it.
#[derive(Debug, Clone, PartialEq)]
pub struct Patched<E> {
    pub forward: Vec<E>,
    pub inverse: Intent<E>,
}

impl<E: Clone> Patched<E> {
    fn unchanged(current: &[E]) -> Self {
        Self {
            forward: current.to_vec(),
            inverse: Intent::Noop,
        }
    }

    /// False when the intent degraded to a no-op.
    pub fn changed(&self) -> bool {
        !self.inverse.is_noop()
    }
}

/// Applies intents to list snapshots, keeping them sorted.
///
/// Every forward result is stable-sorted with the comparator, so entries that
/// compare equal keep their relative order.
pub struct PatchEngine<E> {
    compare: Comparator<E>,
}

impl<E> Clone for PatchEngine<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for PatchEngine<E> {}

impl<E: Entity> Default for PatchEngine<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Entity> PatchEngine<E> {
    pub fn new() -> Self {
        Self::with_comparator(by_display_name::<E>)
    }

    pub fn with_comparator(compare: Comparator<E>) -> Self {
        Self { compare }
    }

    pub fn sort(&self, entities: &mut [E]) {
        entities.sort_by(self.compare);
    }

    pub fn apply(&self, current: &[E], intent: Intent<E>) -> Patched<E> {
        match intent {
            Intent::Insert { entity, at } => self.insert(current, entity, at),
            Intent::Replace { id, entity, at } => self.replace(current, &id, entity, at),
            Intent::Remove { id } => self.remove(current, &id),
            Intent::PatchFields { id, updates, at } => {
                self.patch_fields(current, &id, updates, at)
            }
            Intent::Noop => Patched::unchanged(current),
        }
    }

    fn position(entities: &[E], id: &str) -> Option<usize> {
        entities.iter().position(|e| e.id() == id)
    }

    /// Put `entity` at `at` (or `fallback`), clamped to the list, then sort.
    fn place(&self, mut entities: Vec<E>, entity: E, at: Option<usize>, fallback: usize) -> Vec<E> {
        let index = at.unwrap_or(fallback).min(entities.len());
        entities.insert(index, entity);
        self.sort(&mut entities);
        entities
    }

    fn insert(&self, current: &[E], entity: E, at: Option<usize>) -> Patched<E> {
        if Self::position(current, entity.id()).is_some() {
            debug!(kind = E::KIND, id = entity.id(), "insert skipped, id already listed");
            return Patched::unchanged(current);
        }
        let id = entity.id().to_string();
        let forward = self.place(current.to_vec(), entity, at, current.len());
        Patched {
            forward,
            inverse: Intent::remove(id),
        }
    }

    fn replace(&self, current: &[E], id: &str, entity: E, at: Option<usize>) -> Patched<E> {
        let Some(index) = Self::position(current, id) else {
            debug!(kind = E::KIND, id, "replace skipped, id not listed");
            return Patched::unchanged(current);
        };
        if current[index] == entity && at.map_or(true, |i| i == index) {
            return Patched::unchanged(current);
        }

        let mut rest = current.to_vec();
        let original = rest.remove(index);

        if entity.id() != id && Self::position(&rest, entity.id()).is_some() {
            // The replacement is already listed under its own id; keep that
            // entry and drop this one rather than duplicating the id.
            debug!(kind = E::KIND, id, new_id = entity.id(), "replace collapsed into existing entry");
            self.sort(&mut rest);
            return Patched {
                forward: rest,
                inverse: Intent::Insert {
                    entity: original,
                    at: Some(index),
                },
            };
        }

        let new_id = entity.id().to_string();
        let forward = self.place(rest, entity, at, index);
        Patched {
            forward,
            inverse: Intent::Replace {
                id: new_id,
                entity: original,
                at: Some(index),
            },
        }
    }

    fn remove(&self, current: &[E], id: &str) -> Patched<E> {
        let Some(index) = Self::position(current, id) else {
            debug!(kind = E::KIND, id, "remove skipped, id not listed");
            return Patched::unchanged(current);
        };
        let mut forward = current.to_vec();
        let removed = forward.remove(index);
        self.sort(&mut forward);
        Patched {
            forward,
            inverse: Intent::Insert {
                entity: removed,
                at: Some(index),
            },
        }
    }

    fn patch_fields(
        &self,
        current: &[E],
        id: &str,
        updates: FieldUpdates,
        at: Option<usize>,
    ) -> Patched<E> {
        let Some(index) = Self::position(current, id) else {
            debug!(kind = E::KIND, id, "patch skipped, id not listed");
            return Patched::unchanged(current);
        };
        let mut fields = match serde_json::to_value(&current[index]) {
            Ok(Value::Object(fields)) => fields,
            _ => return Patched::unchanged(current),
        };

        let mut previous = FieldUpdates::new();
        for (field, value) in updates {
            if field == "id" {
                continue;
            }
            let prior = fields.get(&field).cloned().unwrap_or(Value::Null);
            if prior != value {
                previous.insert(field.clone(), prior);
                fields.insert(field, value);
            }
        }
        if previous.is_empty() {
            return Patched::unchanged(current);
        }

        let patched: E = match serde_json::from_value(Value::Object(fields)) {
            Ok(patched) => patched,
            Err(e) => {
                debug!(kind = E::KIND, id, error = %e, "patch skipped, fields do not fit entity");
                return Patched::unchanged(current);
            }
        };
        if patched == current[index] {
            debug!(kind = E::KIND, id, "patch skipped, no field of the entity changed");
            return Patched::unchanged(current);
        }

        let mut rest = current.to_vec();
        rest.remove(index);
        let forward = self.place(rest, patched, at, index);
        Patched {
            forward,
            inverse: Intent::PatchFields {
                id: id.to_string(),
                updates: previous,
                at: Some(index),
            },
        }
    }
}
