//! Pure list transformations with exact inverses.
//!
//! The `PatchEngine` applies an `Intent` (insert, replace, remove, field
//! patch) to a list snapshot and returns both the resulting list and the
//! inverse intent that undoes it. Intents address entities by identifier, so
//! an inverse stays valid after other patches have landed on the list.

pub mod engine;
pub mod intent;

pub use engine::{by_display_name, Comparator, PatchEngine, Patched};
pub use intent::{FieldUpdates, Intent};
