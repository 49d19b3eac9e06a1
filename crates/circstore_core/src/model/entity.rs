//! Slotted entity contract for constraint-safe batch updates.

use serde::Serialize;
use uuid::Uuid;

/// A record that occupies at most one unique slot inside a group.
///
/// `(group_key, slot)` must be unique across committed rows. Entities with
/// `slot() == None` hold no slot and never conflict.
pub trait BatchEntity: Serialize {
    /// Stable identifier used to address the stored row.
    fn entity_id(&self) -> Uuid;
    /// Partition within which the slot must be unique.
    fn group_key(&self) -> String;
    /// Final slot value after the batch commits.
    fn slot(&self) -> Option<i64>;
}
