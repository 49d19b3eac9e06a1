//! Constraint-safe batch update of slotted entities.
//!
//! # Responsibility
//! - Apply a whole batch of entity updates inside one store transaction.
//! - Avoid transient `(group, slot)` collisions while reordering.
//! - Translate store failures into client-correctable or infrastructure errors.
//!
//! # Invariants
//! - All-or-nothing: any failure rolls back every statement of the batch.
//! - Duplicate ids and non-positive slots are rejected before the store is
//!   contacted.
//! - Immediate-checking stores get two-phase staging: every batch row first
//!   moves to a unique negative slot, then receives its final state. Final
//!   slots are `>= 1`, so staged rows never collide with committed ones.
//! - Deferred-checking stores get the updates in supplied order.
//! - Events are published only after commit, and publish failures never fail
//!   the batch.

use crate::db::DbError;
use crate::events::{EventEmitter, EventPublisher};
use crate::logging::CoreLogger;
use crate::model::entity::BatchEntity;
use crate::store::classify::{classify, ViolationClass};
use crate::store::{
    ConstraintChecking, RecordStore, SlotTable, Statement, StoreResult, StoreTransaction,
};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

pub type BatchResult = Result<BatchOutcome, BatchError>;

/// Successful batch outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Applied ids in the order supplied.
    pub applied_ids: Vec<Uuid>,
    /// Whether the change notification was delivered.
    pub event_published: bool,
}

#[derive(Debug)]
pub enum BatchError {
    /// The same id appears more than once in the batch.
    DuplicateIdentifier(Vec<Uuid>),
    /// Final slot falls into the reserved staging range.
    InvalidSlot { id: Uuid, slot: i64 },
    /// Entity could not be serialized into its stored document.
    Document { id: Uuid, source: serde_json::Error },
    /// No stored row matches the entity id.
    EntityNotFound(Uuid),
    /// The committed state would hold two rows in one `(group, slot)`.
    ConstraintViolation {
        offending_ids: Vec<Uuid>,
        message: String,
    },
    Store(DbError),
}

impl Display for BatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateIdentifier(ids) => {
                write!(f, "batch contains duplicate ids: {}", join_ids(ids))
            }
            Self::InvalidSlot { id, slot } => {
                write!(f, "entity {id} has invalid slot {slot}; expected >= 1")
            }
            Self::Document { id, source } => write!(f, "entity {id} not encodable: {source}"),
            Self::EntityNotFound(id) => write!(f, "entity not found: {id}"),
            Self::ConstraintViolation { message, .. } => write!(f, "{message}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for BatchError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Document { source, .. } => Some(source),
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

/// Batch mutation orchestrator.
pub struct BatchService<S: RecordStore, P: EventPublisher> {
    store: S,
    table: SlotTable,
    events: EventEmitter<P>,
    logger: CoreLogger,
}

/// One prepared entity: its final placement and full-row update.
struct PlannedUpdate {
    id: Uuid,
    placement: Option<(String, i64)>,
    update: Statement,
}

/// Failure while statements run, before commit.
enum ApplyFailure {
    Missing(usize),
    Statement { index: usize, error: DbError },
}

impl<S: RecordStore, P: EventPublisher> BatchService<S, P> {
    pub fn new(store: S, table: SlotTable, events: EventEmitter<P>, logger: CoreLogger) -> Self {
        Self {
            store,
            table,
            events,
            logger: logger.scoped("circstore_core::batch"),
        }
    }

    /// Applies every entity as one transaction.
    ///
    /// # Errors
    /// - `DuplicateIdentifier`, `InvalidSlot`, `Document`: rejected before any store call.
    /// - `EntityNotFound`: an id has no stored row; nothing is applied.
    /// - `ConstraintViolation`: the final state breaks slot uniqueness; nothing is applied.
    /// - `Store`: any other store failure; nothing is applied.
    pub fn execute_batch<E: BatchEntity>(&self, entities: &[E]) -> BatchResult {
        let plan = self.prepare(entities)?;
        if plan.is_empty() {
            return Ok(BatchOutcome {
                applied_ids: Vec::new(),
                event_published: false,
            });
        }

        let started_at = Instant::now();
        let checking = self.store.constraint_checking();
        self.logger.info(format_args!(
            "event=batch_execute module=batch status=start table={} count={} strategy={}",
            self.table.table,
            plan.len(),
            strategy_label(checking)
        ));

        let mut txn = self.store.begin().map_err(|err| self.store_failure(err, started_at))?;
        let applied = match checking {
            ConstraintChecking::Immediate => self.apply_staged(&mut txn, &plan),
            ConstraintChecking::Deferred => apply_in_order(&mut txn, &plan),
        };

        if let Err(failure) = applied {
            self.rollback(txn);
            return Err(self.translate(failure, &plan, started_at));
        }

        if let Err(err) = txn.commit() {
            return Err(self.translate_commit(err, &plan, started_at));
        }

        let applied_ids = plan.iter().map(|update| update.id).collect::<Vec<_>>();
        self.logger.info(format_args!(
            "event=batch_execute module=batch status=ok table={} count={} duration_ms={}",
            self.table.table,
            applied_ids.len(),
            started_at.elapsed().as_millis()
        ));

        let event_published = self.events.emit(
            self.table.event_type,
            &json!({
                "table": self.table.table,
                "ids": applied_ids,
                "groups": plan
                    .iter()
                    .filter_map(|update| update.placement.as_ref().map(|(group, _)| group.clone()))
                    .collect::<BTreeSet<_>>(),
            }),
        );

        Ok(BatchOutcome {
            applied_ids,
            event_published,
        })
    }

    fn prepare<E: BatchEntity>(&self, entities: &[E]) -> Result<Vec<PlannedUpdate>, BatchError> {
        let mut seen = HashSet::new();
        let mut duplicates = Vec::new();
        for entity in entities {
            let id = entity.entity_id();
            if !seen.insert(id) && !duplicates.contains(&id) {
                duplicates.push(id);
            }
        }
        if !duplicates.is_empty() {
            self.logger.warn(format_args!(
                "event=batch_execute module=batch status=rejected error_code=duplicate_identifier ids={}",
                join_ids(&duplicates)
            ));
            return Err(BatchError::DuplicateIdentifier(duplicates));
        }

        entities
            .iter()
            .map(|entity| {
                let id = entity.entity_id();
                let slot = entity.slot();
                if let Some(slot) = slot.filter(|slot| *slot < 1) {
                    return Err(BatchError::InvalidSlot { id, slot });
                }
                let group = entity.group_key();
                let document = serde_json::to_string(entity)
                    .map_err(|source| BatchError::Document { id, source })?;
                Ok(PlannedUpdate {
                    id,
                    placement: slot.map(|slot| (group.clone(), slot)),
                    update: self.table.update_statement(id, group, slot, document),
                })
            })
            .collect()
    }

    fn apply_staged<T: StoreTransaction>(
        &self,
        txn: &mut T,
        plan: &[PlannedUpdate],
    ) -> Result<(), ApplyFailure> {
        for (index, planned) in plan.iter().enumerate() {
            let staging = self.table.staging_statement(planned.id, staging_slot(index));
            execute_one(txn, index, &staging)?;
        }
        self.logger.debug(format_args!(
            "event=batch_stage module=batch status=ok table={} count={}",
            self.table.table,
            plan.len()
        ));

        apply_in_order(txn, plan)?;
        self.logger.debug(format_args!(
            "event=batch_apply module=batch status=ok table={} count={}",
            self.table.table,
            plan.len()
        ));
        Ok(())
    }

    fn rollback<T: StoreTransaction>(&self, txn: T) {
        if let Err(err) = txn.rollback() {
            self.logger.error(format_args!(
                "event=batch_execute module=batch status=error table={} error_code=rollback_failed error={}",
                self.table.table, err
            ));
        }
    }

    fn translate(
        &self,
        failure: ApplyFailure,
        plan: &[PlannedUpdate],
        started_at: Instant,
    ) -> BatchError {
        match failure {
            ApplyFailure::Missing(index) => {
                let id = plan[index].id;
                self.logger.warn(format_args!(
                    "event=batch_execute module=batch status=error table={} duration_ms={} error_code=entity_not_found id={}",
                    self.table.table,
                    started_at.elapsed().as_millis(),
                    id
                ));
                BatchError::EntityNotFound(id)
            }
            ApplyFailure::Statement { index, error } => {
                self.classify_failure(error, sharing_placement(plan, index), started_at)
            }
        }
    }

    fn translate_commit(
        &self,
        error: DbError,
        plan: &[PlannedUpdate],
        started_at: Instant,
    ) -> BatchError {
        self.classify_failure(error, colliding_ids(plan), started_at)
    }

    fn classify_failure(
        &self,
        error: DbError,
        offending_ids: Vec<Uuid>,
        started_at: Instant,
    ) -> BatchError {
        match classify(&error, &self.table.constraint) {
            ViolationClass::ConstraintViolation => {
                self.logger.warn(format_args!(
                    "event=batch_execute module=batch status=error table={} duration_ms={} error_code=constraint_violation constraint={} ids={}",
                    self.table.table,
                    started_at.elapsed().as_millis(),
                    self.table.constraint.name,
                    join_ids(&offending_ids)
                ));
                BatchError::ConstraintViolation {
                    offending_ids,
                    message: error.backend_message(),
                }
            }
            ViolationClass::Other => {
                self.logger.warn(format_args!(
                    "event=batch_execute module=batch status=error table={} duration_ms={} error_code=unmanaged_constraint error={}",
                    self.table.table,
                    started_at.elapsed().as_millis(),
                    error
                ));
                BatchError::Store(error)
            }
            ViolationClass::StoreError => self.store_failure(error, started_at),
        }
    }

    fn store_failure(&self, error: DbError, started_at: Instant) -> BatchError {
        self.logger.error(format_args!(
            "event=batch_execute module=batch status=error table={} duration_ms={} error_code=store_failed error={}",
            self.table.table,
            started_at.elapsed().as_millis(),
            error
        ));
        BatchError::Store(error)
    }
}

fn apply_in_order<T: StoreTransaction>(
    txn: &mut T,
    plan: &[PlannedUpdate],
) -> Result<(), ApplyFailure> {
    for (index, planned) in plan.iter().enumerate() {
        execute_one(txn, index, &planned.update)?;
    }
    Ok(())
}

fn execute_one<T: StoreTransaction>(
    txn: &mut T,
    index: usize,
    statement: &Statement,
) -> Result<(), ApplyFailure> {
    let changed: StoreResult<usize> = txn.execute(statement);
    match changed {
        Ok(0) => Err(ApplyFailure::Missing(index)),
        Ok(_) => Ok(()),
        Err(error) => Err(ApplyFailure::Statement { index, error }),
    }
}

/// Temporary slot for the `index`-th batch row; unique within the batch
/// and disjoint from committed slots.
fn staging_slot(index: usize) -> i64 {
    -(index as i64) - 1
}

/// Ids of the failed entity plus batch entities targeting its final placement.
fn sharing_placement(plan: &[PlannedUpdate], index: usize) -> Vec<Uuid> {
    let failed = &plan[index];
    match &failed.placement {
        Some(placement) => plan
            .iter()
            .filter(|update| update.placement.as_ref() == Some(placement))
            .map(|update| update.id)
            .collect(),
        None => vec![failed.id],
    }
}

/// Ids of every batch entity whose final placement is shared with another.
fn colliding_ids(plan: &[PlannedUpdate]) -> Vec<Uuid> {
    let mut counts: HashMap<&(String, i64), usize> = HashMap::new();
    for placement in plan.iter().filter_map(|update| update.placement.as_ref()) {
        *counts.entry(placement).or_default() += 1;
    }
    plan.iter()
        .filter(|update| {
            update
                .placement
                .as_ref()
                .is_some_and(|placement| counts.get(placement).copied().unwrap_or(0) > 1)
        })
        .map(|update| update.id)
        .collect()
}

fn strategy_label(checking: ConstraintChecking) -> &'static str {
    match checking {
        ConstraintChecking::Immediate => "staged",
        ConstraintChecking::Deferred => "deferred",
    }
}

fn join_ids(ids: &[Uuid]) -> String {
    ids.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::{colliding_ids, sharing_placement, staging_slot, PlannedUpdate};
    use crate::store::Statement;
    use uuid::Uuid;

    fn planned(placement: Option<(&str, i64)>) -> PlannedUpdate {
        PlannedUpdate {
            id: Uuid::new_v4(),
            placement: placement.map(|(group, slot)| (group.to_string(), slot)),
            update: Statement::new("UPDATE t SET x = 1;"),
        }
    }

    #[test]
    fn staging_slots_are_negative_and_distinct() {
        let slots = (0..4).map(staging_slot).collect::<Vec<_>>();
        assert_eq!(slots, vec![-1, -2, -3, -4]);
    }

    #[test]
    fn sharing_placement_reports_every_claimant_of_the_failed_slot() {
        let plan = vec![
            planned(Some(("item-a", 1))),
            planned(Some(("item-b", 1))),
            planned(Some(("item-a", 1))),
            planned(None),
        ];

        assert_eq!(sharing_placement(&plan, 2), vec![plan[0].id, plan[2].id]);
        assert_eq!(sharing_placement(&plan, 3), vec![plan[3].id]);
    }

    #[test]
    fn colliding_ids_ignores_unique_and_unslotted_rows() {
        let plan = vec![
            planned(Some(("item-a", 2))),
            planned(Some(("item-a", 3))),
            planned(Some(("item-a", 2))),
            planned(None),
            planned(None),
        ];

        assert_eq!(colliding_ids(&plan), vec![plan[0].id, plan[2].id]);
    }
}
