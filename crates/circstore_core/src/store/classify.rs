//! Constraint violation classification.
//!
//! Maps a native store failure onto the managed uniqueness constraint. Only
//! the constraint under management counts as a violation; other constraint
//! failures on the same table are reported separately.

use crate::db::DbError;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::ffi;

static UNIQUE_FAILED_COLUMNS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^UNIQUE constraint failed: (?P<columns>[\w.]+(?:\s*,\s*[\w.]+)*)$")
        .expect("unique failure pattern must compile")
});

/// Signature of one unique constraint managed by core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueConstraint {
    /// Constraint or index name.
    pub name: &'static str,
    pub table: &'static str,
    /// Constrained columns in declaration order.
    pub columns: &'static [&'static str],
}

/// Outcome of classifying a store failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationClass {
    /// Failure of the managed constraint.
    ConstraintViolation,
    /// Failure of some other constraint (primary key, another index, checks).
    Other,
    /// Not a constraint failure, or an unrecognized error shape.
    StoreError,
}

/// Classifies `error` against `constraint`. Never panics.
pub fn classify(error: &DbError, constraint: &UniqueConstraint) -> ViolationClass {
    let Some(extended_code) = error.sqlite_extended_code() else {
        return ViolationClass::StoreError;
    };
    // Primary result code lives in the low byte.
    if extended_code & 0xff != ffi::SQLITE_CONSTRAINT {
        return ViolationClass::StoreError;
    }

    let message = error.sqlite_message().unwrap_or_default().trim();
    if message.contains(constraint.name) {
        return ViolationClass::ConstraintViolation;
    }
    if extended_code == ffi::SQLITE_CONSTRAINT_UNIQUE
        && lists_constraint_columns(message, constraint)
    {
        return ViolationClass::ConstraintViolation;
    }
    ViolationClass::Other
}

fn lists_constraint_columns(message: &str, constraint: &UniqueConstraint) -> bool {
    let Some(captures) = UNIQUE_FAILED_COLUMNS.captures(message) else {
        return false;
    };
    let listed = captures["columns"]
        .split(',')
        .map(str::trim)
        .collect::<Vec<_>>();

    listed.len() == constraint.columns.len()
        && listed.iter().zip(constraint.columns).all(|(listed, column)| {
            listed
                .split_once('.')
                .is_some_and(|(table, name)| table == constraint.table && name == *column)
        })
}
