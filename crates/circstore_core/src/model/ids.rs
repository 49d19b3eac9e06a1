//! Identifier syntax checks shared by adapters.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use uuid::Uuid;

// Canonical hyphenated form, version 1-5, RFC 4122 variant.
static UUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        "^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[1-5][0-9a-fA-F]{3}-[89abAB][0-9a-fA-F]{3}-[0-9a-fA-F]{12}$",
    )
    .expect("uuid pattern must compile")
});

/// Identifiers split by syntactic validity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionedIds {
    /// Parsed identifiers, first occurrence order, duplicates removed.
    pub valid: Vec<Uuid>,
    /// Raw inputs that failed validation, in input order.
    pub invalid: Vec<String>,
}

/// Returns whether `value` is a canonical hyphenated RFC 4122 UUID.
pub fn is_valid_uuid(value: &str) -> bool {
    UUID_PATTERN.is_match(value)
}

/// Splits raw identifiers into valid UUIDs and rejected inputs.
pub fn partition_ids<S: AsRef<str>>(ids: &[S]) -> PartitionedIds {
    let mut seen = HashSet::new();
    let mut partitioned = PartitionedIds::default();
    for raw in ids {
        let raw = raw.as_ref();
        match Uuid::parse_str(raw) {
            Ok(id) if is_valid_uuid(raw) => {
                if seen.insert(id) {
                    partitioned.valid.push(id);
                }
            }
            _ => partitioned.invalid.push(raw.to_string()),
        }
    }
    partitioned
}
