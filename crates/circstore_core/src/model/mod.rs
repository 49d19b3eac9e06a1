//! Circulation domain model.
//!
//! # Responsibility
//! - Define the request and loan documents persisted by core.
//! - Define the `BatchEntity` contract consumed by batch orchestration.
//!
//! # Invariants
//! - Every persisted document is identified by a stable UUID.
//! - Committed queue positions are always `>= 1`.

pub mod entity;
pub mod ids;
pub mod loan;
pub mod request;
