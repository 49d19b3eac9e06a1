//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate store transactions into use-case level operations.
//! - Keep adapter layers decoupled from SQL and transaction handling.

pub mod batch_service;
pub mod redaction_service;
