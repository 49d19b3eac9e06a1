//! Core circulation storage logic.
//! This crate owns the queue-uniqueness and anonymization invariants.

pub mod config;
pub mod db;
pub mod events;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod store;

pub use config::{ConfigError, ServiceConfig};
pub use events::{
    Event, EventEmitter, EventMetadata, EventPublisher, LogEventPublisher, NoopEventPublisher,
    PublishError, LOAN_ANONYMIZED, REQUEST_QUEUE_REORDERED,
};
pub use logging::{default_log_level, init_logging, logging_status, CoreLogger};
pub use model::entity::BatchEntity;
pub use model::ids::{is_valid_uuid, partition_ids, PartitionedIds};
pub use model::loan::{Loan, LoanHistoryEntry, LoanId, LoanStatus, LoanStatusName};
pub use model::request::{Request, RequestId, RequestStatus, RequestType, RequestValidationError};
pub use repo::loan_repo::{LoanRepository, SqliteLoanRepository};
pub use repo::request_repo::{
    RequestRepository, SqliteRequestRepository, REQUEST_POSITION_CONSTRAINT, REQUEST_QUEUE_TABLE,
};
pub use repo::{RepoError, RepoResult};
pub use service::batch_service::{BatchError, BatchOutcome, BatchResult, BatchService};
pub use service::redaction_service::{
    AnonymizationPlan, RedactionError, RedactionOptions, RedactionReport, RedactionResult,
    RedactionService, SkipReason, SkippedIds,
};
pub use store::classify::{classify, UniqueConstraint, ViolationClass};
pub use store::{
    ConstraintChecking, RecordStore, SlotTable, SqliteRecordStore, SqliteTransaction, Statement,
    StoreError, StoreResult, StoreTransaction,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
