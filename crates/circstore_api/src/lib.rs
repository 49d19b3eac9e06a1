//! Endpoint adapter over `circstore_core`.
//!
//! Exposes JSON-in/status-out dispatch for the requests batch and loan
//! anonymization endpoints, plus health and logging helpers used by hosts.

pub mod api;

pub use api::{ApiError, ApiResponse, CirculationApi, RequestContext};

/// Health-check passthrough.
pub fn ping() -> &'static str {
    circstore_core::ping()
}

/// Core crate version.
pub fn core_version() -> &'static str {
    circstore_core::core_version()
}

/// Initializes core logging once per process.
///
/// Returns an empty string on success and the error message otherwise, so
/// hosts can surface it without matching on error types.
pub fn init_logging(level: &str, log_dir: &str) -> String {
    match circstore_core::init_logging(level, log_dir) {
        Ok(()) => String::new(),
        Err(err) => err,
    }
}
