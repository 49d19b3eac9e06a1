//! Request dispatch for the batch and anonymization endpoints.
//!
//! # Responsibility
//! - Decode raw JSON bodies and hand them to core services.
//! - Map service outcomes onto HTTP-style status codes and bodies.
//!
//! # Invariants
//! - Dispatch functions never panic; every failure becomes an `ApiResponse`.
//! - Events carry the tenant of the calling context.

use circstore_core::db::DbError;
use circstore_core::{
    partition_ids, BatchError, BatchService, CoreLogger, EventEmitter, EventPublisher,
    RedactionError, RedactionOptions, RedactionReport, RedactionService, Request,
    RequestValidationError, ServiceConfig, SkipReason, SqliteRecordStore, REQUEST_QUEUE_TABLE,
};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use uuid::Uuid;

const SAME_POSITION_MESSAGE: &str =
    "Cannot have more than one request with the same position in the queue";
const NO_VALID_LOAN_IDS_MESSAGE: &str = "Please provide valid loanIds";

/// Caller identity taken from request headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant_id: String,
    pub user_id: Option<String>,
}

impl RequestContext {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
        }
    }
}

/// Status code plus encoded body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    /// JSON for 200/422, plain text for 400/500, empty for 201.
    pub body: String,
}

impl ApiResponse {
    fn created() -> Self {
        Self {
            status: 201,
            body: String::new(),
        }
    }

    fn json<T: Serialize>(status: u16, payload: &T) -> Self {
        match serde_json::to_string(payload) {
            Ok(body) => Self { status, body },
            Err(err) => Self::text(500, format!("response encoding failed: {err}")),
        }
    }

    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Failures raised before a service gets to run.
#[derive(Debug)]
pub enum ApiError {
    MalformedBody(serde_json::Error),
    Validation(RequestValidationError),
    Store(DbError),
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MalformedBody(err) => write!(f, "malformed request body: {err}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::MalformedBody(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<ApiError> for ApiResponse {
    fn from(value: ApiError) -> Self {
        match value {
            ApiError::MalformedBody(_) | ApiError::Validation(_) => {
                ApiResponse::text(400, value.to_string())
            }
            ApiError::Store(_) => ApiResponse::text(500, value.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestsBatchBody {
    requests: Vec<Request>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnonymizeLoansBody {
    loan_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnonymizeLoansResponse {
    anonymized_loans: Vec<Uuid>,
    already_anonymized_loans: Vec<Uuid>,
    not_anonymized_loans: Vec<NotAnonymizedLoan>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NotAnonymizedLoan {
    reason: &'static str,
    loan_ids: Vec<String>,
}

/// Validation error envelope shared by every 422 response.
#[derive(Debug, Serialize)]
struct Errors {
    errors: Vec<ErrorEntry>,
}

#[derive(Debug, Serialize)]
struct ErrorEntry {
    message: String,
    code: &'static str,
    parameters: Vec<Parameter>,
}

#[derive(Debug, Serialize)]
struct Parameter {
    key: &'static str,
    value: String,
}

impl Errors {
    fn single(
        message: impl Into<String>,
        code: &'static str,
        key: &'static str,
        value: String,
    ) -> Self {
        Self {
            errors: vec![ErrorEntry {
                message: message.into(),
                code,
                parameters: vec![Parameter { key, value }],
            }],
        }
    }
}

/// Entry point bound to one configuration and event publisher.
pub struct CirculationApi<P: EventPublisher> {
    config: ServiceConfig,
    publisher: P,
    logger: CoreLogger,
}

impl<P: EventPublisher> CirculationApi<P> {
    pub fn new(config: ServiceConfig, publisher: P, logger: CoreLogger) -> Self {
        Self {
            config,
            publisher,
            logger,
        }
    }

    /// `POST /request-storage-batch/requests`.
    ///
    /// Body: `{ "requests": [ <request>, ... ] }`.
    pub fn post_requests_batch(
        &self,
        conn: &Connection,
        ctx: &RequestContext,
        body: &str,
    ) -> ApiResponse {
        let started_at = Instant::now();
        let response = match self.requests_batch(conn, ctx, body) {
            Ok(response) => response,
            Err(err) => err.into(),
        };
        self.log_dispatch("requests_batch", ctx, &response, started_at);
        response
    }

    /// `POST /loan-storage/loans/anonymize`.
    ///
    /// Body: `{ "loanIds": [ "<uuid>", ... ] }`.
    pub fn post_anonymize_loans(
        &self,
        conn: &Connection,
        ctx: &RequestContext,
        body: &str,
    ) -> ApiResponse {
        let started_at = Instant::now();
        let response = match self.anonymize_loans(conn, ctx, body) {
            Ok(response) => response,
            Err(err) => err.into(),
        };
        self.log_dispatch("anonymize_loans", ctx, &response, started_at);
        response
    }

    fn log_dispatch(
        &self,
        endpoint: &str,
        ctx: &RequestContext,
        response: &ApiResponse,
        started_at: Instant,
    ) {
        let logger = self.logger.scoped("circstore_api");
        let duration_ms = started_at.elapsed().as_millis();
        let user = ctx.user_id.as_deref().unwrap_or("-");
        if response.status < 400 {
            logger.info(format_args!(
                "event=api_dispatch module=api status=ok endpoint={} tenant={} user={} http_status={} duration_ms={}",
                endpoint, ctx.tenant_id, user, response.status, duration_ms
            ));
        } else {
            logger.warn(format_args!(
                "event=api_dispatch module=api status=error endpoint={} tenant={} user={} http_status={} duration_ms={}",
                endpoint, ctx.tenant_id, user, response.status, duration_ms
            ));
        }
    }

    fn requests_batch(
        &self,
        conn: &Connection,
        ctx: &RequestContext,
        body: &str,
    ) -> Result<ApiResponse, ApiError> {
        let batch: RequestsBatchBody =
            serde_json::from_str(body).map_err(ApiError::MalformedBody)?;
        for request in &batch.requests {
            request.validate().map_err(ApiError::Validation)?;
        }

        let store = SqliteRecordStore::try_new(conn).map_err(ApiError::Store)?;
        let service = BatchService::new(
            store,
            REQUEST_QUEUE_TABLE,
            self.emitter(ctx),
            self.logger.clone(),
        );

        Ok(match service.execute_batch(&batch.requests) {
            Ok(_) => ApiResponse::created(),
            Err(err) => batch_failure(err),
        })
    }

    fn anonymize_loans(
        &self,
        conn: &Connection,
        ctx: &RequestContext,
        body: &str,
    ) -> Result<ApiResponse, ApiError> {
        let request: AnonymizeLoansBody =
            serde_json::from_str(body).map_err(ApiError::MalformedBody)?;
        let ids = partition_ids(&request.loan_ids);
        if ids.valid.is_empty() {
            return Ok(no_valid_loan_ids(&request.loan_ids));
        }

        let store = SqliteRecordStore::try_new(conn).map_err(ApiError::Store)?;
        let service = RedactionService::new(
            store,
            self.emitter(ctx),
            RedactionOptions {
                report_ineligible: self.config.report_ineligible,
            },
            self.logger.clone(),
        );

        Ok(match service.redact(&ids) {
            Ok(report) => ApiResponse::json(200, &to_anonymize_response(report)),
            Err(RedactionError::NoValidIdentifiers { .. }) => no_valid_loan_ids(&request.loan_ids),
            Err(RedactionError::Store(err)) => ApiResponse::text(500, err.backend_message()),
        })
    }

    fn emitter(&self, ctx: &RequestContext) -> EventEmitter<&P> {
        let config = ServiceConfig {
            tenant_id: ctx.tenant_id.clone(),
            ..self.config.clone()
        };
        EventEmitter::new(&self.publisher, &config, self.logger.clone())
    }
}

fn batch_failure(err: BatchError) -> ApiResponse {
    let message = err.to_string();
    match err {
        BatchError::ConstraintViolation { offending_ids, .. } => ApiResponse::json(
            422,
            &Errors::single(
                SAME_POSITION_MESSAGE,
                "samePositionInQueue",
                "requestIds",
                join_ids(&offending_ids),
            ),
        ),
        BatchError::DuplicateIdentifier(ids) => ApiResponse::json(
            422,
            &Errors::single(message, "duplicateIdentifier", "requestIds", join_ids(&ids)),
        ),
        BatchError::EntityNotFound(id) => ApiResponse::json(
            422,
            &Errors::single(message, "entityNotFound", "requestIds", id.to_string()),
        ),
        BatchError::InvalidSlot { .. } | BatchError::Document { .. } => {
            ApiResponse::text(400, message)
        }
        BatchError::Store(err) => ApiResponse::text(500, err.backend_message()),
    }
}

fn no_valid_loan_ids(raw: &[String]) -> ApiResponse {
    ApiResponse::json(
        422,
        &Errors::single(
            NO_VALID_LOAN_IDS_MESSAGE,
            "invalidLoanIds",
            "loanIds",
            format!("[{}]", raw.join(", ")),
        ),
    )
}

fn to_anonymize_response(report: RedactionReport) -> AnonymizeLoansResponse {
    AnonymizeLoansResponse {
        anonymized_loans: report.redacted,
        already_anonymized_loans: report.already_redacted,
        not_anonymized_loans: report
            .skipped
            .into_iter()
            .map(|skipped| NotAnonymizedLoan {
                reason: skip_reason_label(skipped.reason),
                loan_ids: skipped.ids,
            })
            .collect(),
    }
}

fn skip_reason_label(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::InvalidIdentifier => "invalidLoanIds",
        SkipReason::NotEligible => "loanNotClosed",
        SkipReason::NotFound => "loanNotFound",
    }
}

fn join_ids(ids: &[Uuid]) -> String {
    ids.iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(",")
}
