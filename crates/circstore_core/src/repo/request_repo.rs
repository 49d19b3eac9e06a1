//! Request repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist request documents together with their queue placement columns.
//! - Describe the request queue table for batch orchestration.
//!
//! # Invariants
//! - `requests.item_id` / `requests.position` always mirror the document.
//! - Queue listing is deterministic: `position ASC`, positioned rows only.

use super::{ensure_connection_ready, parse_uuid, RepoError, RepoResult};
use crate::events::REQUEST_QUEUE_REORDERED;
use crate::model::request::{Request, RequestId};
use crate::store::classify::UniqueConstraint;
use crate::store::SlotTable;
use rusqlite::{params, Connection, Row};
use uuid::Uuid;

/// Unique `(item_id, position)` index on `requests`.
pub const REQUEST_POSITION_CONSTRAINT: UniqueConstraint = UniqueConstraint {
    name: "request_item_id_position_idx_unique",
    table: "requests",
    columns: &["item_id", "position"],
};

/// Batch mapping of request documents onto `requests`.
pub const REQUEST_QUEUE_TABLE: SlotTable = SlotTable {
    table: "requests",
    id_column: "id",
    group_column: "item_id",
    slot_column: "position",
    document_column: "jsonb",
    touched_column: Some("updated_at"),
    constraint: REQUEST_POSITION_CONSTRAINT,
    event_type: REQUEST_QUEUE_REORDERED,
};

const REQUEST_COLUMNS: &[&str] = &["id", "item_id", "position", "jsonb", "updated_at"];

pub trait RequestRepository {
    fn create_request(&self, request: &Request) -> RepoResult<RequestId>;
    fn get_request(&self, id: RequestId) -> RepoResult<Option<Request>>;
    /// Lists queued (positioned) requests for one item.
    fn list_queue(&self, item_id: Uuid) -> RepoResult<Vec<Request>>;
}

/// SQLite-backed request repository.
pub struct SqliteRequestRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteRequestRepository<'conn> {
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_connection_ready(conn, &[("requests", REQUEST_COLUMNS)])?;
        Ok(Self { conn })
    }
}

impl RequestRepository for SqliteRequestRepository<'_> {
    fn create_request(&self, request: &Request) -> RepoResult<RequestId> {
        request.validate()?;
        let document = encode_request(request)?;

        self.conn.execute(
            "INSERT INTO requests (id, item_id, position, jsonb)
             VALUES (?1, ?2, ?3, ?4);",
            params![
                request.id.to_string(),
                request.item_id.to_string(),
                request.position,
                document,
            ],
        )?;
        Ok(request.id)
    }

    fn get_request(&self, id: RequestId) -> RepoResult<Option<Request>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, item_id, position, jsonb
             FROM requests
             WHERE id = ?1;",
        )?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_request_row(row)?));
        }
        Ok(None)
    }

    fn list_queue(&self, item_id: Uuid) -> RepoResult<Vec<Request>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, item_id, position, jsonb
             FROM requests
             WHERE item_id = ?1
               AND position IS NOT NULL
             ORDER BY position ASC;",
        )?;
        let mut rows = stmt.query([item_id.to_string()])?;
        let mut queue = Vec::new();
        while let Some(row) = rows.next()? {
            queue.push(parse_request_row(row)?);
        }
        Ok(queue)
    }
}

fn encode_request(request: &Request) -> RepoResult<String> {
    serde_json::to_string(request)
        .map_err(|err| RepoError::InvalidData(format!("request {} not encodable: {err}", request.id)))
}

fn parse_request_row(row: &Row<'_>) -> RepoResult<Request> {
    let id = parse_uuid(&row.get::<_, String>("id")?, "requests.id")?;
    let item_id = parse_uuid(&row.get::<_, String>("item_id")?, "requests.item_id")?;
    let position: Option<i64> = row.get("position")?;
    let document: String = row.get("jsonb")?;

    let request: Request = serde_json::from_str(&document).map_err(|err| {
        RepoError::InvalidData(format!("invalid request document for {id}: {err}"))
    })?;
    if request.id != id || request.item_id != item_id || request.position != position {
        return Err(RepoError::InvalidData(format!(
            "request {id} columns do not match its document"
        )));
    }
    request.validate()?;
    Ok(request)
}
