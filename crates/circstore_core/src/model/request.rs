//! Request queue domain model.
//!
//! # Responsibility
//! - Define the request document stored in `requests.jsonb`.
//! - Expose queue placement (`item_id`, `position`) for batch orchestration.
//!
//! # Invariants
//! - `id` is never nil.
//! - `position`, when present, is `>= 1`. Non-positive values are reserved
//!   for in-transaction staging and must never be committed.
//! - Unknown document fields survive a load/store round trip via `extra`.

use crate::model::entity::BatchEntity;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub type RequestId = Uuid;

/// Request kind, serialized with the external display names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestType {
    Hold,
    Recall,
    Page,
}

/// Request lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    #[serde(rename = "Open - Not yet filled")]
    OpenNotYetFilled,
    #[serde(rename = "Open - Awaiting pickup")]
    OpenAwaitingPickup,
    #[serde(rename = "Open - In transit")]
    OpenInTransit,
    #[serde(rename = "Open - Awaiting delivery")]
    OpenAwaitingDelivery,
    #[serde(rename = "Closed - Filled")]
    ClosedFilled,
    #[serde(rename = "Closed - Cancelled")]
    ClosedCancelled,
    #[serde(rename = "Closed - Unfilled")]
    ClosedUnfilled,
    #[serde(rename = "Closed - Pickup expired")]
    ClosedPickupExpired,
}

/// Request document as stored and exchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: RequestId,
    pub request_type: RequestType,
    pub status: RequestStatus,
    /// Queue owner. Position uniqueness is scoped to this item.
    pub item_id: Uuid,
    pub requester_id: Uuid,
    /// Queue position, `None` once the request leaves the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Request document validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestValidationError {
    NilId,
    NonPositivePosition { id: RequestId, position: i64 },
}

impl Display for RequestValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NilId => write!(f, "request id must not be nil"),
            Self::NonPositivePosition { id, position } => {
                write!(f, "request {id} has invalid position {position}; expected >= 1")
            }
        }
    }
}

impl Error for RequestValidationError {}

impl Request {
    /// Creates an open hold request at `position` in the queue of `item_id`.
    pub fn new_hold(item_id: Uuid, requester_id: Uuid, position: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_type: RequestType::Hold,
            status: RequestStatus::OpenNotYetFilled,
            item_id,
            requester_id,
            position: Some(position),
            extra: Map::new(),
        }
    }

    pub fn validate(&self) -> Result<(), RequestValidationError> {
        if self.id.is_nil() {
            return Err(RequestValidationError::NilId);
        }
        if let Some(position) = self.position {
            if position < 1 {
                return Err(RequestValidationError::NonPositivePosition {
                    id: self.id,
                    position,
                });
            }
        }
        Ok(())
    }
}

impl BatchEntity for Request {
    fn entity_id(&self) -> Uuid {
        self.id
    }

    fn group_key(&self) -> String {
        self.item_id.to_string()
    }

    fn slot(&self) -> Option<i64> {
        self.position
    }
}
