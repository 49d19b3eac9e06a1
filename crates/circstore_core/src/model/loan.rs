//! Loan and loan history documents.
//!
//! # Invariants
//! - `user_id` is the only patron-identifying field; anonymization removes
//!   it from the loan and from every history snapshot of that loan.
//! - A history snapshot embeds the full loan document under `loan`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub type LoanId = Uuid;

/// Loan lifecycle state name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoanStatusName {
    Open,
    Closed,
}

/// Wrapper matching the stored `status: { name }` shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanStatus {
    pub name: LoanStatusName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Loan {
    pub id: LoanId,
    pub status: LoanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<Uuid>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Loan {
    pub fn new(user_id: Uuid, item_id: Uuid, status: LoanStatusName) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: LoanStatus { name: status },
            user_id: Some(user_id),
            item_id: Some(item_id),
            extra: Map::new(),
        }
    }
}

/// One audit row capturing a loan snapshot after a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoanHistoryEntry {
    pub id: Uuid,
    /// `I`, `U` or `D`, matching the audited change kind.
    pub operation: String,
    pub loan: Loan,
}

impl LoanHistoryEntry {
    pub fn snapshot(operation: impl Into<String>, loan: &Loan) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation: operation.into(),
            loan: loan.clone(),
        }
    }
}
