use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::action::ActionStatus;

/// Append-only audit record. Rows are written once and never changed.
#[derive(Debug, Clone, Serialize)]
pub struct ActionHistory {
    pub id: Uuid,
    pub action_id: Uuid,
    pub status: ActionStatus,
    pub executed_at: DateTime<Utc>,
    /// User id or worker id that produced this entry.
    pub executed_by: String,
    pub result: Option<serde_json::Value>,
    pub details: serde_json::Value,
}

impl ActionHistory {
    pub fn new(
        action_id: Uuid,
        status: ActionStatus,
        executed_by: impl Into<String>,
        result: Option<serde_json::Value>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            action_id,
            status,
            executed_at: Utc::now(),
            executed_by: executed_by.into(),
            result,
            details,
        }
    }
}
