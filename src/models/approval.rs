use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

string_enum!(ApprovalStatus, "approval status", {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

/// Who may cast a counting vote on an action.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverSpec {
    Role(String),
    User(Uuid),
}

impl ApproverSpec {
    pub fn admits(&self, user_id: Uuid, roles: &[String]) -> bool {
        match self {
            ApproverSpec::Role(role) => roles.iter().any(|r| r == role),
            ApproverSpec::User(id) => *id == user_id,
        }
    }
}

/// One approver's vote on an action.
#[derive(Debug, Clone, Serialize)]
pub struct Approval {
    pub id: Uuid,
    pub action_id: Uuid,
    pub approver_id: Uuid,
    pub approver_name: Option<String>,
    pub status: ApprovalStatus,
    pub comments: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_spec_matches_any_held_role() {
        let spec = ApproverSpec::Role("approver".into());
        let roles = vec!["viewer".to_string(), "approver".to_string()];
        assert!(spec.admits(Uuid::now_v7(), &roles));
        assert!(!spec.admits(Uuid::now_v7(), &["viewer".to_string()]));
    }

    #[test]
    fn user_spec_matches_only_that_user() {
        let id = Uuid::now_v7();
        let spec = ApproverSpec::User(id);
        assert!(spec.admits(id, &[]));
        assert!(!spec.admits(Uuid::now_v7(), &["approver".to_string()]));
    }

    #[test]
    fn spec_serializes_externally_tagged() {
        let json = serde_json::to_value(ApproverSpec::Role("finops".into())).unwrap();
        assert_eq!(json, serde_json::json!({ "role": "finops" }));
    }
}
