use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::approval::{ApprovalStatus, ApproverSpec};
use super::parameters::ActionParameters;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Azure,
    Gcp,
}

string_enum!(Provider, "provider", {
    Aws => "aws",
    Azure => "azure",
    Gcp => "gcp",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    ResizeResource,
    StopResource,
    StartResource,
    DeleteResource,
    AddTags,
    OptimizeStorage,
    PurchaseReservation,
    TerraformApply,
    TerraformDestroy,
}

string_enum!(ActionType, "action type", {
    ResizeResource => "resize_resource",
    StopResource => "stop_resource",
    StartResource => "start_resource",
    DeleteResource => "delete_resource",
    AddTags => "add_tags",
    OptimizeStorage => "optimize_storage",
    PurchaseReservation => "purchase_reservation",
    TerraformApply => "terraform_apply",
    TerraformDestroy => "terraform_destroy",
});

impl ActionType {
    /// Whether the action targets a specific resource (as opposed to the account).
    pub fn targets_resource(&self) -> bool {
        !matches!(
            self,
            ActionType::PurchaseReservation | ActionType::TerraformApply
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Draft,
    PendingApproval,
    Approved,
    Rejected,
    Scheduled,
    Executing,
    Completed,
    Failed,
    Cancelled,
    RolledBack,
}

string_enum!(ActionStatus, "action status", {
    Draft => "draft",
    PendingApproval => "pending_approval",
    Approved => "approved",
    Rejected => "rejected",
    Scheduled => "scheduled",
    Executing => "executing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
    RolledBack => "rolled_back",
});

impl ActionStatus {
    /// Execution has ended one way or another. `Failed` is included even
    /// though it may still move to `RolledBack`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ActionStatus::Completed
                | ActionStatus::Rejected
                | ActionStatus::Cancelled
                | ActionStatus::RolledBack
                | ActionStatus::Failed
        )
    }

    /// Statuses a user may still cancel from.
    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            ActionStatus::PendingApproval | ActionStatus::Approved | ActionStatus::Scheduled
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    #[default]
    Medium,
    High,
}

string_enum!(RiskLevel, "risk level", {
    Low => "low",
    Medium => "medium",
    High => "high",
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub provider: Provider,
    pub resource_id: String,
    pub resource_type: String,
}

impl ResourceRef {
    pub fn new(provider: Provider, resource_id: &str, resource_type: &str) -> Self {
        Self {
            provider,
            resource_id: resource_id.to_string(),
            resource_type: resource_type.to_string(),
        }
    }

    /// Key used for per-resource execution exclusivity.
    pub fn key(&self) -> String {
        format!("{}:{}", self.provider, self.resource_id)
    }
}

/// Pre-change state captured by a provider executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHandle {
    pub captured_at: DateTime<Utc>,
    pub state: serde_json::Value,
}

impl SnapshotHandle {
    pub fn new(state: serde_json::Value) -> Self {
        Self {
            captured_at: Utc::now(),
            state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub attempted: bool,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub savings_realized: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackOutcome>,
}

impl ActionResult {
    pub fn failure(message: impl Into<String>, provider_error: Option<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            provider_error,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub id: Uuid,
    pub recommendation_id: Option<Uuid>,
    pub workflow_execution_id: Option<Uuid>,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub provider: Provider,
    pub account_id: Option<String>,
    pub resource: Option<ResourceRef>,
    pub parameters: ActionParameters,
    pub description: Option<String>,
    pub status: ActionStatus,
    pub approval_status: ApprovalStatus,
    pub version: i64,
    pub risk: RiskLevel,
    pub cost_impact: f64,
    pub estimated_savings: Option<f64>,
    pub resource_tags: BTreeMap<String, String>,
    pub required_approvers: Vec<ApproverSpec>,
    pub min_approvals: i32,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub apply_started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub claimed_by: Option<String>,
    pub attempts: i32,
    pub cancel_requested: bool,
    pub needs_manual_intervention: bool,
    pub snapshot: Option<SnapshotHandle>,
    pub result: Option<ActionResult>,
}

impl Action {
    /// Build a fresh draft from a validated request.
    pub fn draft(
        request: &CreateAction,
        parameters: ActionParameters,
        resource: Option<ResourceRef>,
        created_by: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            recommendation_id: request.recommendation_id,
            workflow_execution_id: request.workflow_execution_id,
            action_type: request.action_type,
            provider: request.provider,
            account_id: request.account_id.clone(),
            resource,
            parameters,
            description: request.description.clone(),
            status: ActionStatus::Draft,
            approval_status: ApprovalStatus::Pending,
            version: 0,
            risk: request.risk.unwrap_or_default(),
            cost_impact: request.cost_impact.unwrap_or(0.0),
            estimated_savings: request.estimated_savings,
            resource_tags: request.resource_tags.clone(),
            required_approvers: Vec::new(),
            min_approvals: 0,
            scheduled_time: request.scheduled_time,
            created_by,
            created_at: now,
            updated_at: now,
            started_at: None,
            apply_started_at: None,
            heartbeat_at: None,
            completed_at: None,
            claimed_by: None,
            attempts: 0,
            cancel_requested: false,
            needs_manual_intervention: false,
            snapshot: None,
            result: None,
        }
    }

    pub fn resource_key(&self) -> Option<String> {
        self.resource.as_ref().map(ResourceRef::key)
    }

    /// Stable key handed to providers so retried `apply` calls deduplicate.
    pub fn idempotency_key(&self) -> String {
        format!("cloudpilot-{}", self.id)
    }

    /// Approved or scheduled, and its scheduled time (if any) has passed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, ActionStatus::Approved | ActionStatus::Scheduled)
            && self.scheduled_time.is_none_or(|t| t <= now)
    }
}

/// Request body for creating an action (also used inline by workflow steps).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub provider: Provider,
    #[serde(default)]
    pub account_id: Option<String>,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    #[serde(default)]
    pub parameters: serde_json::Value,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub recommendation_id: Option<Uuid>,
    #[serde(default, skip_serializing)]
    pub workflow_execution_id: Option<Uuid>,
    #[serde(default)]
    pub risk: Option<RiskLevel>,
    #[serde(default)]
    pub cost_impact: Option<f64>,
    #[serde(default)]
    pub estimated_savings: Option<f64>,
    #[serde(default)]
    pub resource_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
}
