//! The Action Store: durable, versioned storage for actions, votes,
//! history, workflows, deployments and the webhook outbox.
//!
//! Every mutation of an action goes through a compare-and-swap on its
//! `version` column. The claim is the only place where atomicity across
//! rows matters (per-resource exclusivity) and both backends enforce it
//! inside a single statement / critical section.

pub mod action_history;
pub mod actions;
pub mod approvals;
pub mod memory;
pub mod pg;
pub mod terraform_deployments;
pub mod webhook_events;
pub mod workflows;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    Action, ActionHistory, ActionStatus, Approval, TerraformDeployment, WebhookEvent, Workflow,
    WorkflowExecution,
};

pub use memory::MemoryStore;
pub use pg::PgStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(Uuid),
    #[error("Version conflict on {0}")]
    VersionConflict(Uuid),
    #[error("Duplicate record: {0}")]
    Duplicate(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// Result of an optimistic claim. Losing a claim is a normal outcome.
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(Action),
    /// Version moved on or the action is no longer approved/scheduled.
    Conflict,
    /// Another action is already executing against the same resource.
    ResourceBusy,
}

#[derive(Debug, Clone)]
pub struct ActionFilter {
    pub status: Option<ActionStatus>,
    pub workflow_execution_id: Option<Uuid>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ActionFilter {
    fn default() -> Self {
        Self {
            status: None,
            workflow_execution_id: None,
            limit: 50,
            offset: 0,
        }
    }
}

#[async_trait]
pub trait ActionStore: Send + Sync {
    // ── Actions ─────────────────────────────────────────────────

    async fn insert_action(&self, action: &Action) -> Result<(), StoreError>;

    async fn get_action(&self, id: Uuid) -> Result<Option<Action>, StoreError>;

    async fn list_actions(&self, filter: &ActionFilter) -> Result<Vec<Action>, StoreError>;

    /// Persist `action` if the stored version still equals `action.version`.
    /// Returns the stored row with its bumped version. `heartbeat_at` and
    /// `cancel_requested` are owned by [`heartbeat`](Self::heartbeat) and
    /// [`request_cancel`](Self::request_cancel) and are not written here.
    async fn update_action(&self, action: &Action) -> Result<Action, StoreError>;

    /// Move an approved or scheduled action to `executing` if its version is
    /// still `expected_version` and no other action holds its resource.
    async fn claim_action(
        &self,
        id: Uuid,
        expected_version: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError>;

    /// Hand a claimed action back to `approved` without running it.
    async fn release_claim(&self, id: Uuid, expected_version: i64) -> Result<Action, StoreError>;

    /// Approved or scheduled actions whose scheduled time has passed.
    async fn list_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Action>, StoreError>;

    /// Refresh the liveness stamp of an executing action. Does not bump the version.
    async fn heartbeat(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Flag an executing action for cancellation. Does not bump the version.
    async fn request_cancel(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Executing actions whose last heartbeat is older than `before`.
    async fn list_stale_executing(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Action>, StoreError>;

    // ── Approvals ───────────────────────────────────────────────

    /// Fails with [`StoreError::Duplicate`] when the approver already voted.
    async fn record_vote(&self, approval: &Approval) -> Result<(), StoreError>;

    async fn list_approvals(&self, action_id: Uuid) -> Result<Vec<Approval>, StoreError>;

    // ── History ─────────────────────────────────────────────────

    async fn append_history(&self, entry: &ActionHistory) -> Result<(), StoreError>;

    /// Oldest first.
    async fn list_history(&self, action_id: Uuid) -> Result<Vec<ActionHistory>, StoreError>;

    async fn last_history(&self, action_id: Uuid) -> Result<Option<ActionHistory>, StoreError>;

    // ── Workflows ───────────────────────────────────────────────

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError>;

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    async fn mark_workflow_triggered(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError>;

    /// Compare-and-swap on `execution.version`, like [`update_action`](Self::update_action).
    async fn update_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecution, StoreError>;

    async fn list_active_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError>;

    // ── Terraform deployments ───────────────────────────────────

    async fn insert_deployment(&self, deployment: &TerraformDeployment) -> Result<(), StoreError>;

    async fn get_deployment(&self, id: Uuid) -> Result<Option<TerraformDeployment>, StoreError>;

    async fn update_deployment(&self, deployment: &TerraformDeployment) -> Result<(), StoreError>;

    // ── Webhook outbox ──────────────────────────────────────────

    /// Enqueue one event row. A row with the same dedupe key and target is ignored.
    async fn enqueue_event(&self, event: &WebhookEvent) -> Result<(), StoreError>;

    async fn claim_next_event(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, StoreError>;

    async fn mark_event_delivered(&self, id: Uuid) -> Result<(), StoreError>;

    /// Record a failed delivery, scheduling a retry with `2^attempts` seconds
    /// of backoff until `max_attempts` is reached.
    async fn mark_event_failed(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}

/// Backoff used by the outbox between delivery attempts.
pub fn event_backoff(attempts: i32) -> chrono::Duration {
    chrono::Duration::seconds(2_i64.pow(attempts.clamp(0, 16) as u32))
}
