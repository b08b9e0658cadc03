use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    ActionFilter, ActionStore, ClaimOutcome, StoreError, action_history, actions, approvals,
    terraform_deployments, webhook_events, workflows,
};
use crate::models::{
    Action, ActionHistory, Approval, TerraformDeployment, WebhookEvent, Workflow,
    WorkflowExecution,
};

/// PostgreSQL-backed store. Each method delegates to the per-table query module.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ActionStore for PgStore {
    async fn insert_action(&self, action: &Action) -> Result<(), StoreError> {
        actions::insert(&self.pool, action).await
    }

    async fn get_action(&self, id: Uuid) -> Result<Option<Action>, StoreError> {
        actions::find_by_id(&self.pool, id).await
    }

    async fn list_actions(&self, filter: &ActionFilter) -> Result<Vec<Action>, StoreError> {
        actions::list(&self.pool, filter).await
    }

    async fn update_action(&self, action: &Action) -> Result<Action, StoreError> {
        actions::update(&self.pool, action).await
    }

    async fn claim_action(
        &self,
        id: Uuid,
        expected_version: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        actions::claim(&self.pool, id, expected_version, worker_id, now).await
    }

    async fn release_claim(&self, id: Uuid, expected_version: i64) -> Result<Action, StoreError> {
        actions::release(&self.pool, id, expected_version).await
    }

    async fn list_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Action>, StoreError> {
        actions::list_due(&self.pool, now, limit).await
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        actions::heartbeat(&self.pool, id, worker_id, now).await
    }

    async fn request_cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        actions::request_cancel(&self.pool, id).await
    }

    async fn list_stale_executing(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Action>, StoreError> {
        actions::list_stale_executing(&self.pool, before).await
    }

    async fn record_vote(&self, approval: &Approval) -> Result<(), StoreError> {
        approvals::create(&self.pool, approval).await
    }

    async fn list_approvals(&self, action_id: Uuid) -> Result<Vec<Approval>, StoreError> {
        approvals::list_by_action(&self.pool, action_id).await
    }

    async fn append_history(&self, entry: &ActionHistory) -> Result<(), StoreError> {
        action_history::create(&self.pool, entry).await
    }

    async fn list_history(&self, action_id: Uuid) -> Result<Vec<ActionHistory>, StoreError> {
        action_history::list_by_action(&self.pool, action_id).await
    }

    async fn last_history(&self, action_id: Uuid) -> Result<Option<ActionHistory>, StoreError> {
        action_history::latest(&self.pool, action_id).await
    }

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        workflows::create(&self.pool, workflow).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        workflows::find_by_id(&self.pool, id).await
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        workflows::list(&self.pool).await
    }

    async fn mark_workflow_triggered(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        workflows::mark_triggered(&self.pool, id, at).await
    }

    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        workflows::create_execution(&self.pool, execution).await
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        workflows::find_execution(&self.pool, id).await
    }

    async fn update_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecution, StoreError> {
        workflows::update_execution(&self.pool, execution).await
    }

    async fn list_active_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        workflows::list_active_executions(&self.pool).await
    }

    async fn insert_deployment(&self, deployment: &TerraformDeployment) -> Result<(), StoreError> {
        terraform_deployments::create(&self.pool, deployment).await
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Option<TerraformDeployment>, StoreError> {
        terraform_deployments::find_by_id(&self.pool, id).await
    }

    async fn update_deployment(&self, deployment: &TerraformDeployment) -> Result<(), StoreError> {
        terraform_deployments::update(&self.pool, deployment).await
    }

    async fn enqueue_event(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        webhook_events::enqueue(&self.pool, event).await
    }

    async fn claim_next_event(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, StoreError> {
        webhook_events::claim_next(&self.pool, now).await
    }

    async fn mark_event_delivered(&self, id: Uuid) -> Result<(), StoreError> {
        webhook_events::mark_delivered(&self.pool, id).await
    }

    async fn mark_event_failed(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        webhook_events::mark_failed(&self.pool, id, error, now).await
    }
}
