//! In-process store with the same claim and compare-and-swap semantics as
//! the PostgreSQL backend. Used for local development and the test-suite.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{ActionFilter, ActionStore, ClaimOutcome, StoreError, event_backoff};
use crate::models::{
    Action, ActionHistory, ActionStatus, Approval, ExecutionStatus, TerraformDeployment,
    WebhookEvent, Workflow, WorkflowExecution,
};

#[derive(Default)]
struct Inner {
    actions: HashMap<Uuid, Action>,
    approvals: Vec<Approval>,
    history: Vec<ActionHistory>,
    workflows: HashMap<Uuid, Workflow>,
    executions: HashMap<Uuid, WorkflowExecution>,
    deployments: HashMap<Uuid, TerraformDeployment>,
    events: Vec<WebhookEvent>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-write; the maps are still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// All outbox rows, for inspection in tests.
    pub fn events(&self) -> Vec<WebhookEvent> {
        self.lock().events.clone()
    }
}

fn claimable(status: ActionStatus) -> bool {
    matches!(status, ActionStatus::Approved | ActionStatus::Scheduled)
}

#[async_trait]
impl ActionStore for MemoryStore {
    async fn insert_action(&self, action: &Action) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.actions.contains_key(&action.id) {
            return Err(StoreError::Duplicate(format!("action {}", action.id)));
        }
        inner.actions.insert(action.id, action.clone());
        Ok(())
    }

    async fn get_action(&self, id: Uuid) -> Result<Option<Action>, StoreError> {
        Ok(self.lock().actions.get(&id).cloned())
    }

    async fn list_actions(&self, filter: &ActionFilter) -> Result<Vec<Action>, StoreError> {
        let inner = self.lock();
        let mut rows: Vec<Action> = inner
            .actions
            .values()
            .filter(|a| filter.status.is_none_or(|s| a.status == s))
            .filter(|a| {
                filter
                    .workflow_execution_id
                    .is_none_or(|id| a.workflow_execution_id == Some(id))
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn update_action(&self, action: &Action) -> Result<Action, StoreError> {
        let mut inner = self.lock();
        let stored = inner
            .actions
            .get_mut(&action.id)
            .ok_or(StoreError::NotFound(action.id))?;
        if stored.version != action.version {
            return Err(StoreError::VersionConflict(action.id));
        }

        let heartbeat_at = stored.heartbeat_at;
        let cancel_requested = stored.cancel_requested;
        *stored = action.clone();
        stored.heartbeat_at = heartbeat_at;
        stored.cancel_requested = cancel_requested;
        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn claim_action(
        &self,
        id: Uuid,
        expected_version: i64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut inner = self.lock();

        let Some(candidate) = inner.actions.get(&id) else {
            return Err(StoreError::NotFound(id));
        };
        if candidate.version != expected_version
            || !claimable(candidate.status)
            || candidate.approval_status != crate::models::ApprovalStatus::Approved
        {
            return Ok(ClaimOutcome::Conflict);
        }

        if let Some(key) = candidate.resource_key() {
            let busy = inner.actions.values().any(|other| {
                other.id != id
                    && other.status == ActionStatus::Executing
                    && other.resource_key().as_deref() == Some(key.as_str())
            });
            if busy {
                return Ok(ClaimOutcome::ResourceBusy);
            }
        }

        let action = inner
            .actions
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        action.status = ActionStatus::Executing;
        action.claimed_by = Some(worker_id.to_string());
        action.started_at = Some(now);
        action.heartbeat_at = Some(now);
        action.apply_started_at = None;
        action.version += 1;
        action.updated_at = now;
        Ok(ClaimOutcome::Claimed(action.clone()))
    }

    async fn release_claim(&self, id: Uuid, expected_version: i64) -> Result<Action, StoreError> {
        let mut inner = self.lock();
        let action = inner.actions.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if action.version != expected_version || action.status != ActionStatus::Executing {
            return Err(StoreError::VersionConflict(id));
        }
        action.status = ActionStatus::Approved;
        action.claimed_by = None;
        action.started_at = None;
        action.heartbeat_at = None;
        action.apply_started_at = None;
        action.version += 1;
        action.updated_at = Utc::now();
        Ok(action.clone())
    }

    async fn list_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Action>, StoreError> {
        let inner = self.lock();
        let mut due: Vec<Action> = inner
            .actions
            .values()
            .filter(|a| {
                a.is_due(now) && a.approval_status == crate::models::ApprovalStatus::Approved
            })
            .cloned()
            .collect();
        due.sort_by_key(|a| a.scheduled_time.unwrap_or(a.created_at));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn heartbeat(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.actions.get_mut(&id) {
            Some(a)
                if a.status == ActionStatus::Executing
                    && a.claimed_by.as_deref() == Some(worker_id) =>
            {
                a.heartbeat_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn request_cancel(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.actions.get_mut(&id) {
            Some(a) if a.status == ActionStatus::Executing => {
                a.cancel_requested = true;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn list_stale_executing(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<Action>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .actions
            .values()
            .filter(|a| a.status == ActionStatus::Executing)
            .filter(|a| a.heartbeat_at.or(a.started_at).is_none_or(|t| t < before))
            .cloned()
            .collect())
    }

    async fn record_vote(&self, approval: &Approval) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let duplicate = inner
            .approvals
            .iter()
            .any(|a| a.action_id == approval.action_id && a.approver_id == approval.approver_id);
        if duplicate {
            return Err(StoreError::Duplicate(format!(
                "vote by {} on {}",
                approval.approver_id, approval.action_id
            )));
        }
        inner.approvals.push(approval.clone());
        Ok(())
    }

    async fn list_approvals(&self, action_id: Uuid) -> Result<Vec<Approval>, StoreError> {
        Ok(self
            .lock()
            .approvals
            .iter()
            .filter(|a| a.action_id == action_id)
            .cloned()
            .collect())
    }

    async fn append_history(&self, entry: &ActionHistory) -> Result<(), StoreError> {
        self.lock().history.push(entry.clone());
        Ok(())
    }

    async fn list_history(&self, action_id: Uuid) -> Result<Vec<ActionHistory>, StoreError> {
        Ok(self
            .lock()
            .history
            .iter()
            .filter(|h| h.action_id == action_id)
            .cloned()
            .collect())
    }

    async fn last_history(&self, action_id: Uuid) -> Result<Option<ActionHistory>, StoreError> {
        Ok(self
            .lock()
            .history
            .iter()
            .rev()
            .find(|h| h.action_id == action_id)
            .cloned())
    }

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        self.lock().workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self.lock().workflows.get(&id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let mut rows: Vec<Workflow> = self.lock().workflows.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn mark_workflow_triggered(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let wf = inner.workflows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        wf.last_triggered_at = Some(at);
        wf.updated_at = at;
        Ok(())
    }

    async fn insert_execution(&self, execution: &WorkflowExecution) -> Result<(), StoreError> {
        self.lock()
            .executions
            .insert(execution.id, execution.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<WorkflowExecution>, StoreError> {
        Ok(self.lock().executions.get(&id).cloned())
    }

    async fn update_execution(
        &self,
        execution: &WorkflowExecution,
    ) -> Result<WorkflowExecution, StoreError> {
        let mut inner = self.lock();
        let stored = inner
            .executions
            .get_mut(&execution.id)
            .ok_or(StoreError::NotFound(execution.id))?;
        if stored.version != execution.version {
            return Err(StoreError::VersionConflict(execution.id));
        }
        *stored = execution.clone();
        stored.version += 1;
        stored.updated_at = Utc::now();
        Ok(stored.clone())
    }

    async fn list_active_executions(&self) -> Result<Vec<WorkflowExecution>, StoreError> {
        Ok(self
            .lock()
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::InProgress)
            .cloned()
            .collect())
    }

    async fn insert_deployment(&self, deployment: &TerraformDeployment) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.deployments.contains_key(&deployment.id) {
            return Err(StoreError::Duplicate(format!("deployment {}", deployment.id)));
        }
        inner.deployments.insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn get_deployment(&self, id: Uuid) -> Result<Option<TerraformDeployment>, StoreError> {
        Ok(self.lock().deployments.get(&id).cloned())
    }

    async fn update_deployment(&self, deployment: &TerraformDeployment) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let stored = inner
            .deployments
            .get_mut(&deployment.id)
            .ok_or(StoreError::NotFound(deployment.id))?;
        *stored = deployment.clone();
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn enqueue_event(&self, event: &WebhookEvent) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let exists = inner
            .events
            .iter()
            .any(|e| e.dedupe_key == event.dedupe_key && e.target_url == event.target_url);
        if !exists {
            inner.events.push(event.clone());
        }
        Ok(())
    }

    async fn claim_next_event(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<WebhookEvent>, StoreError> {
        let mut inner = self.lock();
        let next = inner
            .events
            .iter_mut()
            .filter(|e| {
                (e.status == "pending" || (e.status == "failed" && e.attempts < e.max_attempts))
                    && e.next_retry_at <= now
            })
            .min_by_key(|e| e.next_retry_at);
        Ok(next.map(|e| {
            e.status = "processing".to_string();
            e.attempts += 1;
            e.clone()
        }))
    }

    async fn mark_event_delivered(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let event = inner
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound(id))?;
        event.status = "delivered".to_string();
        event.delivered_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_event_failed(
        &self,
        id: Uuid,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let event = inner
            .events
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound(id))?;
        event.status = "failed".to_string();
        event.last_error = Some(error.to_string());
        if event.attempts < event.max_attempts {
            event.next_retry_at = now + event_backoff(event.attempts);
        }
        Ok(())
    }
}
