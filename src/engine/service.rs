//! The operations behind the REST surface: create, vote, schedule,
//! execute, cancel and the read side.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::time::timeout;
use uuid::Uuid;

use super::approval::{Voter, schedule_if_future};
use super::recommendation::{Recommendation, to_action_request};
use super::state_machine::transition;
use super::{ApprovalManager, Dispatcher, EngineError};
use crate::cloud::catalog;
use crate::db::{ActionFilter, ActionStore, ClaimOutcome, StoreError};
use crate::executors::ExecutorRegistry;
use crate::models::{
    Action, ActionHistory, ActionParameters, ActionResult, ActionStatus, Approval, ApprovalStatus,
    CreateAction, ResourceRef,
};

const MAX_CLAIM_ATTEMPTS: usize = 3;

/// Current state plus the most recent audit entry.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub action: Action,
    pub last_history: Option<ActionHistory>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchScheduleResult {
    pub action_id: Uuid,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ActionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct ActionService {
    store: Arc<dyn ActionStore>,
    executors: Arc<ExecutorRegistry>,
    approvals: Arc<ApprovalManager>,
    dispatcher: Arc<Dispatcher>,
    validate_timeout: Duration,
}

impl ActionService {
    pub fn new(
        store: Arc<dyn ActionStore>,
        executors: Arc<ExecutorRegistry>,
        approvals: Arc<ApprovalManager>,
        dispatcher: Arc<Dispatcher>,
        validate_timeout: Duration,
    ) -> Self {
        Self {
            store,
            executors,
            approvals,
            dispatcher,
            validate_timeout,
        }
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Validate a request, store it as a draft and route it through the
    /// approval policy. Invalid requests never reach the store.
    pub async fn create(&self, request: CreateAction, user: Uuid) -> Result<Action, EngineError> {
        self.create_as(Uuid::now_v7(), request, user).await
    }

    /// Create under a caller-chosen id. A second create with the same id
    /// fails with [`StoreError::Duplicate`] and has no effect.
    pub async fn create_as(
        &self,
        id: Uuid,
        request: CreateAction,
        user: Uuid,
    ) -> Result<Action, EngineError> {
        let parameters = ActionParameters::parse(request.action_type, &request.parameters)
            .map_err(EngineError::Validation)?;
        let resource = resolve_resource(&request, &parameters)?;

        let executor = self
            .executors
            .get(request.provider, request.action_type)
            .cloned()
            .ok_or_else(|| {
                EngineError::UnsupportedOperation(format!(
                    "{} is not supported on {}",
                    request.action_type, request.provider
                ))
            })?;

        let mut draft = Action::draft(&request, parameters, resource, user);
        draft.id = id;

        match timeout(self.validate_timeout, executor.validate(&draft)).await {
            Ok(Ok(report)) if !report.is_valid() => {
                return Err(EngineError::Validation(report.message()));
            }
            Ok(Ok(report)) => {
                for warning in &report.warnings {
                    tracing::warn!("Action {} validation warning: {warning}", draft.id);
                }
            }
            // The provider may be briefly unreachable; execution validates again.
            Ok(Err(e)) => tracing::warn!("Pre-flight for action {} skipped: {e}", draft.id),
            Err(_) => tracing::warn!("Pre-flight for action {} timed out", draft.id),
        }

        self.store.insert_action(&draft).await?;
        tracing::info!(
            "Action {} created: {} on {}",
            draft.id,
            draft.action_type,
            draft
                .resource
                .as_ref()
                .map(ResourceRef::key)
                .unwrap_or_else(|| draft.provider.to_string())
        );
        self.approvals.submit(draft).await
    }

    pub async fn from_recommendation(
        &self,
        recommendation: &Recommendation,
        user: Uuid,
    ) -> Result<Action, EngineError> {
        let request = to_action_request(recommendation)?;
        self.create(request, user).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Action, EngineError> {
        self.store
            .get_action(id)
            .await?
            .ok_or_else(|| EngineError::action_not_found(id))
    }

    pub async fn list(&self, filter: &ActionFilter) -> Result<Vec<Action>, EngineError> {
        Ok(self.store.list_actions(filter).await?)
    }

    pub async fn history(&self, id: Uuid) -> Result<Vec<ActionHistory>, EngineError> {
        self.get(id).await?;
        Ok(self.store.list_history(id).await?)
    }

    pub async fn approvals(&self, id: Uuid) -> Result<Vec<Approval>, EngineError> {
        self.get(id).await?;
        Ok(self.store.list_approvals(id).await?)
    }

    pub async fn status(&self, id: Uuid) -> Result<StatusView, EngineError> {
        let action = self.get(id).await?;
        let last_history = self.store.last_history(id).await?;
        Ok(StatusView {
            action,
            last_history,
        })
    }

    pub async fn vote(
        &self,
        id: Uuid,
        voter: &Voter,
        decision: ApprovalStatus,
        comments: Option<String>,
    ) -> Result<Action, EngineError> {
        self.approvals
            .submit_vote(id, voter, decision, comments)
            .await
    }

    /// Set or move the start time. Approved actions move to `scheduled`;
    /// actions still awaiting approval keep the time for when they are approved.
    pub async fn schedule(&self, id: Uuid, at: DateTime<Utc>) -> Result<Action, EngineError> {
        if at <= Utc::now() {
            return Err(EngineError::Validation(
                "scheduled_time must be in the future".to_string(),
            ));
        }

        let mut action = self.get(id).await?;
        match action.status {
            ActionStatus::Draft | ActionStatus::PendingApproval | ActionStatus::Scheduled => {
                action.scheduled_time = Some(at);
                action.updated_at = Utc::now();
            }
            ActionStatus::Approved => {
                action.scheduled_time = Some(at);
                schedule_if_future(&mut action)?;
            }
            other => {
                return Err(EngineError::InvalidState(format!(
                    "Action {id} is {other} and can no longer be scheduled"
                )));
            }
        }

        let updated = self.store.update_action(&action).await?;
        tracing::info!("Action {id} scheduled for {at}");
        Ok(updated)
    }

    pub async fn schedule_batch(
        &self,
        ids: &[Uuid],
        at: DateTime<Utc>,
    ) -> Vec<BatchScheduleResult> {
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            results.push(match self.schedule(*id, at).await {
                Ok(action) => BatchScheduleResult {
                    action_id: *id,
                    success: true,
                    status: Some(action.status),
                    error: None,
                },
                Err(e) => BatchScheduleResult {
                    action_id: *id,
                    success: false,
                    status: None,
                    error: Some(e.to_string()),
                },
            });
        }
        results
    }

    /// Cancel an action that has not started, or ask a running execution
    /// to stop at its next checkpoint.
    pub async fn cancel(&self, id: Uuid, user: Uuid) -> Result<Action, EngineError> {
        let mut action = self.get(id).await?;

        if action.status == ActionStatus::Executing {
            self.store.request_cancel(id).await?;
            tracing::info!("Cancellation requested for executing action {id} by {user}");
            return self.get(id).await;
        }
        if !action.status.is_cancellable() {
            return Err(EngineError::InvalidState(format!(
                "Action {id} is {} and cannot be cancelled",
                action.status
            )));
        }

        let from = action.status;
        transition(&mut action, ActionStatus::Cancelled)?;
        let result = ActionResult {
            success: false,
            message: format!("Cancelled by {user}"),
            ..ActionResult::default()
        };
        action.result = Some(result.clone());
        let cancelled = self.store.update_action(&action).await?;
        self.store
            .append_history(&ActionHistory::new(
                id,
                ActionStatus::Cancelled,
                user.to_string(),
                Some(serde_json::to_value(&result).map_err(StoreError::from)?),
                json!({ "from": from }),
            ))
            .await?;
        tracing::info!("Action {id} cancelled by {user}");
        Ok(cancelled)
    }

    /// Claim an approved action and hand it to the execution pool. A second
    /// call while the first is running returns the running action unchanged.
    pub async fn execute(&self, id: Uuid) -> Result<Action, EngineError> {
        let mut action = self.get(id).await?;

        for _ in 0..MAX_CLAIM_ATTEMPTS {
            match action.status {
                ActionStatus::Executing => return Ok(action),
                ActionStatus::Approved | ActionStatus::Scheduled => {}
                other => {
                    return Err(EngineError::InvalidState(format!(
                        "Action {id} is {other}, not approved"
                    )));
                }
            }

            match self
                .store
                .claim_action(id, action.version, self.dispatcher.worker_id(), Utc::now())
                .await?
            {
                ClaimOutcome::Claimed(claimed) => {
                    return match self.dispatcher.dispatch(claimed.clone()) {
                        Ok(()) => {
                            tracing::info!("Action {id} dispatched for immediate execution");
                            Ok(claimed)
                        }
                        Err(claimed) => {
                            self.store.release_claim(claimed.id, claimed.version).await?;
                            tracing::warn!("Execution pool saturated, released action {id}");
                            Err(EngineError::Saturated)
                        }
                    };
                }
                ClaimOutcome::ResourceBusy => {
                    return Err(EngineError::InvalidState(format!(
                        "Another action is already executing against the resource of action {id}"
                    )));
                }
                ClaimOutcome::Conflict => {
                    tracing::debug!("Lost claim on action {id}, reloading");
                    action = self.get(id).await?;
                    // Someone else ran it between our read and our claim.
                    if matches!(
                        action.status,
                        ActionStatus::Completed | ActionStatus::Failed | ActionStatus::RolledBack
                    ) && action.claimed_by.is_some()
                    {
                        return Ok(action);
                    }
                }
            }
        }
        Err(EngineError::Store(StoreError::VersionConflict(id)))
    }
}

/// Work out the target resource from the request.
fn resolve_resource(
    request: &CreateAction,
    parameters: &ActionParameters,
) -> Result<Option<ResourceRef>, EngineError> {
    let action_type = request.action_type;

    if let ActionParameters::TerraformDestroy(p) = parameters {
        let deployment = p.deployment_id.to_string();
        if request
            .resource_id
            .as_deref()
            .is_some_and(|given| given != deployment)
        {
            return Err(EngineError::Validation(
                "resource_id must match parameters.deployment_id".to_string(),
            ));
        }
        return Ok(Some(ResourceRef::new(
            request.provider,
            &deployment,
            catalog::TERRAFORM_DEPLOYMENT,
        )));
    }

    if !action_type.targets_resource() {
        if request.resource_id.is_some() {
            return Err(EngineError::Validation(format!(
                "{action_type} applies to the account and takes no resource_id"
            )));
        }
        return Ok(None);
    }

    let resource_id = request
        .resource_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| EngineError::Validation(format!("{action_type} requires a resource_id")))?;

    let accepted = catalog::accepted_types(action_type, request.provider);
    let resource_type = match request.resource_type.as_deref() {
        Some(rt) if accepted.contains(&rt) => rt,
        Some(rt) => {
            return Err(EngineError::Validation(format!(
                "{action_type} does not apply to {rt} on {}; accepted: {}",
                request.provider,
                accepted.join(", ")
            )));
        }
        None => match accepted.as_slice() {
            [only] => only,
            [] => {
                return Err(EngineError::UnsupportedOperation(format!(
                    "{action_type} has no target resource types on {}",
                    request.provider
                )));
            }
            _ => {
                return Err(EngineError::Validation(format!(
                    "resource_type is required for {action_type} on {}",
                    request.provider
                )));
            }
        },
    };

    Ok(Some(ResourceRef::new(request.provider, resource_id, resource_type)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Scheduler;
    use crate::engine::testkit::{Kit, request};
    use crate::models::{ActionType, Provider};

    fn approver() -> Voter {
        Voter {
            user_id: Uuid::now_v7(),
            name: Some("Dana".into()),
            roles: vec!["approver".into()],
        }
    }

    fn costly_resize() -> serde_json::Value {
        json!({
            "type": "resize_resource",
            "provider": "aws",
            "resource_id": "i-abc",
            "resource_type": "ec2_instance",
            "parameters": { "instance_type": "m5.large" },
            "cost_impact": 500.0,
            "estimated_savings": 70.0,
        })
    }

    fn cheap_stop(resource_id: &str) -> serde_json::Value {
        json!({
            "type": "stop_resource",
            "provider": "aws",
            "resource_id": resource_id,
            "resource_type": "ec2_instance",
            "risk": "low",
            "cost_impact": 10.0,
        })
    }

    #[tokio::test]
    async fn approved_resize_executes_to_completion() {
        let kit = Kit::new();
        kit.cloud.seed_instance(Provider::Aws, "i-abc", "ec2_instance", "m5.xlarge");
        let service = kit.service(kit.dispatcher(2));
        let creator = Uuid::now_v7();

        let action = service.create(request(costly_resize()), creator).await.unwrap();
        assert_eq!(action.status, ActionStatus::PendingApproval);

        let action = service
            .vote(action.id, &approver(), ApprovalStatus::Approved, None)
            .await
            .unwrap();
        assert_eq!(action.status, ActionStatus::Approved);

        let running = service.execute(action.id).await.unwrap();
        assert_eq!(running.status, ActionStatus::Executing);

        let done = kit.settled(action.id).await;
        assert_eq!(done.status, ActionStatus::Completed);
        let history = service.history(action.id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, ActionStatus::Executing);
        assert_eq!(history[1].status, ActionStatus::Completed);
        assert_eq!(
            kit.cloud.state(&ResourceRef::new(Provider::Aws, "i-abc", "ec2_instance"))
                .unwrap()
                .size
                .as_deref(),
            Some("m5.large")
        );
    }

    #[tokio::test]
    async fn concurrent_execute_dispatches_once() {
        let kit = Kit::new();
        kit.cloud.seed_instance(Provider::Aws, "i-abc", "ec2_instance", "m5.xlarge");
        let service = kit.service(kit.dispatcher(4));
        let action = service
            .create(request(cheap_stop("i-abc")), Uuid::now_v7())
            .await
            .unwrap();
        assert_eq!(action.status, ActionStatus::Approved);

        let (a, b) = tokio::join!(service.execute(action.id), service.execute(action.id));
        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(a.status != ActionStatus::Approved && b.status != ActionStatus::Approved);

        let done = kit.settled(action.id).await;
        assert_eq!(done.status, ActionStatus::Completed);
        assert_eq!(kit.cloud.call_count("stop_instance"), 1);
    }

    #[tokio::test]
    async fn execute_requires_approval() {
        let kit = Kit::new();
        kit.cloud.seed_instance(Provider::Aws, "i-abc", "ec2_instance", "m5.xlarge");
        let service = kit.service(kit.dispatcher(1));
        let action = service
            .create(request(costly_resize()), Uuid::now_v7())
            .await
            .unwrap();

        let err = service.execute(action.id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)), "{err}");
        assert_eq!(kit.cloud.calls().len(), 0);
    }

    #[tokio::test]
    async fn scheduled_action_runs_only_once_due() {
        let kit = Kit::new();
        kit.cloud.seed_instance(Provider::Aws, "i-abc", "ec2_instance", "m5.xlarge");
        let dispatcher = kit.dispatcher(2);
        let service = kit.service(dispatcher.clone());
        let scheduler = Scheduler::new(kit.store.clone(), dispatcher);

        let action = service
            .create(request(cheap_stop("i-abc")), Uuid::now_v7())
            .await
            .unwrap();
        let start = Utc::now() + chrono::Duration::minutes(5);
        let action = service.schedule(action.id, start).await.unwrap();
        assert_eq!(action.status, ActionStatus::Scheduled);

        assert_eq!(scheduler.poll_once(Utc::now()).await.unwrap(), 0);
        assert_eq!(kit.cloud.call_count("stop_instance"), 0);

        assert_eq!(scheduler.poll_once(start).await.unwrap(), 1);
        assert_eq!(kit.settled(action.id).await.status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn invalid_parameters_are_rejected_before_storage() {
        let kit = Kit::new();
        let service = kit.service(kit.dispatcher(1));
        let mut body = costly_resize();
        body["parameters"] = json!({ "colour": "blue" });

        let err = service.create(request(body), Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{err}");
        assert!(service.list(&ActionFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resource_type_is_checked_and_inferred() {
        let kit = Kit::new();
        let service = kit.service(kit.dispatcher(1));

        let mut wrong = cheap_stop("bucket-1");
        wrong["resource_type"] = json!("s3_bucket");
        let err = service.create(request(wrong), Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{err}");

        kit.cloud
            .seed_instance(Provider::Azure, "vm-1", "virtual_machine", "Standard_D4s_v3");
        let inferred = json!({
            "type": "stop_resource",
            "provider": "azure",
            "resource_id": "vm-1",
            "parameters": { "deallocate": true },
            "risk": "low",
        });
        let action = service.create(request(inferred), Uuid::now_v7()).await.unwrap();
        assert_eq!(action.resource.unwrap().resource_type, "virtual_machine");
    }

    #[tokio::test]
    async fn destroy_targets_its_deployment() {
        let deployment = Uuid::now_v7();
        let body = json!({
            "type": "terraform_destroy",
            "provider": "aws",
            "parameters": { "deployment_id": deployment },
        });
        let req = request(body);
        let params = ActionParameters::parse(req.action_type, &req.parameters).unwrap();
        let resource = resolve_resource(&req, &params).unwrap().unwrap();
        assert_eq!(resource.resource_id, deployment.to_string());
        assert_eq!(resource.resource_type, catalog::TERRAFORM_DEPLOYMENT);
    }

    #[tokio::test]
    async fn cancel_pending_then_refuse_again() {
        let kit = Kit::new();
        kit.cloud.seed_instance(Provider::Aws, "i-abc", "ec2_instance", "m5.xlarge");
        let service = kit.service(kit.dispatcher(1));
        let user = Uuid::now_v7();
        let action = service.create(request(costly_resize()), user).await.unwrap();

        let cancelled = service.cancel(action.id, user).await.unwrap();
        assert_eq!(cancelled.status, ActionStatus::Cancelled);
        assert!(cancelled.completed_at.is_some());
        let status = service.status(action.id).await.unwrap();
        assert_eq!(
            status.last_history.map(|h| h.status),
            Some(ActionStatus::Cancelled)
        );

        let err = service.cancel(action.id, user).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn batch_schedule_reports_each_id() {
        let kit = Kit::new();
        kit.cloud.seed_instance(Provider::Aws, "i-1", "ec2_instance", "m5.large");
        let service = kit.service(kit.dispatcher(1));
        let action = service
            .create(request(cheap_stop("i-1")), Uuid::now_v7())
            .await
            .unwrap();
        let missing = Uuid::now_v7();

        let results = service
            .schedule_batch(&[action.id, missing], Utc::now() + chrono::Duration::hours(1))
            .await;
        assert!(results[0].success);
        assert_eq!(results[0].status, Some(ActionStatus::Scheduled));
        assert!(!results[1].success);
        assert!(results[1].error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn schedule_rejects_past_times() {
        let kit = Kit::new();
        let service = kit.service(kit.dispatcher(1));
        let err = service
            .schedule(Uuid::now_v7(), Utc::now() - chrono::Duration::minutes(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn recommendation_becomes_an_action() {
        let kit = Kit::new();
        kit.cloud.seed_instance(Provider::Aws, "i-9", "ec2_instance", "m5.large");
        let service = kit.service(kit.dispatcher(1));
        let rec: Recommendation = serde_json::from_value(json!({
            "recommendation_id": Uuid::now_v7(),
            "recommendation_type": "idle_resource",
            "provider": "aws",
            "resource": { "resource_id": "i-9", "resource_type": "ec2_instance" },
            "details": { "suggested_action": "stop_instance" },
            "estimated_savings": 12.5,
            "priority": "low",
        }))
        .unwrap();

        let action = service.from_recommendation(&rec, Uuid::now_v7()).await.unwrap();
        assert_eq!(action.action_type, ActionType::StopResource);
        assert_eq!(action.recommendation_id, Some(rec.recommendation_id));
    }
}
