use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::policy::{PolicyDecision, PolicyTable};
use super::state_machine::transition;
use super::EngineError;
use crate::db::{ActionStore, StoreError};
use crate::models::{Action, ActionStatus, Approval, ApprovalStatus};

const MAX_CAS_RETRIES: usize = 5;

/// The person casting a vote.
#[derive(Debug, Clone)]
pub struct Voter {
    pub user_id: Uuid,
    pub name: Option<String>,
    pub roles: Vec<String>,
}

pub struct ApprovalManager {
    store: Arc<dyn ActionStore>,
    policy: PolicyTable,
}

impl ApprovalManager {
    pub fn new(store: Arc<dyn ActionStore>, policy: PolicyTable) -> Self {
        Self { store, policy }
    }

    pub fn evaluate_policy(&self, action: &Action) -> PolicyDecision {
        self.policy.evaluate(action)
    }

    /// Route a freshly inserted draft: straight to `approved` (and on to
    /// `scheduled` for a future start) or to `pending_approval`.
    pub async fn submit(&self, mut action: Action) -> Result<Action, EngineError> {
        let decision = self.evaluate_policy(&action);
        action.required_approvers = decision.required_approvers;
        action.min_approvals = decision.min_approvals;

        if decision.auto_approve {
            transition(&mut action, ActionStatus::Approved)?;
            action.approval_status = ApprovalStatus::Approved;
            schedule_if_future(&mut action)?;
            tracing::info!(
                "Action {} ({}) auto-approved: {}",
                action.id,
                action.action_type,
                decision.reason
            );
        } else {
            transition(&mut action, ActionStatus::PendingApproval)?;
            tracing::info!(
                "Action {} ({}) awaits approval: {}",
                action.id,
                action.action_type,
                decision.reason
            );
        }
        Ok(self.store.update_action(&action).await?)
    }

    pub async fn submit_vote(
        &self,
        action_id: Uuid,
        voter: &Voter,
        decision: ApprovalStatus,
        comments: Option<String>,
    ) -> Result<Action, EngineError> {
        if decision == ApprovalStatus::Pending {
            return Err(EngineError::Validation(
                "a vote must approve or reject".to_string(),
            ));
        }

        let action = self
            .store
            .get_action(action_id)
            .await?
            .ok_or_else(|| EngineError::action_not_found(action_id))?;

        if action.status != ActionStatus::PendingApproval {
            return Err(EngineError::InvalidState(format!(
                "Action {action_id} is {}, not pending_approval",
                action.status
            )));
        }
        if action.created_by == voter.user_id {
            return Err(EngineError::SelfApproval);
        }
        let admitted = action.required_approvers.is_empty()
            || action
                .required_approvers
                .iter()
                .any(|spec| spec.admits(voter.user_id, &voter.roles));
        if !admitted {
            return Err(EngineError::NotAnApprover(voter.user_id));
        }

        let now = Utc::now();
        let vote = Approval {
            id: Uuid::now_v7(),
            action_id,
            approver_id: voter.user_id,
            approver_name: voter.name.clone(),
            status: decision,
            comments,
            requested_at: action.updated_at,
            responded_at: Some(now),
        };
        match self.store.record_vote(&vote).await {
            Ok(()) => {}
            Err(StoreError::Duplicate(_)) => return Err(EngineError::DuplicateVote(voter.user_id)),
            Err(e) => return Err(e.into()),
        }
        tracing::info!("Approver {} voted {decision} on action {action_id}", voter.user_id);

        self.aggregate(action).await
    }

    /// Recompute `approval_status` from the recorded votes and move the
    /// action once the outcome is decided.
    async fn aggregate(&self, mut action: Action) -> Result<Action, EngineError> {
        for _ in 0..MAX_CAS_RETRIES {
            if action.status != ActionStatus::PendingApproval {
                return Ok(action);
            }
            let votes = self.store.list_approvals(action.id).await?;
            let rejected = votes.iter().any(|v| v.status == ApprovalStatus::Rejected);
            let approvals = votes
                .iter()
                .filter(|v| v.status == ApprovalStatus::Approved)
                .count() as i32;

            let mut next = action.clone();
            if rejected {
                transition(&mut next, ActionStatus::Rejected)?;
                next.approval_status = ApprovalStatus::Rejected;
            } else if approvals >= action.min_approvals.max(1) {
                transition(&mut next, ActionStatus::Approved)?;
                next.approval_status = ApprovalStatus::Approved;
                schedule_if_future(&mut next)?;
            } else {
                return Ok(action);
            }

            match self.store.update_action(&next).await {
                Ok(updated) => {
                    tracing::info!(
                        "Action {} is now {} ({approvals} approval(s))",
                        updated.id,
                        updated.status
                    );
                    return Ok(updated);
                }
                Err(StoreError::VersionConflict(_)) => {
                    action = self
                        .store
                        .get_action(action.id)
                        .await?
                        .ok_or_else(|| EngineError::action_not_found(action.id))?;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Store(StoreError::VersionConflict(action.id)))
    }
}

/// Approved actions with a future start wait in `scheduled`.
pub(crate) fn schedule_if_future(action: &mut Action) -> Result<(), EngineError> {
    if action.status == ActionStatus::Approved
        && action.scheduled_time.is_some_and(|t| t > Utc::now())
    {
        transition(action, ActionStatus::Scheduled)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{ActionParameters, ApproverSpec, CreateAction};
    use serde_json::json;

    async fn setup(body: serde_json::Value) -> (ApprovalManager, Arc<MemoryStore>, Action) {
        let store = Arc::new(MemoryStore::new());
        let manager = ApprovalManager::new(store.clone(), PolicyTable::default());
        let request: CreateAction = serde_json::from_value(body).unwrap();
        let params = ActionParameters::parse(request.action_type, &request.parameters).unwrap();
        let draft = Action::draft(&request, params, None, Uuid::now_v7());
        store.insert_action(&draft).await.unwrap();
        let action = manager.submit(draft).await.unwrap();
        (manager, store, action)
    }

    fn approver() -> Voter {
        Voter {
            user_id: Uuid::now_v7(),
            name: Some("Approver".into()),
            roles: vec!["approver".into()],
        }
    }

    fn delete_request() -> serde_json::Value {
        json!({ "type": "delete_resource", "provider": "aws", "cost_impact": 0.0 })
    }

    #[tokio::test]
    async fn auto_approved_action_with_future_start_is_scheduled() {
        let at = Utc::now() + chrono::Duration::hours(2);
        let (_, _, a) = setup(json!({
            "type": "add_tags", "provider": "aws",
            "parameters": { "tags": { "team": "core" } },
            "scheduled_time": at,
        }))
        .await;
        assert_eq!(a.status, ActionStatus::Scheduled);
        assert_eq!(a.approval_status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn one_required_vote_approves() {
        let (manager, _, a) = setup(delete_request()).await;
        assert_eq!(a.status, ActionStatus::PendingApproval);
        assert_eq!(a.required_approvers, vec![ApproverSpec::Role("approver".into())]);

        let a = manager
            .submit_vote(a.id, &approver(), ApprovalStatus::Approved, None)
            .await
            .unwrap();
        assert_eq!(a.status, ActionStatus::Approved);
        assert_eq!(a.approval_status, ApprovalStatus::Approved);
    }

    #[tokio::test]
    async fn any_rejection_rejects() {
        let (manager, store, mut a) = setup(delete_request()).await;
        a.min_approvals = 2;
        let a = store.update_action(&a).await.unwrap();

        let a = manager
            .submit_vote(a.id, &approver(), ApprovalStatus::Approved, None)
            .await
            .unwrap();
        assert_eq!(a.status, ActionStatus::PendingApproval);

        let a = manager
            .submit_vote(a.id, &approver(), ApprovalStatus::Rejected, Some("too risky".into()))
            .await
            .unwrap();
        assert_eq!(a.status, ActionStatus::Rejected);
        assert_eq!(a.approval_status, ApprovalStatus::Rejected);
        assert_eq!(store.list_approvals(a.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn creator_cannot_vote() {
        let (manager, _, a) = setup(delete_request()).await;
        let creator = Voter {
            user_id: a.created_by,
            name: None,
            roles: vec!["approver".into()],
        };
        let err = manager
            .submit_vote(a.id, &creator, ApprovalStatus::Approved, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::SelfApproval));
    }

    #[tokio::test]
    async fn outsiders_and_repeat_voters_are_refused() {
        let (manager, store, mut a) = setup(delete_request()).await;
        a.min_approvals = 2;
        let a = store.update_action(&a).await.unwrap();

        let outsider = Voter {
            user_id: Uuid::now_v7(),
            name: None,
            roles: vec!["viewer".into()],
        };
        assert!(matches!(
            manager
                .submit_vote(a.id, &outsider, ApprovalStatus::Approved, None)
                .await,
            Err(EngineError::NotAnApprover(_))
        ));

        let voter = approver();
        manager
            .submit_vote(a.id, &voter, ApprovalStatus::Approved, None)
            .await
            .unwrap();
        assert!(matches!(
            manager
                .submit_vote(a.id, &voter, ApprovalStatus::Approved, None)
                .await,
            Err(EngineError::DuplicateVote(_))
        ));
    }

    #[tokio::test]
    async fn votes_after_decision_are_invalid_state() {
        let (manager, _, a) = setup(delete_request()).await;
        manager
            .submit_vote(a.id, &approver(), ApprovalStatus::Approved, None)
            .await
            .unwrap();
        assert!(matches!(
            manager
                .submit_vote(a.id, &approver(), ApprovalStatus::Rejected, None)
                .await,
            Err(EngineError::InvalidState(_))
        ));
    }
}
