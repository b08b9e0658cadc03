//! Claiming due actions and handing them to the bounded execution pool,
//! plus the reaper that recovers orphaned claims.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, watch};

use super::state_machine::transition;
use super::{EngineError, ExecutionCoordinator};
use crate::db::{ActionStore, ClaimOutcome, StoreError};
use crate::events::Notifier;
use crate::models::{Action, ActionHistory, ActionResult, ActionStatus};

/// Bounded pool of execution slots on the worker runtime.
pub struct Dispatcher {
    coordinator: Arc<ExecutionCoordinator>,
    handle: Handle,
    permits: Arc<Semaphore>,
    size: usize,
}

impl Dispatcher {
    pub fn new(coordinator: Arc<ExecutionCoordinator>, handle: Handle, size: usize) -> Self {
        let size = size.max(1);
        Self {
            coordinator,
            handle,
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn worker_id(&self) -> &str {
        self.coordinator.worker_id()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.size - self.available()
    }

    /// Start executing a claimed action. A saturated pool hands the
    /// action back so the caller can release its claim.
    pub fn dispatch(&self, action: Action) -> Result<(), Action> {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            return Err(action);
        };
        let coordinator = self.coordinator.clone();
        self.handle.spawn(async move {
            coordinator.run(action).await;
            drop(permit);
        });
        Ok(())
    }
}

pub struct Scheduler {
    store: Arc<dyn ActionStore>,
    dispatcher: Arc<Dispatcher>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn ActionStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// Claim and dispatch as many due actions as there are free slots.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let free = self.dispatcher.available();
        if free == 0 {
            return Ok(0);
        }

        let due = self.store.list_due_actions(now, free as i64).await?;
        let mut dispatched = 0;
        for action in due {
            if !action.is_due(now) {
                continue;
            }
            match self
                .store
                .claim_action(action.id, action.version, self.dispatcher.worker_id(), now)
                .await?
            {
                ClaimOutcome::Claimed(claimed) => {
                    if let Err(claimed) = self.dispatcher.dispatch(claimed) {
                        self.store.release_claim(claimed.id, claimed.version).await?;
                        tracing::debug!("Pool saturated, released claim on {}", claimed.id);
                        break;
                    }
                    tracing::debug!("Dispatched action {}", action.id);
                    dispatched += 1;
                }
                ClaimOutcome::Conflict => {
                    tracing::debug!("Lost claim on action {}", action.id);
                }
                ClaimOutcome::ResourceBusy => {
                    tracing::debug!(
                        "Action {} waits: its resource is busy",
                        action.id
                    );
                }
            }
        }
        Ok(dispatched)
    }

    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        tracing::debug!("Scheduler started (every {}ms)", interval.as_millis());
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.poll_once(Utc::now()).await {
                tracing::error!("Scheduler poll failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
        tracing::debug!("Scheduler stopped");
    }
}

/// Recovers `executing` rows whose worker stopped sending heartbeats.
pub struct Reaper {
    store: Arc<dyn ActionStore>,
    notifier: Arc<Notifier>,
    liveness_timeout: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn ActionStore>, notifier: Arc<Notifier>, liveness_timeout: Duration) -> Self {
        Self {
            store,
            notifier,
            liveness_timeout,
        }
    }

    pub async fn reap_once(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let timeout = chrono::Duration::from_std(self.liveness_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(900));
        let stale = self.store.list_stale_executing(now - timeout).await?;

        let mut recovered = 0;
        for action in stale {
            let outcome = if action.apply_started_at.is_none() {
                self.release(&action).await
            } else {
                self.abandon(action).await
            };
            match outcome {
                Ok(()) => recovered += 1,
                Err(EngineError::Store(StoreError::VersionConflict(id))) => {
                    tracing::debug!("Action {id} moved on while being reaped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Nothing reached the provider yet, so the action can run again.
    async fn release(&self, action: &Action) -> Result<(), EngineError> {
        let released = self.store.release_claim(action.id, action.version).await?;
        self.store
            .append_history(&ActionHistory::new(
                released.id,
                ActionStatus::Approved,
                "reaper",
                None,
                json!({
                    "recovery": "claim released",
                    "claimed_by": action.claimed_by,
                    "last_heartbeat": action.heartbeat_at,
                }),
            ))
            .await?;
        tracing::warn!(
            "Released orphaned claim on action {} (worker {:?})",
            action.id,
            action.claimed_by
        );
        Ok(())
    }

    /// Apply started, so the provider state is unknown.
    async fn abandon(&self, mut action: Action) -> Result<(), EngineError> {
        let claimed_by = action.claimed_by.clone();
        transition(&mut action, ActionStatus::Failed)?;
        action.needs_manual_intervention = true;
        let result = ActionResult::failure(
            "execution was orphaned after apply started; provider state is unknown",
            None,
        );
        action.result = Some(result.clone());
        let failed = self.store.update_action(&action).await?;
        self.store
            .append_history(&ActionHistory::new(
                failed.id,
                ActionStatus::Failed,
                "reaper",
                Some(serde_json::to_value(&result).map_err(StoreError::from)?),
                json!({
                    "recovery": "manual intervention required",
                    "claimed_by": claimed_by,
                    "apply_started_at": failed.apply_started_at,
                }),
            ))
            .await?;
        tracing::error!(
            "Action {} orphaned mid-apply, flagged for manual intervention",
            failed.id
        );
        if let Err(e) = self.notifier.action_finished(&failed).await {
            tracing::error!("Failed to enqueue event for action {}: {e}", failed.id);
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.reap_once(Utc::now()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Reaper recovered {n} action(s)"),
                Err(e) => tracing::error!("Reaper failed: {e}"),
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testkit::Kit;
    use crate::models::{Provider, ResourceRef};

    fn stop(resource_id: &str) -> serde_json::Value {
        json!({
            "type": "stop_resource",
            "provider": "aws",
            "resource_id": resource_id,
            "risk": "low",
        })
    }

    fn instance(id: &str) -> ResourceRef {
        ResourceRef::new(Provider::Aws, id, "ec2_instance")
    }

    #[tokio::test]
    async fn future_actions_wait_until_due() {
        let kit = Kit::new();
        kit.cloud.seed_instance(Provider::Aws, "i-1", "ec2_instance", "m5.large");
        let scheduler = Scheduler::new(kit.store.clone(), kit.dispatcher(4));

        let start = Utc::now() + chrono::Duration::minutes(10);
        let mut body = stop("i-1");
        body["scheduled_time"] = json!(start);
        let mut action = kit.approved(body, Some(instance("i-1"))).await;
        action.status = ActionStatus::Scheduled;
        let action = kit.store.update_action(&action).await.unwrap();

        assert_eq!(scheduler.poll_once(Utc::now()).await.unwrap(), 0);
        assert_eq!(
            kit.store.get_action(action.id).await.unwrap().unwrap().status,
            ActionStatus::Scheduled
        );

        assert_eq!(scheduler.poll_once(start).await.unwrap(), 1);
        let done = kit.settled(action.id).await;
        assert_eq!(done.status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn saturated_pool_claims_nothing() {
        let kit = Kit::new();
        let dispatcher = kit.dispatcher(1);
        for id in ["i-1", "i-2"] {
            kit.cloud.seed_instance(Provider::Aws, id, "ec2_instance", "m5.large");
            kit.approved(stop(id), Some(instance(id))).await;
        }
        let scheduler = Scheduler::new(kit.store.clone(), dispatcher.clone());

        assert_eq!(scheduler.poll_once(Utc::now()).await.unwrap(), 1);
        // The single slot is taken until the first action finishes.
        let waiting = kit
            .store
            .list_due_actions(Utc::now(), 10)
            .await
            .unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].status, ActionStatus::Approved);
    }

    #[tokio::test]
    async fn one_action_per_resource_runs_at_a_time() {
        let kit = Kit::new();
        kit.cloud.seed_instance(Provider::Aws, "i-1", "ec2_instance", "m5.large");
        let first = kit.approved(stop("i-1"), Some(instance("i-1"))).await;
        let second = kit.approved(stop("i-1"), Some(instance("i-1"))).await;
        let scheduler = Scheduler::new(kit.store.clone(), kit.dispatcher(4));

        assert_eq!(scheduler.poll_once(Utc::now()).await.unwrap(), 1);
        let statuses = [
            kit.store.get_action(first.id).await.unwrap().unwrap().status,
            kit.store.get_action(second.id).await.unwrap().unwrap().status,
        ];
        assert!(statuses.contains(&ActionStatus::Approved));
    }

    #[tokio::test]
    async fn reaper_releases_claims_that_never_applied() {
        let kit = Kit::new();
        let reaper = Reaper::new(kit.store.clone(), kit.notifier.clone(), Duration::from_secs(60));
        let action = kit.claimed(stop("i-1"), Some(instance("i-1"))).await;

        assert_eq!(reaper.reap_once(Utc::now()).await.unwrap(), 0);
        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(reaper.reap_once(later).await.unwrap(), 1);

        let a = kit.store.get_action(action.id).await.unwrap().unwrap();
        assert_eq!(a.status, ActionStatus::Approved);
        let entry = kit.store.last_history(a.id).await.unwrap().unwrap();
        assert_eq!(entry.executed_by, "reaper");
        assert_eq!(entry.details["recovery"], "claim released");
    }

    #[tokio::test]
    async fn reaper_fails_actions_orphaned_mid_apply() {
        let kit = Kit::new();
        let reaper = Reaper::new(kit.store.clone(), kit.notifier.clone(), Duration::from_secs(60));
        let mut action = kit.claimed(stop("i-1"), Some(instance("i-1"))).await;
        action.apply_started_at = Some(Utc::now());
        kit.store.update_action(&action).await.unwrap();

        let later = Utc::now() + chrono::Duration::minutes(5);
        assert_eq!(reaper.reap_once(later).await.unwrap(), 1);

        let a = kit.store.get_action(action.id).await.unwrap().unwrap();
        assert_eq!(a.status, ActionStatus::Failed);
        assert!(a.needs_manual_intervention);
        assert_eq!(kit.store.events()[0].event_type, "action.failed");
    }
}
