//! Runs one claimed action through validate, snapshot, apply, verify and
//! (when verification fails) rollback, recording what happened.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde_json::{Value, json};
use tokio::time::{Instant, timeout};

use super::state_machine::transition;
use super::EngineError;
use crate::config::ExecutionConfig;
use crate::db::{ActionStore, StoreError};
use crate::events::Notifier;
use crate::executors::{
    ExecutorRegistry, ProviderError, ProviderExecutor, ProviderResult, RollbackError, Snapshot,
};
use crate::models::{Action, ActionHistory, ActionResult, ActionStatus, RollbackOutcome};

pub struct ExecutionCoordinator {
    store: Arc<dyn ActionStore>,
    executors: Arc<ExecutorRegistry>,
    notifier: Arc<Notifier>,
    config: ExecutionConfig,
    worker_id: String,
    heartbeat_every: Duration,
}

/// Step log carried into the terminal history entry.
#[derive(Default)]
struct Steps(Vec<Value>);

impl Steps {
    fn push(&mut self, step: &str, outcome: &str, message: impl Into<String>) {
        self.0.push(json!({
            "step": step,
            "outcome": outcome,
            "message": message.into(),
            "at": Utc::now(),
        }));
    }
}

enum ApplyOutcome {
    Applied(ProviderResult),
    Failed(ProviderError),
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn ActionStore>,
        executors: Arc<ExecutorRegistry>,
        notifier: Arc<Notifier>,
        config: ExecutionConfig,
        worker_id: impl Into<String>,
        heartbeat_every: Duration,
    ) -> Self {
        Self {
            store,
            executors,
            notifier,
            config,
            worker_id: worker_id.into(),
            heartbeat_every: heartbeat_every.max(Duration::from_millis(100)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Execute a claimed action to a terminal status. Store failures are
    /// logged; the reaper recovers anything left in `executing`.
    pub async fn run(&self, action: Action) -> Option<Action> {
        let id = action.id;
        let heartbeat = self.spawn_heartbeat(id);
        let outcome = self.execute(action).await;
        heartbeat.abort();

        match outcome {
            Ok(done) => {
                tracing::info!("Action {id} finished as {}", done.status);
                Some(done)
            }
            Err(e) => {
                tracing::error!("Action {id} execution aborted: {e}");
                None
            }
        }
    }

    fn spawn_heartbeat(&self, id: uuid::Uuid) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let worker_id = self.worker_id.clone();
        let every = self.heartbeat_every;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.heartbeat(id, &worker_id, Utc::now()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => tracing::warn!("Heartbeat for action {id} failed: {e}"),
                }
            }
        })
    }

    async fn execute(&self, mut action: Action) -> Result<Action, EngineError> {
        if action.status != ActionStatus::Executing {
            return Err(EngineError::InvalidState(format!(
                "Action {} is {}, not executing",
                action.id, action.status
            )));
        }

        self.store
            .append_history(&ActionHistory::new(
                action.id,
                ActionStatus::Executing,
                &self.worker_id,
                None,
                json!({ "claimed_by": action.claimed_by, "type": action.action_type }),
            ))
            .await?;

        let mut steps = Steps::default();
        let Some(executor) = self
            .executors
            .get(action.provider, action.action_type)
            .cloned()
        else {
            let message = format!(
                "no executor registered for {}/{}",
                action.provider, action.action_type
            );
            steps.push("validate", "failed", &message);
            return self
                .finish(action, ActionStatus::Failed, ActionResult::failure(message, None), steps)
                .await;
        };

        // Validate: a failure here means no provider call is made.
        match timeout(self.config.validate_timeout, executor.validate(&action)).await {
            Ok(Ok(v)) if v.is_valid() => {
                steps.push("validate", "ok", v.warnings.join("; "));
            }
            Ok(Ok(v)) => {
                let message = format!("validation failed: {}", v.message());
                steps.push("validate", "failed", v.message());
                return self
                    .finish(action, ActionStatus::Failed, ActionResult::failure(message, None), steps)
                    .await;
            }
            Ok(Err(e)) => {
                steps.push("validate", "failed", e.message());
                let result =
                    ActionResult::failure(format!("validation failed: {e}"), Some(e.message().to_string()));
                return self.finish(action, ActionStatus::Failed, result, steps).await;
            }
            Err(_) => {
                let message = format!(
                    "validation timed out after {}s",
                    self.config.validate_timeout.as_secs()
                );
                steps.push("validate", "timeout", &message);
                return self
                    .finish(action, ActionStatus::Failed, ActionResult::failure(message, None), steps)
                    .await;
            }
        }

        if let Some(cancelled) = self.cancel_if_requested(&action, &mut steps).await? {
            return self.finish_cancelled(cancelled, steps).await;
        }

        // Snapshot: best effort, a failure only disables rollback.
        let mut no_snapshot_reason = None;
        match timeout(self.config.validate_timeout, executor.snapshot(&action)).await {
            Ok(Ok(Snapshot::Captured(handle))) => {
                action.snapshot = Some(handle);
                action = self.store.update_action(&action).await?;
                steps.push("snapshot", "captured", "");
            }
            Ok(Ok(Snapshot::Unsupported(reason))) => {
                steps.push("snapshot", "unsupported", &reason);
                no_snapshot_reason = Some(reason);
            }
            Ok(Err(e)) => {
                tracing::warn!("Snapshot of action {} failed: {e}", action.id);
                steps.push("snapshot", "failed", e.message());
                no_snapshot_reason = Some(format!("snapshot failed: {}", e.message()));
            }
            Err(_) => {
                steps.push("snapshot", "timeout", "");
                no_snapshot_reason = Some("snapshot timed out".to_string());
            }
        }

        if let Some(cancelled) = self.cancel_if_requested(&action, &mut steps).await? {
            return self.finish_cancelled(cancelled, steps).await;
        }

        action.apply_started_at = Some(Utc::now());
        action = self.store.update_action(&action).await?;

        let applied = match self.apply_with_retry(&mut action, executor.as_ref(), &mut steps).await? {
            ApplyOutcome::Applied(r) => r,
            ApplyOutcome::Failed(e) => {
                let result = ActionResult::failure(
                    format!("apply failed: {}", e.message()),
                    Some(e.message().to_string()),
                );
                return self.finish(action, ActionStatus::Failed, result, steps).await;
            }
        };

        match self.verify(&action, executor.as_ref(), &applied).await {
            Ok(()) => {
                steps.push("verify", "ok", "");
                let result = ActionResult {
                    success: true,
                    message: applied.message.clone(),
                    provider_response: Some(applied.response.clone()),
                    savings_realized: applied.savings_realized,
                    ..ActionResult::default()
                };
                self.finish(action, ActionStatus::Completed, result, steps).await
            }
            Err(failure) => {
                steps.push("verify", "failed", &failure);
                self.handle_verification_failure(
                    action,
                    executor.as_ref(),
                    applied,
                    failure,
                    no_snapshot_reason,
                    steps,
                )
                .await
            }
        }
    }

    async fn apply_with_retry(
        &self,
        action: &mut Action,
        executor: &dyn ProviderExecutor,
        steps: &mut Steps,
    ) -> Result<ApplyOutcome, EngineError> {
        let key = action.idempotency_key();
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            action.attempts = attempt as i32;
            let error = match timeout(self.config.apply_timeout, executor.apply(action, &key)).await {
                Ok(Ok(result)) => {
                    steps.push("apply", "ok", format!("attempt {attempt}: {}", result.message));
                    *action = self.store.update_action(action).await?;
                    return Ok(ApplyOutcome::Applied(result));
                }
                Ok(Err(e)) => e,
                Err(_) => ProviderError::Retryable(format!(
                    "apply timed out after {}s",
                    self.config.apply_timeout.as_secs()
                )),
            };

            steps.push("apply", "error", format!("attempt {attempt}: {error}"));
            if !error.is_retryable() || attempt == max_attempts {
                *action = self.store.update_action(action).await?;
                return Ok(ApplyOutcome::Failed(error));
            }

            let delay = self.backoff(attempt);
            tracing::warn!(
                "Action {} apply attempt {attempt}/{max_attempts} failed, retrying in {}ms: {error}",
                action.id,
                delay.as_millis()
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Exponential backoff with a little jitter, capped.
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base.as_millis() as u64;
        let exp = base.saturating_mul(1u64 << (attempt - 1).min(20));
        let jitter = rand::rng().random_range(0..=base / 4);
        Duration::from_millis(exp.saturating_add(jitter)).min(self.config.backoff_max)
    }

    /// Poll `verify` until it confirms or the ceiling passes.
    async fn verify(
        &self,
        action: &Action,
        executor: &dyn ProviderExecutor,
        applied: &ProviderResult,
    ) -> Result<(), String> {
        let deadline = Instant::now() + self.config.verify_timeout;
        let mut last = "end state not reached".to_string();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(format!(
                    "{last} within {}s",
                    self.config.verify_timeout.as_secs()
                ));
            }
            match timeout(remaining, executor.verify(action, applied)).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => {}
                Ok(Err(e)) if e.is_retryable() => last = e.message().to_string(),
                Ok(Err(e)) => return Err(e.message().to_string()),
                Err(_) => continue,
            }
            let nap = self.config.verify_poll.min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(nap).await;
        }
    }

    async fn handle_verification_failure(
        &self,
        mut action: Action,
        executor: &dyn ProviderExecutor,
        applied: ProviderResult,
        failure: String,
        no_snapshot_reason: Option<String>,
        mut steps: Steps,
    ) -> Result<Action, EngineError> {
        let failure = EngineError::VerificationFailed(failure).to_string();

        let Some(snapshot) = action.snapshot.clone() else {
            let reason = no_snapshot_reason.unwrap_or_else(|| "no snapshot was captured".into());
            steps.push("rollback", "skipped", &reason);
            let result = ActionResult {
                success: false,
                message: format!("{failure}; rollback unsupported: {reason}"),
                provider_response: Some(applied.response),
                original_failure: Some(failure),
                rollback: Some(RollbackOutcome {
                    attempted: false,
                    success: false,
                    message: format!("rollback unsupported: {reason}"),
                }),
                ..ActionResult::default()
            };
            return self.finish(action, ActionStatus::Failed, result, steps).await;
        };

        // The action is failed first; rolled_back follows only on success.
        let failed_result = ActionResult {
            success: false,
            message: format!("{failure}; attempting rollback"),
            provider_response: Some(applied.response.clone()),
            original_failure: Some(failure.clone()),
            ..ActionResult::default()
        };
        action = self
            .persist_terminal(action, ActionStatus::Failed, failed_result, &steps)
            .await?;

        let rollback = timeout(self.config.apply_timeout, executor.rollback(&action, &snapshot)).await;
        let rollback = match rollback {
            Ok(r) => r,
            Err(_) => Err(RollbackError::Provider(ProviderError::Retryable(format!(
                "rollback timed out after {}s",
                self.config.apply_timeout.as_secs()
            )))),
        };

        match rollback {
            Ok(restored) => {
                steps.push("rollback", "ok", &restored.message);
                let result = ActionResult {
                    success: false,
                    message: format!("{failure}; rolled back to the captured snapshot"),
                    provider_response: Some(restored.response),
                    original_failure: Some(failure),
                    rollback: Some(RollbackOutcome {
                        attempted: true,
                        success: true,
                        message: restored.message,
                    }),
                    ..ActionResult::default()
                };
                self.finish(action, ActionStatus::RolledBack, result, steps).await
            }
            Err(RollbackError::Unsupported(reason)) => {
                steps.push("rollback", "unsupported", &reason);
                let result = ActionResult {
                    success: false,
                    message: format!("{failure}; rollback unsupported: {reason}"),
                    provider_response: Some(applied.response),
                    original_failure: Some(failure),
                    rollback: Some(RollbackOutcome {
                        attempted: false,
                        success: false,
                        message: reason,
                    }),
                    ..ActionResult::default()
                };
                self.amend_failed(action, result, steps, false).await
            }
            Err(RollbackError::Provider(e)) => {
                let err = EngineError::RollbackFailed(e.message().to_string());
                tracing::error!("Action {} needs manual intervention: {err}", action.id);
                steps.push("rollback", "failed", e.message());
                let result = ActionResult {
                    success: false,
                    message: format!("{failure}; {err}; manual intervention required"),
                    provider_response: Some(applied.response),
                    provider_error: Some(e.message().to_string()),
                    original_failure: Some(failure),
                    rollback: Some(RollbackOutcome {
                        attempted: true,
                        success: false,
                        message: e.message().to_string(),
                    }),
                    ..ActionResult::default()
                };
                self.amend_failed(action, result, steps, true).await
            }
        }
    }

    async fn cancel_if_requested(
        &self,
        action: &Action,
        steps: &mut Steps,
    ) -> Result<Option<Action>, EngineError> {
        let current = self
            .store
            .get_action(action.id)
            .await?
            .ok_or_else(|| EngineError::action_not_found(action.id))?;
        if current.version != action.version {
            return Err(StoreError::VersionConflict(action.id).into());
        }
        if current.cancel_requested {
            steps.push("cancel", "ok", "cancelled before apply");
            return Ok(Some(current));
        }
        Ok(None)
    }

    async fn finish_cancelled(&self, action: Action, steps: Steps) -> Result<Action, EngineError> {
        let result = ActionResult::failure("cancelled before apply started", None);
        self.finish(action, ActionStatus::Cancelled, result, steps).await
    }

    async fn finish(
        &self,
        action: Action,
        status: ActionStatus,
        result: ActionResult,
        steps: Steps,
    ) -> Result<Action, EngineError> {
        let done = self
            .persist_terminal(action, status, result, &steps)
            .await?;
        self.notify(&done).await;
        Ok(done)
    }

    /// Rewrite the result of an action that stays `failed` after a rollback
    /// attempt, without another status change.
    async fn amend_failed(
        &self,
        mut action: Action,
        result: ActionResult,
        steps: Steps,
        manual: bool,
    ) -> Result<Action, EngineError> {
        action.result = Some(result.clone());
        action.needs_manual_intervention = manual;
        let done = self.store.update_action(&action).await?;
        self.store
            .append_history(&ActionHistory::new(
                done.id,
                ActionStatus::Failed,
                &self.worker_id,
                Some(serde_json::to_value(&result).map_err(StoreError::from)?),
                json!({ "steps": steps.0, "attempts": done.attempts, "rollback": true }),
            ))
            .await?;
        self.notify(&done).await;
        Ok(done)
    }

    async fn persist_terminal(
        &self,
        mut action: Action,
        status: ActionStatus,
        result: ActionResult,
        steps: &Steps,
    ) -> Result<Action, EngineError> {
        transition(&mut action, status)?;
        action.result = Some(result.clone());
        let done = self.store.update_action(&action).await?;
        self.store
            .append_history(&ActionHistory::new(
                done.id,
                status,
                &self.worker_id,
                Some(serde_json::to_value(&result).map_err(StoreError::from)?),
                json!({ "steps": steps.0, "attempts": done.attempts }),
            ))
            .await?;
        Ok(done)
    }

    async fn notify(&self, action: &Action) {
        if let Err(e) = self.notifier.action_finished(action).await {
            tracing::error!("Failed to enqueue event for action {}: {e}", action.id);
        }
    }
}
