//! Drives workflow executions forward: one step at a time, persisting the
//! cursor after every change so a restart resumes where it stopped.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::watch;
use uuid::Uuid;

use super::{ActionService, EngineError};
use crate::db::{ActionStore, StoreError};
use crate::models::workflow::validate_steps;
use crate::models::{
    Action, ActionParameters, ActionStatus, CreateAction, ExecutionStatus, StepResult, StepStatus,
    Workflow, WorkflowExecution, WorkflowStatus, WorkflowStep, WorkflowTrigger,
};

const MAX_STEPS_VISITED: i32 = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct NewWorkflow {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default)]
    pub trigger: WorkflowTrigger,
}

pub struct WorkflowEngine {
    store: Arc<dyn ActionStore>,
    actions: Arc<ActionService>,
}

/// What the cursor should do after looking at the current step.
enum Next {
    Continue,
    Wait,
    /// Another advancer moved the cursor first.
    Lost,
}

impl WorkflowEngine {
    pub fn new(store: Arc<dyn ActionStore>, actions: Arc<ActionService>) -> Self {
        Self { store, actions }
    }

    pub async fn create_workflow(
        &self,
        new: NewWorkflow,
        user: Uuid,
    ) -> Result<Workflow, EngineError> {
        if new.name.trim().is_empty() {
            return Err(EngineError::Validation("name must not be empty".to_string()));
        }
        validate_steps(&new.steps).map_err(EngineError::Validation)?;
        for (i, step) in new.steps.iter().enumerate() {
            if let WorkflowStep::Action {
                action: Some(def), ..
            } = step
            {
                ActionParameters::parse(def.action_type, &def.parameters)
                    .map_err(|e| EngineError::Validation(format!("step {i}: {e}")))?;
            }
        }
        if let WorkflowTrigger::Interval { interval_hours: 0 } = new.trigger {
            return Err(EngineError::Validation(
                "interval_hours must be at least 1".to_string(),
            ));
        }

        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::now_v7(),
            name: new.name.trim().to_string(),
            description: new.description,
            steps: new.steps,
            trigger: new.trigger,
            status: WorkflowStatus::Active,
            created_by: user,
            created_at: now,
            updated_at: now,
            last_triggered_at: None,
        };
        self.store.insert_workflow(&workflow).await?;
        tracing::info!(
            "Workflow {} '{}' created with {} step(s)",
            workflow.id,
            workflow.name,
            workflow.steps.len()
        );
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        self.store
            .get_workflow(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Workflow {id}")))
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>, EngineError> {
        Ok(self.store.list_workflows().await?)
    }

    pub async fn get_execution(&self, id: Uuid) -> Result<WorkflowExecution, EngineError> {
        self.store
            .get_execution(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Workflow execution {id}")))
    }

    /// Start a new execution and run it as far as it can go right now.
    pub async fn start(
        &self,
        workflow_id: Uuid,
        triggered_by: &str,
    ) -> Result<WorkflowExecution, EngineError> {
        self.start_at(workflow_id, triggered_by, Utc::now()).await
    }

    /// As [`start`](Self::start), recording `at` as the trigger time.
    async fn start_at(
        &self,
        workflow_id: Uuid,
        triggered_by: &str,
        at: DateTime<Utc>,
    ) -> Result<WorkflowExecution, EngineError> {
        let workflow = self.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Active {
            return Err(EngineError::InvalidState(format!(
                "Workflow {workflow_id} is {}",
                workflow.status
            )));
        }

        let execution = WorkflowExecution::start(workflow_id, triggered_by);
        self.store.insert_execution(&execution).await?;
        self.store.mark_workflow_triggered(workflow_id, at).await?;
        tracing::info!(
            "Workflow {workflow_id} started as execution {} by {triggered_by}",
            execution.id
        );
        self.advance(&workflow, execution).await
    }

    pub async fn cancel_execution(
        &self,
        id: Uuid,
        user: Uuid,
    ) -> Result<WorkflowExecution, EngineError> {
        let mut execution = self.get_execution(id).await?;
        if execution.status != ExecutionStatus::InProgress {
            return Err(EngineError::InvalidState(format!(
                "Workflow execution {id} is {}",
                execution.status
            )));
        }

        if let Some(action_id) = execution.waiting_action_id.take() {
            if let Err(e) = self.actions.cancel(action_id, user).await {
                tracing::warn!("Could not cancel action {action_id} of execution {id}: {e}");
            }
        }
        let now = Utc::now();
        execution.status = ExecutionStatus::Cancelled;
        execution.wake_at = None;
        execution.error = Some(format!("Cancelled by {user}"));
        execution.completed_at = Some(now);
        execution.updated_at = now;
        let cancelled = self.store.update_execution(&execution).await?;
        tracing::info!("Workflow execution {id} cancelled by {user}");
        Ok(cancelled)
    }

    /// Move the cursor until the execution finishes or has to wait.
    pub async fn advance(
        &self,
        workflow: &Workflow,
        mut execution: WorkflowExecution,
    ) -> Result<WorkflowExecution, EngineError> {
        let mut dirty = false;

        while execution.status == ExecutionStatus::InProgress {
            if execution.current_step >= workflow.steps.len() {
                finish(&mut execution, ExecutionStatus::Completed, None);
                dirty = true;
                break;
            }
            if execution.steps_visited >= MAX_STEPS_VISITED {
                finish(
                    &mut execution,
                    ExecutionStatus::Failed,
                    Some(format!("aborted after visiting {MAX_STEPS_VISITED} steps")),
                );
                dirty = true;
                break;
            }

            let step = &workflow.steps[execution.current_step];
            match self.step(workflow, step, &mut execution, &mut dirty).await? {
                Next::Continue => continue,
                Next::Wait => break,
                Next::Lost => {
                    tracing::debug!("Workflow execution {} advanced elsewhere", execution.id);
                    return self.get_execution(execution.id).await;
                }
            }
        }

        if !dirty {
            return Ok(execution);
        }
        execution.updated_at = Utc::now();
        match self.store.update_execution(&execution).await {
            Ok(saved) => {
                if saved.status != ExecutionStatus::InProgress {
                    tracing::info!(
                        "Workflow execution {} finished as {}",
                        saved.id,
                        saved.status
                    );
                }
                Ok(saved)
            }
            Err(StoreError::VersionConflict(id)) => {
                tracing::debug!("Workflow execution {id} advanced elsewhere");
                self.get_execution(id).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn step(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        execution: &mut WorkflowExecution,
        dirty: &mut bool,
    ) -> Result<Next, EngineError> {
        let index = execution.current_step;
        let now = Utc::now();

        match step {
            WorkflowStep::Delay {
                duration_seconds, ..
            } => match execution.wake_at {
                None => {
                    let wake = now + chrono::Duration::seconds(*duration_seconds as i64);
                    execution.wake_at = Some(wake);
                    record(execution, step, StepStatus::Waiting, json!({ "wake_at": wake }), None);
                    *dirty = true;
                    Ok(Next::Wait)
                }
                Some(wake) if wake <= now => {
                    execution.wake_at = None;
                    record(execution, step, StepStatus::Completed, json!({ "wake_at": wake }), None);
                    move_to(execution, index + 1);
                    *dirty = true;
                    Ok(Next::Continue)
                }
                Some(_) => Ok(Next::Wait),
            },

            WorkflowStep::Condition {
                condition,
                true_branch,
                false_branch,
                ..
            } => {
                *dirty = true;
                match condition.evaluate(&execution.step_results) {
                    Ok(outcome) => {
                        let branch = if outcome { *true_branch } else { *false_branch };
                        record(execution, step, StepStatus::Completed, json!({ "result": outcome }), None);
                        move_to(execution, branch.unwrap_or(index + 1));
                    }
                    Err(e) => {
                        let message = format!("step {index}: {e}");
                        record(execution, step, StepStatus::Failed, Value::Null, Some(message.clone()));
                        finish(execution, ExecutionStatus::Failed, Some(message));
                    }
                }
                Ok(Next::Continue)
            }

            WorkflowStep::Action {
                action_id,
                action: definition,
                on_failure,
                next,
                ..
            } => {
                let waiting = match (execution.waiting_action_id, action_id, definition) {
                    (Some(waiting), _, _) => waiting,
                    (None, Some(id), _) => {
                        *dirty = true;
                        match self.actions.get(*id).await {
                            Ok(action) => {
                                self.kick(&action).await;
                                execution.waiting_action_id = Some(action.id);
                                record(execution, step, StepStatus::Running, action_output(&action), None);
                                return Ok(Next::Continue);
                            }
                            Err(e) => {
                                return Ok(self.action_failed(execution, step, *on_failure, None, e.to_string()));
                            }
                        }
                    }
                    (None, None, Some(_)) => {
                        // Persist the id before the action exists so exactly one
                        // advancer goes on to create it.
                        let id = Uuid::now_v7();
                        execution.waiting_action_id = Some(id);
                        record(
                            execution,
                            step,
                            StepStatus::Running,
                            json!({ "action_id": id, "status": ActionStatus::Draft }),
                            None,
                        );
                        execution.updated_at = now;
                        match self.store.update_execution(execution).await {
                            Ok(saved) => {
                                *execution = saved;
                                *dirty = false;
                            }
                            Err(StoreError::VersionConflict(_)) => return Ok(Next::Lost),
                            Err(e) => return Err(e.into()),
                        }
                        id
                    }
                    (None, None, None) => {
                        *dirty = true;
                        let message = format!("step {index} names no action");
                        return Ok(self.action_failed(execution, step, *on_failure, None, message));
                    }
                };

                let action = match self.actions.get(waiting).await {
                    Ok(action) => action,
                    Err(EngineError::NotFound(_)) if action_id.is_none() => {
                        let Some(def) = definition else {
                            return Ok(Next::Wait);
                        };
                        return self
                            .create_step_action(workflow, step, execution, def, waiting, *on_failure, dirty)
                            .await;
                    }
                    Err(e) => return Err(e),
                };
                match action.status {
                    ActionStatus::Completed => {
                        *dirty = true;
                        execution.waiting_action_id = None;
                        record(execution, step, StepStatus::Completed, action_output(&action), None);
                        move_to(execution, next.unwrap_or(index + 1));
                        Ok(Next::Continue)
                    }
                    ActionStatus::Failed
                    | ActionStatus::RolledBack
                    | ActionStatus::Rejected
                    | ActionStatus::Cancelled => {
                        *dirty = true;
                        execution.waiting_action_id = None;
                        let message = format!("action {} ended {}", action.id, action.status);
                        Ok(self.action_failed(execution, step, *on_failure, Some(&action), message))
                    }
                    ActionStatus::Approved => {
                        self.kick(&action).await;
                        Ok(Next::Wait)
                    }
                    _ => Ok(Next::Wait),
                }
            }
        }
    }

    /// Create the inline action of a claimed step under its reserved id.
    #[allow(clippy::too_many_arguments)]
    async fn create_step_action(
        &self,
        workflow: &Workflow,
        step: &WorkflowStep,
        execution: &mut WorkflowExecution,
        definition: &CreateAction,
        id: Uuid,
        on_failure: Option<usize>,
        dirty: &mut bool,
    ) -> Result<Next, EngineError> {
        let mut def = definition.clone();
        def.workflow_execution_id = Some(execution.id);
        match self.actions.create_as(id, def, workflow.created_by).await {
            Ok(action) => {
                self.kick(&action).await;
                record(execution, step, StepStatus::Running, action_output(&action), None);
                *dirty = true;
                // Auto-approved actions may already be done.
                Ok(Next::Continue)
            }
            Err(EngineError::Store(StoreError::Duplicate(_))) => {
                tracing::debug!("Action {id} of execution {} already created", execution.id);
                Ok(Next::Wait)
            }
            Err(e) => {
                *dirty = true;
                execution.waiting_action_id = None;
                Ok(self.action_failed(execution, step, on_failure, None, e.to_string()))
            }
        }
    }

    /// Branch to `on_failure` or fail the whole execution.
    fn action_failed(
        &self,
        execution: &mut WorkflowExecution,
        step: &WorkflowStep,
        on_failure: Option<usize>,
        action: Option<&Action>,
        message: String,
    ) -> Next {
        let output = action.map(action_output).unwrap_or(Value::Null);
        record(execution, step, StepStatus::Failed, output, Some(message.clone()));
        match on_failure {
            Some(target) => move_to(execution, target),
            None => finish(
                execution,
                ExecutionStatus::Failed,
                Some(format!("step {}: {message}", execution.current_step)),
            ),
        }
        Next::Continue
    }

    /// Ask for immediate execution; the scheduler picks it up otherwise.
    async fn kick(&self, action: &Action) {
        if action.status != ActionStatus::Approved {
            return;
        }
        if let Err(e) = self.actions.execute(action.id).await {
            tracing::debug!("Workflow action {} left for the scheduler: {e}", action.id);
        }
    }

    /// Advance every in-progress execution and start due interval workflows.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, EngineError> {
        let active = self.store.list_active_executions().await?;
        let mut busy: HashSet<Uuid> = HashSet::new();
        let mut progressed = 0;

        for execution in active {
            let workflow = match self.store.get_workflow(execution.workflow_id).await? {
                Some(wf) => wf,
                None => {
                    tracing::warn!(
                        "Execution {} refers to missing workflow {}",
                        execution.id,
                        execution.workflow_id
                    );
                    continue;
                }
            };
            let before = execution.version;
            match self.advance(&workflow, execution).await {
                Ok(after) => {
                    if after.version != before {
                        progressed += 1;
                    }
                    if after.status == ExecutionStatus::InProgress {
                        busy.insert(after.workflow_id);
                    }
                }
                Err(e) => tracing::error!("Advancing workflow {} failed: {e}", workflow.id),
            }
        }

        for workflow in self.store.list_workflows().await? {
            if workflow.status != WorkflowStatus::Active || busy.contains(&workflow.id) {
                continue;
            }
            if workflow.trigger.is_due(workflow.last_triggered_at, now) {
                let label = workflow.trigger.label();
                match self.start_at(workflow.id, label, now).await {
                    Ok(_) => progressed += 1,
                    Err(e) => {
                        tracing::error!("Start ({label}) of workflow {} failed: {e}", workflow.id)
                    }
                }
            }
        }
        Ok(progressed)
    }

    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::error!("Workflow tick failed: {e}");
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }
}

fn action_output(action: &Action) -> Value {
    json!({
        "action_id": action.id,
        "status": action.status,
        "result": action.result,
    })
}

fn move_to(execution: &mut WorkflowExecution, step: usize) {
    execution.current_step = step;
    execution.steps_visited += 1;
}

fn finish(execution: &mut WorkflowExecution, status: ExecutionStatus, error: Option<String>) {
    let now = Utc::now();
    execution.status = status;
    execution.error = error;
    execution.wake_at = None;
    execution.completed_at = Some(now);
}

/// Append a step result, replacing the open entry for the same step.
fn record(
    execution: &mut WorkflowExecution,
    step: &WorkflowStep,
    status: StepStatus,
    output: Value,
    message: Option<String>,
) {
    let now = Utc::now();
    let index = execution.current_step;
    let open = execution.step_results.last().is_some_and(|r| {
        r.step_index == index && matches!(r.status, StepStatus::Running | StepStatus::Waiting)
    });
    let started_at = if open {
        execution
            .step_results
            .pop()
            .map(|r| r.started_at)
            .unwrap_or(now)
    } else {
        now
    };
    let finished = matches!(status, StepStatus::Completed | StepStatus::Failed);
    execution.step_results.push(StepResult {
        step_index: index,
        kind: step.kind().to_string(),
        status,
        action_id: output
            .get("action_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok()),
        output,
        message,
        started_at,
        finished_at: finished.then_some(now),
    });
}
