//! Workflows compose actions, conditions and delays into an ordered step
//! list. A `WorkflowExecution` is the persisted cursor over that list.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::action::CreateAction;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowTrigger {
    #[default]
    Manual,
    Interval { interval_hours: u32 },
    /// Runs once, on the first tick at or after `time`.
    At { time: DateTime<Utc> },
}

impl WorkflowTrigger {
    /// Whether the ticker should start the workflow now, given when it
    /// last started.
    pub fn is_due(&self, last_triggered_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match self {
            WorkflowTrigger::Manual => false,
            WorkflowTrigger::Interval { interval_hours } => last_triggered_at
                .is_none_or(|last| now - last >= chrono::Duration::hours(*interval_hours as i64)),
            WorkflowTrigger::At { time } => {
                now >= *time && last_triggered_at.is_none_or(|last| last < *time)
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            WorkflowTrigger::Manual => "manual",
            WorkflowTrigger::Interval { .. } => "interval",
            WorkflowTrigger::At { .. } => "schedule",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Active,
    Paused,
}

string_enum!(WorkflowStatus, "workflow status", {
    Active => "active",
    Paused => "paused",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

string_enum!(ExecutionStatus, "execution status", {
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Waiting,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowStep {
    /// Run an existing action (`action_id`) or create one from `action`.
    Action {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        action_id: Option<Uuid>,
        #[serde(default)]
        action: Option<CreateAction>,
        /// Step to continue at when the action fails or is rejected.
        #[serde(default)]
        on_failure: Option<usize>,
        #[serde(default)]
        next: Option<usize>,
    },
    Condition {
        #[serde(default)]
        name: Option<String>,
        condition: Condition,
        #[serde(default)]
        true_branch: Option<usize>,
        #[serde(default)]
        false_branch: Option<usize>,
    },
    Delay {
        #[serde(default)]
        name: Option<String>,
        duration_seconds: u64,
    },
}

impl WorkflowStep {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowStep::Action { .. } => "action",
            WorkflowStep::Condition { .. } => "condition",
            WorkflowStep::Delay { .. } => "delay",
        }
    }
}

/// Check a step list before it is stored.
pub fn validate_steps(steps: &[WorkflowStep]) -> Result<(), String> {
    if steps.is_empty() {
        return Err("workflow must have at least one step".to_string());
    }

    let in_range = |idx: Option<usize>, i: usize, what: &str| match idx {
        Some(target) if target >= steps.len() => Err(format!(
            "step {i}: {what} points at step {target}, but there are only {} steps",
            steps.len()
        )),
        _ => Ok(()),
    };

    for (i, step) in steps.iter().enumerate() {
        match step {
            WorkflowStep::Action {
                action_id,
                action,
                on_failure,
                next,
                ..
            } => {
                if action_id.is_none() && action.is_none() {
                    return Err(format!(
                        "step {i}: action step needs an action_id or an action definition"
                    ));
                }
                in_range(*on_failure, i, "on_failure")?;
                in_range(*next, i, "next")?;
            }
            WorkflowStep::Condition {
                condition,
                true_branch,
                false_branch,
                ..
            } => {
                if true_branch.is_none() && false_branch.is_none() {
                    return Err(format!("step {i}: condition step needs at least one branch"));
                }
                in_range(*true_branch, i, "true_branch")?;
                in_range(*false_branch, i, "false_branch")?;
                condition
                    .check_refs(i)
                    .map_err(|e| format!("step {i}: {e}"))?;
            }
            WorkflowStep::Delay {
                duration_seconds, ..
            } => {
                if *duration_seconds == 0 {
                    return Err(format!("step {i}: delay needs a positive duration_seconds"));
                }
            }
        }
    }
    Ok(())
}

/// Either a JSON literal or a reference into an earlier step's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Operand {
    Ref { step: usize, pointer: String },
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Equals { left: Operand, right: Operand },
    NotEquals { left: Operand, right: Operand },
    GreaterThan { left: Operand, right: Operand },
    LessThan { left: Operand, right: Operand },
    Contains { left: Operand, right: Operand },
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

impl Condition {
    /// Evaluate against the results recorded so far. A reference to a step
    /// that has not produced output resolves to `null`.
    pub fn evaluate(&self, results: &[StepResult]) -> Result<bool, String> {
        match self {
            Condition::Equals { left, right } => {
                Ok(values_equal(&resolve(left, results), &resolve(right, results)))
            }
            Condition::NotEquals { left, right } => {
                Ok(!values_equal(&resolve(left, results), &resolve(right, results)))
            }
            Condition::GreaterThan { left, right } => {
                compare(&resolve(left, results), &resolve(right, results))
                    .map(|o| o == Ordering::Greater)
            }
            Condition::LessThan { left, right } => {
                compare(&resolve(left, results), &resolve(right, results))
                    .map(|o| o == Ordering::Less)
            }
            Condition::Contains { left, right } => {
                let haystack = resolve(left, results);
                let needle = resolve(right, results);
                match (&haystack, &needle) {
                    (Value::String(h), Value::String(n)) => Ok(h.contains(n.as_str())),
                    (Value::Array(items), _) => {
                        Ok(items.iter().any(|item| values_equal(item, &needle)))
                    }
                    (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
                    (Value::Null, _) => Ok(false),
                    _ => Err(format!("contains is not defined for {haystack} and {needle}")),
                }
            }
            Condition::And { conditions } => {
                for c in conditions {
                    if !c.evaluate(results)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Condition::Or { conditions } => {
                for c in conditions {
                    if c.evaluate(results)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Condition::Not { condition } => condition.evaluate(results).map(|b| !b),
        }
    }

    /// References may only point at steps before `at`.
    fn check_refs(&self, at: usize) -> Result<(), String> {
        let check = |op: &Operand| match op {
            Operand::Ref { step, pointer } => {
                if *step >= at {
                    Err(format!("condition refers to step {step}, which does not run before it"))
                } else if !pointer.is_empty() && !pointer.starts_with('/') {
                    Err(format!("invalid JSON pointer: {pointer}"))
                } else {
                    Ok(())
                }
            }
            Operand::Literal(_) => Ok(()),
        };

        match self {
            Condition::Equals { left, right }
            | Condition::NotEquals { left, right }
            | Condition::GreaterThan { left, right }
            | Condition::LessThan { left, right }
            | Condition::Contains { left, right } => {
                check(left)?;
                check(right)
            }
            Condition::And { conditions } | Condition::Or { conditions } => {
                conditions.iter().try_for_each(|c| c.check_refs(at))
            }
            Condition::Not { condition } => condition.check_refs(at),
        }
    }
}

fn resolve(operand: &Operand, results: &[StepResult]) -> Value {
    match operand {
        Operand::Literal(v) => v.clone(),
        Operand::Ref { step, pointer } => results
            .iter()
            .rev()
            .find(|r| r.step_index == *step)
            .and_then(|r| r.output.pointer(pointer))
            .cloned()
            .unwrap_or(Value::Null),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Result<Ordering, String> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => {
            let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y)
                .ok_or_else(|| format!("cannot compare {a} and {b}"))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(format!("cannot compare {a} and {b}")),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_index: usize,
    pub kind: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_id: Option<Uuid>,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<WorkflowStep>,
    pub trigger: WorkflowTrigger,
    pub status: WorkflowStatus,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_triggered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowExecution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    pub current_step: usize,
    pub step_results: Vec<StepResult>,
    /// Set while a delay step is pending.
    pub wake_at: Option<DateTime<Utc>>,
    /// Set while an action step is waiting for its action to finish.
    pub waiting_action_id: Option<Uuid>,
    pub steps_visited: i32,
    pub version: i64,
    pub triggered_by: String,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    pub fn start(workflow_id: Uuid, triggered_by: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            status: ExecutionStatus::InProgress,
            current_step: 0,
            step_results: Vec::new(),
            wake_at: None,
            waiting_action_id: None,
            steps_visited: 0,
            version: 0,
            triggered_by: triggered_by.into(),
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}
