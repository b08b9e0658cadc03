/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum from a
/// single variant/name table shared by serde, SQL columns and query strings.
macro_rules! string_enum {
    ($ty:ident, $what:literal, { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $name),+
                }
            }
        }

        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($ty::$variant),)+
                    other => Err(format!("unknown {}: {other}", $what)),
                }
            }
        }
    };
}

pub mod action;
pub mod approval;
pub mod history;
pub mod parameters;
pub mod terraform;
pub mod webhook_event;
pub mod workflow;

pub use action::{
    Action, ActionResult, ActionStatus, ActionType, CreateAction, Provider, ResourceRef,
    RiskLevel, RollbackOutcome, SnapshotHandle,
};
pub use approval::{Approval, ApprovalStatus, ApproverSpec};
pub use history::ActionHistory;
pub use parameters::ActionParameters;
pub use terraform::{DeploymentStatus, TerraformDeployment};
pub use webhook_event::WebhookEvent;
pub use workflow::{
    Condition, ExecutionStatus, Operand, StepResult, StepStatus, Workflow, WorkflowExecution,
    WorkflowStatus, WorkflowStep, WorkflowTrigger,
};

