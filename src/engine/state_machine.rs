//! The action lifecycle graph. Every status change the engine makes goes
//! through [`transition`].

use chrono::Utc;

use super::EngineError;
use crate::models::{Action, ActionStatus};

/// The documented action lifecycle with exactly one addition:
/// `executing -> cancelled`, taken when a cancel request is seen between
/// steps before apply starts. Every other edge is the documented one.
pub fn can_transition(from: ActionStatus, to: ActionStatus) -> bool {
    use ActionStatus::*;
    matches!(
        (from, to),
        (Draft, PendingApproval)
            | (Draft, Approved)
            | (PendingApproval, Approved)
            | (PendingApproval, Rejected)
            | (PendingApproval, Cancelled)
            | (Approved, Scheduled)
            | (Approved, Executing)
            | (Approved, Cancelled)
            | (Scheduled, Executing)
            | (Scheduled, Cancelled)
            | (Executing, Completed)
            | (Executing, Failed)
            // Cancellation observed between steps, before apply started.
            | (Executing, Cancelled)
            | (Failed, RolledBack)
    )
}

pub fn validate_transition(from: ActionStatus, to: ActionStatus) -> Result<(), EngineError> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(EngineError::InvalidTransition { from, to })
    }
}

/// Move `action` to `to`, stamping `completed_at` on terminal statuses.
pub fn transition(action: &mut Action, to: ActionStatus) -> Result<(), EngineError> {
    validate_transition(action.status, to)?;
    let now = Utc::now();
    action.status = to;
    action.updated_at = now;
    if to.is_terminal() {
        action.completed_at = Some(now);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ActionStatus::*;

    const EDGES: &[(ActionStatus, ActionStatus)] = &[
        (Draft, PendingApproval),
        (Draft, Approved),
        (PendingApproval, Approved),
        (PendingApproval, Rejected),
        (PendingApproval, Cancelled),
        (Approved, Scheduled),
        (Approved, Executing),
        (Approved, Cancelled),
        (Scheduled, Executing),
        (Scheduled, Cancelled),
        (Executing, Completed),
        (Executing, Failed),
        (Executing, Cancelled),
        (Failed, RolledBack),
    ];

    #[test]
    fn executing_ends_in_an_outcome_or_an_early_cancel() {
        let exits: Vec<ActionStatus> = ActionStatus::ALL
            .iter()
            .copied()
            .filter(|to| can_transition(Executing, *to))
            .collect();
        assert_eq!(exits, vec![Completed, Failed, Cancelled]);
    }

    #[test]
    fn every_pair_matches_the_lifecycle_graph() {
        for from in ActionStatus::ALL {
            for to in ActionStatus::ALL {
                let expected = EDGES.contains(&(*from, *to));
                assert_eq!(
                    can_transition(*from, *to),
                    expected,
                    "{from} -> {to} should be {}",
                    if expected { "allowed" } else { "refused" }
                );
            }
        }
    }

    #[test]
    fn terminal_statuses_have_no_way_out() {
        for from in [Completed, Rejected, Cancelled, RolledBack] {
            for to in ActionStatus::ALL {
                assert!(!can_transition(from, *to), "{from} -> {to}");
            }
        }
        // Failed may only move on to rolled_back.
        let exits: Vec<_> = ActionStatus::ALL
            .iter()
            .filter(|to| can_transition(Failed, **to))
            .collect();
        assert_eq!(exits, vec![&RolledBack]);
    }

    #[test]
    fn no_status_returns_to_draft_or_repeats() {
        for s in ActionStatus::ALL {
            assert!(!can_transition(*s, Draft));
            assert!(!can_transition(*s, *s));
        }
    }

    #[test]
    fn refused_transition_reports_both_ends() {
        let err = validate_transition(Completed, Executing).unwrap_err();
        assert_eq!(err.to_string(), "Invalid transition from completed to executing");
    }
}
