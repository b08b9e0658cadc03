//! Approval policy as data. The built-in table can be replaced by a JSON
//! file (`CLOUDPILOT_POLICY_FILE`) with the same shape.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::models::{Action, ActionType, ApproverSpec, RiskLevel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoApprove {
    Always,
    Never,
    /// Auto-approve when the absolute cost impact and the risk stay within bounds.
    Below {
        max_cost_impact: f64,
        #[serde(default = "default_max_risk")]
        max_risk: RiskLevel,
    },
}

fn default_max_risk() -> RiskLevel {
    RiskLevel::High
}

fn default_approvers() -> Vec<ApproverSpec> {
    vec![ApproverSpec::Role("approver".to_string())]
}

fn default_min_approvals() -> i32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub action_type: ActionType,
    pub auto_approve: AutoApprove,
    #[serde(default = "default_approvers")]
    pub required_approvers: Vec<ApproverSpec>,
    #[serde(default = "default_min_approvals")]
    pub min_approvals: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyTable {
    pub rules: Vec<PolicyRule>,
    /// Resource tags that always force a human decision. A value of `*`
    /// matches any value of that key.
    #[serde(default)]
    pub protected_tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDecision {
    pub auto_approve: bool,
    pub required_approvers: Vec<ApproverSpec>,
    pub min_approvals: i32,
    pub reason: String,
}

impl Default for PolicyTable {
    fn default() -> Self {
        let rule = |action_type, auto_approve| PolicyRule {
            action_type,
            auto_approve,
            required_approvers: default_approvers(),
            min_approvals: 1,
        };
        let below = |max_cost_impact, max_risk| AutoApprove::Below {
            max_cost_impact,
            max_risk,
        };
        Self {
            rules: vec![
                rule(ActionType::AddTags, AutoApprove::Always),
                rule(ActionType::StopResource, below(100.0, RiskLevel::Low)),
                rule(ActionType::StartResource, below(100.0, RiskLevel::Medium)),
                rule(ActionType::ResizeResource, below(50.0, RiskLevel::Medium)),
                rule(ActionType::OptimizeStorage, below(50.0, RiskLevel::Medium)),
                rule(ActionType::DeleteResource, AutoApprove::Never),
                rule(ActionType::PurchaseReservation, AutoApprove::Never),
                rule(ActionType::TerraformApply, AutoApprove::Never),
                rule(ActionType::TerraformDestroy, AutoApprove::Never),
            ],
            protected_tags: BTreeMap::from([
                ("environment".to_string(), "production".to_string()),
                ("protected".to_string(), "true".to_string()),
            ]),
        }
    }
}

impl PolicyTable {
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read policy file {}: {e}", path.display()))?;
        let table: PolicyTable = serde_json::from_str(&raw)
            .map_err(|e| format!("Invalid policy file {}: {e}", path.display()))?;
        for rule in &table.rules {
            if rule.min_approvals < 1 {
                return Err(format!(
                    "Policy for {} needs min_approvals >= 1",
                    rule.action_type
                ));
            }
            if rule.required_approvers.is_empty() {
                return Err(format!(
                    "Policy for {} has no required approvers",
                    rule.action_type
                ));
            }
        }
        Ok(table)
    }

    fn protected_tag(&self, action: &Action) -> Option<String> {
        self.protected_tags.iter().find_map(|(key, expected)| {
            action
                .resource_tags
                .get(key)
                .filter(|v| expected == "*" || v.eq_ignore_ascii_case(expected))
                .map(|v| format!("{key}={v}"))
        })
    }

    pub fn evaluate(&self, action: &Action) -> PolicyDecision {
        let Some(rule) = self
            .rules
            .iter()
            .find(|r| r.action_type == action.action_type)
        else {
            return PolicyDecision {
                auto_approve: false,
                required_approvers: default_approvers(),
                min_approvals: 1,
                reason: format!("no policy for {}", action.action_type),
            };
        };

        let decide = |auto_approve: bool, reason: String| PolicyDecision {
            auto_approve,
            required_approvers: rule.required_approvers.clone(),
            min_approvals: rule.min_approvals,
            reason,
        };

        if let Some(tag) = self.protected_tag(action) {
            return decide(false, format!("resource is protected ({tag})"));
        }

        match &rule.auto_approve {
            AutoApprove::Always => decide(true, "auto-approved by policy".to_string()),
            AutoApprove::Never => decide(false, format!("{} always needs approval", action.action_type)),
            AutoApprove::Below {
                max_cost_impact,
                max_risk,
            } => {
                let cost = action.cost_impact.abs();
                if cost > *max_cost_impact {
                    decide(
                        false,
                        format!("cost impact {cost:.2} exceeds {max_cost_impact:.2}"),
                    )
                } else if action.risk > *max_risk {
                    decide(false, format!("risk {} exceeds {max_risk}", action.risk))
                } else {
                    decide(true, "within auto-approval limits".to_string())
                }
            }
        }
    }
}
