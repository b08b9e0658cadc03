use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::action::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Planning,
    Applying,
    Completed,
    Failed,
    Destroying,
    Destroyed,
}

string_enum!(DeploymentStatus, "deployment status", {
    Planning => "planning",
    Applying => "applying",
    Completed => "completed",
    Failed => "failed",
    Destroying => "destroying",
    Destroyed => "destroyed",
});

/// Lifecycle record of one Terraform deployment. The id equals the id of
/// the `terraform_apply` action that created it.
#[derive(Debug, Clone, Serialize)]
pub struct TerraformDeployment {
    pub id: Uuid,
    pub action_id: Uuid,
    pub name: String,
    pub provider: Provider,
    pub template_id: String,
    pub variables: serde_json::Value,
    pub status: DeploymentStatus,
    pub workdir: String,
    pub plan_output: Option<String>,
    pub output: Option<serde_json::Value>,
    pub logs: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TerraformDeployment {
    pub fn append_log(&mut self, stage: &str, text: &str) {
        if text.is_empty() {
            return;
        }
        self.logs.push_str(&format!("==> {stage}\n{text}"));
        if !text.ends_with('\n') {
            self.logs.push('\n');
        }
    }
}
