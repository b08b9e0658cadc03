use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use super::TerraformOrchestrator;
use crate::cloud::{ProviderError, catalog};
use crate::executors::{
    ProviderExecutor, ProviderResult, RollbackError, Snapshot, ValidationResult,
};
use crate::models::{Action, ActionParameters, ActionType, DeploymentStatus, Provider, SnapshotHandle};

/// Creates infrastructure from a template. Rolling back destroys exactly
/// the deployment this action created.
pub struct TerraformApplyExecutor {
    provider: Provider,
    terraform: Arc<TerraformOrchestrator>,
}

impl TerraformApplyExecutor {
    pub fn new(provider: Provider, terraform: Arc<TerraformOrchestrator>) -> Self {
        Self { provider, terraform }
    }
}

#[async_trait]
impl ProviderExecutor for TerraformApplyExecutor {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn action_type(&self) -> ActionType {
        ActionType::TerraformApply
    }

    fn description(&self) -> String {
        format!("terraform init/plan/apply on {}", self.provider)
    }

    async fn validate(&self, action: &Action) -> Result<ValidationResult, ProviderError> {
        let ActionParameters::TerraformApply(params) = &action.parameters else {
            return Ok(ValidationResult::invalid("terraform_apply parameters expected"));
        };
        if action.provider != self.provider {
            return Ok(ValidationResult::invalid(format!(
                "executor for {} cannot run a {} action",
                self.provider, action.provider
            )));
        }

        let template = match self.terraform.template(&params.template_id).await {
            Ok(Some(t)) => t,
            Ok(None) => {
                return Ok(ValidationResult::invalid(format!(
                    "template {} not found",
                    params.template_id
                )));
            }
            Err(e) => return Ok(ValidationResult::invalid(e.message())),
        };

        let mut result = ValidationResult::ok();
        let missing = template.missing_variables(&params.variables);
        if !missing.is_empty() {
            result.error(format!("missing template variables: {}", missing.join(", ")));
        }
        if let Some(existing) = self.terraform.deployment(action.id).await? {
            match existing.status {
                DeploymentStatus::Destroying | DeploymentStatus::Destroyed => {
                    result.error(format!("deployment {} has been destroyed", existing.id));
                }
                DeploymentStatus::Completed => result.warn("deployment already applied"),
                _ => result.warn("resuming a previous deployment attempt"),
            }
        }
        Ok(result)
    }

    async fn snapshot(&self, action: &Action) -> Result<Snapshot, ProviderError> {
        let existed = self.terraform.deployment(action.id).await?.is_some();
        Ok(Snapshot::Captured(SnapshotHandle::new(json!({
            "deployment_id": action.id,
            "existed": existed,
        }))))
    }

    async fn apply(
        &self,
        action: &Action,
        _idempotency_key: &str,
    ) -> Result<ProviderResult, ProviderError> {
        let ActionParameters::TerraformApply(params) = &action.parameters else {
            return Err(ProviderError::Permanent(
                "terraform_apply parameters expected".into(),
            ));
        };
        let deployment = self.terraform.apply(action, params).await?;
        Ok(ProviderResult::new(
            format!("deployment {} applied", deployment.name),
            json!({
                "deployment_id": deployment.id,
                "status": deployment.status,
                "output": deployment.output,
            }),
        )
        .with_savings(action.estimated_savings))
    }

    async fn verify(&self, action: &Action, _applied: &ProviderResult) -> Result<bool, ProviderError> {
        self.terraform.plan_is_clean(action.id).await
    }

    async fn rollback(
        &self,
        action: &Action,
        snapshot: &SnapshotHandle,
    ) -> Result<ProviderResult, RollbackError> {
        let owner = snapshot.state["deployment_id"]
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok());
        if owner != Some(action.id) {
            return Err(RollbackError::Unsupported(
                "snapshot does not belong to this deployment".into(),
            ));
        }
        let deployment = self.terraform.destroy(action.id).await?;
        Ok(ProviderResult::new(
            format!("deployment {} destroyed", deployment.name),
            json!({ "deployment_id": deployment.id, "status": deployment.status }),
        ))
    }
}

/// Tears down a deployment created by an earlier `terraform_apply`.
pub struct TerraformDestroyExecutor {
    provider: Provider,
    terraform: Arc<TerraformOrchestrator>,
}

impl TerraformDestroyExecutor {
    pub fn new(provider: Provider, terraform: Arc<TerraformOrchestrator>) -> Self {
        Self { provider, terraform }
    }
}

#[async_trait]
impl ProviderExecutor for TerraformDestroyExecutor {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn action_type(&self) -> ActionType {
        ActionType::TerraformDestroy
    }

    fn description(&self) -> String {
        format!("terraform destroy on {}", self.provider)
    }

    async fn validate(&self, action: &Action) -> Result<ValidationResult, ProviderError> {
        let ActionParameters::TerraformDestroy(params) = &action.parameters else {
            return Ok(ValidationResult::invalid("terraform_destroy parameters expected"));
        };

        let mut result = ValidationResult::ok();
        match &action.resource {
            Some(r)
                if r.resource_type == catalog::TERRAFORM_DEPLOYMENT
                    && r.resource_id == params.deployment_id.to_string() => {}
            _ => result.error(format!(
                "resource must be the {} {}",
                catalog::TERRAFORM_DEPLOYMENT,
                params.deployment_id
            )),
        }

        match self.terraform.deployment(params.deployment_id).await? {
            None => result.error(format!("deployment {} not found", params.deployment_id)),
            Some(d) if d.provider != self.provider => result.error(format!(
                "deployment {} belongs to {}",
                d.id, d.provider
            )),
            Some(d) => match d.status {
                DeploymentStatus::Destroyed => {
                    result.error(format!("deployment {} is already destroyed", d.id))
                }
                DeploymentStatus::Destroying | DeploymentStatus::Planning | DeploymentStatus::Applying => {
                    result.error(format!("deployment {} is busy ({})", d.id, d.status))
                }
                DeploymentStatus::Failed => result.warn("deployment is in a failed state"),
                DeploymentStatus::Completed => {}
            },
        }
        Ok(result)
    }

    async fn snapshot(&self, _action: &Action) -> Result<Snapshot, ProviderError> {
        Ok(Snapshot::Unsupported(
            "destroyed infrastructure cannot be restored".into(),
        ))
    }

    async fn apply(
        &self,
        action: &Action,
        _idempotency_key: &str,
    ) -> Result<ProviderResult, ProviderError> {
        let ActionParameters::TerraformDestroy(params) = &action.parameters else {
            return Err(ProviderError::Permanent(
                "terraform_destroy parameters expected".into(),
            ));
        };
        let deployment = self.terraform.destroy(params.deployment_id).await?;
        Ok(ProviderResult::new(
            format!("deployment {} destroyed", deployment.name),
            json!({ "deployment_id": deployment.id, "status": deployment.status }),
        )
        .with_savings(action.estimated_savings))
    }

    async fn verify(&self, action: &Action, _applied: &ProviderResult) -> Result<bool, ProviderError> {
        let ActionParameters::TerraformDestroy(params) = &action.parameters else {
            return Ok(false);
        };
        Ok(self
            .terraform
            .remaining_resources(params.deployment_id)
            .await?
            .is_empty())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{CreateAction, ResourceRef};
    use crate::terraform::{StaticTemplates, Template, fake::FakeRunner};

    fn orchestrator() -> Arc<TerraformOrchestrator> {
        let template = Template {
            id: "bucket".into(),
            files: BTreeMap::from([("main.tf".to_string(), "# bucket".to_string())]),
            required_variables: vec!["bucket_name".into()],
        };
        Arc::new(TerraformOrchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeRunner::default()),
            Arc::new(StaticTemplates::default().with(template)),
            std::env::temp_dir().join(format!("cloudpilot-tfx-{}", Uuid::now_v7())),
        ))
    }

    fn action(body: serde_json::Value, resource: Option<ResourceRef>) -> Action {
        let request: CreateAction = serde_json::from_value(body).unwrap();
        let params = ActionParameters::parse(request.action_type, &request.parameters).unwrap();
        Action::draft(&request, params, resource, Uuid::now_v7())
    }

    fn apply_action(variables: serde_json::Value) -> Action {
        action(
            json!({
                "type": "terraform_apply",
                "provider": "gcp",
                "parameters": { "template_id": "bucket", "variables": variables },
            }),
            None,
        )
    }

    fn destroy_action(deployment_id: Uuid) -> Action {
        action(
            json!({
                "type": "terraform_destroy",
                "provider": "gcp",
                "parameters": { "deployment_id": deployment_id },
            }),
            Some(ResourceRef::new(
                Provider::Gcp,
                &deployment_id.to_string(),
                catalog::TERRAFORM_DEPLOYMENT,
            )),
        )
    }

    #[tokio::test]
    async fn apply_validates_template_and_variables() {
        let exec = TerraformApplyExecutor::new(Provider::Gcp, orchestrator());
        let missing = exec.validate(&apply_action(json!({}))).await.unwrap();
        assert!(missing.message().contains("bucket_name"));

        let mut unknown = apply_action(json!({}));
        unknown.parameters = ActionParameters::parse(
            ActionType::TerraformApply,
            &json!({ "template_id": "nope" }),
        )
        .unwrap();
        assert!(exec.validate(&unknown).await.unwrap().message().contains("not found"));
    }

    #[tokio::test]
    async fn apply_then_rollback_destroys_own_deployment() {
        let terraform = orchestrator();
        let exec = TerraformApplyExecutor::new(Provider::Gcp, terraform.clone());
        let a = apply_action(json!({ "bucket_name": "logs" }));

        assert!(exec.validate(&a).await.unwrap().is_valid());
        let Snapshot::Captured(snap) = exec.snapshot(&a).await.unwrap() else {
            panic!("apply must be reversible");
        };
        let applied = exec.apply(&a, &a.idempotency_key()).await.unwrap();
        assert_eq!(applied.response["deployment_id"], json!(a.id));
        assert!(exec.verify(&a, &applied).await.unwrap());

        exec.rollback(&a, &snap).await.unwrap();
        let d = terraform.deployment(a.id).await.unwrap().unwrap();
        assert_eq!(d.status, DeploymentStatus::Destroyed);
    }

    #[tokio::test]
    async fn rollback_refuses_foreign_snapshot() {
        let exec = TerraformApplyExecutor::new(Provider::Gcp, orchestrator());
        let a = apply_action(json!({ "bucket_name": "logs" }));
        let foreign = SnapshotHandle::new(json!({ "deployment_id": Uuid::now_v7() }));
        assert!(matches!(
            exec.rollback(&a, &foreign).await,
            Err(RollbackError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn destroy_checks_deployment_and_verifies_empty_state() {
        let terraform = orchestrator();
        let creator = apply_action(json!({ "bucket_name": "logs" }));
        TerraformApplyExecutor::new(Provider::Gcp, terraform.clone())
            .apply(&creator, &creator.idempotency_key())
            .await
            .unwrap();

        let exec = TerraformDestroyExecutor::new(Provider::Gcp, terraform.clone());
        let unknown = destroy_action(Uuid::now_v7());
        assert!(!exec.validate(&unknown).await.unwrap().is_valid());

        let d = destroy_action(creator.id);
        assert!(exec.validate(&d).await.unwrap().is_valid());
        assert!(matches!(exec.snapshot(&d).await.unwrap(), Snapshot::Unsupported(_)));
        let applied = exec.apply(&d, &d.idempotency_key()).await.unwrap();
        assert!(exec.verify(&d, &applied).await.unwrap());
        assert!(!exec.validate(&d).await.unwrap().is_valid());
    }
}
