//! Terraform deployment orchestration: one working directory and one state
//! file per deployment, driven through the `terraform` CLI.

mod executor;
#[cfg(test)]
pub mod fake;
pub mod runner;
pub mod templates;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::cloud::ProviderError;
use crate::db::{ActionStore, StoreError};
use crate::models::{Action, DeploymentStatus, TerraformDeployment};
use crate::models::parameters::TerraformApplyParams;

pub use executor::{TerraformApplyExecutor, TerraformDestroyExecutor};
pub use runner::{CliRunner, CommandOutput, TerraformRunner};
pub use templates::{DirectoryTemplates, StaticTemplates, Template, TemplateSource};

const PLAN_FILE: &str = "tfplan";
const VARS_FILE: &str = "terraform.tfvars.json";

pub struct TerraformOrchestrator {
    store: Arc<dyn ActionStore>,
    runner: Arc<dyn TerraformRunner>,
    templates: Arc<dyn TemplateSource>,
    work_root: PathBuf,
}

fn store_error(e: StoreError) -> ProviderError {
    ProviderError::Retryable(format!("deployment store: {e}"))
}

impl TerraformOrchestrator {
    pub fn new(
        store: Arc<dyn ActionStore>,
        runner: Arc<dyn TerraformRunner>,
        templates: Arc<dyn TemplateSource>,
        work_root: PathBuf,
    ) -> Self {
        Self {
            store,
            runner,
            templates,
            work_root,
        }
    }

    pub fn workdir(&self, deployment_id: Uuid) -> PathBuf {
        self.work_root.join(deployment_id.to_string())
    }

    pub async fn template(&self, template_id: &str) -> Result<Option<Template>, ProviderError> {
        self.templates
            .load(template_id)
            .await
            .map_err(ProviderError::Permanent)
    }

    pub async fn deployment(
        &self,
        id: Uuid,
    ) -> Result<Option<TerraformDeployment>, ProviderError> {
        self.store.get_deployment(id).await.map_err(store_error)
    }

    async fn save(&self, deployment: &mut TerraformDeployment) -> Result<(), ProviderError> {
        deployment.updated_at = Utc::now();
        self.store
            .update_deployment(deployment)
            .await
            .map_err(store_error)
    }

    async fn step(
        &self,
        deployment: &mut TerraformDeployment,
        stage: &str,
        args: &[&str],
        ok_codes: &[i32],
    ) -> Result<CommandOutput, ProviderError> {
        let workdir = PathBuf::from(&deployment.workdir);
        let output = self.runner.run(&workdir, args).await?;
        deployment.append_log(stage, &output.combined());
        if !ok_codes.contains(&output.exit_code) {
            return Err(runner::classify_failure(stage, &output));
        }
        Ok(output)
    }

    /// Deployments live strictly below the work root, one directory each.
    fn owned_workdir(&self, deployment: &TerraformDeployment) -> Result<(), ProviderError> {
        let workdir = Path::new(&deployment.workdir);
        if workdir != self.workdir(deployment.id) {
            return Err(ProviderError::Permanent(format!(
                "deployment {} has a foreign working directory {}",
                deployment.id, deployment.workdir
            )));
        }
        Ok(())
    }

    /// Render the template, plan and apply it. The deployment id equals the
    /// action id, so a retried apply resumes the same deployment.
    pub async fn apply(
        &self,
        action: &Action,
        params: &TerraformApplyParams,
    ) -> Result<TerraformDeployment, ProviderError> {
        let mut deployment = match self.deployment(action.id).await? {
            Some(d) if d.status == DeploymentStatus::Completed => return Ok(d),
            Some(d) if matches!(d.status, DeploymentStatus::Destroying | DeploymentStatus::Destroyed) => {
                return Err(ProviderError::Permanent(format!(
                    "deployment {} has been destroyed",
                    d.id
                )));
            }
            Some(d) => d,
            None => {
                let now = Utc::now();
                let deployment = TerraformDeployment {
                    id: action.id,
                    action_id: action.id,
                    name: params
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("{}-{}", params.template_id, action.id.simple())),
                    provider: action.provider,
                    template_id: params.template_id.clone(),
                    variables: serde_json::Value::Object(params.variables.clone()),
                    status: DeploymentStatus::Planning,
                    workdir: self.workdir(action.id).to_string_lossy().into_owned(),
                    plan_output: None,
                    output: None,
                    logs: String::new(),
                    created_at: now,
                    updated_at: now,
                };
                self.store
                    .insert_deployment(&deployment)
                    .await
                    .map_err(store_error)?;
                deployment
            }
        };
        self.owned_workdir(&deployment)?;

        match self.run_apply(&mut deployment, params).await {
            Ok(()) => {
                deployment.status = DeploymentStatus::Completed;
                self.save(&mut deployment).await?;
                tracing::info!("Terraform deployment {} applied", deployment.id);
                Ok(deployment)
            }
            Err(e) => {
                deployment.status = DeploymentStatus::Failed;
                deployment.append_log("error", e.message());
                self.save(&mut deployment).await?;
                tracing::warn!("Terraform deployment {} failed: {e}", deployment.id);
                Err(e)
            }
        }
    }

    async fn run_apply(
        &self,
        deployment: &mut TerraformDeployment,
        params: &TerraformApplyParams,
    ) -> Result<(), ProviderError> {
        let template = self.template(&params.template_id).await?.ok_or_else(|| {
            ProviderError::Permanent(format!("template {} not found", params.template_id))
        })?;
        let missing = template.missing_variables(&params.variables);
        if !missing.is_empty() {
            return Err(ProviderError::Permanent(format!(
                "missing template variables: {}",
                missing.join(", ")
            )));
        }

        let workdir = PathBuf::from(&deployment.workdir);
        write_workdir(&workdir, &template, &params.variables)
            .await
            .map_err(|e| ProviderError::Permanent(format!("workdir {}: {e}", workdir.display())))?;

        deployment.status = DeploymentStatus::Planning;
        self.save(deployment).await?;

        self.step(deployment, "init", &["init", "-input=false", "-no-color"], &[0])
            .await?;
        let plan_out = format!("-out={PLAN_FILE}");
        let plan = self
            .step(
                deployment,
                "plan",
                &["plan", "-input=false", "-no-color", "-detailed-exitcode", &plan_out],
                &[0, 2],
            )
            .await?;
        deployment.plan_output = Some(plan.stdout);
        deployment.status = DeploymentStatus::Applying;
        self.save(deployment).await?;

        self.step(
            deployment,
            "apply",
            &["apply", "-input=false", "-no-color", "-auto-approve", PLAN_FILE],
            &[0],
        )
        .await?;

        let output = self
            .step(deployment, "output", &["output", "-json", "-no-color"], &[0])
            .await?;
        deployment.output = Some(flatten_outputs(&output.stdout)?);
        Ok(())
    }

    /// True when a fresh plan shows no difference from the applied state.
    pub async fn plan_is_clean(&self, deployment_id: Uuid) -> Result<bool, ProviderError> {
        let mut deployment = self.deployment(deployment_id).await?.ok_or_else(|| {
            ProviderError::Permanent(format!("deployment {deployment_id} not found"))
        })?;
        self.owned_workdir(&deployment)?;
        let plan = self
            .step(
                &mut deployment,
                "verify",
                &["plan", "-input=false", "-no-color", "-detailed-exitcode"],
                &[0, 2],
            )
            .await?;
        self.save(&mut deployment).await?;
        Ok(plan.exit_code == 0)
    }

    /// Destroy what this deployment's own state file tracks and nothing else.
    pub async fn destroy(&self, deployment_id: Uuid) -> Result<TerraformDeployment, ProviderError> {
        let mut deployment = self.deployment(deployment_id).await?.ok_or_else(|| {
            ProviderError::Permanent(format!("deployment {deployment_id} not found"))
        })?;
        if deployment.status == DeploymentStatus::Destroyed {
            return Ok(deployment);
        }
        self.owned_workdir(&deployment)?;

        deployment.status = DeploymentStatus::Destroying;
        self.save(&mut deployment).await?;

        let destroyed = self
            .step(
                &mut deployment,
                "destroy",
                &["destroy", "-input=false", "-no-color", "-auto-approve"],
                &[0],
            )
            .await;
        match destroyed {
            Ok(_) => {
                deployment.status = DeploymentStatus::Destroyed;
                deployment.output = None;
                self.save(&mut deployment).await?;
                tracing::info!("Terraform deployment {} destroyed", deployment.id);
                Ok(deployment)
            }
            Err(e) => {
                deployment.status = DeploymentStatus::Failed;
                deployment.append_log("error", e.message());
                self.save(&mut deployment).await?;
                Err(e)
            }
        }
    }

    /// Addresses still present in the deployment's state file.
    pub async fn remaining_resources(&self, deployment_id: Uuid) -> Result<Vec<String>, ProviderError> {
        let deployment = self.deployment(deployment_id).await?.ok_or_else(|| {
            ProviderError::Permanent(format!("deployment {deployment_id} not found"))
        })?;
        self.owned_workdir(&deployment)?;
        let workdir = PathBuf::from(&deployment.workdir);
        let output = self.runner.run(&workdir, &["state", "list", "-no-color"]).await?;
        if output.exit_code != 0 {
            return Err(runner::classify_failure("state list", &output));
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }
}

async fn write_workdir(
    workdir: &Path,
    template: &Template,
    variables: &serde_json::Map<String, serde_json::Value>,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(workdir).await?;
    for (name, body) in &template.files {
        tokio::fs::write(workdir.join(name), body).await?;
    }
    let vars = serde_json::to_vec_pretty(variables).map_err(std::io::Error::other)?;
    tokio::fs::write(workdir.join(VARS_FILE), vars).await
}

/// `terraform output -json` wraps each value as `{"value": .., "type": ..}`.
fn flatten_outputs(raw: &str) -> Result<serde_json::Value, ProviderError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::json!({}));
    }
    let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_str(raw)
        .map_err(|e| ProviderError::Permanent(format!("unreadable terraform output: {e}")))?;
    Ok(serde_json::Value::Object(
        parsed
            .into_iter()
            .map(|(k, v)| {
                let value = v.get("value").cloned().unwrap_or(v);
                (k, value)
            })
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::models::{ActionParameters, ActionType, CreateAction};
    use fake::FakeRunner;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn web_template() -> Template {
        Template {
            id: "web".into(),
            files: BTreeMap::from([(
                "main.tf".to_string(),
                "variable \"region\" {}\nresource \"null_resource\" \"web\" {}\n".to_string(),
            )]),
            required_variables: vec!["region".into()],
        }
    }

    fn orchestrator(runner: Arc<FakeRunner>) -> (TerraformOrchestrator, PathBuf) {
        let root = std::env::temp_dir().join(format!("cloudpilot-tf-{}", Uuid::now_v7()));
        let orch = TerraformOrchestrator::new(
            Arc::new(MemoryStore::new()),
            runner,
            Arc::new(StaticTemplates::default().with(web_template())),
            root.clone(),
        );
        (orch, root)
    }

    fn apply_action(variables: serde_json::Value) -> (Action, TerraformApplyParams) {
        let request: CreateAction = serde_json::from_value(json!({
            "type": "terraform_apply",
            "provider": "aws",
            "parameters": { "template_id": "web", "variables": variables },
        }))
        .unwrap();
        let params = ActionParameters::parse(ActionType::TerraformApply, &request.parameters).unwrap();
        let ActionParameters::TerraformApply(p) = params.clone() else {
            unreachable!()
        };
        (Action::draft(&request, params, None, Uuid::now_v7()), p)
    }

    #[tokio::test]
    async fn apply_renders_plans_and_records_outputs() {
        let runner = Arc::new(FakeRunner::default());
        let (orch, root) = orchestrator(runner.clone());
        let (action, params) = apply_action(json!({ "region": "eu-west-1" }));

        let d = orch.apply(&action, &params).await.unwrap();
        assert_eq!(d.id, action.id);
        assert_eq!(d.status, DeploymentStatus::Completed);
        assert_eq!(d.output, Some(json!({ "endpoint": "10.0.0.1" })));
        assert!(d.plan_output.as_deref().unwrap().contains("1 to add"));
        assert!(d.logs.contains("==> apply"));

        let vars = tokio::fs::read_to_string(orch.workdir(action.id).join(VARS_FILE))
            .await
            .unwrap();
        assert!(vars.contains("eu-west-1"));
        assert_eq!(
            runner.commands(),
            vec!["init", "plan", "apply", "output"]
        );

        // Re-applying a completed deployment does not run terraform again.
        orch.apply(&action, &params).await.unwrap();
        assert_eq!(runner.commands().len(), 4);

        assert!(orch.plan_is_clean(action.id).await.unwrap());
        tokio::fs::remove_dir_all(root).await.unwrap();
    }

    #[tokio::test]
    async fn failed_apply_marks_deployment_failed() {
        let runner = Arc::new(FakeRunner::default());
        runner.script(
            "apply",
            CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "Error: UnauthorizedOperation".into(),
            },
        );
        let (orch, root) = orchestrator(runner);
        let (action, params) = apply_action(json!({ "region": "eu-west-1" }));

        let err = orch.apply(&action, &params).await.unwrap_err();
        assert!(!err.is_retryable());
        let d = orch.deployment(action.id).await.unwrap().unwrap();
        assert_eq!(d.status, DeploymentStatus::Failed);
        assert!(d.logs.contains("UnauthorizedOperation"));
        tokio::fs::remove_dir_all(root).await.unwrap();
    }

    #[tokio::test]
    async fn missing_variables_fail_before_running_terraform() {
        let runner = Arc::new(FakeRunner::default());
        let (orch, _root) = orchestrator(runner.clone());
        let (action, params) = apply_action(json!({}));

        let err = orch.apply(&action, &params).await.unwrap_err();
        assert!(err.message().contains("region"));
        assert!(runner.commands().is_empty());
    }

    #[tokio::test]
    async fn destroy_empties_state_and_is_idempotent() {
        let runner = Arc::new(FakeRunner::default());
        let (orch, root) = orchestrator(runner.clone());
        let (action, params) = apply_action(json!({ "region": "eu-west-1" }));
        orch.apply(&action, &params).await.unwrap();
        assert_eq!(orch.remaining_resources(action.id).await.unwrap().len(), 1);

        let d = orch.destroy(action.id).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Destroyed);
        assert!(orch.remaining_resources(action.id).await.unwrap().is_empty());

        orch.destroy(action.id).await.unwrap();
        assert_eq!(runner.commands().iter().filter(|c| *c == "destroy").count(), 1);

        let err = orch.apply(&action, &params).await.unwrap_err();
        assert!(err.message().contains("destroyed"));
        tokio::fs::remove_dir_all(root).await.unwrap();
    }

    #[test]
    fn outputs_are_unwrapped() {
        let raw = r#"{"ip":{"sensitive":false,"type":"string","value":"1.2.3.4"}}"#;
        assert_eq!(flatten_outputs(raw).unwrap(), json!({ "ip": "1.2.3.4" }));
        assert_eq!(flatten_outputs("").unwrap(), json!({}));
    }
}
