use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{
    ProviderError, ProviderExecutor, ProviderResult, RollbackError, Snapshot, ValidationResult,
};
use crate::cloud::{CloudApi, CloudRequest, catalog};
use crate::models::{Action, ActionParameters, ActionType, Provider, ResourceRef, SnapshotHandle};

/// Tag (label) changes. Tags are merged on apply and the full prior set is
/// written back on rollback.
pub struct TagsExecutor {
    provider: Provider,
    cloud: Arc<dyn CloudApi>,
}

impl TagsExecutor {
    pub fn new(provider: Provider, cloud: Arc<dyn CloudApi>) -> Self {
        Self { provider, cloud }
    }

    fn max_tags(&self) -> usize {
        match self.provider {
            Provider::Aws | Provider::Azure => 50,
            Provider::Gcp => 64,
        }
    }

    fn parts<'a>(
        &self,
        action: &'a Action,
    ) -> Result<(&'a ResourceRef, &'a BTreeMap<String, String>, &'static str), ProviderError> {
        let resource = action
            .resource
            .as_ref()
            .ok_or_else(|| ProviderError::Permanent("add_tags requires a resource".into()))?;
        let ActionParameters::AddTags(params) = &action.parameters else {
            return Err(ProviderError::Permanent("add_tags parameters expected".into()));
        };
        let operation = catalog::operation(ActionType::AddTags, &resource.resource_type)
            .ok_or_else(|| {
                ProviderError::Permanent(format!(
                    "UnsupportedOperation: add_tags on {}",
                    resource.resource_type
                ))
            })?;
        Ok((resource, &params.tags, operation))
    }

    fn request(
        &self,
        action: &Action,
        operation: &str,
        resource: &ResourceRef,
        tags: &BTreeMap<String, String>,
        replace: bool,
        key: String,
    ) -> CloudRequest {
        CloudRequest {
            provider: self.provider,
            account_id: action.account_id.clone(),
            operation: operation.to_string(),
            resource: Some(resource.clone()),
            arguments: json!({ "tags": tags, "replace": replace }),
            idempotency_key: key,
        }
    }
}

#[async_trait]
impl ProviderExecutor for TagsExecutor {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn action_type(&self) -> ActionType {
        ActionType::AddTags
    }

    fn description(&self) -> String {
        format!("add_tags on {}", self.provider)
    }

    async fn validate(&self, action: &Action) -> Result<ValidationResult, ProviderError> {
        let (resource, tags, _) = match self.parts(action) {
            Ok(parts) => parts,
            Err(e) => return Ok(ValidationResult::invalid(e.message())),
        };

        let mut result = ValidationResult::ok();
        if self.provider == Provider::Gcp {
            for key in tags.keys() {
                if key.chars().any(|c| c.is_ascii_uppercase() || c == ' ') {
                    result.error(format!("GCP label keys must be lowercase without spaces: {key}"));
                }
            }
        }

        let Some(state) = self.cloud.describe(resource).await? else {
            result.error(format!("resource {} not found", resource.resource_id));
            return Ok(result);
        };

        let mut merged = state.tags.clone();
        merged.extend(tags.clone());
        if merged.len() > self.max_tags() {
            result.error(format!(
                "{} allows at most {} tags per resource, this would leave {}",
                self.provider,
                self.max_tags(),
                merged.len()
            ));
        }
        if merged == state.tags {
            result.warn("all tags are already present");
        }
        Ok(result)
    }

    async fn snapshot(&self, action: &Action) -> Result<Snapshot, ProviderError> {
        let (resource, _, _) = self.parts(action)?;
        let state = self.cloud.describe(resource).await?.ok_or_else(|| {
            ProviderError::Permanent(format!("ResourceNotFound: {}", resource.resource_id))
        })?;
        Ok(Snapshot::Captured(SnapshotHandle::new(json!({ "tags": state.tags }))))
    }

    async fn apply(
        &self,
        action: &Action,
        idempotency_key: &str,
    ) -> Result<ProviderResult, ProviderError> {
        let (resource, tags, operation) = self.parts(action)?;
        let request = self.request(
            action,
            operation,
            resource,
            tags,
            false,
            idempotency_key.to_string(),
        );
        let response = self.cloud.invoke(&request).await?;
        Ok(ProviderResult::new(
            format!("{} tag(s) written to {}", tags.len(), resource.resource_id),
            response,
        ))
    }

    async fn verify(
        &self,
        action: &Action,
        _applied: &ProviderResult,
    ) -> Result<bool, ProviderError> {
        let (resource, tags, _) = self.parts(action)?;
        let Some(state) = self.cloud.describe(resource).await? else {
            return Ok(false);
        };
        Ok(tags.iter().all(|(k, v)| state.tags.get(k) == Some(v)))
    }

    async fn rollback(
        &self,
        action: &Action,
        snapshot: &SnapshotHandle,
    ) -> Result<ProviderResult, RollbackError> {
        let (resource, _, operation) = self.parts(action)?;
        let prior: BTreeMap<String, String> = serde_json::from_value(snapshot.state["tags"].clone())
            .map_err(|e| RollbackError::Unsupported(format!("prior tags unreadable: {e}")))?;
        let request = self.request(
            action,
            operation,
            resource,
            &prior,
            true,
            format!("{}-rollback", action.idempotency_key()),
        );
        let response = self.cloud.invoke(&request).await?;
        Ok(ProviderResult::new(
            format!("restored {} prior tag(s) on {}", prior.len(), resource.resource_id),
            response,
        ))
    }
}
