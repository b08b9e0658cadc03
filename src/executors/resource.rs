//! Executors for changes to a single compute or storage resource:
//! resize, stop, start, delete and storage-class changes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{
    ProviderError, ProviderExecutor, ProviderResult, RollbackError, Snapshot, ValidationResult,
};
use crate::cloud::{CloudApi, CloudRequest, ResourceState, catalog};
use crate::models::{Action, ActionParameters, ActionType, Provider, ResourceRef, SnapshotHandle};

pub struct ResourceExecutor {
    provider: Provider,
    action_type: ActionType,
    cloud: Arc<dyn CloudApi>,
}

impl ResourceExecutor {
    pub fn new(provider: Provider, action_type: ActionType, cloud: Arc<dyn CloudApi>) -> Self {
        Self {
            provider,
            action_type,
            cloud,
        }
    }

    fn resource<'a>(&self, action: &'a Action) -> Result<&'a ResourceRef, ProviderError> {
        action
            .resource
            .as_ref()
            .ok_or_else(|| ProviderError::Permanent(format!("{} requires a resource", self.action_type)))
    }

    fn operation_for(
        &self,
        action_type: ActionType,
        resource: &ResourceRef,
    ) -> Result<&'static str, ProviderError> {
        catalog::operation(action_type, &resource.resource_type).ok_or_else(|| {
            ProviderError::Permanent(format!(
                "UnsupportedOperation: {action_type} on {}",
                resource.resource_type
            ))
        })
    }

    async fn current(&self, resource: &ResourceRef) -> Result<ResourceState, ProviderError> {
        self.cloud.describe(resource).await?.ok_or_else(|| {
            ProviderError::Permanent(format!("ResourceNotFound: {}", resource.resource_id))
        })
    }

    fn request(
        &self,
        action: &Action,
        operation: &str,
        resource: &ResourceRef,
        arguments: Value,
        idempotency_key: &str,
    ) -> CloudRequest {
        CloudRequest {
            provider: self.provider,
            account_id: action.account_id.clone(),
            operation: operation.to_string(),
            resource: Some(resource.clone()),
            arguments,
            idempotency_key: idempotency_key.to_string(),
        }
    }

    fn arguments(&self, action: &Action) -> Value {
        match &action.parameters {
            ActionParameters::Resize(p) => json!({
                "target_size": p.target_size,
                "apply_immediately": p.apply_immediately,
            }),
            ActionParameters::Stop(p) => json!({ "force": p.force, "deallocate": p.deallocate }),
            ActionParameters::Delete(p) => json!({ "force": p.force }),
            ActionParameters::OptimizeStorage(p) => json!({ "storage_class": p.storage_class }),
            _ => json!({}),
        }
    }

    /// Whether `state` shows the end state this action asks for.
    fn reached(&self, action: &Action, state: Option<&ResourceState>) -> bool {
        match (&action.parameters, state) {
            (ActionParameters::Delete(_), state) => state.is_none(),
            (ActionParameters::Resize(p), Some(s)) => s.size.as_deref() == Some(p.target_size.as_str()),
            (ActionParameters::Stop(p), Some(s)) => {
                let want: &[&str] = if p.deallocate {
                    &["deallocated"]
                } else {
                    &["stopped", "deallocated"]
                };
                s.power_state.as_deref().is_some_and(|ps| want.contains(&ps))
            }
            (ActionParameters::Start(_), Some(s)) => s.power_state.as_deref() == Some("running"),
            (ActionParameters::OptimizeStorage(p), Some(s)) => {
                s.storage_class.as_deref() == Some(p.storage_class.as_str())
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ProviderExecutor for ResourceExecutor {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn action_type(&self) -> ActionType {
        self.action_type
    }

    fn description(&self) -> String {
        let types = catalog::accepted_types(self.action_type, self.provider).join(", ");
        format!("{} on {} ({types})", self.action_type, self.provider)
    }

    async fn validate(&self, action: &Action) -> Result<ValidationResult, ProviderError> {
        let Some(resource) = action.resource.as_ref() else {
            return Ok(ValidationResult::invalid(format!(
                "{} requires resource_id and resource_type",
                self.action_type
            )));
        };

        let mut result = ValidationResult::ok();
        if resource.provider != self.provider {
            result.error(format!(
                "resource belongs to {}, executor handles {}",
                resource.provider, self.provider
            ));
        }
        let accepted = catalog::accepted_types(self.action_type, self.provider);
        if !accepted.contains(&resource.resource_type.as_str()) {
            result.error(format!(
                "{} does not apply to {} resources (accepted: {})",
                self.action_type,
                resource.resource_type,
                accepted.join(", ")
            ));
            return Ok(result);
        }

        match &action.parameters {
            ActionParameters::Resize(p) => {
                if let Err(e) = catalog::validate_size(self.provider, &p.target_size) {
                    result.error(e);
                }
            }
            ActionParameters::OptimizeStorage(p) => {
                if let Err(e) = catalog::validate_storage_class(self.provider, &p.storage_class) {
                    result.error(e);
                }
            }
            _ => {}
        }
        if !result.is_valid() {
            return Ok(result);
        }

        let Some(state) = self.cloud.describe(resource).await? else {
            result.error(format!("resource {} not found", resource.resource_id));
            return Ok(result);
        };

        match &action.parameters {
            ActionParameters::Resize(p) if state.size.as_deref() == Some(p.target_size.as_str()) => {
                result.error(format!("resource is already {}", p.target_size));
            }
            ActionParameters::Stop(_) if self.reached(action, Some(&state)) => {
                result.warn("resource is already stopped");
            }
            ActionParameters::Start(_) if self.reached(action, Some(&state)) => {
                result.warn("resource is already running");
            }
            ActionParameters::OptimizeStorage(p)
                if state.storage_class.as_deref() == Some(p.storage_class.as_str()) =>
            {
                result.error(format!("storage class is already {}", p.storage_class));
            }
            _ => {}
        }
        Ok(result)
    }

    async fn snapshot(&self, action: &Action) -> Result<Snapshot, ProviderError> {
        if self.action_type == ActionType::DeleteResource {
            return Ok(Snapshot::Unsupported(
                "deleting a resource cannot be reversed".to_string(),
            ));
        }

        let resource = self.resource(action)?;
        let state = self.current(resource).await?;
        let captured = match self.action_type {
            ActionType::ResizeResource => json!({ "size": state.size }),
            ActionType::StopResource | ActionType::StartResource => {
                json!({ "power_state": state.power_state })
            }
            ActionType::OptimizeStorage => json!({ "storage_class": state.storage_class }),
            _ => return Ok(Snapshot::Unsupported(format!("no snapshot for {}", self.action_type))),
        };
        Ok(Snapshot::Captured(SnapshotHandle::new(captured)))
    }

    async fn apply(
        &self,
        action: &Action,
        idempotency_key: &str,
    ) -> Result<ProviderResult, ProviderError> {
        let resource = self.resource(action)?;
        let operation = self.operation_for(self.action_type, resource)?;
        let request = self.request(
            action,
            operation,
            resource,
            self.arguments(action),
            idempotency_key,
        );
        let response = self.cloud.invoke(&request).await?;

        Ok(ProviderResult::new(
            format!("{operation} accepted for {}", resource.resource_id),
            response,
        )
        .with_savings(action.estimated_savings))
    }

    async fn verify(
        &self,
        action: &Action,
        _applied: &ProviderResult,
    ) -> Result<bool, ProviderError> {
        let resource = self.resource(action)?;
        let state = self.cloud.describe(resource).await?;
        Ok(self.reached(action, state.as_ref()))
    }

    async fn rollback(
        &self,
        action: &Action,
        snapshot: &SnapshotHandle,
    ) -> Result<ProviderResult, RollbackError> {
        let resource = self.resource(action)?;
        let key = format!("{}-rollback", action.idempotency_key());
        let prior = &snapshot.state;

        let (action_type, arguments) = match self.action_type {
            ActionType::ResizeResource => {
                let size = prior["size"]
                    .as_str()
                    .ok_or_else(|| RollbackError::Unsupported("prior size unknown".into()))?;
                (ActionType::ResizeResource, json!({ "target_size": size }))
            }
            ActionType::StopResource | ActionType::StartResource => {
                match prior["power_state"].as_str() {
                    Some("running") => (ActionType::StartResource, json!({})),
                    Some("stopped") => (ActionType::StopResource, json!({})),
                    Some("deallocated") => {
                        (ActionType::StopResource, json!({ "deallocate": true }))
                    }
                    other => {
                        return Err(RollbackError::Unsupported(format!(
                            "prior power state {other:?} cannot be restored"
                        )));
                    }
                }
            }
            ActionType::OptimizeStorage => {
                let class = prior["storage_class"].as_str().ok_or_else(|| {
                    RollbackError::Unsupported("prior storage class unknown".into())
                })?;
                (ActionType::OptimizeStorage, json!({ "storage_class": class }))
            }
            other => {
                return Err(RollbackError::Unsupported(format!("{other} cannot be reversed")));
            }
        };

        let operation = self.operation_for(action_type, resource)?;
        let request = self.request(action, operation, resource, arguments, &key);
        let response = self.cloud.invoke(&request).await?;
        Ok(ProviderResult::new(
            format!("{operation} restored {} to its prior state", resource.resource_id),
            response,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{Fault, SimulatedCloud};
    use crate::models::{CreateAction, ResourceRef};

    fn action(action_type: &str, resource_id: &str, resource_type: &str, params: Value) -> Action {
        let request: CreateAction = serde_json::from_value(json!({
            "type": action_type,
            "provider": "aws",
            "resource_id": resource_id,
            "resource_type": resource_type,
            "parameters": params,
        }))
        .unwrap();
        let parsed = ActionParameters::parse(request.action_type, &request.parameters).unwrap();
        let resource = ResourceRef::new(Provider::Aws, resource_id, resource_type);
        Action::draft(&request, parsed, Some(resource), uuid::Uuid::now_v7())
    }

    fn setup() -> (Arc<SimulatedCloud>, ResourceRef) {
        let cloud = Arc::new(SimulatedCloud::new());
        cloud.seed_instance(Provider::Aws, "i-abc", "ec2_instance", "m5.xlarge");
        (cloud, ResourceRef::new(Provider::Aws, "i-abc", "ec2_instance"))
    }

    #[tokio::test]
    async fn resize_round_trip_through_rollback() {
        let (cloud, r) = setup();
        let exec = ResourceExecutor::new(Provider::Aws, ActionType::ResizeResource, cloud.clone());
        let a = action("resize_resource", "i-abc", "ec2_instance", json!({ "instance_type": "m5.large" }));

        assert!(exec.validate(&a).await.unwrap().is_valid());
        let Snapshot::Captured(snap) = exec.snapshot(&a).await.unwrap() else {
            panic!("resize must snapshot");
        };
        let applied = exec.apply(&a, &a.idempotency_key()).await.unwrap();
        assert!(exec.verify(&a, &applied).await.unwrap());

        exec.rollback(&a, &snap).await.unwrap();
        assert_eq!(cloud.state(&r).unwrap().size.as_deref(), Some("m5.xlarge"));
    }

    #[tokio::test]
    async fn resize_to_current_size_is_invalid() {
        let (cloud, _) = setup();
        let exec = ResourceExecutor::new(Provider::Aws, ActionType::ResizeResource, cloud);
        let a = action("resize_resource", "i-abc", "ec2_instance", json!({ "target_size": "m5.xlarge" }));
        assert!(!exec.validate(&a).await.unwrap().is_valid());
    }

    #[tokio::test]
    async fn wrong_resource_type_is_invalid() {
        let (cloud, _) = setup();
        let exec = ResourceExecutor::new(Provider::Aws, ActionType::OptimizeStorage, cloud);
        let a = action("optimize_storage", "i-abc", "ec2_instance", json!({ "storage_class": "GLACIER" }));
        let v = exec.validate(&a).await.unwrap();
        assert!(v.message().contains("does not apply"), "{}", v.message());
    }

    #[tokio::test]
    async fn delete_has_no_snapshot() {
        let (cloud, _) = setup();
        let exec = ResourceExecutor::new(Provider::Aws, ActionType::DeleteResource, cloud);
        let a = action("delete_resource", "i-abc", "ec2_instance", json!({}));
        assert!(matches!(exec.snapshot(&a).await.unwrap(), Snapshot::Unsupported(_)));
    }

    #[tokio::test]
    async fn ignored_stop_fails_verification() {
        let (cloud, _) = setup();
        cloud.inject("stop_instance", Fault::Ignore, 1);
        let exec = ResourceExecutor::new(Provider::Aws, ActionType::StopResource, cloud);
        let a = action("stop_resource", "i-abc", "ec2_instance", json!({}));
        let applied = exec.apply(&a, "k").await.unwrap();
        assert!(!exec.verify(&a, &applied).await.unwrap());
    }
}
