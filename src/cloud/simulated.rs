//! In-process cloud used in `simulated` provider mode and by the tests.
//! Applies operations to an in-memory resource table, honours idempotency
//! keys, and supports scripted faults.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{CloudApi, CloudRequest, ProviderError, Reservation, ResourceState};
use crate::models::{Provider, ResourceRef};

/// Scripted misbehaviour for one operation.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the call with this error.
    Error(ProviderError),
    /// Report success without changing anything.
    Ignore,
}

#[derive(Debug, Clone)]
pub struct CloudCall {
    pub operation: String,
    pub resource_id: Option<String>,
    pub idempotency_key: String,
}

#[derive(Default)]
struct Inner {
    resources: HashMap<String, ResourceState>,
    reservations: HashMap<String, (Provider, Reservation)>,
    faults: HashMap<String, Vec<Fault>>,
    applied: HashMap<(String, String), Value>,
    calls: Vec<CloudCall>,
}

#[derive(Default)]
pub struct SimulatedCloud {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every mutating call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn seed(&self, resource: &ResourceRef, state: ResourceState) {
        self.lock().resources.insert(resource.key(), state);
    }

    /// Convenience seed for a running compute instance.
    pub fn seed_instance(&self, provider: Provider, id: &str, resource_type: &str, size: &str) {
        let resource = ResourceRef::new(provider, id, resource_type);
        self.seed(
            &resource,
            ResourceState {
                resource_id: id.to_string(),
                resource_type: resource_type.to_string(),
                power_state: Some("running".to_string()),
                size: Some(size.to_string()),
                ..ResourceState::default()
            },
        );
    }

    /// Queue `times` copies of `fault` for the next calls to `operation`.
    pub fn inject(&self, operation: &str, fault: Fault, times: usize) {
        let mut inner = self.lock();
        let queue = inner.faults.entry(operation.to_string()).or_default();
        queue.extend(std::iter::repeat_n(fault, times));
    }

    pub fn state(&self, resource: &ResourceRef) -> Option<ResourceState> {
        self.lock().resources.get(&resource.key()).cloned()
    }

    pub fn calls(&self) -> Vec<CloudCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self, operation: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    fn apply(inner: &mut Inner, request: &CloudRequest) -> Result<Value, ProviderError> {
        let args = &request.arguments;
        let op = request.operation.as_str();

        if op.starts_with("purchase_") || op == "create_commitment" {
            let reservation_id = format!("res-{}", inner.reservations.len() + 1);
            let reservation = Reservation {
                reservation_id: reservation_id.clone(),
                offering: args["offering"].as_str().unwrap_or_default().to_string(),
                quantity: args["quantity"].as_u64().unwrap_or(1) as u32,
                term_months: args["term_months"].as_u64().unwrap_or(12) as u32,
                state: "active".to_string(),
            };
            inner
                .reservations
                .insert(reservation_id.clone(), (request.provider, reservation));
            return Ok(json!({ "reservation_id": reservation_id, "state": "active" }));
        }

        let resource = request
            .resource
            .as_ref()
            .ok_or_else(|| ProviderError::Permanent(format!("{op} requires a resource")))?;
        let key = resource.key();
        let state = inner.resources.get_mut(&key).ok_or_else(|| {
            ProviderError::Permanent(format!("ResourceNotFound: {}", resource.resource_id))
        })?;

        match op {
            "start_instance" | "start_vm" => {
                state.power_state = Some("running".to_string());
            }
            "stop_instance" | "stop_vm" => {
                let deallocate = args["deallocate"].as_bool().unwrap_or(false);
                state.power_state = Some(if deallocate { "deallocated" } else { "stopped" }.to_string());
            }
            "resize_instance" | "resize_vm" => {
                let size = args["target_size"].as_str().ok_or_else(|| {
                    ProviderError::Permanent("InvalidParameter: target_size".to_string())
                })?;
                state.size = Some(size.to_string());
            }
            "create_tags" | "update_tags" | "set_labels" => {
                let tags: std::collections::BTreeMap<String, String> =
                    serde_json::from_value(args["tags"].clone()).map_err(|e| {
                        ProviderError::Permanent(format!("InvalidParameter: tags: {e}"))
                    })?;
                if args["replace"].as_bool().unwrap_or(false) {
                    state.tags = tags;
                } else {
                    state.tags.extend(tags);
                }
            }
            "update_lifecycle" | "update_tier" | "update_storage_class" => {
                let class = args["storage_class"].as_str().ok_or_else(|| {
                    ProviderError::Permanent("InvalidParameter: storage_class".to_string())
                })?;
                state.storage_class = Some(class.to_string());
            }
            "terminate_instance" | "delete_instance" | "delete_vm" | "delete_bucket"
            | "delete_storage_account" => {
                inner.resources.remove(&key);
                return Ok(json!({ "resource_id": resource.resource_id, "deleted": true }));
            }
            other => {
                return Err(ProviderError::Permanent(format!(
                    "UnsupportedOperation: {other}"
                )));
            }
        }

        Ok(json!({ "resource_id": resource.resource_id, "state": state }))
    }
}

#[async_trait]
impl CloudApi for SimulatedCloud {
    async fn describe(&self, resource: &ResourceRef) -> Result<Option<ResourceState>, ProviderError> {
        Ok(self.state(resource))
    }

    async fn invoke(&self, request: &CloudRequest) -> Result<Value, ProviderError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.lock();
        inner.calls.push(CloudCall {
            operation: request.operation.clone(),
            resource_id: request.resource.as_ref().map(|r| r.resource_id.clone()),
            idempotency_key: request.idempotency_key.clone(),
        });

        let dedupe = (request.idempotency_key.clone(), request.operation.clone());
        if let Some(previous) = inner.applied.get(&dedupe) {
            return Ok(previous.clone());
        }

        let fault = inner
            .faults
            .get_mut(&request.operation)
            .filter(|q| !q.is_empty())
            .map(|q| q.remove(0));
        match fault {
            Some(Fault::Error(e)) => return Err(e),
            Some(Fault::Ignore) => {
                return Ok(json!({ "accepted": true }));
            }
            None => {}
        }

        let response = Self::apply(&mut inner, request)?;
        inner.applied.insert(dedupe, response.clone());
        Ok(response)
    }

    async fn describe_reservation(
        &self,
        provider: Provider,
        reservation_id: &str,
    ) -> Result<Option<Reservation>, ProviderError> {
        Ok(self
            .lock()
            .reservations
            .get(reservation_id)
            .filter(|(p, _)| *p == provider)
            .map(|(_, r)| r.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(op: &str, resource: &ResourceRef, args: Value, key: &str) -> CloudRequest {
        CloudRequest {
            provider: resource.provider,
            account_id: None,
            operation: op.to_string(),
            resource: Some(resource.clone()),
            arguments: args,
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn resize_changes_size() {
        let cloud = SimulatedCloud::new();
        cloud.seed_instance(Provider::Aws, "i-abc", "ec2_instance", "m5.xlarge");
        let r = ResourceRef::new(Provider::Aws, "i-abc", "ec2_instance");

        cloud
            .invoke(&request("resize_instance", &r, json!({ "target_size": "m5.large" }), "k1"))
            .await
            .unwrap();
        assert_eq!(cloud.state(&r).unwrap().size.as_deref(), Some("m5.large"));
    }

    #[tokio::test]
    async fn repeated_key_is_applied_once() {
        let cloud = SimulatedCloud::new();
        cloud.seed_instance(Provider::Aws, "i-abc", "ec2_instance", "m5.xlarge");
        let r = ResourceRef::new(Provider::Aws, "i-abc", "ec2_instance");
        let tag = |v: &str| json!({ "tags": { "n": v } });

        cloud.invoke(&request("create_tags", &r, tag("1"), "same")).await.unwrap();
        cloud.invoke(&request("create_tags", &r, tag("2"), "same")).await.unwrap();
        assert_eq!(cloud.state(&r).unwrap().tags["n"], "1");
        assert_eq!(cloud.call_count("create_tags"), 2);
    }

    #[tokio::test]
    async fn injected_faults_are_consumed_in_order() {
        let cloud = SimulatedCloud::new();
        cloud.seed_instance(Provider::Gcp, "vm-1", "compute_instance", "e2-medium");
        let r = ResourceRef::new(Provider::Gcp, "vm-1", "compute_instance");
        cloud.inject(
            "stop_instance",
            Fault::Error(ProviderError::Retryable("RateLimitExceeded".into())),
            1,
        );

        let first = cloud.invoke(&request("stop_instance", &r, json!({}), "k")).await;
        assert!(matches!(first, Err(ProviderError::Retryable(_))));
        cloud.invoke(&request("stop_instance", &r, json!({}), "k")).await.unwrap();
        assert_eq!(cloud.state(&r).unwrap().power_state.as_deref(), Some("stopped"));
    }

    #[tokio::test]
    async fn unknown_resource_is_permanent() {
        let cloud = SimulatedCloud::new();
        let r = ResourceRef::new(Provider::Azure, "vm-missing", "virtual_machine");
        let err = cloud
            .invoke(&request("stop_vm", &r, json!({}), "k"))
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
