//! Narrow seam to the cloud providers. Executors speak provider-native
//! operation names through [`CloudApi`]; the implementation is either an
//! in-process simulation or an HTTP gateway per provider.

pub mod catalog;
pub mod gateway;
pub mod simulated;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{Provider, ResourceRef};

pub use gateway::GatewayCloud;
pub use simulated::{Fault, SimulatedCloud};

/// Provider failure, classified for the retry policy.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// Throttling, timeouts, transient network faults.
    #[error("Retryable provider error: {0}")]
    Retryable(String),
    /// Access denied, resource not found, invalid state at the provider.
    #[error("Permanent provider error: {0}")]
    Permanent(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ProviderError::Retryable(m) | ProviderError::Permanent(m) => m,
        }
    }
}

/// Observed state of a single cloud resource.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceState {
    pub resource_id: String,
    pub resource_type: String,
    #[serde(default)]
    pub power_state: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub storage_class: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: String,
    pub offering: String,
    pub quantity: u32,
    pub term_months: u32,
    pub state: String,
}

/// One mutating call against a provider.
#[derive(Debug, Clone, Serialize)]
pub struct CloudRequest {
    pub provider: Provider,
    pub account_id: Option<String>,
    /// Provider-native operation, e.g. `resize_vm` or `update_storage_class`.
    pub operation: String,
    pub resource: Option<ResourceRef>,
    pub arguments: serde_json::Value,
    /// Retried requests carry the same key so the provider applies them once.
    pub idempotency_key: String,
}

#[async_trait]
pub trait CloudApi: Send + Sync {
    /// `None` when the resource does not exist (or no longer exists).
    async fn describe(&self, resource: &ResourceRef) -> Result<Option<ResourceState>, ProviderError>;

    async fn invoke(&self, request: &CloudRequest) -> Result<serde_json::Value, ProviderError>;

    async fn describe_reservation(
        &self,
        provider: Provider,
        reservation_id: &str,
    ) -> Result<Option<Reservation>, ProviderError>;
}
