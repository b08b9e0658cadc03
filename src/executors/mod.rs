//! Provider executors: one implementation per (provider, action type),
//! resolved through a static registry built at start-up.

pub mod reservation;
pub mod resource;
pub mod tags;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::cloud::CloudApi;
use crate::models::{Action, ActionType, Provider, SnapshotHandle};
use crate::terraform::TerraformOrchestrator;

pub use crate::cloud::ProviderError;

/// Outcome of the side-effect-free pre-flight check.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            errors: vec![error.into()],
            warnings: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(&mut self, error: impl Into<String>) {
        self.errors.push(error.into());
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn message(&self) -> String {
        self.errors.join("; ")
    }
}

/// Result of `snapshot`. Irreversible actions say so explicitly.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Captured(SnapshotHandle),
    Unsupported(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderResult {
    pub message: String,
    pub response: serde_json::Value,
    pub savings_realized: Option<f64>,
}

impl ProviderResult {
    pub fn new(message: impl Into<String>, response: serde_json::Value) -> Self {
        Self {
            message: message.into(),
            response,
            savings_realized: None,
        }
    }

    pub fn with_savings(mut self, savings: Option<f64>) -> Self {
        self.savings_realized = savings;
        self
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RollbackError {
    #[error("Rollback unsupported: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

#[async_trait]
pub trait ProviderExecutor: Send + Sync {
    fn provider(&self) -> Provider;
    fn action_type(&self) -> ActionType;
    fn description(&self) -> String;

    /// Pre-flight check. Must not change anything at the provider.
    async fn validate(&self, action: &Action) -> Result<ValidationResult, ProviderError>;

    /// Capture enough state to reverse `apply`.
    async fn snapshot(&self, action: &Action) -> Result<Snapshot, ProviderError>;

    /// Perform the change. Safe to repeat with the same `idempotency_key`.
    async fn apply(
        &self,
        action: &Action,
        idempotency_key: &str,
    ) -> Result<ProviderResult, ProviderError>;

    /// Check once whether the provider now shows the intended end state.
    async fn verify(&self, action: &Action, applied: &ProviderResult)
    -> Result<bool, ProviderError>;

    async fn rollback(
        &self,
        _action: &Action,
        _snapshot: &SnapshotHandle,
    ) -> Result<ProviderResult, RollbackError> {
        Err(RollbackError::Unsupported(format!(
            "{} cannot be reversed on {}",
            self.action_type(),
            self.provider()
        )))
    }
}

#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<(Provider, ActionType), Arc<dyn ProviderExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in executor for every provider.
    pub fn standard(cloud: Arc<dyn CloudApi>, terraform: Arc<TerraformOrchestrator>) -> Self {
        let mut registry = Self::new();
        for provider in Provider::ALL.iter().copied() {
            for action_type in [
                ActionType::ResizeResource,
                ActionType::StopResource,
                ActionType::StartResource,
                ActionType::DeleteResource,
                ActionType::OptimizeStorage,
            ] {
                registry.register(Arc::new(resource::ResourceExecutor::new(
                    provider,
                    action_type,
                    cloud.clone(),
                )));
            }
            registry.register(Arc::new(tags::TagsExecutor::new(provider, cloud.clone())));
            registry.register(Arc::new(reservation::ReservationExecutor::new(
                provider,
                cloud.clone(),
            )));
            registry.register(Arc::new(crate::terraform::TerraformApplyExecutor::new(
                provider,
                terraform.clone(),
            )));
            registry.register(Arc::new(crate::terraform::TerraformDestroyExecutor::new(
                provider,
                terraform.clone(),
            )));
        }
        registry
    }

    pub fn register(&mut self, executor: Arc<dyn ProviderExecutor>) {
        self.executors
            .insert((executor.provider(), executor.action_type()), executor);
    }

    pub fn get(
        &self,
        provider: Provider,
        action_type: ActionType,
    ) -> Option<&Arc<dyn ProviderExecutor>> {
        self.executors.get(&(provider, action_type))
    }

    /// Registered pairs in a stable order.
    pub fn list(&self) -> Vec<&Arc<dyn ProviderExecutor>> {
        let mut all: Vec<_> = self.executors.values().collect();
        all.sort_by_key(|e| (e.provider(), e.action_type()));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::SimulatedCloud;
    use crate::db::MemoryStore;
    use crate::terraform::{StaticTemplates, fake::FakeRunner};

    #[test]
    fn standard_registry_covers_every_pair() {
        let cloud: Arc<dyn CloudApi> = Arc::new(SimulatedCloud::new());
        let terraform = Arc::new(TerraformOrchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(FakeRunner::default()),
            Arc::new(StaticTemplates::default()),
            std::env::temp_dir().join("cloudpilot-registry-test"),
        ));
        let registry = ExecutorRegistry::standard(cloud, terraform);

        for provider in Provider::ALL {
            for action_type in ActionType::ALL {
                assert!(
                    registry.get(*provider, *action_type).is_some(),
                    "missing {provider}/{action_type}"
                );
            }
        }
        assert_eq!(registry.list().len(), Provider::ALL.len() * ActionType::ALL.len());
    }

    #[test]
    fn empty_registry_resolves_nothing() {
        let registry = ExecutorRegistry::new();
        assert!(registry.get(Provider::Aws, ActionType::StopResource).is_none());
    }

    #[test]
    fn validation_result_joins_errors() {
        let mut v = ValidationResult::ok();
        assert!(v.is_valid());
        v.error("a");
        v.error("b");
        v.warn("c");
        assert!(!v.is_valid());
        assert_eq!(v.message(), "a; b");
    }
}
