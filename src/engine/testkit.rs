//! Shared fixtures for engine tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use super::{ActionService, ApprovalManager, Dispatcher, ExecutionCoordinator, PolicyTable};
use crate::cloud::SimulatedCloud;
use crate::config::ExecutionConfig;
use crate::db::{ActionStore, ClaimOutcome, MemoryStore};
use crate::events::Notifier;
use crate::executors::ExecutorRegistry;
use crate::models::{Action, ActionParameters, ActionStatus, ApprovalStatus, CreateAction, ResourceRef};
use crate::terraform::{StaticTemplates, TerraformOrchestrator, fake::FakeRunner};

pub const HOOK_URL: &str = "http://hooks.test/cloudpilot";

pub fn fast_config() -> ExecutionConfig {
    ExecutionConfig {
        max_attempts: 3,
        backoff_base: Duration::from_millis(1),
        backoff_max: Duration::from_millis(5),
        validate_timeout: Duration::from_secs(5),
        apply_timeout: Duration::from_secs(5),
        verify_timeout: Duration::from_millis(200),
        verify_poll: Duration::from_millis(10),
    }
}

pub struct Kit {
    pub store: Arc<MemoryStore>,
    pub cloud: Arc<SimulatedCloud>,
    pub executors: Arc<ExecutorRegistry>,
    pub notifier: Arc<Notifier>,
    pub coordinator: Arc<ExecutionCoordinator>,
}

impl Kit {
    pub fn new() -> Self {
        Self::with_registry(|_, _| {})
    }

    /// Build with a chance to swap executors in the standard registry.
    pub fn with_registry(customise: impl FnOnce(&mut ExecutorRegistry, Arc<SimulatedCloud>)) -> Self {
        let store = Arc::new(MemoryStore::new());
        let cloud = Arc::new(SimulatedCloud::new());
        let terraform = Arc::new(TerraformOrchestrator::new(
            store.clone(),
            Arc::new(FakeRunner::default()),
            Arc::new(StaticTemplates::default()),
            std::env::temp_dir().join(format!("cloudpilot-engine-{}", Uuid::now_v7())),
        ));
        let mut registry = ExecutorRegistry::standard(cloud.clone(), terraform);
        customise(&mut registry, cloud.clone());
        let executors = Arc::new(registry);
        let notifier = Arc::new(Notifier::new(store.clone(), vec![HOOK_URL.to_string()]));
        let coordinator = Arc::new(ExecutionCoordinator::new(
            store.clone(),
            executors.clone(),
            notifier.clone(),
            fast_config(),
            "test-worker",
            Duration::from_secs(1),
        ));
        Self {
            store,
            cloud,
            executors,
            notifier,
            coordinator,
        }
    }

    pub fn dispatcher(&self, pool_size: usize) -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            self.coordinator.clone(),
            tokio::runtime::Handle::current(),
            pool_size,
        ))
    }

    pub fn service(&self, dispatcher: Arc<Dispatcher>) -> Arc<ActionService> {
        Arc::new(ActionService::new(
            self.store.clone(),
            self.executors.clone(),
            Arc::new(ApprovalManager::new(self.store.clone(), PolicyTable::default())),
            dispatcher,
            fast_config().validate_timeout,
        ))
    }

    /// Insert an already-approved action and claim it.
    pub async fn claimed(&self, body: Value, resource: Option<ResourceRef>) -> Action {
        let action = self.approved(body, resource).await;
        match self
            .store
            .claim_action(action.id, action.version, "test-worker", chrono::Utc::now())
            .await
            .unwrap()
        {
            ClaimOutcome::Claimed(a) => a,
            other => panic!("claim failed: {other:?}"),
        }
    }

    pub async fn approved(&self, body: Value, resource: Option<ResourceRef>) -> Action {
        let mut action = draft(body, resource);
        action.status = ActionStatus::Approved;
        action.approval_status = ApprovalStatus::Approved;
        self.store.insert_action(&action).await.unwrap();
        action
    }

    /// Poll until the action leaves `executing` (or 5s pass).
    pub async fn settled(&self, id: Uuid) -> Action {
        for _ in 0..500 {
            let a = self.store.get_action(id).await.unwrap().unwrap();
            // A failed action may still be on its way to rolled_back.
            let settled = match a.status {
                ActionStatus::Failed => a
                    .result
                    .as_ref()
                    .is_some_and(|r| !r.message.ends_with("attempting rollback")),
                s => s.is_terminal(),
            };
            let recorded = self
                .store
                .last_history(id)
                .await
                .unwrap()
                .is_some_and(|h| h.status == a.status);
            if settled && recorded {
                return a;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("action {id} did not settle");
    }
}

pub fn request(body: Value) -> CreateAction {
    serde_json::from_value(body).unwrap()
}

pub fn draft(body: Value, resource: Option<ResourceRef>) -> Action {
    let request = request(body);
    let params = ActionParameters::parse(request.action_type, &request.parameters).unwrap();
    Action::draft(&request, params, resource, Uuid::now_v7())
}
