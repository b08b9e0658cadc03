use std::sync::Arc;

use tokio::runtime::Handle;
use uuid::Uuid;

use crate::cloud::CloudApi;
use crate::config::Config;
use crate::db::ActionStore;
use crate::engine::{
    ActionService, ApprovalManager, Dispatcher, ExecutionCoordinator, PolicyTable, Reaper,
    Scheduler, WorkflowEngine,
};
use crate::events::Notifier;
use crate::events::delivery::Deliverer;
use crate::executors::ExecutorRegistry;
use crate::terraform::{TemplateSource, TerraformOrchestrator, TerraformRunner};

pub type SharedState = Arc<AppState>;

/// The pluggable edges: where state lives and how providers are reached.
pub struct Backends {
    pub store: Arc<dyn ActionStore>,
    pub cloud: Arc<dyn CloudApi>,
    pub terraform_runner: Arc<dyn TerraformRunner>,
    pub templates: Arc<dyn TemplateSource>,
    pub policy: PolicyTable,
}

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ActionStore>,
    pub executors: Arc<ExecutorRegistry>,
    pub actions: Arc<ActionService>,
    pub workflows: Arc<WorkflowEngine>,
    pub terraform: Arc<TerraformOrchestrator>,
    pub dispatcher: Arc<Dispatcher>,
    pub scheduler: Arc<Scheduler>,
    pub reaper: Arc<Reaper>,
    pub deliverer: Arc<Deliverer>,
}

impl AppState {
    /// Wire the engine together. Executions are spawned on `worker`.
    pub fn new(config: Config, backends: Backends, worker: Handle) -> Result<SharedState, String> {
        let Backends {
            store,
            cloud,
            terraform_runner,
            templates,
            policy,
        } = backends;

        let terraform = Arc::new(TerraformOrchestrator::new(
            store.clone(),
            terraform_runner,
            templates,
            config.terraform.workdir.clone(),
        ));
        let executors = Arc::new(ExecutorRegistry::standard(cloud, terraform.clone()));
        let notifier = Arc::new(Notifier::new(store.clone(), config.webhooks.urls.clone()));
        let deliverer = Arc::new(Deliverer::new(store.clone(), config.webhooks.secret.clone())?);

        let worker_id = format!("worker-{}", Uuid::now_v7());
        let coordinator = Arc::new(ExecutionCoordinator::new(
            store.clone(),
            executors.clone(),
            notifier.clone(),
            config.execution.clone(),
            worker_id,
            config.scheduler.liveness_timeout / 3,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            coordinator,
            worker,
            config.scheduler.worker_count,
        ));

        let approvals = Arc::new(ApprovalManager::new(store.clone(), policy));
        let actions = Arc::new(ActionService::new(
            store.clone(),
            executors.clone(),
            approvals,
            dispatcher.clone(),
            config.execution.validate_timeout,
        ));
        let workflows = Arc::new(WorkflowEngine::new(store.clone(), actions.clone()));
        let scheduler = Arc::new(Scheduler::new(store.clone(), dispatcher.clone()));
        let reaper = Arc::new(Reaper::new(
            store.clone(),
            notifier,
            config.scheduler.liveness_timeout,
        ));

        tracing::info!(
            "Engine ready: {} executor(s), pool of {}",
            executors.list().len(),
            config.scheduler.worker_count
        );

        Ok(Arc::new(AppState {
            config,
            store,
            executors,
            actions,
            workflows,
            terraform,
            dispatcher,
            scheduler,
            reaper,
            deliverer,
        }))
    }
}
