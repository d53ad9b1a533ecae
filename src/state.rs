use crate::config::AppConfig;
use crate::page::PageController;
use crate::runs::RunRegistry;
use crate::triggers::{TriggerEngine, TriggerPolicyGate};
use crate::workflow::runner::{StartContext, WorkflowRunner};
use crate::workflow::schema::{RunStatus, RunTrigger};
use crate::workflow::steps::StepExecutor;
use crate::workflow::WorkflowManager;
use std::sync::Arc;

/// Engine global state: the manager, run tracking, and the trigger engine,
/// all sharing one page controller.
#[derive(Clone)]
pub struct EngineState {
    pub config: Arc<AppConfig>,
    pub manager: Arc<WorkflowManager>,
    pub registry: Arc<RunRegistry>,
    pub runner: Arc<WorkflowRunner>,
    pub gate: Arc<TriggerPolicyGate>,
    pub triggers: Arc<TriggerEngine>,
}

impl EngineState {
    pub fn new(
        config: AppConfig,
        manager: Arc<WorkflowManager>,
        page: Arc<dyn PageController>,
    ) -> Self {
        let registry = Arc::new(RunRegistry::new());
        let executor = StepExecutor::new(page.clone(), manager.clone());
        let runner = Arc::new(WorkflowRunner::new(
            manager.clone(),
            registry.clone(),
            executor,
        ));
        let gate = Arc::new(TriggerPolicyGate::new(manager.clone(), registry.clone()));
        let triggers = Arc::new(TriggerEngine::new(
            manager.clone(),
            page,
            gate.clone(),
            runner.clone(),
        ));
        Self {
            config: Arc::new(config),
            manager,
            registry,
            runner,
            gate,
            triggers,
        }
    }

    /// Run a workflow manually, outside the trigger policy gate.
    pub async fn run_workflow(&self, workflow_id: &str) -> RunStatus {
        self.runner
            .run(workflow_id, RunTrigger::Manual, StartContext::default())
            .await
    }

    /// Flag every active run for cancellation.
    pub fn cancel_all_runs(&self) {
        self.registry.cancel_all();
    }

    /// Stop watchers, sockets, and flag runs; used on shutdown.
    pub fn shutdown(&self) {
        self.triggers.shutdown();
        self.registry.cancel_all();
    }
}
