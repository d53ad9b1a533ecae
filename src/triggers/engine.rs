//! Trigger engine: arms and tears down the four watcher kinds per workflow.
//!
//! Watchers are plain tokio tasks. The engine re-syncs whenever the manager
//! reports a structural change: a workflow whose trigger signature changed
//! gets its watchers rebuilt (which also resets per-session watcher state),
//! everything else is left running. Teardown aborts every task, symmetric
//! with setup.

use crate::page::PageController;
use crate::triggers::policy::TriggerPolicyGate;
use crate::triggers::webhook::ConnectionManager;
use crate::triggers::{browser, dom, schedule, TriggerFire};
use crate::workflow::manager::WorkflowManager;
use crate::workflow::runner::WorkflowRunner;
use crate::workflow::schema::{Trigger, TriggerConfig, Workflow};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;

struct WorkflowWatchers {
    signature: String,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkflowWatchers {
    fn abort(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

/// Coordinates trigger watchers for every workflow.
pub struct TriggerEngine {
    manager: Arc<WorkflowManager>,
    page: Arc<dyn PageController>,
    fire: Arc<TriggerFire>,
    connections: ConnectionManager,
    watchers: Mutex<HashMap<String, WorkflowWatchers>>,
}

impl TriggerEngine {
    pub fn new(
        manager: Arc<WorkflowManager>,
        page: Arc<dyn PageController>,
        gate: Arc<TriggerPolicyGate>,
        runner: Arc<WorkflowRunner>,
    ) -> Self {
        let fire = Arc::new(TriggerFire::new(gate, runner));
        let connections = ConnectionManager::new(manager.clone(), fire.clone());
        Self {
            manager,
            page,
            fire,
            connections,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Arm everything, then follow manager revisions until shutdown.
    pub async fn run(&self) {
        let mut revisions = self.manager.subscribe();
        self.sync_all();
        while revisions.changed().await.is_ok() {
            self.sync_all();
        }
    }

    /// Reconcile watcher tasks and webhook sockets with the current
    /// workflow collection.
    pub fn sync_all(&self) {
        let workflows = self.manager.list();
        let live: HashSet<&str> = workflows.iter().map(|w| w.id.as_str()).collect();

        {
            let mut watchers = self.watchers.lock();
            let stale: Vec<String> = watchers
                .keys()
                .filter(|id| !live.contains(id.as_str()))
                .cloned()
                .collect();
            for id in stale {
                if let Some(old) = watchers.remove(&id) {
                    old.abort();
                }
                self.connections.close(&id);
                tracing::info!(workflow = %id, "watchers removed");
            }

            for workflow in &workflows {
                let signature = trigger_signature(workflow);
                let rebuild = watchers
                    .get(&workflow.id)
                    .map(|w| w.signature != signature)
                    .unwrap_or(true);
                if rebuild {
                    if let Some(old) = watchers.remove(&workflow.id) {
                        old.abort();
                    }
                    let tasks = self.arm(workflow);
                    if !tasks.is_empty() {
                        tracing::info!(
                            workflow = %workflow.id,
                            watchers = tasks.len(),
                            "watchers armed"
                        );
                    }
                    watchers.insert(workflow.id.clone(), WorkflowWatchers { signature, tasks });
                }
            }
        }

        for workflow in &workflows {
            self.connections.sync(workflow);
        }
    }

    /// Spawn watcher tasks for one workflow. Paused workflows get none.
    fn arm(&self, workflow: &Workflow) -> Vec<JoinHandle<()>> {
        if !workflow.is_active() {
            return Vec::new();
        }

        let mut tasks = Vec::new();
        let mut browser_triggers: Vec<Trigger> = Vec::new();

        for trigger in workflow.triggers.iter().filter(|t| t.enabled) {
            match &trigger.config {
                TriggerConfig::Schedule(cfg) => {
                    tasks.push(tokio::spawn(schedule::watch(
                        workflow.id.clone(),
                        trigger.clone(),
                        cfg.clone(),
                        self.fire.clone(),
                    )));
                }
                TriggerConfig::DomCondition(cfg) => {
                    tasks.push(tokio::spawn(dom::watch(
                        workflow.id.clone(),
                        trigger.clone(),
                        cfg.clone(),
                        self.page.clone(),
                        self.fire.clone(),
                    )));
                }
                TriggerConfig::BrowserEvent(_) => browser_triggers.push(trigger.clone()),
                // Sockets are owned by the connection manager, not a task
                // per trigger.
                TriggerConfig::WebhookWs(_) => {}
            }
        }

        if !browser_triggers.is_empty() {
            tasks.push(tokio::spawn(browser::watch(
                workflow.id.clone(),
                browser_triggers,
                self.page.clone(),
                self.fire.clone(),
            )));
        }

        tasks
    }

    /// Close and re-open a workflow's webhook socket.
    pub fn restart_websocket(&self, workflow_id: &str) {
        self.connections.close(workflow_id);
        if let Err(e) = self.manager.request_websocket_restart(workflow_id) {
            tracing::warn!(workflow = workflow_id, "websocket restart failed: {e}");
            return;
        }
        if let Some(workflow) = self.manager.get(workflow_id) {
            self.connections.sync(&workflow);
        }
    }

    /// Abort every watcher task and close every socket.
    pub fn shutdown(&self) {
        let mut watchers = self.watchers.lock();
        for (_, entry) in watchers.drain() {
            entry.abort();
        }
        self.connections.dispose_all();
        tracing::info!("trigger engine shut down");
    }

    /// Armed watcher tasks for a workflow (tests and diagnostics).
    pub fn watcher_count(&self, workflow_id: &str) -> usize {
        self.watchers
            .lock()
            .get(workflow_id)
            .map(|w| w.tasks.len())
            .unwrap_or(0)
    }

    pub fn open_socket_count(&self) -> usize {
        self.connections.open_count()
    }
}

/// Stable digest of the parts watchers depend on. Excludes volatile fields
/// (last-event stamps, socket state) so firing a trigger does not rebuild
/// its watcher.
fn trigger_signature(workflow: &Workflow) -> String {
    let parts: Vec<_> = workflow
        .triggers
        .iter()
        .map(|t| (&t.id, t.enabled, &t.config))
        .collect();
    serde_json::to_string(&(
        &workflow.status,
        &parts,
        &workflow.settings.ws_endpoint,
    ))
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::schema::{
        ScheduleMode, ScheduleTimezone, ScheduleTriggerConfig, WorkflowStatus,
    };

    #[test]
    fn test_signature_ignores_last_event() {
        let mut workflow = Workflow::new("Sig");
        workflow.triggers.push(Trigger {
            id: "t1".to_string(),
            name: "tick".to_string(),
            enabled: true,
            config: TriggerConfig::Schedule(ScheduleTriggerConfig {
                mode: ScheduleMode::EveryMinutes,
                every_minutes: Some(5),
                every_ms: None,
                daily_time: None,
                cron_expression: None,
                timezone: ScheduleTimezone::Local,
                jitter_ms: 0,
            }),
            last_event: None,
        });

        let before = trigger_signature(&workflow);
        workflow.triggers[0].last_event = Some(12345);
        assert_eq!(before, trigger_signature(&workflow));

        workflow.triggers[0].enabled = false;
        assert_ne!(before, trigger_signature(&workflow));

        workflow.triggers[0].enabled = true;
        workflow.status = WorkflowStatus::Idle;
        assert_ne!(before, trigger_signature(&workflow));
    }
}
