//! Workflow manager: owns the workflow collection, guards mutation rules,
//! and persists state through the storage backend.
//!
//! Structural edits (steps, triggers) are only legal while a workflow is
//! paused; an active workflow's shape is frozen so a running execution never
//! races an edit. Variables, runs, and settings mutate freely.

use crate::error::{Result, TabflowError};
use crate::storage::StorageBackend;
use crate::workflow::schema::{
    now_ms, AllowedSite, AtomicStep, ConditionalBlock, Run, RunArtifact, StepNode, StepRecord,
    Trigger, Workflow, WorkflowSettings, WorkflowStatus,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Storage key holding the serialized workflow collection.
const STORAGE_KEY: &str = "tabflow:workflows";

/// Which branch of a conditional block to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Branch {
    If,
    Else,
}

/// Manages workflow definitions and their run history.
pub struct WorkflowManager {
    storage: Arc<dyn StorageBackend>,
    workflows: RwLock<Vec<Workflow>>,
    revision_tx: watch::Sender<u64>,
}

impl WorkflowManager {
    /// Create a manager, hydrating from storage. A corrupt or missing
    /// collection starts empty; the stored state is only replaced on the
    /// next successful mutation.
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        let workflows = match Self::hydrate(storage.as_ref()) {
            Ok(list) => list,
            Err(e) => {
                tracing::warn!("Failed to load workflow state: {e}");
                Vec::new()
            }
        };
        let (revision_tx, _) = watch::channel(0);
        Self {
            storage,
            workflows: RwLock::new(workflows),
            revision_tx,
        }
    }

    fn hydrate(storage: &dyn StorageBackend) -> Result<Vec<Workflow>> {
        let mut data = storage.get(&[STORAGE_KEY])?;
        match data.remove(STORAGE_KEY) {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Vec::new()),
        }
    }

    fn persist(&self, workflows: &[Workflow]) {
        let value = match serde_json::to_value(workflows) {
            Ok(v) => v,
            Err(e) => {
                tracing::error!("Failed to serialize workflow state: {e}");
                return;
            }
        };
        let mut entries = HashMap::new();
        entries.insert(STORAGE_KEY.to_string(), value);
        if let Err(e) = self.storage.set(entries) {
            tracing::error!("Failed to persist workflow state: {e}");
        }
    }

    fn bump_revision(&self) {
        self.revision_tx.send_modify(|rev| *rev += 1);
    }

    /// Revision channel for watcher resynchronization.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }

    // ==================== Queries ====================

    pub fn list(&self) -> Vec<Workflow> {
        self.workflows.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<Workflow> {
        self.workflows.read().iter().find(|w| w.id == id).cloned()
    }

    // ==================== Workflow CRUD ====================

    pub fn add(&self, workflow: Workflow) -> Result<()> {
        let mut workflows = self.workflows.write();
        if workflows.iter().any(|w| w.id == workflow.id) {
            return Err(TabflowError::Validation(format!(
                "Workflow {} already exists",
                workflow.id
            )));
        }
        workflows.push(workflow);
        self.persist(&workflows);
        drop(workflows);
        self.bump_revision();
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let mut workflows = self.workflows.write();
        let before = workflows.len();
        workflows.retain(|w| w.id != id);
        if workflows.len() == before {
            return Err(TabflowError::WorkflowNotFound(id.to_string()));
        }
        self.persist(&workflows);
        drop(workflows);
        self.bump_revision();
        Ok(())
    }

    pub fn set_status(&self, id: &str, status: WorkflowStatus) -> Result<()> {
        self.mutate(id, |w| {
            w.status = status;
            Ok(())
        })
    }

    pub fn rename(&self, id: &str, name: &str) -> Result<()> {
        self.mutate(id, |w| {
            w.name = name.to_string();
            Ok(())
        })
    }

    // ==================== Steps & triggers (paused-only) ====================

    pub fn add_step(&self, workflow_id: &str, step: StepNode) -> Result<()> {
        self.mutate_structural(workflow_id, |w| {
            w.steps.push(step);
            Ok(())
        })
    }

    pub fn update_step(&self, workflow_id: &str, step: StepNode) -> Result<()> {
        self.mutate_structural(workflow_id, |w| {
            match w.steps.iter_mut().find(|s| s.id() == step.id()) {
                Some(existing) => {
                    *existing = step;
                    Ok(())
                }
                None => Err(TabflowError::Validation(format!(
                    "Step {} not found",
                    step.id()
                ))),
            }
        })
    }

    pub fn delete_step(&self, workflow_id: &str, step_id: &str) -> Result<()> {
        self.mutate_structural(workflow_id, |w| {
            w.steps.retain(|s| s.id() != step_id);
            Ok(())
        })
    }

    pub fn reorder_steps(&self, workflow_id: &str, from: usize, to: usize) -> Result<()> {
        self.mutate_structural(workflow_id, |w| {
            if from >= w.steps.len() || to >= w.steps.len() {
                return Err(TabflowError::Validation(
                    "Step reorder index out of range".to_string(),
                ));
            }
            let step = w.steps.remove(from);
            w.steps.insert(to, step);
            Ok(())
        })
    }

    pub fn add_step_to_block(
        &self,
        workflow_id: &str,
        block_id: &str,
        branch: Branch,
        step: AtomicStep,
    ) -> Result<()> {
        self.mutate_block(workflow_id, block_id, move |block| {
            match branch {
                Branch::If => block.if_steps.push(step),
                Branch::Else => block.else_steps.push(step),
            }
            Ok(())
        })
    }

    pub fn delete_step_from_block(
        &self,
        workflow_id: &str,
        block_id: &str,
        branch: Branch,
        step_id: &str,
    ) -> Result<()> {
        self.mutate_block(workflow_id, block_id, move |block| {
            let steps = match branch {
                Branch::If => &mut block.if_steps,
                Branch::Else => &mut block.else_steps,
            };
            steps.retain(|s| s.id != step_id);
            Ok(())
        })
    }

    pub fn update_step_in_block(
        &self,
        workflow_id: &str,
        block_id: &str,
        branch: Branch,
        step: AtomicStep,
    ) -> Result<()> {
        self.mutate_block(workflow_id, block_id, move |block| {
            let steps = match branch {
                Branch::If => &mut block.if_steps,
                Branch::Else => &mut block.else_steps,
            };
            match steps.iter_mut().find(|s| s.id == step.id) {
                Some(existing) => {
                    *existing = step;
                    Ok(())
                }
                None => Err(TabflowError::Validation(format!(
                    "Step {} not found in block {block_id}",
                    step.id
                ))),
            }
        })
    }

    pub fn add_trigger(&self, workflow_id: &str, trigger: Trigger) -> Result<()> {
        crate::triggers::validate_trigger(&trigger)?;
        self.mutate_structural(workflow_id, |w| {
            w.triggers.push(trigger);
            Ok(())
        })
    }

    pub fn update_trigger(&self, workflow_id: &str, trigger: Trigger) -> Result<()> {
        crate::triggers::validate_trigger(&trigger)?;
        self.mutate_structural(workflow_id, |w| {
            match w.triggers.iter_mut().find(|t| t.id == trigger.id) {
                Some(existing) => {
                    *existing = trigger;
                    Ok(())
                }
                None => Err(TabflowError::Validation(format!(
                    "Trigger {} not found",
                    trigger.id
                ))),
            }
        })
    }

    pub fn delete_trigger(&self, workflow_id: &str, trigger_id: &str) -> Result<()> {
        self.mutate_structural(workflow_id, |w| {
            w.triggers.retain(|t| t.id != trigger_id);
            Ok(())
        })
    }

    /// Stamp a trigger's last admitted firing. Not a structural edit.
    pub fn touch_trigger(&self, workflow_id: &str, trigger_id: &str) {
        let _ = self.mutate_quiet(workflow_id, |w| {
            if let Some(trigger) = w.triggers.iter_mut().find(|t| t.id == trigger_id) {
                trigger.last_event = Some(now_ms());
            }
            Ok(())
        });
    }

    // ==================== Variables ====================

    pub fn set_variable(&self, workflow_id: &str, key: &str, value: &str) -> Result<()> {
        self.mutate_quiet(workflow_id, |w| {
            w.variables.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    pub fn delete_variable(&self, workflow_id: &str, key: &str) -> Result<()> {
        self.mutate_quiet(workflow_id, |w| {
            w.variables.remove(key);
            Ok(())
        })
    }

    // ==================== Settings ====================

    pub fn update_settings(
        &self,
        workflow_id: &str,
        update: impl FnOnce(&mut WorkflowSettings),
    ) -> Result<()> {
        self.mutate(workflow_id, |w| {
            update(&mut w.settings);
            Ok(())
        })
    }

    pub fn add_allowed_site(&self, workflow_id: &str, site: AllowedSite) -> Result<()> {
        self.mutate(workflow_id, |w| {
            if !w.settings.allowed_sites.contains(&site) {
                w.settings.allowed_sites.push(site);
            }
            Ok(())
        })
    }

    pub fn remove_allowed_site(&self, workflow_id: &str, host: &str) -> Result<()> {
        self.mutate(workflow_id, |w| {
            w.settings.allowed_sites.retain(|s| s.host != host);
            Ok(())
        })
    }

    /// Ask the connection manager to rebuild this workflow's socket.
    pub fn request_websocket_restart(&self, workflow_id: &str) -> Result<()> {
        self.mutate(workflow_id, |w| {
            w.settings.ws_connected = false;
            w.settings.ws_connect_requested = true;
            Ok(())
        })
    }

    /// Reflect the live socket state. Quiet: watcher resync must not churn
    /// on connection flaps.
    pub fn set_ws_connected(&self, workflow_id: &str, connected: bool) {
        let _ = self.mutate_quiet(workflow_id, |w| {
            w.settings.ws_connected = connected;
            Ok(())
        });
    }

    // ==================== Runs ====================

    /// Prepend a new run to the history.
    pub fn add_run(&self, workflow_id: &str, run: Run) -> Result<()> {
        self.mutate_quiet(workflow_id, |w| {
            w.runs.insert(0, run);
            w.run_count += 1;
            Ok(())
        })
    }

    pub fn update_run(
        &self,
        workflow_id: &str,
        run_id: &str,
        update: impl FnOnce(&mut Run),
    ) -> Result<()> {
        self.mutate_quiet(workflow_id, |w| {
            match w.runs.iter_mut().find(|r| r.id == run_id) {
                Some(run) => {
                    update(run);
                    Ok(())
                }
                None => Err(TabflowError::Validation(format!("Run {run_id} not found"))),
            }
        })
    }

    pub fn set_run_steps(&self, workflow_id: &str, run_id: &str, steps: Vec<StepRecord>) {
        let _ = self.update_run(workflow_id, run_id, |run| run.steps = steps);
    }

    pub fn push_run_artifact(&self, workflow_id: &str, run_id: &str, artifact: RunArtifact) {
        let _ = self.update_run(workflow_id, run_id, |run| run.artifacts.push(artifact));
    }

    pub fn delete_run(&self, workflow_id: &str, run_id: &str) -> Result<()> {
        self.mutate_quiet(workflow_id, |w| {
            w.runs.retain(|r| r.id != run_id);
            Ok(())
        })
    }

    pub fn clear_runs(&self, workflow_id: &str) -> Result<()> {
        self.mutate_quiet(workflow_id, |w| {
            w.runs.clear();
            Ok(())
        })
    }

    // ==================== Mutation plumbing ====================

    /// Mutate and notify watchers (status/settings/trigger-shape changes).
    fn mutate(&self, id: &str, f: impl FnOnce(&mut Workflow) -> Result<()>) -> Result<()> {
        self.mutate_inner(id, false, f)?;
        self.bump_revision();
        Ok(())
    }

    /// Mutate without a revision bump (runs, variables, last-event stamps
    /// change constantly and watchers don't care).
    fn mutate_quiet(&self, id: &str, f: impl FnOnce(&mut Workflow) -> Result<()>) -> Result<()> {
        self.mutate_inner(id, false, f)
    }

    /// Structural mutation: requires the workflow to be paused.
    fn mutate_structural(
        &self,
        id: &str,
        f: impl FnOnce(&mut Workflow) -> Result<()>,
    ) -> Result<()> {
        self.mutate_inner(id, true, f)?;
        self.bump_revision();
        Ok(())
    }

    /// Structural mutation scoped to one conditional block.
    fn mutate_block(
        &self,
        workflow_id: &str,
        block_id: &str,
        f: impl FnOnce(&mut ConditionalBlock) -> Result<()>,
    ) -> Result<()> {
        self.mutate_structural(workflow_id, |w| {
            let block = w.steps.iter_mut().find_map(|s| match s {
                StepNode::IfElse(block) if block.id == block_id => Some(block),
                _ => None,
            });
            match block {
                Some(block) => f(block),
                None => Err(TabflowError::Validation(format!(
                    "Conditional block {block_id} not found"
                ))),
            }
        })
    }

    fn mutate_inner(
        &self,
        id: &str,
        structural: bool,
        f: impl FnOnce(&mut Workflow) -> Result<()>,
    ) -> Result<()> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .iter_mut()
            .find(|w| w.id == id)
            .ok_or_else(|| TabflowError::WorkflowNotFound(id.to_string()))?;
        if structural && workflow.is_active() {
            return Err(TabflowError::WorkflowActive(id.to_string()));
        }
        f(workflow)?;
        workflow.updated_at = now_ms();
        self.persist(&workflows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::workflow::schema::{OnFailure, StepAction};

    fn manager() -> WorkflowManager {
        WorkflowManager::new(Arc::new(MemoryStorage::new()))
    }

    fn nav_step(id: &str) -> StepNode {
        StepNode::Step(AtomicStep {
            id: id.to_string(),
            name: id.to_string(),
            enabled: true,
            timeout_ms: None,
            retries: 0,
            on_failure: OnFailure::Stop,
            goto_step: None,
            fallback_code: None,
            action: StepAction::GoTo {
                url: "https://a.test/".to_string(),
            },
        })
    }

    #[test]
    fn test_workflow_crud() {
        let manager = manager();
        let workflow = Workflow::new("Test CRUD");
        let id = workflow.id.clone();

        manager.add(workflow).unwrap();
        assert_eq!(manager.get(&id).unwrap().name, "Test CRUD");

        manager.rename(&id, "Updated Name").unwrap();
        assert_eq!(manager.get(&id).unwrap().name, "Updated Name");

        manager.delete(&id).unwrap();
        assert!(manager.get(&id).is_none());
    }

    #[test]
    fn test_structural_edit_requires_paused() {
        let manager = manager();
        let workflow = Workflow::new("Guarded");
        let id = workflow.id.clone();
        manager.add(workflow).unwrap();

        manager.set_status(&id, WorkflowStatus::Idle).unwrap();
        let err = manager.add_step(&id, nav_step("s1")).unwrap_err();
        assert!(matches!(err, TabflowError::WorkflowActive(_)));

        manager.set_status(&id, WorkflowStatus::Paused).unwrap();
        manager.add_step(&id, nav_step("s1")).unwrap();
        assert_eq!(manager.get(&id).unwrap().steps.len(), 1);
    }

    #[test]
    fn test_variables_mutate_while_active() {
        let manager = manager();
        let workflow = Workflow::new("Vars");
        let id = workflow.id.clone();
        manager.add(workflow).unwrap();
        manager.set_status(&id, WorkflowStatus::Idle).unwrap();

        manager.set_variable(&id, "result", "42").unwrap();
        assert_eq!(
            manager.get(&id).unwrap().variables.get("result").unwrap(),
            "42"
        );
    }

    #[test]
    fn test_state_survives_reload() {
        let storage = Arc::new(MemoryStorage::new());
        let id = {
            let manager = WorkflowManager::new(storage.clone());
            let workflow = Workflow::new("Persisted");
            let id = workflow.id.clone();
            manager.add(workflow).unwrap();
            manager.add_step(&id, nav_step("s1")).unwrap();
            id
        };

        let reloaded = WorkflowManager::new(storage);
        let workflow = reloaded.get(&id).unwrap();
        assert_eq!(workflow.name, "Persisted");
        assert_eq!(workflow.steps.len(), 1);
    }

    #[test]
    fn test_revision_bumps_on_structural_change() {
        let manager = manager();
        let rx = manager.subscribe();
        let before = *rx.borrow();

        let workflow = Workflow::new("Rev");
        let id = workflow.id.clone();
        manager.add(workflow).unwrap();
        manager.add_step(&id, nav_step("s1")).unwrap();

        assert!(*rx.borrow() > before);
    }
}
