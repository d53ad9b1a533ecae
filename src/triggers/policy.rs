//! Per-workflow concurrency gate consulted before a trigger starts a run.

use crate::runs::RunRegistry;
use crate::workflow::manager::WorkflowManager;
use crate::workflow::schema::{Trigger, TriggerPolicyMode};
use std::sync::Arc;

/// Decides whether a trigger firing may start a run.
pub struct TriggerPolicyGate {
    manager: Arc<WorkflowManager>,
    registry: Arc<RunRegistry>,
}

impl TriggerPolicyGate {
    pub fn new(manager: Arc<WorkflowManager>, registry: Arc<RunRegistry>) -> Self {
        Self { manager, registry }
    }

    /// Apply the workflow's trigger run policy. On admission the trigger's
    /// last-event stamp is recorded.
    pub fn admit(&self, workflow_id: &str, trigger: &Trigger) -> bool {
        let Some(workflow) = self.manager.get(workflow_id) else {
            return false;
        };
        // Paused workflows never fire.
        if workflow.status == crate::workflow::schema::WorkflowStatus::Paused {
            return false;
        }

        let policy = &workflow.settings.trigger_policy;
        let active = self.registry.active_count(workflow_id);
        let parallel_limit = policy.parallel_limit.max(1) as usize;

        match policy.mode {
            TriggerPolicyMode::Single if active > 0 => return false,
            TriggerPolicyMode::Restart if active > 0 => {
                let flagged = self.registry.cancel_workflow(workflow_id);
                tracing::info!(
                    workflow = workflow_id,
                    flagged,
                    "restart policy cancelled active runs"
                );
            }
            TriggerPolicyMode::Parallel if active >= parallel_limit => return false,
            _ => {}
        }

        self.manager.touch_trigger(workflow_id, &trigger.id);
        true
    }
}
