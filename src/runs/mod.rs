//! In-flight run tracking.
//!
//! The registry exists only for a run's lifetime: it backs cancellation and
//! the concurrency counting the trigger policy gate relies on. Run history
//! lives on the workflow itself.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation handle for one run.
///
/// Cancellation is cooperative: the runner polls the flag before and after
/// every step, so a run stops at the next check point rather than mid-call.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub workflow_id: String,
    cancel: Arc<AtomicBool>,
}

impl RunHandle {
    pub fn new(run_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

/// Registry of currently executing runs.
#[derive(Default)]
pub struct RunRegistry {
    active: Mutex<HashMap<String, RunHandle>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run and hand back its handle.
    pub fn register(&self, run_id: &str, workflow_id: &str) -> RunHandle {
        let handle = RunHandle::new(run_id, workflow_id);
        self.active
            .lock()
            .insert(run_id.to_string(), handle.clone());
        handle
    }

    /// Drop a finished run.
    pub fn remove(&self, run_id: &str) {
        self.active.lock().remove(run_id);
    }

    pub fn handle(&self, run_id: &str) -> Option<RunHandle> {
        self.active.lock().get(run_id).cloned()
    }

    /// Active (not yet cancelled) runs for a workflow.
    pub fn active_count(&self, workflow_id: &str) -> usize {
        self.active
            .lock()
            .values()
            .filter(|h| h.workflow_id == workflow_id && !h.is_cancelled())
            .count()
    }

    /// Total in-flight runs, cancelled or not.
    pub fn len(&self) -> usize {
        self.active.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.lock().is_empty()
    }

    pub fn cancel_run(&self, run_id: &str) -> bool {
        match self.active.lock().get(run_id) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Flag every run of a workflow for cancellation.
    pub fn cancel_workflow(&self, workflow_id: &str) -> usize {
        let active = self.active.lock();
        let mut flagged = 0;
        for handle in active.values() {
            if handle.workflow_id == workflow_id {
                handle.cancel();
                flagged += 1;
            }
        }
        flagged
    }

    pub fn cancel_all(&self) {
        for handle in self.active.lock().values() {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_count_remove() {
        let registry = RunRegistry::new();
        registry.register("r1", "wf-1");
        registry.register("r2", "wf-1");
        registry.register("r3", "wf-2");

        assert_eq!(registry.active_count("wf-1"), 2);
        assert_eq!(registry.active_count("wf-2"), 1);

        registry.remove("r1");
        assert_eq!(registry.active_count("wf-1"), 1);
    }

    #[test]
    fn test_cancelled_runs_leave_active_count() {
        let registry = RunRegistry::new();
        let handle = registry.register("r1", "wf-1");
        assert_eq!(registry.active_count("wf-1"), 1);

        handle.cancel();
        assert_eq!(registry.active_count("wf-1"), 0);
        // Still registered until the runner removes it.
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cancel_workflow_flags_every_run() {
        let registry = RunRegistry::new();
        let a = registry.register("r1", "wf-1");
        let b = registry.register("r2", "wf-1");
        let other = registry.register("r3", "wf-2");

        assert_eq!(registry.cancel_workflow("wf-1"), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(!other.is_cancelled());
    }
}
