//! Workflow runner: walks a workflow's step list, applies per-step failure
//! policy, and drives the run-level retry loop.
//!
//! The runner never returns an error; every failure resolves to a terminal
//! run status. Cancellation is cooperative: the flag is polled before and
//! after every step, and a cancelled run always ends `cancelled` no matter
//! what else happened.

use crate::page::protocol::TabQuery;
use crate::runs::{RunHandle, RunRegistry};
use crate::workflow::allowed::is_url_allowed;
use crate::workflow::manager::WorkflowManager;
use crate::workflow::schema::{
    now_ms, AtomicStep, Condition, ConditionalBlock, OnFailure, Run, RunContext, RunStatus,
    RunTrigger, StepNode, StepRecord, StepStatus, Workflow,
};
use crate::workflow::steps::{RunState, StepExecutor, StepSuccess};
use std::collections::HashMap;
use std::sync::Arc;

/// Iteration budget multiplier guarding goto cycles.
const ITERATION_FACTOR: usize = 5;

/// Where the run context starts from (trigger-provided tab, if any).
#[derive(Debug, Clone, Default)]
pub struct StartContext {
    pub tab_id: Option<i64>,
    pub url: Option<String>,
}

/// What a finished (or failed-to-recover) step tells the walk loop to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepFlow {
    Continue(usize),
    Jump(usize),
    Stop,
}

/// Failure-policy fields shared by atomic steps and conditional blocks.
struct FailurePolicy<'a> {
    on_failure: OnFailure,
    goto_step: Option<&'a str>,
    fallback_code: Option<&'a str>,
}

impl<'a> FailurePolicy<'a> {
    fn of_step(step: &'a AtomicStep) -> Self {
        Self {
            on_failure: step.on_failure,
            goto_step: step.goto_step.as_deref(),
            fallback_code: step.fallback_code.as_deref(),
        }
    }

    fn of_block(block: &'a ConditionalBlock) -> Self {
        Self {
            on_failure: block.on_failure,
            goto_step: block.goto_step.as_deref(),
            fallback_code: block.fallback_code.as_deref(),
        }
    }
}

/// Executes workflows and records their runs.
pub struct WorkflowRunner {
    manager: Arc<WorkflowManager>,
    registry: Arc<RunRegistry>,
    executor: StepExecutor,
}

impl WorkflowRunner {
    pub fn new(
        manager: Arc<WorkflowManager>,
        registry: Arc<RunRegistry>,
        executor: StepExecutor,
    ) -> Self {
        Self {
            manager,
            registry,
            executor,
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    /// Run a workflow to a terminal status.
    pub async fn run(
        &self,
        workflow_id: &str,
        trigger: RunTrigger,
        start: StartContext,
    ) -> RunStatus {
        let Some(workflow) = self.manager.get(workflow_id) else {
            tracing::warn!(workflow = workflow_id, "run requested for unknown workflow");
            return RunStatus::Failed;
        };

        let run_id = format!("run-{}", uuid::Uuid::new_v4());
        let handle = self.registry.register(&run_id, workflow_id);
        tracing::info!(workflow = workflow_id, run = %run_id, ?trigger, "run started");

        let status = self
            .run_with_retries(&workflow, &run_id, trigger, start, &handle)
            .await;

        self.registry.remove(&run_id);
        tracing::info!(workflow = workflow_id, run = %run_id, ?status, "run finished");
        status
    }

    async fn run_with_retries(
        &self,
        workflow: &Workflow,
        run_id: &str,
        trigger: RunTrigger,
        start: StartContext,
        handle: &RunHandle,
    ) -> RunStatus {
        let max_retries = workflow.settings.max_retries;
        let base_vars = workflow.variables.clone();

        let mut state = RunState {
            run_id: run_id.to_string(),
            vars: base_vars.clone(),
            tab_id: start.tab_id,
            tab_url: start.url,
        };

        // Resolve the target tab once; retries reuse it.
        if state.tab_id.is_none() || state.tab_url.is_none() {
            match self.executor.page().find_tab(TabQuery::Active).await {
                Ok(Some(tab)) => {
                    state.tab_id = state.tab_id.or(Some(tab.id));
                    state.tab_url = state.tab_url.or(tab.url);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(run = run_id, "failed to query tabs: {e}");
                }
            }
        }

        let started_at = now_ms();
        let run = Run {
            id: run_id.to_string(),
            workflow_id: workflow.id.clone(),
            status: RunStatus::Running,
            trigger,
            start_time: started_at,
            end_time: None,
            duration_ms: None,
            steps: build_steps_snapshot(&workflow.steps),
            context: RunContext {
                url: state.tab_url.clone(),
                tab_id: state.tab_id,
                variables: state.vars.clone(),
            },
            artifacts: Vec::new(),
            error: None,
        };
        if let Err(e) = self.manager.add_run(&workflow.id, run) {
            tracing::warn!(run = run_id, "failed to record run: {e}");
        }

        let mut attempt: u32 = 0;
        let mut status;
        loop {
            state.vars = base_vars.clone();
            status = self
                .execute_attempt(workflow, run_id, &mut state, handle, started_at)
                .await;
            attempt += 1;

            if status == RunStatus::Failed && attempt <= max_retries && !handle.is_cancelled() {
                tracing::warn!(
                    run = run_id,
                    attempt,
                    max_retries,
                    "run failed, retrying"
                );
                continue;
            }
            break;
        }
        status
    }

    /// One full pass over the step list. Rebuilds the run's step records.
    async fn execute_attempt(
        &self,
        workflow: &Workflow,
        run_id: &str,
        state: &mut RunState,
        handle: &RunHandle,
        started_at: u64,
    ) -> RunStatus {
        let mut records = RecordSink {
            manager: &self.manager,
            workflow_id: &workflow.id,
            run_id,
            steps: build_steps_snapshot(&workflow.steps),
            first_error: None,
        };
        records.flush();
        let _ = self.manager.update_run(&workflow.id, run_id, |run| {
            run.status = RunStatus::Running;
            run.error = None;
            run.context.url = state.tab_url.clone();
            run.context.tab_id = state.tab_id;
            run.context.variables = state.vars.clone();
        });

        // Hard safety gate: the current page must be allow-listed before any
        // interaction happens.
        let allowed = is_url_allowed(state.tab_url.as_deref(), &workflow.settings.allowed_sites);
        let mut run_error: Option<String> = None;
        let mut status = RunStatus::Running;

        if !allowed.allowed {
            let reason = allowed
                .reason
                .unwrap_or_else(|| "Current site is not in the allowed list.".to_string());
            tracing::warn!(run = run_id, reason, "run blocked by allowed sites");
            run_error = Some(reason);
            status = RunStatus::Failed;
        } else {
            let steps = &workflow.steps;
            let index_map = build_index_map(steps);
            let max_iterations = steps.len() * ITERATION_FACTOR;
            let mut idx = 0usize;
            let mut iterations = 0usize;

            while idx < steps.len() {
                if handle.is_cancelled() {
                    records.mark_cancelled();
                    status = RunStatus::Cancelled;
                    break;
                }

                iterations += 1;
                if iterations > max_iterations {
                    let message = format!(
                        "Aborted after {max_iterations} iterations; goto loop suspected"
                    );
                    records.fail_remaining(&message);
                    run_error = Some(message);
                    status = RunStatus::Failed;
                    break;
                }

                let node = &steps[idx];
                let record_id = node.id().to_string();

                if !node.enabled() {
                    records.update(&record_id, StepStatus::Skipped, Some(0), Some("Disabled"));
                    idx += 1;
                    continue;
                }

                let step_start = now_ms();
                records.update(&record_id, StepStatus::Running, None, None);

                let flow = match node {
                    StepNode::Step(step) => {
                        self.drive_atomic(
                            workflow, step, state, &mut records, &record_id, &index_map, idx,
                            step_start, None,
                        )
                        .await
                    }
                    StepNode::IfElse(block) => {
                        self.drive_block(
                            workflow, block, state, handle, &mut records, &record_id,
                            &index_map, idx, step_start,
                        )
                        .await
                    }
                };

                match flow {
                    StepFlow::Continue(next) | StepFlow::Jump(next) => idx = next,
                    StepFlow::Stop => {
                        status = RunStatus::Failed;
                        break;
                    }
                }

                if handle.is_cancelled() {
                    records.mark_cancelled();
                    status = RunStatus::Cancelled;
                    break;
                }
            }
        }

        // Cancellation wins over any concurrent failure signal.
        if handle.is_cancelled() && status != RunStatus::Cancelled {
            records.mark_cancelled();
            status = RunStatus::Cancelled;
        }
        if status == RunStatus::Running {
            status = RunStatus::Success;
        }

        let ended_at = now_ms();
        let error = match status {
            RunStatus::Failed => run_error.or_else(|| records.first_error.clone()),
            _ => None,
        };
        let _ = self.manager.update_run(&workflow.id, run_id, |run| {
            run.status = status;
            run.end_time = Some(ended_at);
            run.duration_ms = Some(ended_at.saturating_sub(started_at));
            run.error = error.clone();
            run.context.variables = state.vars.clone();
        });
        status
    }

    /// Execute one atomic step and fold failures through its policy.
    #[allow(clippy::too_many_arguments)]
    async fn drive_atomic(
        &self,
        workflow: &Workflow,
        step: &AtomicStep,
        state: &mut RunState,
        records: &mut RecordSink<'_>,
        record_id: &str,
        index_map: &HashMap<String, usize>,
        idx: usize,
        step_start: u64,
        branch_of: Option<&str>,
    ) -> StepFlow {
        let result = self.executor.execute(workflow, step, state).await;
        let duration = now_ms().saturating_sub(step_start);

        match result {
            Ok(StepSuccess::Done) => {
                records.update(record_id, StepStatus::Success, Some(duration), None);
                StepFlow::Continue(idx + 1)
            }
            Ok(StepSuccess::Skipped { reason }) => {
                records.update(
                    record_id,
                    StepStatus::Skipped,
                    Some(duration),
                    Some(&reason),
                );
                StepFlow::Continue(idx + 1)
            }
            Err(message) => {
                if branch_of.is_none() {
                    tracing::debug!(
                        step = %step.id,
                        kind = step.action.kind(),
                        "step failed: {message}"
                    );
                }
                self.apply_failure(
                    FailurePolicy::of_step(step),
                    &message,
                    state,
                    records,
                    record_id,
                    index_map,
                    idx,
                    step_start,
                )
                .await
            }
        }
    }

    /// Apply a failure policy: skip, jump, fallback, or stop.
    #[allow(clippy::too_many_arguments)]
    async fn apply_failure(
        &self,
        policy: FailurePolicy<'_>,
        message: &str,
        state: &mut RunState,
        records: &mut RecordSink<'_>,
        record_id: &str,
        index_map: &HashMap<String, usize>,
        idx: usize,
        step_start: u64,
    ) -> StepFlow {
        let duration = now_ms().saturating_sub(step_start);
        match policy.on_failure {
            OnFailure::Skip => {
                records.update(record_id, StepStatus::Skipped, Some(duration), Some(message));
                StepFlow::Continue(idx + 1)
            }
            OnFailure::Goto => {
                let target = policy.goto_step.and_then(|id| index_map.get(id)).copied();
                match target {
                    None => {
                        records.update(
                            record_id,
                            StepStatus::Failed,
                            Some(duration),
                            Some("Goto target not found"),
                        );
                        StepFlow::Stop
                    }
                    Some(target) if target == idx => {
                        // Self-jump would loop silently; treat as stop.
                        records.update(
                            record_id,
                            StepStatus::Failed,
                            Some(duration),
                            Some("Goto target is the same step; aborting"),
                        );
                        StepFlow::Stop
                    }
                    Some(target) => {
                        records.update(
                            record_id,
                            StepStatus::Skipped,
                            Some(duration),
                            Some(message),
                        );
                        StepFlow::Jump(target)
                    }
                }
            }
            OnFailure::Fallback => {
                let Some(code) = policy.fallback_code.filter(|c| !c.trim().is_empty()) else {
                    records.update(
                        record_id,
                        StepStatus::Failed,
                        Some(duration),
                        Some("Fallback code missing"),
                    );
                    return StepFlow::Stop;
                };
                match self
                    .executor
                    .page()
                    .run_fallback(state.tab_id, code.to_string())
                    .await
                {
                    Ok(()) => {
                        records.update(
                            record_id,
                            StepStatus::Success,
                            Some(now_ms().saturating_sub(step_start)),
                            Some("Fallback executed"),
                        );
                        StepFlow::Continue(idx + 1)
                    }
                    Err(e) => {
                        records.update(
                            record_id,
                            StepStatus::Failed,
                            Some(now_ms().saturating_sub(step_start)),
                            Some(&e.to_string()),
                        );
                        StepFlow::Stop
                    }
                }
            }
            OnFailure::Stop => {
                records.update(record_id, StepStatus::Failed, Some(duration), Some(message));
                StepFlow::Stop
            }
        }
    }

    /// Evaluate an if/else block and run the chosen branch. Branch failure
    /// propagates through the block's own policy.
    #[allow(clippy::too_many_arguments)]
    async fn drive_block(
        &self,
        workflow: &Workflow,
        block: &ConditionalBlock,
        state: &mut RunState,
        handle: &RunHandle,
        records: &mut RecordSink<'_>,
        record_id: &str,
        index_map: &HashMap<String, usize>,
        idx: usize,
        step_start: u64,
    ) -> StepFlow {
        let condition = match self.evaluate_condition(&block.condition, state).await {
            Ok(result) => result,
            Err(message) => {
                return self
                    .apply_failure(
                        FailurePolicy::of_block(block),
                        &message,
                        state,
                        records,
                        record_id,
                        index_map,
                        idx,
                        step_start,
                    )
                    .await;
            }
        };

        let (branch_label, branch_steps) = if condition {
            ("IF", &block.if_steps)
        } else {
            ("ELSE", &block.else_steps)
        };

        let branch = self
            .run_branch(workflow, block, branch_steps, branch_label, state, handle, records)
            .await;

        match branch {
            BranchOutcome::Cancelled => {
                records.mark_cancelled();
                StepFlow::Stop
            }
            BranchOutcome::Failed(error) => {
                // The branch failed; the block's own policy decides what
                // happens next, not the branch step's.
                let message = error.unwrap_or_else(|| format!("{branch_label} branch failed"));
                self.apply_failure(
                    FailurePolicy::of_block(block),
                    &message,
                    state,
                    records,
                    record_id,
                    index_map,
                    idx,
                    step_start,
                )
                .await
            }
            BranchOutcome::Success => {
                records.update(
                    record_id,
                    StepStatus::Success,
                    Some(now_ms().saturating_sub(step_start)),
                    Some(&format!("{branch_label} branch executed")),
                );
                StepFlow::Continue(idx + 1)
            }
        }
    }

    /// Walk one branch with its own index map and iteration cap.
    async fn run_branch(
        &self,
        workflow: &Workflow,
        block: &ConditionalBlock,
        steps: &[AtomicStep],
        branch_label: &str,
        state: &mut RunState,
        handle: &RunHandle,
        records: &mut RecordSink<'_>,
    ) -> BranchOutcome {
        // Branch-local map: goto targets cannot cross branch boundaries.
        let branch_map: HashMap<String, usize> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();

        let max_iterations = (steps.len() * ITERATION_FACTOR).max(ITERATION_FACTOR);
        let mut idx = 0usize;
        let mut iterations = 0usize;
        let mut last_error: Option<String> = None;

        while idx < steps.len() {
            if handle.is_cancelled() {
                return BranchOutcome::Cancelled;
            }

            iterations += 1;
            if iterations > max_iterations {
                return BranchOutcome::Failed(Some(format!(
                    "Aborted after {max_iterations} branch iterations; goto loop suspected"
                )));
            }

            let step = &steps[idx];
            let record_id = format!("{}:{}:{}", block.id, step.id, branch_label);
            let record_name = format!("{branch_label} > {}", step.name);
            records.ensure_branch_record(&record_id, &record_name);

            if !step.enabled {
                records.update(&record_id, StepStatus::Skipped, Some(0), Some("Disabled"));
                idx += 1;
                continue;
            }

            let step_start = now_ms();
            records.update(&record_id, StepStatus::Running, None, None);

            let flow = self
                .drive_atomic(
                    workflow,
                    step,
                    state,
                    records,
                    &record_id,
                    &branch_map,
                    idx,
                    step_start,
                    Some(branch_label),
                )
                .await;

            if let Some(error) = records.last_error_of(&record_id) {
                last_error = Some(error);
            }

            match flow {
                StepFlow::Continue(next) | StepFlow::Jump(next) => idx = next,
                StepFlow::Stop => return BranchOutcome::Failed(last_error),
            }
        }

        BranchOutcome::Success
    }

    /// Variable conditions read run state; everything else asks the page.
    async fn evaluate_condition(
        &self,
        condition: &Condition,
        state: &RunState,
    ) -> Result<bool, String> {
        if condition.is_variable_condition() {
            return Ok(evaluate_variable_condition(condition, &state.vars));
        }
        self.executor
            .page()
            .check_condition(state.tab_id, condition.clone())
            .await
            .map_err(|e| format!("Condition evaluation failed: {e}"))
    }
}

enum BranchOutcome {
    Success,
    Failed(Option<String>),
    Cancelled,
}

fn evaluate_variable_condition(condition: &Condition, vars: &HashMap<String, String>) -> bool {
    let lookup = |name: &str| vars.get(name).cloned().unwrap_or_default();
    match condition {
        Condition::VariableEquals { variable, value } => lookup(variable) == *value,
        Condition::VariableNotEquals { variable, value } => lookup(variable) != *value,
        Condition::VariableGreater { variable, value } => {
            match (lookup(variable).trim().parse::<f64>(), value.trim().parse::<f64>()) {
                (Ok(a), Ok(b)) => a > b,
                _ => false,
            }
        }
        Condition::VariableLess { variable, value } => {
            match (lookup(variable).trim().parse::<f64>(), value.trim().parse::<f64>()) {
                (Ok(a), Ok(b)) => a < b,
                _ => false,
            }
        }
        Condition::VariableEmpty { variable } => lookup(variable).trim().is_empty(),
        Condition::VariableNotEmpty { variable } => !lookup(variable).trim().is_empty(),
        _ => false,
    }
}

fn build_steps_snapshot(steps: &[StepNode]) -> Vec<StepRecord> {
    steps
        .iter()
        .map(|node| StepRecord {
            id: node.id().to_string(),
            name: node.name().to_string(),
            status: StepStatus::Pending,
            duration_ms: None,
            error: None,
        })
        .collect()
}

fn build_index_map(steps: &[StepNode]) -> HashMap<String, usize> {
    steps
        .iter()
        .enumerate()
        .map(|(i, node)| (node.id().to_string(), i))
        .collect()
}

/// Incrementally maintained step timeline, flushed to the run record on
/// every change so observers see live progress.
struct RecordSink<'a> {
    manager: &'a Arc<WorkflowManager>,
    workflow_id: &'a str,
    run_id: &'a str,
    steps: Vec<StepRecord>,
    first_error: Option<String>,
}

impl RecordSink<'_> {
    fn update(&mut self, id: &str, status: StepStatus, duration_ms: Option<u64>, error: Option<&str>) {
        if let Some(record) = self.steps.iter_mut().find(|s| s.id == id) {
            record.status = status;
            if duration_ms.is_some() {
                record.duration_ms = duration_ms;
            }
            record.error = error.map(|e| e.to_string());
        }
        if let Some(error) = error {
            if self.first_error.is_none()
                && matches!(status, StepStatus::Failed | StepStatus::Skipped)
            {
                self.first_error = Some(error.to_string());
            }
        }
        self.flush();
    }

    /// Branch records are appended to the timeline as they are reached.
    fn ensure_branch_record(&mut self, id: &str, name: &str) {
        if !self.steps.iter().any(|s| s.id == id) {
            self.steps.push(StepRecord {
                id: id.to_string(),
                name: name.to_string(),
                status: StepStatus::Pending,
                duration_ms: None,
                error: None,
            });
        }
    }

    fn last_error_of(&self, id: &str) -> Option<String> {
        self.steps
            .iter()
            .find(|s| s.id == id)
            .and_then(|s| s.error.clone())
    }

    /// Everything still pending or running becomes skipped("Cancelled").
    fn mark_cancelled(&mut self) {
        for record in &mut self.steps {
            if matches!(record.status, StepStatus::Pending | StepStatus::Running) {
                record.status = StepStatus::Skipped;
                record.error = Some("Cancelled".to_string());
            }
        }
        self.flush();
    }

    fn fail_remaining(&mut self, message: &str) {
        for record in &mut self.steps {
            if matches!(record.status, StepStatus::Pending | StepStatus::Running) {
                record.status = StepStatus::Failed;
                record.error = Some(message.to_string());
            }
        }
        if self.first_error.is_none() {
            self.first_error = Some(message.to_string());
        }
        self.flush();
    }

    fn flush(&self) {
        self.manager
            .set_run_steps(self.workflow_id, self.run_id, self.steps.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variable_conditions() {
        let mut vars = HashMap::new();
        vars.insert("count".to_string(), "12".to_string());
        vars.insert("name".to_string(), "tabflow".to_string());
        vars.insert("blank".to_string(), "  ".to_string());

        let eq = Condition::VariableEquals {
            variable: "name".to_string(),
            value: "tabflow".to_string(),
        };
        assert!(evaluate_variable_condition(&eq, &vars));

        let gt = Condition::VariableGreater {
            variable: "count".to_string(),
            value: "5".to_string(),
        };
        assert!(evaluate_variable_condition(&gt, &vars));

        let lt = Condition::VariableLess {
            variable: "count".to_string(),
            value: "5".to_string(),
        };
        assert!(!evaluate_variable_condition(&lt, &vars));

        let empty = Condition::VariableEmpty {
            variable: "blank".to_string(),
        };
        assert!(evaluate_variable_condition(&empty, &vars));

        // Non-numeric comparison never matches.
        let bad = Condition::VariableGreater {
            variable: "name".to_string(),
            value: "1".to_string(),
        };
        assert!(!evaluate_variable_condition(&bad, &vars));
    }
}
