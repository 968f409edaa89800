// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! The execution engine: one `afl:execute` tick.
//!
//! A tick loads the runner's step tree, drives every step that can make
//! progress through the changer, commits the resulting change set, and
//! repeats until the tree is quiescent. When the only outstanding work is
//! an event task, the tick parks; the poller wakes the runner after the
//! result is captured. Re-running a tick from any persisted intermediate
//! state is idempotent: step creation is keyed by block-local statement
//! IDs and step writes are guarded by sequence numbers.

use std::sync::Arc;
use std::time::Duration;

use agentflow_core::{evaluate, AflError, EvalScope, Facet, ObjectType, Program, Result};
use agentflow_state::{
    ChangeSet, RunnerRecord, RunnerState, StepRecord, Store, StoreError, DEFAULT_TASK_LIST,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::changer;
use crate::sandbox::Sandbox;
use crate::tick::TickContext;

/// Upper bound on drive/commit passes within one tick.
const MAX_TICK_PASSES: usize = 1_000;

/// Retries for conflicting commits before giving up.
const CONFLICT_RETRIES: u32 = 8;

/// Map store faults onto runtime errors.
fn store_err(err: StoreError) -> AflError {
    match err {
        StoreError::Conflict(message) => AflError::Concurrency(message),
        other => AflError::Store(other.to_string()),
    }
}

/// Drives runners forward, one tick at a time.
pub struct ExecutionEngine {
    store: Arc<dyn Store>,
    sandbox: Option<Arc<dyn Sandbox>>,
    task_list: String,
}

impl ExecutionEngine {
    /// Create an engine over a store.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            sandbox: None,
            task_list: DEFAULT_TASK_LIST.to_string(),
        }
    }

    /// Attach a sandbox for script-bodied facets.
    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    /// Task list used for emitted event tasks.
    pub fn with_task_list(mut self, task_list: impl Into<String>) -> Self {
        self.task_list = task_list.into();
        self
    }

    /// The engine's store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Advance a runner until it parks or reaches a terminal state.
    ///
    /// Conflicting commits (another worker racing on the same tree) are
    /// retried with a short backoff; every retry restarts from freshly
    /// loaded state.
    #[instrument(skip(self), fields(runner_id = %runner_id))]
    pub async fn advance(&self, runner_id: Uuid) -> Result<RunnerRecord> {
        let mut attempt = 0;
        loop {
            match self.advance_once(runner_id).await {
                Err(err) if err.is_retryable() && attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(attempt, error = %err, "Tick conflicted; retrying");
                    tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    async fn advance_once(&self, runner_id: Uuid) -> Result<RunnerRecord> {
        let mut runner = self
            .store
            .get_runner(runner_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| AflError::other(format!("Runner not found: {runner_id}")))?;

        if runner.is_terminal() {
            return Ok(runner);
        }

        let flow = self
            .store
            .get_flow(runner.flow_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| AflError::other(format!("Flow not found: {}", runner.flow_id)))?;
        let program: Program = serde_json::from_value(flow.program)?;
        let workflow_ast = program
            .find_workflow(&runner.workflow_name)
            .ok_or_else(|| AflError::WorkflowNotFound(runner.workflow_name.clone()))?;

        self.ensure_root_step(&mut runner, workflow_ast).await?;

        for _pass in 0..MAX_TICK_PASSES {
            // Pick up external cancellation between passes.
            let current = self
                .store
                .get_runner(runner_id)
                .await
                .map_err(store_err)?
                .ok_or_else(|| AflError::other(format!("Runner not found: {runner_id}")))?;
            if current.state == RunnerState::Cancelled {
                return self.finalize_cancelled(current).await;
            }
            runner = current;

            let steps = self
                .store
                .get_steps_by_runner(runner_id)
                .await
                .map_err(store_err)?;
            let tasks = self
                .store
                .get_tasks_by_runner(runner_id)
                .await
                .map_err(store_err)?;

            let mut ctx = TickContext::new(
                &program,
                workflow_ast,
                &runner,
                steps,
                tasks,
                self.task_list.clone(),
                self.sandbox.as_deref(),
            );

            for step_id in ctx.step_ids() {
                let Some(mut step) = ctx.find_step(step_id) else {
                    continue;
                };
                if step.is_terminal() {
                    continue;
                }
                let before = step.clone();
                changer::drive(&mut step, &mut ctx);
                if step != before {
                    ctx.changes.add_updated_step(step);
                }
            }

            propagate_failures(&mut ctx);

            if ctx.changes.is_empty() {
                break;
            }
            self.store.apply(&ctx.changes).await.map_err(store_err)?;
        }

        self.finalize(runner).await
    }

    /// Create the workflow root step and mark the runner running. A no-op
    /// when the root already exists.
    async fn ensure_root_step(&self, runner: &mut RunnerRecord, workflow: &Facet) -> Result<()> {
        let steps = self
            .store
            .get_steps_by_runner(runner.runner_id)
            .await
            .map_err(store_err)?;
        if let Some(root) = steps
            .iter()
            .find(|s| s.container_id.is_none() && s.block_id.is_none())
        {
            if runner.root_step_id != Some(root.step_id) || runner.state == RunnerState::Created {
                runner.root_step_id = Some(root.step_id);
                if runner.state == RunnerState::Created {
                    runner.mark_running();
                }
                self.store.save_runner(runner).await.map_err(store_err)?;
            }
            return Ok(());
        }

        let root = build_root_step(runner, workflow)?;
        info!(
            runner_id = %runner.runner_id,
            root_step_id = %root.step_id,
            workflow = %runner.workflow_name,
            "Starting workflow execution"
        );

        runner.root_step_id = Some(root.step_id);
        runner.mark_running();

        let mut changes = ChangeSet::default();
        changes.add_created_step(root);
        changes.runner = Some(runner.clone());
        self.store.apply(&changes).await.map_err(store_err)?;

        // Another worker may have won the root creation; adopt its step.
        let steps = self
            .store
            .get_steps_by_runner(runner.runner_id)
            .await
            .map_err(store_err)?;
        if let Some(root) = steps
            .iter()
            .find(|s| s.container_id.is_none() && s.block_id.is_none())
        {
            runner.root_step_id = Some(root.step_id);
        }
        Ok(())
    }

    /// Set the runner's final state from the root step, or leave it
    /// running when the tree is parked on external work.
    async fn finalize(&self, mut runner: RunnerRecord) -> Result<RunnerRecord> {
        let steps = self
            .store
            .get_steps_by_runner(runner.runner_id)
            .await
            .map_err(store_err)?;
        let Some(root) = steps
            .iter()
            .find(|s| s.container_id.is_none() && s.block_id.is_none())
        else {
            return Ok(runner);
        };

        if root.is_complete() {
            runner.mark_succeeded(root.attributes.return_values());
            self.store.save_runner(&runner).await.map_err(store_err)?;
            info!(runner_id = %runner.runner_id, "Workflow completed successfully");
            return Ok(runner);
        }

        if root.state == agentflow_state::StepState::Error {
            let error = root
                .error
                .clone()
                .unwrap_or_else(|| "workflow failed".to_string());
            runner.mark_failed(error.clone());
            self.store.save_runner(&runner).await.map_err(store_err)?;

            let cancelled = self
                .store
                .cancel_tasks_by_runner(runner.runner_id)
                .await
                .map_err(store_err)?;
            self.short_circuit_steps(runner.runner_id).await?;

            warn!(
                runner_id = %runner.runner_id,
                cancelled_tasks = cancelled,
                error = %error,
                "Workflow failed"
            );
            return Ok(runner);
        }

        debug!(runner_id = %runner.runner_id, "Tick parked; waiting on external work");
        Ok(runner)
    }

    async fn finalize_cancelled(&self, runner: RunnerRecord) -> Result<RunnerRecord> {
        self.store
            .cancel_tasks_by_runner(runner.runner_id)
            .await
            .map_err(store_err)?;
        self.short_circuit_steps(runner.runner_id).await?;
        info!(runner_id = %runner.runner_id, "Workflow cancelled");
        Ok(runner)
    }

    /// Move every remaining non-terminal step to the cancelled terminal.
    async fn short_circuit_steps(&self, runner_id: Uuid) -> Result<()> {
        let steps = self
            .store
            .get_steps_by_runner(runner_id)
            .await
            .map_err(store_err)?;
        let mut changes = ChangeSet::default();
        for mut step in steps {
            if !step.is_terminal() {
                step.mark_cancelled();
                changes.add_updated_step(step);
            }
        }
        if !changes.is_empty() {
            self.store.apply(&changes).await.map_err(store_err)?;
        }
        Ok(())
    }

    /// Cancel a runner: cancel its queued tasks, short-circuit its steps,
    /// and mark it Cancelled. Idempotent on terminal runners.
    pub async fn cancel(&self, runner_id: Uuid) -> Result<RunnerRecord> {
        let mut runner = self
            .store
            .get_runner(runner_id)
            .await
            .map_err(store_err)?
            .ok_or_else(|| AflError::other(format!("Runner not found: {runner_id}")))?;

        if runner.is_terminal() {
            return Ok(runner);
        }

        runner.mark_cancelled();
        self.store.save_runner(&runner).await.map_err(store_err)?;
        self.store
            .cancel_tasks_by_runner(runner_id)
            .await
            .map_err(store_err)?;
        self.short_circuit_steps(runner_id).await?;

        info!(runner_id = %runner_id, "Runner cancelled");
        Ok(runner)
    }
}

/// Fail the ancestors of every failed step, up to the root.
///
/// Siblings are left alone: they keep running until their own
/// dependencies block, and the final failure pass cancels whatever
/// remains.
fn propagate_failures(ctx: &mut TickContext<'_>) {
    loop {
        let mut changed = false;
        let errored: Vec<StepRecord> = ctx
            .all_steps()
            .into_iter()
            .filter(|s| s.state == agentflow_state::StepState::Error)
            .collect();

        for failed in errored {
            let parent_id = failed.block_id.or(failed.container_id);
            let Some(parent_id) = parent_id else { continue };
            let Some(mut parent) = ctx.find_step(parent_id) else {
                continue;
            };
            if parent.is_terminal() {
                continue;
            }

            let label = if failed.statement_id.is_empty() {
                failed.step_id.to_string()
            } else {
                failed.statement_id.clone()
            };
            parent.mark_error(format!(
                "child '{}' failed: {}",
                label,
                failed.error.as_deref().unwrap_or("unknown error")
            ));
            ctx.changes.add_updated_step(parent);
            changed = true;
        }

        if !changed {
            break;
        }
    }
}

/// Build the workflow root step: runner inputs as parameters, workflow
/// parameter defaults underneath.
fn build_root_step(runner: &RunnerRecord, workflow: &Facet) -> Result<StepRecord> {
    let mut root = StepRecord::create(
        runner.runner_id,
        runner.workflow_id,
        runner.flow_id,
        ObjectType::VariableAssignment,
        runner.workflow_name.clone(),
        "root",
        None,
        None,
        None,
    );

    for (name, value) in &runner.inputs {
        let hint = workflow.param(name).map(|p| p.type_name.clone());
        root.attributes.set_param(name.clone(), value.clone(), hint);
    }

    let scope = EvalScope::inputs_only(&runner.inputs);
    for param in &workflow.params {
        if runner.inputs.contains_key(&param.name) {
            continue;
        }
        if let Some(default) = &param.default {
            let value = evaluate(default, &scope)?;
            root.attributes
                .set_param(param.name.clone(), value, Some(param.type_name.clone()));
        }
    }

    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    #[test]
    fn test_build_root_step_applies_defaults() {
        let workflow: Facet = serde_json::from_value(json!({
            "name": "W",
            "params": [
                {"name": "x", "type": "Long"},
                {"name": "retries", "type": "Long", "default": {"type": "Int", "value": 3}}
            ]
        }))
        .unwrap();

        let mut inputs = Map::new();
        inputs.insert("x".to_string(), json!(1));
        let runner = RunnerRecord::create(Uuid::new_v4(), Uuid::new_v4(), "W", inputs);

        let root = build_root_step(&runner, &workflow).unwrap();
        assert_eq!(root.attributes.param_values()["x"], json!(1));
        assert_eq!(root.attributes.param_values()["retries"], json!(3));
        assert_eq!(
            root.attributes.params["x"].type_hint.as_deref(),
            Some("Long")
        );
        assert!(root.container_id.is_none());
        assert!(root.block_id.is_none());
    }

    #[test]
    fn test_build_root_step_caller_inputs_win_over_defaults() {
        let workflow: Facet = serde_json::from_value(json!({
            "name": "W",
            "params": [
                {"name": "retries", "type": "Long", "default": {"type": "Int", "value": 3}}
            ]
        }))
        .unwrap();

        let mut inputs = Map::new();
        inputs.insert("retries".to_string(), json!(9));
        let runner = RunnerRecord::create(Uuid::new_v4(), Uuid::new_v4(), "W", inputs);

        let root = build_root_step(&runner, &workflow).unwrap();
        assert_eq!(root.attributes.param_values()["retries"], json!(9));
    }
}
