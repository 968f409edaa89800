// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! In-memory reference implementation of the [`Store`] trait.
//!
//! Used by every engine test and by the single-process `run` command.
//! Entities live in `DashMap`s; steps and tasks sit behind mutexes because
//! their operations (idempotent creation, atomic claim) span multiple
//! records and must observe a consistent view.

use crate::models::{
    FlowRecord, PublishedSourceRecord, RunnerRecord, StepRecord, TaskRecord, TaskState,
    WorkflowRecord, now_ms, EXECUTE_TASK_NAME,
};
use crate::traits::{ChangeSet, Store, StoreError, StoreResult};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// In-memory document store.
#[derive(Default)]
pub struct MemoryStore {
    flows: DashMap<Uuid, FlowRecord>,
    workflows: DashMap<Uuid, WorkflowRecord>,
    runners: DashMap<Uuid, RunnerRecord>,
    steps: Mutex<HashMap<Uuid, StepRecord>>,
    tasks: Mutex<HashMap<Uuid, TaskRecord>>,
    published: Mutex<HashMap<(String, String), PublishedSourceRecord>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a created step would duplicate an existing one under its
    /// block-local (or container-local, or per-runner root) uniqueness key.
    fn duplicates_existing(steps: &HashMap<Uuid, StepRecord>, new: &StepRecord) -> bool {
        steps.values().any(|s| {
            if s.step_id == new.step_id {
                return true;
            }
            match (new.block_id, new.container_id) {
                (Some(block_id), _) => {
                    s.block_id == Some(block_id) && s.statement_id == new.statement_id
                }
                (None, Some(container_id)) => {
                    s.block_id.is_none()
                        && s.container_id == Some(container_id)
                        && s.statement_id == new.statement_id
                }
                // Workflow root: one per runner.
                (None, None) => {
                    s.runner_id == new.runner_id && s.block_id.is_none() && s.container_id.is_none()
                }
            }
        })
    }

    fn sorted(mut steps: Vec<StepRecord>) -> Vec<StepRecord> {
        steps.sort_by(|a, b| a.created.cmp(&b.created).then(a.step_id.cmp(&b.step_id)));
        steps
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_flow(&self, flow: &FlowRecord) -> StoreResult<()> {
        self.flows.insert(flow.flow_id, flow.clone());
        Ok(())
    }

    async fn get_flow(&self, flow_id: Uuid) -> StoreResult<Option<FlowRecord>> {
        Ok(self.flows.get(&flow_id).map(|f| f.clone()))
    }

    async fn save_workflow(&self, workflow: &WorkflowRecord) -> StoreResult<()> {
        self.workflows.insert(workflow.workflow_id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: Uuid) -> StoreResult<Option<WorkflowRecord>> {
        Ok(self.workflows.get(&workflow_id).map(|w| w.clone()))
    }

    async fn save_runner(&self, runner: &RunnerRecord) -> StoreResult<()> {
        self.runners.insert(runner.runner_id, runner.clone());
        Ok(())
    }

    async fn get_runner(&self, runner_id: Uuid) -> StoreResult<Option<RunnerRecord>> {
        Ok(self.runners.get(&runner_id).map(|r| r.clone()))
    }

    async fn list_runners(&self) -> StoreResult<Vec<RunnerRecord>> {
        let mut runners: Vec<RunnerRecord> =
            self.runners.iter().map(|r| r.value().clone()).collect();
        runners.sort_by_key(|r| r.created);
        Ok(runners)
    }

    async fn save_step(&self, step: &StepRecord) -> StoreResult<()> {
        self.steps.lock().insert(step.step_id, step.clone());
        Ok(())
    }

    async fn get_step(&self, step_id: Uuid) -> StoreResult<Option<StepRecord>> {
        Ok(self.steps.lock().get(&step_id).cloned())
    }

    async fn get_steps_by_runner(&self, runner_id: Uuid) -> StoreResult<Vec<StepRecord>> {
        let steps = self.steps.lock();
        Ok(Self::sorted(
            steps
                .values()
                .filter(|s| s.runner_id == runner_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_steps_by_workflow(&self, workflow_id: Uuid) -> StoreResult<Vec<StepRecord>> {
        let steps = self.steps.lock();
        Ok(Self::sorted(
            steps
                .values()
                .filter(|s| s.workflow_id == workflow_id)
                .cloned()
                .collect(),
        ))
    }

    async fn get_steps_by_block(&self, block_id: Uuid) -> StoreResult<Vec<StepRecord>> {
        let steps = self.steps.lock();
        Ok(Self::sorted(
            steps
                .values()
                .filter(|s| s.block_id == Some(block_id))
                .cloned()
                .collect(),
        ))
    }

    async fn get_blocks_by_step(&self, container_id: Uuid) -> StoreResult<Vec<StepRecord>> {
        let steps = self.steps.lock();
        Ok(Self::sorted(
            steps
                .values()
                .filter(|s| s.container_id == Some(container_id) && s.is_block())
                .cloned()
                .collect(),
        ))
    }

    async fn step_exists(&self, statement_id: &str, block_id: Uuid) -> StoreResult<bool> {
        let steps = self.steps.lock();
        Ok(steps
            .values()
            .any(|s| s.block_id == Some(block_id) && s.statement_id == statement_id))
    }

    async fn block_step_exists(&self, statement_id: &str, container_id: Uuid) -> StoreResult<bool> {
        let steps = self.steps.lock();
        Ok(steps.values().any(|s| {
            s.container_id == Some(container_id) && s.statement_id == statement_id && s.is_block()
        }))
    }

    async fn save_task(&self, task: &TaskRecord) -> StoreResult<()> {
        self.tasks.lock().insert(task.task_id, task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> StoreResult<Option<TaskRecord>> {
        Ok(self.tasks.lock().get(&task_id).cloned())
    }

    async fn get_tasks_by_step(&self, step_id: Uuid) -> StoreResult<Vec<TaskRecord>> {
        let tasks = self.tasks.lock();
        let mut found: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.step_id == Some(step_id))
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created);
        Ok(found)
    }

    async fn get_tasks_by_runner(&self, runner_id: Uuid) -> StoreResult<Vec<TaskRecord>> {
        let tasks = self.tasks.lock();
        let mut found: Vec<TaskRecord> = tasks
            .values()
            .filter(|t| t.runner_id == runner_id)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created);
        Ok(found)
    }

    async fn has_pending_execute_task(&self, runner_id: Uuid) -> StoreResult<bool> {
        let tasks = self.tasks.lock();
        Ok(tasks.values().any(|t| {
            t.runner_id == runner_id
                && t.name == EXECUTE_TASK_NAME
                && t.state == TaskState::Pending
        }))
    }

    async fn claim_next_task(
        &self,
        task_list: &str,
        lease: Duration,
        claimer: &str,
    ) -> StoreResult<Option<TaskRecord>> {
        let mut tasks = self.tasks.lock();
        let now = now_ms();

        let candidate = tasks
            .values()
            .filter(|t| t.task_list_name == task_list)
            .filter(|t| match t.state {
                TaskState::Pending => true,
                TaskState::Leased => t.lease_expiry.is_some_and(|exp| exp < now),
                _ => false,
            })
            .min_by(|a, b| a.created.cmp(&b.created).then(a.task_id.cmp(&b.task_id)))
            .map(|t| t.task_id);

        let Some(task_id) = candidate else {
            return Ok(None);
        };

        // The whole scan-and-claim runs under the table lock, which is the
        // in-memory equivalent of the conditional update.
        let task = tasks.get_mut(&task_id).ok_or_else(|| {
            StoreError::Conflict(format!("task {task_id} vanished during claim"))
        })?;
        task.state = TaskState::Leased;
        task.lease_expiry = Some(now + lease.as_millis() as i64);
        task.claimed_by = Some(claimer.to_string());
        task.updated = now;

        debug!(task_id = %task_id, name = %task.name, claimer, "Task claimed");
        Ok(Some(task.clone()))
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        claimer: &str,
        result: Map<String, Value>,
    ) -> StoreResult<()> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;

        if task.state != TaskState::Leased || task.claimed_by.as_deref() != Some(claimer) {
            return Err(StoreError::LeaseLost(task_id));
        }

        task.state = TaskState::Completed;
        task.result = Some(result);
        task.updated = now_ms();
        Ok(())
    }

    async fn fail_task(&self, task_id: Uuid, claimer: &str, error: &str) -> StoreResult<()> {
        let mut tasks = self.tasks.lock();
        let task = tasks
            .get_mut(&task_id)
            .ok_or_else(|| StoreError::NotFound(format!("task {task_id}")))?;

        if task.state != TaskState::Leased || task.claimed_by.as_deref() != Some(claimer) {
            return Err(StoreError::LeaseLost(task_id));
        }

        task.state = TaskState::Failed;
        task.error = Some(error.to_string());
        task.updated = now_ms();
        Ok(())
    }

    async fn cancel_tasks_by_runner(&self, runner_id: Uuid) -> StoreResult<u64> {
        let mut tasks = self.tasks.lock();
        let now = now_ms();
        let mut cancelled = 0;
        for task in tasks.values_mut() {
            if task.runner_id == runner_id && !task.is_terminal() {
                task.state = TaskState::Cancelled;
                task.updated = now;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn apply(&self, changes: &ChangeSet) -> StoreResult<()> {
        // Creations land before guarded updates: a partial commit then
        // leaves parents in their pre-transition state, and the re-driven
        // tick skips the already-created children.
        {
            let mut steps = self.steps.lock();

            for created in &changes.created_steps {
                if Self::duplicates_existing(&steps, created) {
                    debug!(
                        statement_id = %created.statement_id,
                        "Skipping duplicate step creation"
                    );
                    continue;
                }
                steps.insert(created.step_id, created.clone());
            }
        }

        {
            let mut tasks = self.tasks.lock();
            for task in &changes.created_tasks {
                tasks.entry(task.task_id).or_insert_with(|| task.clone());
            }
        }

        {
            let mut steps = self.steps.lock();
            for updated in &changes.updated_steps {
                match steps.get(&updated.step_id) {
                    Some(stored) if stored.seq != updated.seq => {
                        return Err(StoreError::Conflict(format!(
                            "step {} was modified concurrently (seq {} != {})",
                            updated.step_id, stored.seq, updated.seq
                        )));
                    }
                    _ => {}
                }
                let mut record = updated.clone();
                record.seq += 1;
                steps.insert(record.step_id, record);
            }
        }

        if let Some(runner) = &changes.runner {
            self.runners.insert(runner.runner_id, runner.clone());
        }

        Ok(())
    }

    async fn save_published_source(
        &self,
        source: &PublishedSourceRecord,
        force: bool,
    ) -> StoreResult<()> {
        let mut published = self.published.lock();
        let key = (source.namespace_name.clone(), source.version.clone());

        if let Some(existing) = published.get(&key) {
            if existing.content == source.content {
                return Ok(());
            }
            if !force {
                return Err(StoreError::AlreadyPublished(format!(
                    "{}@{}",
                    source.namespace_name, source.version
                )));
            }
        }

        published.insert(key, source.clone());
        Ok(())
    }

    async fn get_published_source(
        &self,
        namespace_name: &str,
        version: &str,
    ) -> StoreResult<Option<PublishedSourceRecord>> {
        let published = self.published.lock();
        Ok(published
            .get(&(namespace_name.to_string(), version.to_string()))
            .cloned())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
