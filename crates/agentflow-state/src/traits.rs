// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! The durable-store trait and change-set commit unit.

use crate::models::{
    FlowRecord, PublishedSourceRecord, RunnerRecord, StepRecord, TaskRecord, WorkflowRecord,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Error types for store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A conditional update lost a race; the caller should reload and retry.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// Task completion attempted without holding the lease.
    #[error("Lease lost for task {0}")]
    LeaseLost(Uuid),

    /// A (namespace, version) pair is already published with different content.
    #[error("Already published: {0}")]
    AlreadyPublished(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => StoreError::NotFound("Row not found".to_string()),
            sqlx::Error::PoolTimedOut => {
                StoreError::Connection("Connection pool timed out".to_string())
            }
            _ => StoreError::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// One tick's worth of writes, applied as a unit.
///
/// A change set carries the mutated steps, any newly created sibling
/// steps, emitted tasks, and the runner when its state moved. Every
/// write's uniqueness key is either a generated ID or a block-local
/// statement ID, so no multi-document transaction is required; the set is
/// retried wholesale on conflict.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    /// Steps created this tick.
    pub created_steps: Vec<StepRecord>,

    /// Steps mutated this tick.
    pub updated_steps: Vec<StepRecord>,

    /// Tasks emitted this tick.
    pub created_tasks: Vec<TaskRecord>,

    /// The runner, when its record changed.
    pub runner: Option<RunnerRecord>,
}

impl ChangeSet {
    /// Queue a newly created step.
    pub fn add_created_step(&mut self, step: StepRecord) {
        self.created_steps.push(step);
    }

    /// Queue a step mutation, replacing any earlier queued copy.
    pub fn add_updated_step(&mut self, step: StepRecord) {
        if let Some(existing) = self
            .updated_steps
            .iter_mut()
            .find(|s| s.step_id == step.step_id)
        {
            *existing = step;
        } else {
            self.updated_steps.push(step);
        }
    }

    /// Queue an emitted task.
    pub fn add_task(&mut self, task: TaskRecord) {
        self.created_tasks.push(task);
    }

    /// Whether the change set carries no writes.
    pub fn is_empty(&self) -> bool {
        self.created_steps.is_empty()
            && self.updated_steps.is_empty()
            && self.created_tasks.is_empty()
            && self.runner.is_none()
    }

    /// Whether a created step with the given block-local key is queued.
    pub fn created_step_exists(&self, statement_id: &str, block_id: Uuid) -> bool {
        self.created_steps
            .iter()
            .any(|s| s.statement_id == statement_id && s.block_id == Some(block_id))
    }

    /// Whether a created block step with the given container-local key is
    /// queued.
    pub fn created_block_exists(&self, statement_id: &str, container_id: Uuid) -> bool {
        self.created_steps
            .iter()
            .any(|s| s.statement_id == statement_id && s.container_id == Some(container_id))
    }

    /// Find a queued step (created or updated) by ID.
    pub fn find_step(&self, step_id: Uuid) -> Option<&StepRecord> {
        self.updated_steps
            .iter()
            .find(|s| s.step_id == step_id)
            .or_else(|| self.created_steps.iter().find(|s| s.step_id == step_id))
    }

    /// Drop all queued writes.
    pub fn clear(&mut self) {
        self.created_steps.clear();
        self.updated_steps.clear();
        self.created_tasks.clear();
        self.runner = None;
    }
}

/// The durable document store backing all execution state.
///
/// Single-document operations are linearizable. At-most-one task claim is
/// enforced by a conditional update, not by consensus.
#[async_trait]
pub trait Store: Send + Sync {
    /// Upsert a flow.
    async fn save_flow(&self, flow: &FlowRecord) -> StoreResult<()>;

    /// Load a flow by ID.
    async fn get_flow(&self, flow_id: Uuid) -> StoreResult<Option<FlowRecord>>;

    /// Upsert a workflow.
    async fn save_workflow(&self, workflow: &WorkflowRecord) -> StoreResult<()>;

    /// Load a workflow by ID.
    async fn get_workflow(&self, workflow_id: Uuid) -> StoreResult<Option<WorkflowRecord>>;

    /// Upsert a runner.
    async fn save_runner(&self, runner: &RunnerRecord) -> StoreResult<()>;

    /// Load a runner by ID.
    async fn get_runner(&self, runner_id: Uuid) -> StoreResult<Option<RunnerRecord>>;

    /// List all runners.
    async fn list_runners(&self) -> StoreResult<Vec<RunnerRecord>>;

    /// Upsert a step unconditionally. Prefer [`Store::apply`] in the
    /// execution path; this exists for repair tooling and tests.
    async fn save_step(&self, step: &StepRecord) -> StoreResult<()>;

    /// Load a step by ID.
    async fn get_step(&self, step_id: Uuid) -> StoreResult<Option<StepRecord>>;

    /// All steps of a runner's tree.
    async fn get_steps_by_runner(&self, runner_id: Uuid) -> StoreResult<Vec<StepRecord>>;

    /// All steps of a workflow, across runners.
    async fn get_steps_by_workflow(&self, workflow_id: Uuid) -> StoreResult<Vec<StepRecord>>;

    /// Children of a block step.
    async fn get_steps_by_block(&self, block_id: Uuid) -> StoreResult<Vec<StepRecord>>;

    /// Block steps owned by a container step.
    async fn get_blocks_by_step(&self, container_id: Uuid) -> StoreResult<Vec<StepRecord>>;

    /// Whether a step with the block-local statement key exists.
    async fn step_exists(&self, statement_id: &str, block_id: Uuid) -> StoreResult<bool>;

    /// Whether a block step with the container-local statement key exists.
    async fn block_step_exists(&self, statement_id: &str, container_id: Uuid) -> StoreResult<bool>;

    /// Upsert a task.
    async fn save_task(&self, task: &TaskRecord) -> StoreResult<()>;

    /// Load a task by ID.
    async fn get_task(&self, task_id: Uuid) -> StoreResult<Option<TaskRecord>>;

    /// Tasks emitted by a step.
    async fn get_tasks_by_step(&self, step_id: Uuid) -> StoreResult<Vec<TaskRecord>>;

    /// Tasks belonging to a runner.
    async fn get_tasks_by_runner(&self, runner_id: Uuid) -> StoreResult<Vec<TaskRecord>>;

    /// Whether a pending `afl:execute` task exists for a runner.
    ///
    /// Leased execute tasks deliberately don't count: the poller holding
    /// one may finish its tick without seeing a result captured after the
    /// tick's snapshot, so a wake-up must still be enqueued.
    async fn has_pending_execute_task(&self, runner_id: Uuid) -> StoreResult<bool>;

    /// Atomically claim the oldest claimable task of a task list.
    ///
    /// Claimable: `Pending`, or `Leased` with an expired lease. The claim
    /// sets the state to `Leased`, stamps `lease_expiry = now + lease`, and
    /// records the claimer, all guarded by the observed `(state,
    /// lease_expiry)`. Losers observe `None` or another task.
    async fn claim_next_task(
        &self,
        task_list: &str,
        lease: Duration,
        claimer: &str,
    ) -> StoreResult<Option<TaskRecord>>;

    /// Complete a task with its result, conditional on the caller still
    /// holding the lease. Returns [`StoreError::LeaseLost`] otherwise.
    async fn complete_task(
        &self,
        task_id: Uuid,
        claimer: &str,
        result: Map<String, Value>,
    ) -> StoreResult<()>;

    /// Fail a task, conditional on the caller still holding the lease.
    async fn fail_task(&self, task_id: Uuid, claimer: &str, error: &str) -> StoreResult<()>;

    /// Cancel all non-terminal tasks of a runner. Returns the count.
    async fn cancel_tasks_by_runner(&self, runner_id: Uuid) -> StoreResult<u64>;

    /// Apply one tick's change set.
    ///
    /// Created steps are guarded by their block-local statement key (a
    /// duplicate is silently skipped); updated steps are guarded by their
    /// sequence number and fail with [`StoreError::Conflict`] on a race.
    async fn apply(&self, changes: &ChangeSet) -> StoreResult<()>;

    /// Publish a namespace source under a version.
    ///
    /// Re-publishing identical content is a no-op; different content under
    /// an existing (namespace, version) is rejected unless `force` is set.
    async fn save_published_source(
        &self,
        source: &PublishedSourceRecord,
        force: bool,
    ) -> StoreResult<()>;

    /// Load a published source by its unique (namespace, version) key.
    async fn get_published_source(
        &self,
        namespace_name: &str,
        version: &str,
    ) -> StoreResult<Option<PublishedSourceRecord>>;

    /// Health check.
    async fn health_check(&self) -> StoreResult<()>;
}
