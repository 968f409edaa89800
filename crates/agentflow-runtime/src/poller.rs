// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Task queue poller.
//!
//! A poller targets one task list: it claims the oldest claimable task
//! under a lease, dispatches by task name, and captures the result.
//! `afl:execute` tasks drive the execution engine; everything else goes
//! to the event-handler registry. After an event result is captured the
//! poller wakes the owning runner with a fresh execute task, so parked
//! steps resume without anyone busy-polling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agentflow_core::{AflError, Result};
use agentflow_state::{StepState, Store, StoreError, TaskRecord, TaskState, EXECUTE_TASK_NAME};
use rand::Rng;
use serde_json::{json, Map};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::engine::ExecutionEngine;
use crate::registry::{HandlerRegistry, TaskLog};

/// Default lease duration for claimed tasks.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// A single-threaded claim/dispatch loop over one task list.
pub struct TaskPoller {
    store: Arc<dyn Store>,
    engine: Arc<ExecutionEngine>,
    registry: Arc<HandlerRegistry>,
    task_list: String,
    lease: Duration,
    poller_id: String,
    idle_backoff: Duration,
    shutdown: Arc<AtomicBool>,
}

impl TaskPoller {
    /// Create a poller over a task list.
    pub fn new(
        store: Arc<dyn Store>,
        engine: Arc<ExecutionEngine>,
        registry: Arc<HandlerRegistry>,
        task_list: impl Into<String>,
    ) -> Self {
        let task_list = task_list.into();
        let poller_id = format!("poller-{}", uuid::Uuid::new_v4());
        Self {
            store,
            engine,
            registry,
            task_list,
            lease: DEFAULT_LEASE,
            poller_id,
            idle_backoff: Duration::from_millis(250),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Override the lease duration.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Override the idle backoff base.
    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    /// Override the poller's claimer identifier.
    pub fn with_poller_id(mut self, poller_id: impl Into<String>) -> Self {
        self.poller_id = poller_id.into();
        self
    }

    /// Handle for asking the run loop to stop after the current task.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// The poller's claimer identifier.
    pub fn poller_id(&self) -> &str {
        &self.poller_id
    }

    /// Run until shut down. Claims synchronously, executes the claimed
    /// task, loops; idle waits are jittered to avoid thundering herds.
    #[instrument(skip(self), fields(task_list = %self.task_list, poller = %self.poller_id))]
    pub async fn run(&self) {
        info!("Poller started");
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::time::sleep(self.jittered_idle()).await;
                }
                Err(err) => {
                    error!(error = %err, "Poll iteration failed");
                    tokio::time::sleep(self.jittered_idle()).await;
                }
            }
        }
        info!("Poller stopped");
    }

    /// Claim and dispatch at most one task. Returns whether work was done.
    pub async fn poll_once(&self) -> Result<bool> {
        let claimed = self
            .store
            .claim_next_task(&self.task_list, self.lease, &self.poller_id)
            .await
            .map_err(|e| AflError::Store(e.to_string()))?;

        let Some(task) = claimed else {
            return Ok(false);
        };

        self.dispatch(task).await;
        Ok(true)
    }

    fn jittered_idle(&self) -> Duration {
        let base = self.idle_backoff.as_millis() as u64;
        let jitter = rand::thread_rng().gen_range(0..=base / 2 + 1);
        Duration::from_millis(base + jitter)
    }

    async fn dispatch(&self, task: TaskRecord) {
        debug!(task_id = %task.task_id, name = %task.name, "Dispatching task");

        if task.name == EXECUTE_TASK_NAME {
            self.dispatch_execute(task).await;
        } else {
            self.dispatch_event(task).await;
        }
    }

    /// Drive the runner; the tick itself is idempotent, so a lost lease
    /// just means another poller will repeat it.
    ///
    /// Event results captured by other pollers while this tick held the
    /// execute lease suppress their own wake-up (a live execute task
    /// exists). The re-advance loop here consumes those results before
    /// the lease is released, so no completion is ever stranded.
    async fn dispatch_execute(&self, task: TaskRecord) {
        for _ in 0..100 {
            match self.engine.advance(task.runner_id).await {
                Ok(runner) => {
                    debug!(
                        runner_id = %task.runner_id,
                        state = %runner.state,
                        "Execution tick finished"
                    );
                    if runner.is_terminal()
                        || !self.has_unconsumed_event_result(task.runner_id).await
                    {
                        self.capture(&task, Ok(Map::new())).await;
                        return;
                    }
                }
                Err(err) => {
                    error!(runner_id = %task.runner_id, error = %err, "Execution tick failed");
                    self.capture(&task, Err(err.to_string())).await;
                    return;
                }
            }
        }
        self.capture(&task, Ok(Map::new())).await;
    }

    /// Whether any terminal event task still has its step parked in
    /// event transmit.
    async fn has_unconsumed_event_result(&self, runner_id: Uuid) -> bool {
        let tasks = match self.store.get_tasks_by_runner(runner_id).await {
            Ok(tasks) => tasks,
            Err(_) => return false,
        };

        for task in tasks {
            if task.name == EXECUTE_TASK_NAME {
                continue;
            }
            if !matches!(task.state, TaskState::Completed | TaskState::Failed) {
                continue;
            }
            let Some(step_id) = task.step_id else { continue };
            if let Ok(Some(step)) = self.store.get_step(step_id).await {
                if step.state == StepState::EventTransmit {
                    return true;
                }
            }
        }
        false
    }

    async fn dispatch_event(&self, task: TaskRecord) {
        let Some(handler) = self.registry.get(&task.name) else {
            warn!(name = %task.name, "No handler registered for event facet");
            self.capture(&task, Err(format!("no handler registered for '{}'", task.name)))
                .await;
            self.wake_runner(&task).await;
            return;
        };

        let log = TaskLog::new(task.task_id, task.name.clone());
        let outcome = handler.handle(task.data.clone(), &log).await;

        let captured = match outcome {
            Ok(result) => self.capture(&task, Ok(result)).await,
            Err(err) => {
                warn!(task_id = %task.task_id, name = %task.name, error = %err, "Handler failed");
                self.capture(&task, Err(err.to_string())).await
            }
        };

        // Wake the parked step only when our result actually landed.
        if captured {
            self.wake_runner(&task).await;
        }
    }

    /// Write the task outcome, conditional on still holding the lease.
    /// A lost lease discards the work silently: another poller owns the
    /// task now and will re-attempt it.
    async fn capture(
        &self,
        task: &TaskRecord,
        outcome: std::result::Result<Map<String, serde_json::Value>, String>,
    ) -> bool {
        let result = match outcome {
            Ok(result) => {
                self.store
                    .complete_task(task.task_id, &self.poller_id, result)
                    .await
            }
            Err(error) => {
                self.store
                    .fail_task(task.task_id, &self.poller_id, &error)
                    .await
            }
        };

        match result {
            Ok(()) => true,
            Err(StoreError::LeaseLost(_)) => {
                debug!(task_id = %task.task_id, "Lease lost; discarding result");
                false
            }
            Err(err) => {
                error!(task_id = %task.task_id, error = %err, "Failed to capture task result");
                false
            }
        }
    }

    /// Enqueue a wake-up execute task for the task's runner, unless one is
    /// already pending.
    async fn wake_runner(&self, task: &TaskRecord) {
        match self.store.has_pending_execute_task(task.runner_id).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(err) => {
                error!(runner_id = %task.runner_id, error = %err, "Wake-up check failed");
                return;
            }
        }

        let mut data = Map::new();
        data.insert("runner_id".to_string(), json!(task.runner_id.to_string()));
        data.insert(
            "workflow_id".to_string(),
            json!(task.workflow_id.to_string()),
        );
        data.insert("flow_id".to_string(), json!(task.flow_id.to_string()));

        let wake = TaskRecord::create(
            EXECUTE_TASK_NAME,
            task.runner_id,
            task.workflow_id,
            task.flow_id,
            None,
            self.task_list.clone(),
            data,
        );

        if let Err(err) = self.store.save_task(&wake).await {
            error!(runner_id = %task.runner_id, error = %err, "Failed to enqueue wake-up task");
        } else {
            debug!(runner_id = %task.runner_id, task_id = %wake.task_id, "Runner woken");
        }
    }
}

/// Drain a task list until it stays empty and every runner parked on it
/// is quiescent. Single-process convenience used by tests and `afl run`.
pub async fn drain_task_list(poller: &TaskPoller, max_idle_polls: u32) -> Result<()> {
    let mut idle = 0;
    while idle < max_idle_polls {
        if poller.poll_once().await? {
            idle = 0;
        } else {
            idle += 1;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    Ok(())
}
