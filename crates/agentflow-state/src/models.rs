// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Durable entity records.
//!
//! Every record here is a document in the store. Records are identified by
//! UUIDs rendered as text, and all timestamps are milliseconds since the
//! epoch.

use agentflow_core::ObjectType;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Task name of an internal execution tick.
pub const EXECUTE_TASK_NAME: &str = "afl:execute";

/// Default task list (queue partition).
pub const DEFAULT_TASK_LIST: &str = "default";

/// Current time in milliseconds since the epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Runner execution state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerState {
    /// Submitted, not yet advanced.
    Created,
    /// The execution loop has started the root step.
    Running,
    /// Root step completed without errors.
    Succeeded,
    /// A step in the tree failed non-recoverably.
    Failed,
    /// Cancelled on external demand.
    Cancelled,
}

impl RunnerState {
    /// Whether the runner can make no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for RunnerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "created" => Ok(Self::Created),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid runner state: {s}")),
        }
    }
}

/// Task queue state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a poller; the lease bounds exclusive ownership.
    Leased,
    /// Handler returned normally; `result` is set.
    Completed,
    /// Handler raised; `error` is set.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl TaskState {
    /// Whether the task will never run again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Leased => write!(f, "leased"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

/// The step lifecycle alphabet.
///
/// Which subset applies to a step is decided by its object type; the
/// transition tables live with the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepState {
    /// Initial state of every step.
    Created,
    /// Evaluating call arguments and facet defaults.
    FacetInitializationBegin,
    /// Argument evaluation finished.
    FacetInitializationEnd,
    /// Running the facet's script body through the sandbox.
    FacetScriptsBegin,
    /// Script phase finished.
    FacetScriptsEnd,
    /// Statement-level scripts (reserved).
    StatementScriptsBegin,
    /// Statement-level scripts finished.
    StatementScriptsEnd,
    /// Materializing mixin blocks (reserved).
    MixinBlocksBegin,
    /// Waiting on mixin blocks (reserved).
    MixinBlocksContinue,
    /// Mixin blocks finished.
    MixinBlocksEnd,
    /// Capturing mixin yields (reserved).
    MixinCaptureBegin,
    /// Mixin capture finished.
    MixinCaptureEnd,
    /// Dispatching to an external event-facet handler; parks until the
    /// emitted task completes.
    EventTransmit,
    /// Materializing body blocks as child block steps.
    StatementBlocksBegin,
    /// Waiting on child block completion.
    StatementBlocksContinue,
    /// Body blocks finished.
    StatementBlocksEnd,
    /// Merging yields from completed child blocks into returns.
    StatementCaptureBegin,
    /// Capture finished.
    StatementCaptureEnd,
    /// About to persist terminal state.
    StatementEnd,
    /// Terminal success. Attributes are immutable from here on.
    StatementComplete,
    /// Block executor: analyzing statements, creating eligible steps.
    BlockExecutionBegin,
    /// Block executor: polling child completion, creating newly-ready steps.
    BlockExecutionContinue,
    /// Block executor finished.
    BlockExecutionEnd,
    /// Terminal failure; `error` is set on the step.
    Error,
    /// Terminal cancellation.
    Cancelled,
}

impl StepState {
    /// Whether the step is in a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::StatementComplete | Self::Error | Self::Cancelled)
    }

    /// Whether the step completed successfully.
    pub fn is_complete(self) -> bool {
        matches!(self, Self::StatementComplete)
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// One attribute value with an optional type hint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    /// The attribute value.
    pub value: Value,

    /// Declared type name, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_hint: Option<String>,
}

/// A step's parameter and return attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    /// Parameters, set during initialization.
    #[serde(default)]
    pub params: BTreeMap<String, Attribute>,

    /// Returns, set by handlers, scripts, or yield capture.
    #[serde(default)]
    pub returns: BTreeMap<String, Attribute>,
}

impl Attributes {
    /// Set a parameter attribute.
    pub fn set_param(&mut self, name: impl Into<String>, value: Value, type_hint: Option<String>) {
        self.params.insert(name.into(), Attribute { value, type_hint });
    }

    /// Set a return attribute.
    pub fn set_return(&mut self, name: impl Into<String>, value: Value, type_hint: Option<String>) {
        self.returns.insert(name.into(), Attribute { value, type_hint });
    }

    /// Parameter values as a plain JSON map.
    pub fn param_values(&self) -> Map<String, Value> {
        self.params
            .iter()
            .map(|(k, a)| (k.clone(), a.value.clone()))
            .collect()
    }

    /// Return values as a plain JSON map.
    pub fn return_values(&self) -> Map<String, Value> {
        self.returns
            .iter()
            .map(|(k, a)| (k.clone(), a.value.clone()))
            .collect()
    }

    /// Look up an attribute, returns first.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.returns
            .get(name)
            .or_else(|| self.params.get(name))
            .map(|a| &a.value)
    }
}

/// A step's pending transition requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// The step wants the changer to select and enter the next state.
    pub request_state_change: bool,

    /// The step cannot progress now and wants to be re-scheduled.
    pub request_push: bool,
}

/// The runtime materialization of one statement, block, or foreach
/// sub-block in an executing workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Unique step ID.
    pub step_id: Uuid,

    /// Owning runner.
    pub runner_id: Uuid,

    /// Owning workflow.
    pub workflow_id: Uuid,

    /// Owning flow.
    pub flow_id: Uuid,

    /// Runtime object type.
    pub object_type: ObjectType,

    /// Resolved fully-qualified facet/schema name. Empty for blocks.
    #[serde(default)]
    pub facet_name: String,

    /// Stable statement ID within the parent block's AST.
    #[serde(default)]
    pub statement_id: String,

    /// Statement name, referenced by sibling expressions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_name: Option<String>,

    /// The step owning this step's enclosing block; null for the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<Uuid>,

    /// Object type of the container, as text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_type: Option<String>,

    /// The block step this step is a child of; null for the root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_id: Option<Uuid>,

    /// Root of the containing tree (cache, not a cycle).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<Uuid>,

    /// Parameter and return attributes.
    #[serde(default)]
    pub attributes: Attributes,

    /// Current lifecycle state.
    pub state: StepState,

    /// Pending transition requests.
    #[serde(default)]
    pub transition: Transition,

    /// Opaque error text, set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Foreach loop variable. Set only on foreach sub-blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach_var: Option<String>,

    /// Value bound to the foreach variable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach_value: Option<Value>,

    /// Cached block body AST for foreach sub-blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_body: Option<Value>,

    /// Optimistic-concurrency sequence, bumped by the store on each write.
    #[serde(default)]
    pub seq: i64,

    /// Creation time (epoch millis).
    pub created: i64,

    /// Last update time (epoch millis).
    pub updated: i64,
}

impl StepRecord {
    /// Create a step in the `Created` state, requesting its first
    /// transition.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        runner_id: Uuid,
        workflow_id: Uuid,
        flow_id: Uuid,
        object_type: ObjectType,
        facet_name: impl Into<String>,
        statement_id: impl Into<String>,
        container_id: Option<Uuid>,
        block_id: Option<Uuid>,
        root_id: Option<Uuid>,
    ) -> Self {
        let now = now_ms();
        Self {
            step_id: Uuid::new_v4(),
            runner_id,
            workflow_id,
            flow_id,
            object_type,
            facet_name: facet_name.into(),
            statement_id: statement_id.into(),
            statement_name: None,
            container_id,
            container_type: None,
            block_id,
            root_id,
            attributes: Attributes::default(),
            state: StepState::Created,
            transition: Transition {
                request_state_change: true,
                request_push: false,
            },
            error: None,
            foreach_var: None,
            foreach_value: None,
            block_body: None,
            seq: 0,
            created: now,
            updated: now,
        }
    }

    /// Whether the step completed successfully.
    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    /// Whether the step is terminal.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the step is a block.
    pub fn is_block(&self) -> bool {
        self.object_type.is_block()
    }

    /// Enter a new state and clear transition requests.
    pub fn change_state(&mut self, next: StepState) {
        self.state = next;
        self.transition = Transition::default();
        self.updated = now_ms();
    }

    /// Request (or withdraw) a state change. No-op when the flag already
    /// matches; the record stays byte-identical on idle re-drives.
    pub fn request_state_change(&mut self, requested: bool) {
        if self.transition.request_state_change != requested {
            self.transition.request_state_change = requested;
            self.updated = now_ms();
        }
    }

    /// Request re-scheduling by the execution loop. No-op when unchanged.
    pub fn request_push(&mut self, requested: bool) {
        if self.transition.request_push != requested {
            self.transition.request_push = requested;
            self.updated = now_ms();
        }
    }

    /// Fail the step terminally.
    pub fn mark_error(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.state = StepState::Error;
        self.transition = Transition::default();
        self.updated = now_ms();
    }

    /// Cancel the step terminally.
    pub fn mark_cancelled(&mut self) {
        self.state = StepState::Cancelled;
        self.transition = Transition::default();
        self.updated = now_ms();
    }
}

/// A durable queue item requesting external work or an execution tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Unique task ID.
    pub task_id: Uuid,

    /// Task name: `afl:execute` or an event facet's qualified name.
    pub name: String,

    /// Owning runner.
    pub runner_id: Uuid,

    /// Owning workflow.
    pub workflow_id: Uuid,

    /// Owning flow.
    pub flow_id: Uuid,

    /// The step that emitted the task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<Uuid>,

    /// Queue state.
    pub state: TaskState,

    /// Creation time (epoch millis).
    pub created: i64,

    /// Last update time (epoch millis).
    pub updated: i64,

    /// Lease expiry (epoch millis) while `Leased`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expiry: Option<i64>,

    /// Identifier of the poller holding the lease.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claimed_by: Option<String>,

    /// Queue partition.
    pub task_list_name: String,

    /// Inputs payload.
    #[serde(default)]
    pub data: Map<String, Value>,

    /// Outputs payload, set on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,

    /// Error text, set on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRecord {
    /// Create a pending task.
    pub fn create(
        name: impl Into<String>,
        runner_id: Uuid,
        workflow_id: Uuid,
        flow_id: Uuid,
        step_id: Option<Uuid>,
        task_list_name: impl Into<String>,
        data: Map<String, Value>,
    ) -> Self {
        let now = now_ms();
        Self {
            task_id: Uuid::new_v4(),
            name: name.into(),
            runner_id,
            workflow_id,
            flow_id,
            step_id,
            state: TaskState::Pending,
            created: now,
            updated: now,
            lease_expiry: None,
            claimed_by: None,
            task_list_name: task_list_name.into(),
            data,
            result: None,
            error: None,
        }
    }

    /// Whether the task is terminal.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// One source file of a published flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceText {
    /// Source file name.
    pub name: String,

    /// Source text.
    pub content: String,
}

/// A published program plus its combined source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Unique flow ID.
    pub flow_id: Uuid,

    /// Flow name.
    pub name: String,

    /// Flow version.
    pub version: String,

    /// Combined sources the flow was compiled from.
    #[serde(default)]
    pub sources: Vec<SourceText>,

    /// The compiled program AST, as emitted.
    pub program: Value,

    /// Creation time (epoch millis).
    pub created: i64,
}

/// One workflow declaration within a published flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// Unique workflow ID.
    pub workflow_id: Uuid,

    /// Owning flow.
    pub flow_id: Uuid,

    /// Qualified workflow name.
    pub name: String,

    /// Version, inherited from the flow.
    pub version: String,

    /// Creation time (epoch millis).
    pub created: i64,
}

/// One execution of one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerRecord {
    /// Unique runner ID.
    pub runner_id: Uuid,

    /// The workflow being executed.
    pub workflow_id: Uuid,

    /// Owning flow.
    pub flow_id: Uuid,

    /// Qualified workflow name.
    pub workflow_name: String,

    /// Execution state.
    pub state: RunnerState,

    /// Initial inputs.
    #[serde(default)]
    pub inputs: Map<String, Value>,

    /// Root-step returns, copied here on success.
    #[serde(default)]
    pub outputs: Map<String, Value>,

    /// Root step ID, set after the first advance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_step_id: Option<Uuid>,

    /// Error text when failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Creation time (epoch millis).
    pub created: i64,

    /// Last update time (epoch millis).
    pub updated: i64,
}

impl RunnerRecord {
    /// Create a runner in the `Created` state.
    pub fn create(
        workflow_id: Uuid,
        flow_id: Uuid,
        workflow_name: impl Into<String>,
        inputs: Map<String, Value>,
    ) -> Self {
        let now = now_ms();
        Self {
            runner_id: Uuid::new_v4(),
            workflow_id,
            flow_id,
            workflow_name: workflow_name.into(),
            state: RunnerState::Created,
            inputs,
            outputs: Map::new(),
            root_step_id: None,
            error: None,
            created: now,
            updated: now,
        }
    }

    /// Mark the runner running.
    pub fn mark_running(&mut self) {
        self.state = RunnerState::Running;
        self.updated = now_ms();
    }

    /// Mark the runner succeeded with the root step's returns.
    pub fn mark_succeeded(&mut self, outputs: Map<String, Value>) {
        self.state = RunnerState::Succeeded;
        self.outputs = outputs;
        self.updated = now_ms();
    }

    /// Mark the runner failed.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = RunnerState::Failed;
        self.error = Some(error.into());
        self.updated = now_ms();
    }

    /// Mark the runner cancelled.
    pub fn mark_cancelled(&mut self) {
        self.state = RunnerState::Cancelled;
        self.updated = now_ms();
    }

    /// Whether the runner is terminal.
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// A namespace's published source under a version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedSourceRecord {
    /// Unique record ID.
    pub id: Uuid,

    /// Namespace name. Unique together with `version`.
    pub namespace_name: String,

    /// Published version.
    pub version: String,

    /// The combined source text.
    pub content: String,

    /// Creation time (epoch millis).
    pub created: i64,
}

impl PublishedSourceRecord {
    /// Create a published-source record.
    pub fn create(
        namespace_name: impl Into<String>,
        version: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            namespace_name: namespace_name.into(),
            version: version.into(),
            content: content.into(),
            created: now_ms(),
        }
    }
}
