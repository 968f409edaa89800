// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Workflow submission.
//!
//! A submission creates the four records of a new execution in one
//! logical step: the Flow (compiled program plus combined sources), the
//! Workflow, the Runner in Created state, and one `afl:execute` task
//! whose claim starts the execution loop. No further submitter action is
//! required.

use std::sync::Arc;

use agentflow_core::{evaluate, AflError, EvalScope, Program, Result};
use agentflow_state::{
    now_ms, FlowRecord, RunnerRecord, SourceText, Store, TaskRecord, WorkflowRecord,
    EXECUTE_TASK_NAME,
};
use serde_json::{json, Map, Value};
use tracing::info;
use uuid::Uuid;

/// IDs of the records a submission created.
#[derive(Debug, Clone)]
pub struct Submission {
    /// The created flow.
    pub flow_id: Uuid,
    /// The created workflow.
    pub workflow_id: Uuid,
    /// The created runner.
    pub runner_id: Uuid,
    /// The initial execute task.
    pub task_id: Uuid,
}

/// Submit a workflow for execution.
///
/// Workflow parameter defaults are applied underneath `inputs`: a literal
/// default fills any parameter the caller omitted. The workflow name may
/// be simple or dotted-qualified.
pub async fn submit(
    store: &Arc<dyn Store>,
    program: &Program,
    workflow_name: &str,
    inputs: Map<String, Value>,
    task_list: &str,
    sources: Vec<SourceText>,
) -> Result<Submission> {
    let workflow_ast = program
        .find_workflow(workflow_name)
        .ok_or_else(|| AflError::WorkflowNotFound(workflow_name.to_string()))?;

    // Defaults first, caller inputs on top.
    let mut merged = Map::new();
    let empty = Map::new();
    let scope = EvalScope::inputs_only(&empty);
    for param in &workflow_ast.params {
        if let Some(default) = &param.default {
            merged.insert(param.name.clone(), evaluate(default, &scope)?);
        }
    }
    for (name, value) in inputs {
        merged.insert(name, value);
    }

    let flow = FlowRecord {
        flow_id: Uuid::new_v4(),
        name: workflow_name.to_string(),
        version: "1.0".to_string(),
        sources,
        program: serde_json::to_value(program)?,
        created: now_ms(),
    };

    let workflow = WorkflowRecord {
        workflow_id: Uuid::new_v4(),
        flow_id: flow.flow_id,
        name: workflow_name.to_string(),
        version: flow.version.clone(),
        created: now_ms(),
    };

    let runner = RunnerRecord::create(
        workflow.workflow_id,
        flow.flow_id,
        workflow_name,
        merged.clone(),
    );

    let mut data = Map::new();
    data.insert("flow_id".to_string(), json!(flow.flow_id.to_string()));
    data.insert(
        "workflow_id".to_string(),
        json!(workflow.workflow_id.to_string()),
    );
    data.insert("workflow_name".to_string(), json!(workflow_name));
    data.insert("inputs".to_string(), Value::Object(merged));
    data.insert("runner_id".to_string(), json!(runner.runner_id.to_string()));

    let task = TaskRecord::create(
        EXECUTE_TASK_NAME,
        runner.runner_id,
        workflow.workflow_id,
        flow.flow_id,
        None,
        task_list,
        data,
    );

    let err = |e: agentflow_state::StoreError| AflError::Store(e.to_string());
    store.save_flow(&flow).await.map_err(err)?;
    store.save_workflow(&workflow).await.map_err(err)?;
    store.save_runner(&runner).await.map_err(err)?;
    store.save_task(&task).await.map_err(err)?;

    info!(
        runner_id = %runner.runner_id,
        flow_id = %flow.flow_id,
        workflow = %workflow_name,
        task_list = %task.task_list_name,
        "Workflow submitted"
    );

    Ok(Submission {
        flow_id: flow.flow_id,
        workflow_id: workflow.workflow_id,
        runner_id: runner.runner_id,
        task_id: task.task_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_state::{MemoryStore, RunnerState, TaskState};

    fn program() -> Program {
        Program::from_json(
            r#"{
                "workflows": [{
                    "type": "WorkflowDecl",
                    "name": "W",
                    "params": [
                        {"name": "x", "type": "Long"},
                        {"name": "mode", "type": "String", "default": {"type": "String", "value": "fast"}}
                    ]
                }]
            }"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_creates_four_records() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut inputs = Map::new();
        inputs.insert("x".to_string(), json!(1));

        let submission = submit(&store, &program(), "W", inputs, "default", Vec::new())
            .await
            .unwrap();

        let flow = store.get_flow(submission.flow_id).await.unwrap().unwrap();
        assert_eq!(flow.name, "W");

        let workflow = store
            .get_workflow(submission.workflow_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(workflow.flow_id, submission.flow_id);

        let runner = store.get_runner(submission.runner_id).await.unwrap().unwrap();
        assert_eq!(runner.state, RunnerState::Created);
        assert_eq!(runner.inputs["x"], json!(1));
        // The default filled the omitted parameter.
        assert_eq!(runner.inputs["mode"], json!("fast"));

        let task = store.get_task(submission.task_id).await.unwrap().unwrap();
        assert_eq!(task.name, EXECUTE_TASK_NAME);
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.task_list_name, "default");
        assert_eq!(
            task.data["runner_id"],
            json!(submission.runner_id.to_string())
        );
    }

    #[tokio::test]
    async fn test_submit_unknown_workflow() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let err = submit(&store, &program(), "Nope", Map::new(), "default", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AflError::WorkflowNotFound(_)));
    }
}
