// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! End-to-end execution scenarios over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use agentflow_core::{ObjectType, Program};
use agentflow_runtime::{
    drain_task_list, submit, ExecutionEngine, HandlerRegistry, Sandbox, TaskPoller,
};
use agentflow_state::{MemoryStore, RunnerState, StepState, Store};
use serde_json::{json, Map, Value};
use uuid::Uuid;

fn inputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn add_one_registry() -> Arc<HandlerRegistry> {
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_fn("AddOne", |params| {
        let input = params.get("input").and_then(Value::as_i64).unwrap_or(0);
        let mut out = Map::new();
        out.insert("output".to_string(), json!(input + 1));
        Ok(out)
    });
    registry
}

fn harness(
    registry: Arc<HandlerRegistry>,
) -> (Arc<dyn Store>, Arc<ExecutionEngine>, TaskPoller) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let engine = Arc::new(ExecutionEngine::new(store.clone()));
    let poller = TaskPoller::new(store.clone(), engine.clone(), registry, "default")
        .with_lease(Duration::from_secs(60));
    (store, engine, poller)
}

fn add_one_program() -> Program {
    Program::from_json(
        r#"{
            "type": "Program",
            "workflows": [{
                "type": "WorkflowDecl",
                "name": "TestAddOne",
                "params": [{"name": "x", "type": "Long"}],
                "returns": [{"name": "result", "type": "Long"}],
                "body": {
                    "type": "AndThenBlock",
                    "steps": [{
                        "type": "StepStmt",
                        "id": "s1",
                        "name": "step",
                        "call": {
                            "type": "CallExpr",
                            "target": "AddOne",
                            "args": [{"name": "input", "value": {"type": "InputRef", "path": ["x"]}}]
                        }
                    }],
                    "yield": {
                        "type": "YieldStmt",
                        "id": "y1",
                        "call": {
                            "type": "CallExpr",
                            "target": "TestAddOne",
                            "args": [{"name": "result", "value": {"type": "StepRef", "path": ["step", "output"]}}]
                        }
                    }
                }
            }],
            "eventFacets": [{
                "type": "EventFacetDecl",
                "name": "AddOne",
                "params": [{"name": "input", "type": "Long"}],
                "returns": [{"name": "output", "type": "Long"}]
            }]
        }"#,
    )
    .unwrap()
}

async fn run_to_completion(
    store: &Arc<dyn Store>,
    poller: &TaskPoller,
    runner_id: Uuid,
) -> agentflow_state::RunnerRecord {
    for _ in 0..100 {
        drain_task_list(poller, 3).await.unwrap();
        let runner = store.get_runner(runner_id).await.unwrap().unwrap();
        if runner.is_terminal() {
            return runner;
        }
    }
    panic!("runner did not reach a terminal state");
}

#[tokio::test]
async fn test_add_one_succeeds() {
    let (store, _engine, poller) = harness(add_one_registry());
    let program = add_one_program();

    let submission = submit(
        &store,
        &program,
        "TestAddOne",
        inputs(&[("x", json!(1))]),
        "default",
        Vec::new(),
    )
    .await
    .unwrap();

    let runner = run_to_completion(&store, &poller, submission.runner_id).await;
    assert_eq!(runner.state, RunnerState::Succeeded);
    assert_eq!(runner.outputs["result"], json!(2));

    // The root step carries the same returns.
    let root = store
        .get_step(runner.root_step_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(root.is_complete());
    assert_eq!(root.attributes.return_values()["result"], json!(2));
}

#[tokio::test]
async fn test_add_one_forty_one() {
    let (store, _engine, poller) = harness(add_one_registry());
    let submission = submit(
        &store,
        &add_one_program(),
        "TestAddOne",
        inputs(&[("x", json!(41))]),
        "default",
        Vec::new(),
    )
    .await
    .unwrap();

    let runner = run_to_completion(&store, &poller, submission.runner_id).await;
    assert_eq!(runner.state, RunnerState::Succeeded);
    assert_eq!(runner.outputs["result"], json!(42));
}

fn two_step_program() -> Program {
    Program::from_json(
        r#"{
            "type": "Program",
            "workflows": [{
                "type": "WorkflowDecl",
                "name": "TwoStep",
                "params": [{"name": "x", "type": "Long"}],
                "returns": [{"name": "out", "type": "Long"}],
                "body": {
                    "type": "AndThenBlock",
                    "steps": [
                        {
                            "type": "StepStmt",
                            "id": "s1",
                            "name": "s1",
                            "call": {
                                "target": "AddOne",
                                "args": [{"name": "input", "value": {"type": "InputRef", "path": ["x"]}}]
                            }
                        },
                        {
                            "type": "StepStmt",
                            "id": "s2",
                            "name": "s2",
                            "call": {
                                "target": "AddOne",
                                "args": [{"name": "input", "value": {
                                    "type": "BinaryExpr",
                                    "operator": "+",
                                    "left": {"type": "StepRef", "path": ["s1", "output"]},
                                    "right": {"type": "Int", "value": 1}
                                }}]
                            }
                        }
                    ],
                    "yield": {
                        "id": "y1",
                        "call": {
                            "target": "TwoStep",
                            "args": [{"name": "out", "value": {"type": "StepRef", "path": ["s2", "output"]}}]
                        }
                    }
                }
            }],
            "eventFacets": [{
                "type": "EventFacetDecl",
                "name": "AddOne",
                "params": [{"name": "input", "type": "Long"}],
                "returns": [{"name": "output", "type": "Long"}]
            }]
        }"#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_two_step_arithmetic() {
    let (store, _engine, poller) = harness(add_one_registry());
    let submission = submit(
        &store,
        &two_step_program(),
        "TwoStep",
        inputs(&[("x", json!(1))]),
        "default",
        Vec::new(),
    )
    .await
    .unwrap();

    let runner = run_to_completion(&store, &poller, submission.runner_id).await;
    assert_eq!(runner.state, RunnerState::Succeeded);

    let steps = store
        .get_steps_by_runner(submission.runner_id)
        .await
        .unwrap();
    let s1 = steps.iter().find(|s| s.statement_id == "s1").unwrap();
    let s2 = steps.iter().find(|s| s.statement_id == "s2").unwrap();

    // s2 was blocked on s1: it can only have been created afterwards.
    assert!(s2.created >= s1.created);
    assert_eq!(s1.attributes.param_values()["input"], json!(1));
    assert_eq!(s1.attributes.return_values()["output"], json!(2));
    // s1.output + 1 evaluated to 3 before dispatch.
    assert_eq!(s2.attributes.param_values()["input"], json!(3));
    assert_eq!(runner.outputs["out"], json!(4));
}

#[tokio::test]
async fn test_dependency_respect_under_parallel_siblings() {
    // Two independent steps plus one dependent: the dependent step must
    // not initialize before both dependencies are complete.
    let program = Program::from_json(
        r#"{
            "workflows": [{
                "type": "WorkflowDecl",
                "name": "Fan",
                "params": [{"name": "x", "type": "Long"}],
                "returns": [{"name": "out", "type": "Long"}],
                "body": {
                    "type": "AndThenBlock",
                    "steps": [
                        {"id": "a", "name": "a", "call": {"target": "AddOne",
                            "args": [{"name": "input", "value": {"type": "InputRef", "path": ["x"]}}]}},
                        {"id": "b", "name": "b", "call": {"target": "AddOne",
                            "args": [{"name": "input", "value": {"type": "InputRef", "path": ["x"]}}]}},
                        {"id": "c", "name": "c", "call": {"target": "AddOne",
                            "args": [{"name": "input", "value": {
                                "type": "BinaryExpr", "operator": "+",
                                "left": {"type": "StepRef", "path": ["a", "output"]},
                                "right": {"type": "StepRef", "path": ["b", "output"]}}}]}}
                    ],
                    "yield": {"id": "y", "call": {"target": "Fan",
                        "args": [{"name": "out", "value": {"type": "StepRef", "path": ["c", "output"]}}]}}
                }
            }],
            "eventFacets": [{
                "type": "EventFacetDecl",
                "name": "AddOne",
                "params": [{"name": "input", "type": "Long"}],
                "returns": [{"name": "output", "type": "Long"}]
            }]
        }"#,
    )
    .unwrap();

    let (store, _engine, poller) = harness(add_one_registry());
    let submission = submit(
        &store,
        &program,
        "Fan",
        inputs(&[("x", json!(10))]),
        "default",
        Vec::new(),
    )
    .await
    .unwrap();

    let runner = run_to_completion(&store, &poller, submission.runner_id).await;
    assert_eq!(runner.state, RunnerState::Succeeded);
    // a = 11, b = 11, c = AddOne(22) = 23.
    assert_eq!(runner.outputs["out"], json!(23));

    let steps = store
        .get_steps_by_runner(submission.runner_id)
        .await
        .unwrap();
    let a = steps.iter().find(|s| s.statement_id == "a").unwrap();
    let b = steps.iter().find(|s| s.statement_id == "b").unwrap();
    let c = steps.iter().find(|s| s.statement_id == "c").unwrap();
    assert!(c.created >= a.created);
    assert!(c.created >= b.created);
    assert_eq!(c.attributes.param_values()["input"], json!(22));
}

fn foreach_program() -> Program {
    Program::from_json(
        r#"{
            "workflows": [{
                "type": "WorkflowDecl",
                "name": "Each",
                "params": [{"name": "items", "type": "List"}],
                "returns": [{"name": "sum", "type": "Long"}],
                "body": {
                    "type": "AndThenBlock",
                    "foreach": {"variable": "item", "iterable": {"type": "InputRef", "path": ["items"]}},
                    "steps": [{
                        "id": "r", "name": "r",
                        "call": {"target": "Double",
                            "args": [{"name": "n", "value": {"type": "InputRef", "path": ["item"]}}]}
                    }],
                    "yield": {"id": "y", "call": {"target": "Each",
                        "args": [{"name": "sum", "value": {"type": "StepRef", "path": ["r", "out"]}}]}}
                }
            }],
            "eventFacets": [{
                "type": "EventFacetDecl",
                "name": "Double",
                "params": [{"name": "n", "type": "Long"}],
                "returns": [{"name": "out", "type": "Long"}]
            }]
        }"#,
    )
    .unwrap()
}

#[tokio::test]
async fn test_foreach_spawns_sub_blocks() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_fn("Double", |params| {
        let n = params.get("n").and_then(Value::as_i64).unwrap_or(0);
        let mut out = Map::new();
        out.insert("out".to_string(), json!(n * 2));
        Ok(out)
    });

    let (store, _engine, poller) = harness(registry);
    let submission = submit(
        &store,
        &foreach_program(),
        "Each",
        inputs(&[("items", json!([1, 2, 3]))]),
        "default",
        Vec::new(),
    )
    .await
    .unwrap();

    let runner = run_to_completion(&store, &poller, submission.runner_id).await;
    assert_eq!(runner.state, RunnerState::Succeeded);

    let steps = store
        .get_steps_by_runner(submission.runner_id)
        .await
        .unwrap();

    // Three sub-blocks, one per element.
    let sub_blocks: Vec<_> = steps
        .iter()
        .filter(|s| s.statement_id.starts_with("foreach-"))
        .collect();
    assert_eq!(sub_blocks.len(), 3);
    for sub in &sub_blocks {
        assert!(sub.is_complete());
        assert_eq!(sub.foreach_var.as_deref(), Some("item"));
    }

    // Each iteration yielded its doubled element.
    let mut yielded: Vec<i64> = steps
        .iter()
        .filter(|s| s.object_type == ObjectType::YieldAssignment)
        .map(|y| y.attributes.param_values()["sum"].as_i64().unwrap())
        .collect();
    yielded.sort_unstable();
    assert_eq!(yielded, vec![2, 4, 6]);

    // The outer step aggregated the yields; its sum is one of them.
    let sum = runner.outputs["sum"].as_i64().unwrap();
    assert!([2, 4, 6].contains(&sum));
}

#[tokio::test]
async fn test_foreach_empty_iterable_completes() {
    let registry = Arc::new(HandlerRegistry::new());
    let (store, _engine, poller) = harness(registry);
    let submission = submit(
        &store,
        &foreach_program(),
        "Each",
        inputs(&[("items", json!([]))]),
        "default",
        Vec::new(),
    )
    .await
    .unwrap();

    let runner = run_to_completion(&store, &poller, submission.runner_id).await;
    assert_eq!(runner.state, RunnerState::Succeeded);
    assert!(runner.outputs.is_empty());
}

#[tokio::test]
async fn test_schema_instantiation() {
    let program = Program::from_json(
        r#"{
            "schemas": [{
                "type": "SchemaDecl",
                "name": "Addr",
                "fields": [
                    {"name": "city", "type": "String"},
                    {"name": "zip", "type": "String"}
                ]
            }],
            "workflows": [{
                "type": "WorkflowDecl",
                "name": "UseAddr",
                "returns": [{"name": "city", "type": "String"}, {"name": "zip", "type": "String"}],
                "body": {
                    "type": "AndThenBlock",
                    "steps": [{
                        "id": "a", "name": "a",
                        "call": {"target": "Addr", "args": [
                            {"name": "city", "value": {"type": "String", "value": "X"}},
                            {"name": "zip", "value": {"type": "String", "value": "1"}}
                        ]}
                    }],
                    "yield": {"id": "y", "call": {"target": "UseAddr", "args": [
                        {"name": "city", "value": {"type": "StepRef", "path": ["a", "city"]}},
                        {"name": "zip", "value": {"type": "StepRef", "path": ["a", "zip"]}}
                    ]}}
                }
            }]
        }"#,
    )
    .unwrap();

    let (store, _engine, poller) = harness(Arc::new(HandlerRegistry::new()));
    let submission = submit(&store, &program, "UseAddr", Map::new(), "default", Vec::new())
        .await
        .unwrap();

    let runner = run_to_completion(&store, &poller, submission.runner_id).await;
    assert_eq!(runner.state, RunnerState::Succeeded);
    assert_eq!(runner.outputs["city"], json!("X"));
    assert_eq!(runner.outputs["zip"], json!("1"));

    let steps = store
        .get_steps_by_runner(submission.runner_id)
        .await
        .unwrap();
    let a = steps.iter().find(|s| s.statement_id == "a").unwrap();
    assert_eq!(a.object_type, ObjectType::SchemaInstantiation);
    // Schema fields land as returns, readable as a.city downstream.
    assert_eq!(a.attributes.return_values()["city"], json!("X"));
    assert_eq!(a.attributes.return_values()["zip"], json!("1"));
}

#[tokio::test]
async fn test_nested_facet_body_scope_and_empty_yield() {
    // Wrap has a body but yields nothing: the wrap step completes with
    // empty returns, and the downstream reference to wrap.missing fails
    // that downstream step, failing the runner.
    let program = Program::from_json(
        r#"{
            "facets": [{
                "type": "FacetDecl",
                "name": "Wrap",
                "params": [{"name": "v", "type": "Long"}],
                "returns": [{"name": "w", "type": "Long"}],
                "body": {
                    "type": "AndThenBlock",
                    "steps": [{
                        "id": "inner", "name": "inner",
                        "call": {"target": "AddOne",
                            "args": [{"name": "input", "value": {"type": "InputRef", "path": ["v"]}}]}
                    }]
                }
            }],
            "workflows": [{
                "type": "WorkflowDecl",
                "name": "W",
                "params": [{"name": "x", "type": "Long"}],
                "returns": [{"name": "out", "type": "Long"}],
                "body": {
                    "type": "AndThenBlock",
                    "steps": [
                        {"id": "wrap", "name": "wrap", "call": {"target": "Wrap",
                            "args": [{"name": "v", "value": {"type": "InputRef", "path": ["x"]}}]}},
                        {"id": "after", "name": "after", "call": {"target": "AddOne",
                            "args": [{"name": "input", "value": {"type": "StepRef", "path": ["wrap", "missing"]}}]}}
                    ],
                    "yield": {"id": "y", "call": {"target": "W",
                        "args": [{"name": "out", "value": {"type": "StepRef", "path": ["after", "output"]}}]}}
                }
            }],
            "eventFacets": [{
                "type": "EventFacetDecl",
                "name": "AddOne",
                "params": [{"name": "input", "type": "Long"}],
                "returns": [{"name": "output", "type": "Long"}]
            }]
        }"#,
    )
    .unwrap();

    let (store, _engine, poller) = harness(add_one_registry());
    let submission = submit(
        &store,
        &program,
        "W",
        inputs(&[("x", json!(5))]),
        "default",
        Vec::new(),
    )
    .await
    .unwrap();

    let runner = run_to_completion(&store, &poller, submission.runner_id).await;
    assert_eq!(runner.state, RunnerState::Failed);

    let steps = store
        .get_steps_by_runner(submission.runner_id)
        .await
        .unwrap();

    // The wrap step completed, with empty returns, and its inner step saw
    // the facet parameter scope ($.v).
    let wrap = steps.iter().find(|s| s.statement_id == "wrap").unwrap();
    assert!(wrap.is_complete());
    assert!(wrap.attributes.returns.is_empty());
    let inner = steps.iter().find(|s| s.statement_id == "inner").unwrap();
    assert_eq!(inner.attributes.param_values()["input"], json!(5));
    assert_eq!(inner.attributes.return_values()["output"], json!(6));

    // The downstream step failed on the unresolved reference.
    let after = steps.iter().find(|s| s.statement_id == "after").unwrap();
    assert_eq!(after.state, StepState::Error);
    assert!(after.error.as_deref().unwrap().contains("missing"));
    assert!(runner.error.is_some());
}

#[tokio::test]
async fn test_handler_failure_fails_runner() {
    let registry = Arc::new(HandlerRegistry::new());
    registry.register_fn("AddOne", |_params| Err("upstream exploded".into()));

    let (store, _engine, poller) = harness(registry);
    let submission = submit(
        &store,
        &add_one_program(),
        "TestAddOne",
        inputs(&[("x", json!(1))]),
        "default",
        Vec::new(),
    )
    .await
    .unwrap();

    let runner = run_to_completion(&store, &poller, submission.runner_id).await;
    assert_eq!(runner.state, RunnerState::Failed);
    assert!(runner.error.as_deref().unwrap().contains("AddOne"));

    // Remaining non-terminal steps were short-circuited.
    let steps = store
        .get_steps_by_runner(submission.runner_id)
        .await
        .unwrap();
    assert!(steps.iter().all(|s| s.is_terminal()));
}

#[tokio::test]
async fn test_crash_and_resume_between_workers() {
    let (store, engine_a, poller_a) = harness(add_one_registry());
    let submission = submit(
        &store,
        &add_one_program(),
        "TestAddOne",
        inputs(&[("x", json!(41))]),
        "default",
        Vec::new(),
    )
    .await
    .unwrap();

    // Worker A claims the initial execute tick and advances until the step
    // parks in event transmit, then dies without further progress.
    assert!(poller_a.poll_once().await.unwrap());
    let steps = store
        .get_steps_by_runner(submission.runner_id)
        .await
        .unwrap();
    assert!(steps
        .iter()
        .any(|s| s.state == StepState::EventTransmit && !s.is_terminal()));
    drop(poller_a);
    drop(engine_a);

    // Worker B joins the same store and finishes the run.
    let engine_b = Arc::new(ExecutionEngine::new(store.clone()));
    let poller_b = TaskPoller::new(
        store.clone(),
        engine_b,
        add_one_registry(),
        "default",
    );
    let runner = run_to_completion(&store, &poller_b, submission.runner_id).await;

    assert_eq!(runner.state, RunnerState::Succeeded);
    assert_eq!(runner.outputs["result"], json!(42));
}

#[tokio::test]
async fn test_resume_is_idempotent() {
    let (store, engine, poller) = harness(add_one_registry());
    let submission = submit(
        &store,
        &add_one_program(),
        "TestAddOne",
        inputs(&[("x", json!(1))]),
        "default",
        Vec::new(),
    )
    .await
    .unwrap();

    // Interleave redundant advances with normal polling; re-running the
    // tick from any intermediate persistent state must not duplicate
    // steps or tasks.
    for _ in 0..3 {
        engine.advance(submission.runner_id).await.unwrap();
    }
    assert!(poller.poll_once().await.unwrap());
    for _ in 0..3 {
        engine.advance(submission.runner_id).await.unwrap();
    }

    let steps_before = store
        .get_steps_by_runner(submission.runner_id)
        .await
        .unwrap()
        .len();
    let tasks_before = store
        .get_tasks_by_runner(submission.runner_id)
        .await
        .unwrap()
        .len();

    engine.advance(submission.runner_id).await.unwrap();

    let steps_after = store
        .get_steps_by_runner(submission.runner_id)
        .await
        .unwrap()
        .len();
    let tasks_after = store
        .get_tasks_by_runner(submission.runner_id)
        .await
        .unwrap()
        .len();
    assert_eq!(steps_before, steps_after);
    assert_eq!(tasks_before, tasks_after);

    let runner = run_to_completion(&store, &poller, submission.runner_id).await;
    assert_eq!(runner.state, RunnerState::Succeeded);
    assert_eq!(runner.outputs["result"], json!(2));

    // Exactly one step exists per (block, statement) key.
    let steps = store
        .get_steps_by_runner(submission.runner_id)
        .await
        .unwrap();
    let mut keys: Vec<(Option<Uuid>, String)> = steps
        .iter()
        .map(|s| (s.block_id, s.statement_id.clone()))
        .collect();
    keys.sort();
    let total = keys.len();
    keys.dedup();
    assert_eq!(keys.len(), total, "duplicate steps created");
}

/// Binds `a` and returns `b = a * 10`, standing in for a real Python
/// sandbox.
struct TimesTenSandbox;

impl Sandbox for TimesTenSandbox {
    fn execute(
        &self,
        language: &str,
        _code: &str,
        params: &Map<String, Value>,
    ) -> Result<Map<String, Value>, String> {
        if language != "python" {
            return Err(format!("unsupported language: {language}"));
        }
        let a = params.get("a").and_then(Value::as_i64).unwrap_or(0);
        let mut out = Map::new();
        out.insert("b".to_string(), json!(a * 10));
        Ok(out)
    }
}

#[tokio::test]
async fn test_script_facet_through_sandbox() {
    let program = Program::from_json(
        r#"{
            "facets": [{
                "type": "FacetDecl",
                "name": "Calc",
                "params": [{"name": "a", "type": "Long"}],
                "returns": [{"name": "b", "type": "Long"}],
                "body": {"type": "ScriptBlock", "language": "python", "code": "b = a * 10"}
            }],
            "workflows": [{
                "type": "WorkflowDecl",
                "name": "W",
                "params": [{"name": "x", "type": "Long"}],
                "returns": [{"name": "out", "type": "Long"}],
                "body": {
                    "type": "AndThenBlock",
                    "steps": [{
                        "id": "c", "name": "c",
                        "call": {"target": "Calc",
                            "args": [{"name": "a", "value": {"type": "InputRef", "path": ["x"]}}]}
                    }],
                    "yield": {"id": "y", "call": {"target": "W",
                        "args": [{"name": "out", "value": {"type": "StepRef", "path": ["c", "b"]}}]}}
                }
            }]
        }"#,
    )
    .unwrap();

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let engine = Arc::new(
        ExecutionEngine::new(store.clone()).with_sandbox(Arc::new(TimesTenSandbox)),
    );
    let poller = TaskPoller::new(
        store.clone(),
        engine,
        Arc::new(HandlerRegistry::new()),
        "default",
    );

    let submission = submit(
        &store,
        &program,
        "W",
        inputs(&[("x", json!(4))]),
        "default",
        Vec::new(),
    )
    .await
    .unwrap();

    let runner = run_to_completion(&store, &poller, submission.runner_id).await;
    assert_eq!(runner.state, RunnerState::Succeeded);
    assert_eq!(runner.outputs["out"], json!(40));
}

#[tokio::test]
async fn test_script_facet_without_sandbox_fails() {
    let program = Program::from_json(
        r#"{
            "facets": [{
                "type": "FacetDecl",
                "name": "Calc",
                "params": [{"name": "a", "type": "Long"}],
                "returns": [{"name": "b", "type": "Long"}],
                "body": {"type": "ScriptBlock", "language": "python", "code": "b = a"}
            }],
            "workflows": [{
                "type": "WorkflowDecl",
                "name": "W",
                "returns": [{"name": "out", "type": "Long"}],
                "body": {
                    "type": "AndThenBlock",
                    "steps": [{
                        "id": "c", "name": "c",
                        "call": {"target": "Calc",
                            "args": [{"name": "a", "value": {"type": "Int", "value": 1}}]}
                    }],
                    "yield": {"id": "y", "call": {"target": "W",
                        "args": [{"name": "out", "value": {"type": "StepRef", "path": ["c", "b"]}}]}}
                }
            }]
        }"#,
    )
    .unwrap();

    let (store, _engine, poller) = harness(Arc::new(HandlerRegistry::new()));
    let submission = submit(&store, &program, "W", Map::new(), "default", Vec::new())
        .await
        .unwrap();

    let runner = run_to_completion(&store, &poller, submission.runner_id).await;
    assert_eq!(runner.state, RunnerState::Failed);
    assert!(runner.error.as_deref().unwrap().contains("sandbox"));
}

#[tokio::test]
async fn test_cancel_runner_short_circuits() {
    // The event task list is never polled, so the run parks in event
    // transmit after the first advance.
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let engine = Arc::new(ExecutionEngine::new(store.clone()));

    let submission = submit(
        &store,
        &add_one_program(),
        "TestAddOne",
        inputs(&[("x", json!(1))]),
        "default",
        Vec::new(),
    )
    .await
    .unwrap();

    engine.advance(submission.runner_id).await.unwrap();

    let runner = store
        .get_runner(submission.runner_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(runner.state, RunnerState::Running);

    let runner = engine.cancel(submission.runner_id).await.unwrap();
    assert_eq!(runner.state, RunnerState::Cancelled);

    let steps = store
        .get_steps_by_runner(submission.runner_id)
        .await
        .unwrap();
    assert!(steps
        .iter()
        .all(|s| s.is_terminal()));
    assert!(steps.iter().any(|s| s.state == StepState::Cancelled));

    let tasks = store
        .get_tasks_by_runner(submission.runner_id)
        .await
        .unwrap();
    assert!(tasks.iter().all(|t| t.is_terminal()));

    // Cancelling again is a no-op.
    let runner = engine.cancel(submission.runner_id).await.unwrap();
    assert_eq!(runner.state, RunnerState::Cancelled);
}
