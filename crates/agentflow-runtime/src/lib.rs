// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! AgentFlow Runtime - durable execution of compiled agent-flow programs.
//!
//! The runtime drives each step of an executing workflow through a
//! phase-ordered state machine, materializes blocks as their dependencies
//! complete, dispatches event facets to external handlers through a
//! leased task queue, and persists every transition in a durable store.
//! A worker crash at any point neither loses nor duplicates work.
//!
//! # Example
//!
//! ```no_run
//! use agentflow_core::Program;
//! use agentflow_runtime::{drain_task_list, submit, ExecutionEngine, HandlerRegistry, TaskPoller};
//! use agentflow_state::{MemoryStore, Store};
//! use serde_json::{json, Map};
//! use std::sync::Arc;
//!
//! # async fn example(program: Program) -> Result<(), Box<dyn std::error::Error>> {
//! let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! let engine = Arc::new(ExecutionEngine::new(store.clone()));
//!
//! let registry = Arc::new(HandlerRegistry::new());
//! registry.register_fn("AddOne", |params| {
//!     let input = params.get("input").and_then(|v| v.as_i64()).unwrap_or(0);
//!     let mut out = Map::new();
//!     out.insert("output".to_string(), json!(input + 1));
//!     Ok(out)
//! });
//!
//! let mut inputs = Map::new();
//! inputs.insert("x".to_string(), json!(41));
//! let submission = submit(&store, &program, "TestAddOne", inputs, "default", Vec::new()).await?;
//!
//! let poller = TaskPoller::new(store.clone(), engine, registry, "default");
//! drain_task_list(&poller, 10).await?;
//!
//! let runner = store.get_runner(submission.runner_id).await?.unwrap();
//! assert_eq!(runner.outputs["result"], json!(42));
//! # Ok(())
//! # }
//! ```

pub mod analysis;
pub mod changer;
pub mod engine;
pub mod handlers;
pub mod poller;
pub mod publish;
pub mod registry;
pub mod sandbox;
pub mod states;
pub mod submit;
pub mod tick;

// Re-export commonly used types
pub use analysis::{BlockAnalysis, StepAnalysis};
pub use engine::ExecutionEngine;
pub use handlers::HandlerResult;
pub use poller::{drain_task_list, TaskPoller, DEFAULT_LEASE};
pub use publish::{get_published, publish};
pub use registry::{EventHandler, HandlerError, HandlerRegistry, TaskLog};
pub use sandbox::Sandbox;
pub use states::select_next_state;
pub use submit::{submit, Submission};
pub use tick::TickContext;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
