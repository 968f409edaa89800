// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Durable state for the AgentFlow runtime.
//!
//! This crate defines the persisted entities (flows, workflows, runners,
//! steps, tasks, published sources), the [`Store`] trait every backend
//! implements, and two implementations:
//!
//! - [`MemoryStore`] — the in-process reference store, used by tests and
//!   the single-process `run` command.
//! - [`PostgresStore`] — the production store, with conditional task
//!   claims and per-step optimistic concurrency.
//!
//! # Example
//!
//! ```no_run
//! # use agentflow_state::{MemoryStore, Store, TaskRecord};
//! # use serde_json::Map;
//! # use std::time::Duration;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = MemoryStore::new();
//! let task = TaskRecord::create(
//!     "afl:execute",
//!     uuid::Uuid::new_v4(),
//!     uuid::Uuid::new_v4(),
//!     uuid::Uuid::new_v4(),
//!     None,
//!     "default",
//!     Map::new(),
//! );
//! store.save_task(&task).await?;
//!
//! let claimed = store
//!     .claim_next_task("default", Duration::from_secs(120), "worker-1")
//!     .await?;
//! assert!(claimed.is_some());
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod models;
pub mod postgres;
pub mod traits;

// Re-export commonly used types
pub use memory::MemoryStore;
pub use models::{
    now_ms, Attribute, Attributes, FlowRecord, PublishedSourceRecord, RunnerRecord, RunnerState,
    SourceText, StepRecord, StepState, TaskRecord, TaskState, Transition, WorkflowRecord,
    DEFAULT_TASK_LIST, EXECUTE_TASK_NAME,
};
pub use postgres::PostgresStore;
pub use traits::{ChangeSet, Store, StoreError, StoreResult};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
