// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! AgentFlow Core - compiled-program model and pure analysis.
//!
//! This crate holds everything the runtime needs that performs no I/O:
//! the serde mirror of the compiled program AST, name resolution across
//! namespaces, the expression evaluator, and the per-block dependency
//! graph builder.
//!
//! # Example
//!
//! ```rust
//! use agentflow_core::{evaluate, EvalScope, Expression, Program};
//! use serde_json::{json, Map};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let program = Program::from_json(r#"{
//!     "eventFacets": [{"type": "EventFacetDecl", "name": "AddOne"}]
//! }"#)?;
//! assert!(program.is_event_facet("AddOne"));
//!
//! let mut inputs = Map::new();
//! inputs.insert("x".to_string(), json!(41));
//! let scope = EvalScope::inputs_only(&inputs);
//! let expr: Expression = serde_json::from_value(json!(
//!     {"type": "InputRef", "path": ["x"]}
//! ))?;
//! assert_eq!(evaluate(&expr, &scope)?, json!(41));
//! # Ok(())
//! # }
//! ```

pub mod dependency;
pub mod error;
pub mod expression;
pub mod program;
pub mod resolver;

// Re-export commonly used types
pub use dependency::{DependencyGraph, ObjectType, StatementInfo};
pub use error::{AflError, Result};
pub use expression::{evaluate, evaluate_args, EvalScope};
pub use program::{
    AndThenBlock, Body, BodyBlock, CallExpr, Declaration, Expression, Facet, ForeachClause,
    MapEntry, Mixin, NamedArg, Namespace, Param, Program, PromptBlock, Schema, SchemaField,
    ScriptBlock, StepStmt, YieldStmt,
};
pub use resolver::{ResolvedTarget, TargetKind};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
