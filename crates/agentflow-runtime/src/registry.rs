// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Event-facet handler registry.
//!
//! Handlers are registered by the process that runs the poller, keyed by
//! the event facet's fully-qualified name. A handler receives the step's
//! parameter attributes and a structured logging callback, and returns a
//! mapping of names to values; the runtime stores whatever comes back.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Error type handlers may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Structured logging callback handed to handlers.
pub struct TaskLog {
    task_id: Uuid,
    task_name: String,
    lines: Mutex<Vec<String>>,
}

impl TaskLog {
    /// Create a log bound to a task.
    pub fn new(task_id: Uuid, task_name: impl Into<String>) -> Self {
        Self {
            task_id,
            task_name: task_name.into(),
            lines: Mutex::new(Vec::new()),
        }
    }

    /// Record a handler log line.
    pub fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!(
            task_id = %self.task_id,
            task = %self.task_name,
            "{message}"
        );
        self.lines.lock().push(message);
    }

    /// Lines logged so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }
}

/// An external handler for one event facet.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Execute the handler with the step's parameters.
    async fn handle(
        &self,
        params: Map<String, Value>,
        log: &TaskLog,
    ) -> Result<Map<String, Value>, HandlerError>;
}

/// Adapter turning a plain function into an [`EventHandler`].
struct FnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Map<String, Value>) -> Result<Map<String, Value>, HandlerError> + Send + Sync,
{
    async fn handle(
        &self,
        params: Map<String, Value>,
        _log: &TaskLog,
    ) -> Result<Map<String, Value>, HandlerError> {
        (self.0)(params)
    }
}

/// Registry of event handlers, keyed by facet FQN.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event facet.
    pub fn register(&self, facet_name: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(facet_name.into(), handler);
    }

    /// Register a plain function as a handler.
    pub fn register_fn<F>(&self, facet_name: impl Into<String>, handler: F)
    where
        F: Fn(Map<String, Value>) -> Result<Map<String, Value>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.register(facet_name, Arc::new(FnHandler(handler)));
    }

    /// Look up a handler by facet FQN.
    pub fn get(&self, facet_name: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(facet_name).map(|h| h.clone())
    }

    /// Registered facet names.
    pub fn names(&self) -> Vec<String> {
        self.handlers.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_invoke_fn_handler() {
        let registry = HandlerRegistry::new();
        registry.register_fn("ns.AddOne", |params| {
            let input = params.get("input").and_then(|v| v.as_i64()).unwrap_or(0);
            let mut out = Map::new();
            out.insert("output".to_string(), json!(input + 1));
            Ok(out)
        });

        let handler = registry.get("ns.AddOne").unwrap();
        let mut params = Map::new();
        params.insert("input".to_string(), json!(41));

        let log = TaskLog::new(Uuid::new_v4(), "ns.AddOne");
        let result = handler.handle(params, &log).await.unwrap();
        assert_eq!(result["output"], json!(42));
    }

    #[test]
    fn test_unknown_handler() {
        let registry = HandlerRegistry::new();
        assert!(registry.get("ns.Missing").is_none());
    }

    #[test]
    fn test_task_log_collects_lines() {
        let log = TaskLog::new(Uuid::new_v4(), "ns.F");
        log.log("first");
        log.log("second");
        assert_eq!(log.lines(), vec!["first".to_string(), "second".to_string()]);
    }
}
