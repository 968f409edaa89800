// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Error types for the AgentFlow core.

use thiserror::Error;
use uuid::Uuid;

/// Result type alias for AgentFlow operations.
pub type Result<T> = std::result::Result<T, AflError>;

/// Main error type for the AgentFlow runtime core.
#[derive(Error, Debug)]
pub enum AflError {
    /// A name or path in an expression could not be resolved.
    #[error("Reference error: {message} (reference: {reference})")]
    Reference {
        /// The reference text as written, e.g. `$.x` or `step.output`.
        reference: String,
        /// Why resolution failed.
        message: String,
    },

    /// Expression evaluation failed (arithmetic fault, bad index, unknown kind).
    #[error("Evaluation error: {message} (expression: {expression})")]
    Evaluation {
        /// A rendering of the offending expression.
        expression: String,
        /// Why evaluation failed.
        message: String,
    },

    /// The state machine was driven from a state it cannot handle.
    #[error("Step {step_id} is in invalid state '{state}'")]
    InvalidStepState { step_id: Uuid, state: String },

    /// An illegal state transition was attempted.
    #[error("Invalid transition for step {step_id}: cannot transition from '{from}' to '{to}'")]
    InvalidTransition {
        step_id: Uuid,
        from: String,
        to: String,
    },

    /// A conditional store update lost a race.
    #[error("Concurrency conflict: {0}")]
    Concurrency(String),

    /// An event-facet handler failed.
    #[error("Handler for '{facet}' failed: {message}")]
    HandlerFailure { facet: String, message: String },

    /// A task completion was attempted after the lease was lost.
    #[error("Lease lost for task {task_id}")]
    TaskLeaseLost { task_id: Uuid },

    /// Script execution through the sandbox failed.
    #[error("Script execution failed: {0}")]
    Script(String),

    /// A step referenced by ID does not exist.
    #[error("Step not found: {0}")]
    StepNotFound(Uuid),

    /// A workflow could not be located in the compiled program.
    #[error("Workflow '{0}' not found in program")]
    WorkflowNotFound(String),

    /// Cyclic dependency between statements of a block.
    #[error("Cyclic dependency detected between statements of a block")]
    CyclicDependency,

    /// Durable store failure, carried through the runtime.
    #[error("Store error: {0}")]
    Store(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error.
    #[error("{0}")]
    Other(String),
}

impl AflError {
    /// Create a reference error.
    pub fn reference(reference: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Reference {
            reference: reference.into(),
            message: message.into(),
        }
    }

    /// Create an evaluation error.
    pub fn evaluation(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Evaluation {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Create a handler-failure error.
    pub fn handler(facet: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerFailure {
            facet: facet.into(),
            message: message.into(),
        }
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Check if the error is transient and worth retrying.
    ///
    /// Only concurrency conflicts (conditional-update races) and store
    /// faults qualify; everything else is a program or data fault.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Concurrency(_) | Self::Store(_))
    }
}

impl From<serde_json::Error> for AflError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AflError::reference("$.x", "Input parameter 'x' not found");
        assert_eq!(
            err.to_string(),
            "Reference error: Input parameter 'x' not found (reference: $.x)"
        );
    }

    #[test]
    fn test_is_retryable() {
        assert!(AflError::Concurrency("write conflict".into()).is_retryable());
        assert!(!AflError::reference("a.b", "missing").is_retryable());
        assert!(!AflError::CyclicDependency.is_retryable());
    }
}
