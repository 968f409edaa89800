// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Block-progress analysis.
//!
//! [`StepAnalysis`] classifies a block's statements against the steps that
//! exist for them; the block executor's Continue phase uses it to decide
//! what to create next and when the block is done. [`BlockAnalysis`] does
//! the same for a step's child blocks.

use std::collections::HashSet;

use agentflow_core::StatementInfo;
use agentflow_state::{StepRecord, StepState};
use tracing::debug;
use uuid::Uuid;

/// Execution-state classification of one block's statements.
#[derive(Debug, Default)]
pub struct StepAnalysis {
    /// Statements with no step yet.
    pub missing: Vec<StatementInfo>,

    /// Steps that completed successfully.
    pub completed: Vec<StepRecord>,

    /// Steps asking to be re-scheduled.
    pub requesting_push: Vec<StepRecord>,

    /// Steps asking for a state change.
    pub requesting_transition: Vec<StepRecord>,

    /// Steps parked on an event task.
    pub pending_event: Vec<StepRecord>,

    /// Steps waiting on child blocks.
    pub pending_blocks: Vec<StepRecord>,

    /// Total number of statements in the block.
    pub total: usize,

    /// True when every statement has a complete step.
    pub done: bool,
}

impl StepAnalysis {
    /// Classify a block's statements against its existing steps.
    pub fn load(block_id: Uuid, statements: &[&StatementInfo], steps: &[StepRecord]) -> Self {
        let mut analysis = Self {
            total: statements.len(),
            ..Self::default()
        };

        for stmt in statements {
            let step = steps.iter().find(|s| s.statement_id == stmt.id);
            match step {
                None => analysis.missing.push((*stmt).clone()),
                Some(step) => analysis.categorize(step),
            }
        }

        analysis.done =
            analysis.missing.is_empty() && analysis.completed.len() == analysis.total;

        debug!(
            block_id = %block_id,
            total = analysis.total,
            missing = analysis.missing.len(),
            completed = analysis.completed.len(),
            pending_event = analysis.pending_event.len(),
            pending_blocks = analysis.pending_blocks.len(),
            done = analysis.done,
            "Block statement analysis"
        );

        analysis
    }

    fn categorize(&mut self, step: &StepRecord) {
        if step.is_complete() {
            self.completed.push(step.clone());
        } else if step.transition.request_push {
            self.requesting_push.push(step.clone());
        } else if step.transition.request_state_change {
            self.requesting_transition.push(step.clone());
        } else if step.state == StepState::EventTransmit {
            self.pending_event.push(step.clone());
        } else if matches!(
            step.state,
            StepState::BlockExecutionContinue | StepState::StatementBlocksContinue
        ) {
            self.pending_blocks.push(step.clone());
        }
    }

    /// Completed statement IDs.
    pub fn completed_ids(&self) -> HashSet<String> {
        self.completed
            .iter()
            .map(|s| s.statement_id.clone())
            .collect()
    }

    /// Whether nothing can be created and nothing is running.
    pub fn is_blocked(&self, creatable: usize) -> bool {
        !self.missing.is_empty()
            && creatable == 0
            && self.requesting_transition.is_empty()
            && self.requesting_push.is_empty()
    }

    /// Completion progress as (completed, total).
    pub fn progress(&self) -> (usize, usize) {
        (self.completed.len(), self.total)
    }
}

/// Completion analysis of a step's child blocks.
#[derive(Debug, Default)]
pub struct BlockAnalysis {
    /// Completed child blocks.
    pub completed: Vec<StepRecord>,

    /// Child blocks still running.
    pub pending: Vec<StepRecord>,

    /// True when no child block is pending.
    pub done: bool,
}

impl BlockAnalysis {
    /// Classify a step's child blocks.
    pub fn load(step_id: Uuid, blocks: &[StepRecord]) -> Self {
        let mut analysis = Self::default();
        for block in blocks {
            if block.is_complete() {
                analysis.completed.push(block.clone());
            } else {
                analysis.pending.push(block.clone());
            }
        }
        analysis.done = analysis.pending.is_empty();

        debug!(
            step_id = %step_id,
            completed = analysis.completed.len(),
            pending = analysis.pending.len(),
            "Child block analysis"
        );

        analysis
    }
}
