// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! The changer: drives one step through as many transitions as it can.
//!
//! A drive loops select-next-state / execute-handler until the step is
//! terminal or a handler returns stay-and-requeue. Handlers see the tick
//! snapshot; the step itself is mutated in place and committed by the
//! engine afterwards.

use agentflow_state::StepRecord;
use tracing::{debug, warn};

use crate::handlers::{self, HandlerResult};
use crate::states::select_next_state;
use crate::tick::TickContext;

/// Drive a step until it parks or reaches a terminal state.
pub fn drive(step: &mut StepRecord, ctx: &mut TickContext<'_>) {
    if step.is_terminal() {
        return;
    }

    debug!(
        step_id = %step.step_id,
        object_type = %step.object_type,
        state = %step.state,
        "Driving step"
    );

    loop {
        if step.transition.request_state_change {
            match select_next_state(step.object_type, step.state) {
                Some(next) => {
                    debug!(
                        step_id = %step.step_id,
                        from = %step.state,
                        to = %next,
                        "State transition"
                    );
                    step.change_state(next);
                }
                None => {
                    step.request_state_change(false);
                }
            }
            if step.is_terminal() {
                return;
            }
        }

        match handlers::execute(step, ctx) {
            HandlerResult::Advance => {
                step.request_state_change(true);
            }
            HandlerResult::Stay { push } => {
                step.request_state_change(false);
                step.request_push(push);
                return;
            }
            HandlerResult::Error(err) => {
                warn!(
                    step_id = %step.step_id,
                    state = %step.state,
                    error = %err,
                    "Handler error; step failed"
                );
                step.mark_error(err.to_string());
                return;
            }
        }

        if step.is_terminal() || !step.transition.request_state_change {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::{Facet, ObjectType, Program};
    use agentflow_state::{RunnerRecord, StepState};
    use serde_json::Map;
    use uuid::Uuid;

    fn empty_program() -> (Program, Facet) {
        let program = Program::from_json(r#"{"workflows": [{"name": "W"}]}"#).unwrap();
        let workflow = program.workflows[0].clone();
        (program, workflow)
    }

    #[test]
    fn test_drive_terminal_step_is_a_no_op() {
        let (program, workflow) = empty_program();
        let runner = RunnerRecord::create(Uuid::new_v4(), Uuid::new_v4(), "W", Map::new());
        let mut ctx = TickContext::new(
            &program,
            &workflow,
            &runner,
            Vec::new(),
            Vec::new(),
            "default",
            None,
        );

        let mut step = StepRecord::create(
            runner.runner_id,
            runner.workflow_id,
            runner.flow_id,
            ObjectType::VariableAssignment,
            "W",
            "s1",
            Some(Uuid::new_v4()),
            Some(Uuid::new_v4()),
            None,
        );
        step.state = StepState::StatementComplete;
        step.transition = Default::default();

        let before = step.clone();
        drive(&mut step, &mut ctx);
        assert_eq!(step, before);
    }

    #[test]
    fn test_block_with_no_body_completes() {
        let (program, workflow) = empty_program();
        let runner = RunnerRecord::create(Uuid::new_v4(), Uuid::new_v4(), "W", Map::new());
        let mut ctx = TickContext::new(
            &program,
            &workflow,
            &runner,
            Vec::new(),
            Vec::new(),
            "default",
            None,
        );

        // A block whose container cannot be found has no AST; it runs the
        // block table straight to completion.
        let mut block = StepRecord::create(
            runner.runner_id,
            runner.workflow_id,
            runner.flow_id,
            ObjectType::AndThenBlock,
            "",
            "block-0",
            Some(Uuid::new_v4()),
            None,
            None,
        );

        drive(&mut block, &mut ctx);
        assert_eq!(block.state, StepState::StatementComplete);
    }
}
