// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Event transmit: the only phase that touches the outside world, and it
//! does so by emitting a task and parking.
//!
//! On first entry the step's parameters go out as a task named after the
//! event facet. The step then stays put, without re-queueing, until a
//! poller captures the handler's result; the poller wakes the runner and
//! the step resumes here with the task terminal.

use agentflow_core::{AflError, TargetKind};
use agentflow_state::{StepRecord, TaskRecord, TaskState};
use tracing::{debug, warn};

use super::HandlerResult;
use crate::tick::TickContext;

/// Dispatch to the event-facet handler, or resume from its result.
pub fn event_transmit(step: &mut StepRecord, ctx: &mut TickContext<'_>) -> HandlerResult {
    let Some((facet, kind)) = ctx.find_facet(&step.facet_name) else {
        return HandlerResult::Advance;
    };
    if kind != TargetKind::EventFacet {
        return HandlerResult::Advance;
    }

    let tasks = ctx.tasks_for_step(step.step_id);
    let event_task = tasks.iter().filter(|t| t.name == step.facet_name).next_back();

    let Some(task) = event_task else {
        let task = TaskRecord::create(
            step.facet_name.clone(),
            step.runner_id,
            step.workflow_id,
            step.flow_id,
            Some(step.step_id),
            ctx.task_list.clone(),
            step.attributes.param_values(),
        );
        debug!(
            step_id = %step.step_id,
            facet = %step.facet_name,
            task_id = %task.task_id,
            "Event task emitted; step parked"
        );
        ctx.changes.add_task(task);
        return HandlerResult::Stay { push: false };
    };

    match task.state {
        TaskState::Completed => {
            let result = task.result.clone().unwrap_or_default();
            for (name, value) in result {
                let hint = facet
                    .returns
                    .iter()
                    .find(|p| p.name == name)
                    .map(|p| p.type_name.clone());
                step.attributes.set_return(name, value, hint);
            }
            debug!(
                step_id = %step.step_id,
                facet = %step.facet_name,
                "Event task completed; resuming step"
            );
            HandlerResult::Advance
        }
        TaskState::Failed => {
            warn!(
                step_id = %step.step_id,
                facet = %step.facet_name,
                error = task.error.as_deref().unwrap_or(""),
                "Event task failed"
            );
            HandlerResult::Error(AflError::handler(
                &step.facet_name,
                task.error.clone().unwrap_or_else(|| "handler failed".into()),
            ))
        }
        TaskState::Cancelled => {
            step.mark_cancelled();
            HandlerResult::Stay { push: false }
        }
        TaskState::Pending | TaskState::Leased => HandlerResult::Stay { push: false },
    }
}
