// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Statement-blocks and mixin-blocks phases.
//!
//! `StatementBlocksBegin` materializes a step's andThen bodies as child
//! block steps; Continue waits for them. Mixin blocks are reserved: the
//! handlers keep the container-type filter but no mixin blocks are
//! created in the current runtime.

use agentflow_core::ObjectType;
use agentflow_state::StepRecord;
use tracing::debug;

use super::HandlerResult;
use crate::analysis::BlockAnalysis;
use crate::tick::TickContext;

/// Create one block step per andThen body of this step.
pub fn statement_blocks_begin(step: &mut StepRecord, ctx: &mut TickContext<'_>) -> HandlerResult {
    let bodies = ctx.body_blocks_for(step);

    for index in 0..bodies.len() {
        let statement_id = format!("block-{index}");
        if ctx.block_step_exists(&statement_id, step.step_id) {
            continue;
        }

        let mut block = StepRecord::create(
            step.runner_id,
            step.workflow_id,
            step.flow_id,
            ObjectType::AndThenBlock,
            "",
            statement_id,
            Some(step.step_id),
            None,
            step.root_id.or(Some(step.step_id)),
        );
        block.container_type = Some(step.object_type.to_string());

        debug!(
            step_id = %step.step_id,
            block_id = %block.step_id,
            statement_id = %block.statement_id,
            "Block step created"
        );
        ctx.changes.add_created_step(block);
    }

    HandlerResult::Advance
}

/// Wait until every child block step is complete.
pub fn statement_blocks_continue(
    step: &mut StepRecord,
    ctx: &mut TickContext<'_>,
) -> HandlerResult {
    let blocks = ctx.blocks_of_step(step.step_id);
    if blocks.is_empty() {
        return HandlerResult::Advance;
    }

    let analysis = BlockAnalysis::load(step.step_id, &blocks);
    if analysis.done {
        HandlerResult::Advance
    } else {
        HandlerResult::Stay { push: true }
    }
}

/// Wait until every mixin block is complete. No mixin blocks exist in the
/// current runtime, so this is an identity transition with the filter in
/// place.
pub fn mixin_blocks_continue(step: &mut StepRecord, ctx: &mut TickContext<'_>) -> HandlerResult {
    let mixin_blocks: Vec<StepRecord> = ctx
        .blocks_of_step(step.step_id)
        .into_iter()
        .filter(|b| b.container_type.as_deref() == Some("Facet"))
        .collect();

    if mixin_blocks.is_empty() {
        return HandlerResult::Advance;
    }

    let analysis = BlockAnalysis::load(step.step_id, &mixin_blocks);
    if analysis.done {
        HandlerResult::Advance
    } else {
        HandlerResult::Stay { push: true }
    }
}
