// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Capture phases: merging yield results into the containing step.
//!
//! Each completed yield step's parameters become return attributes of the
//! step that owns the block. A body that yields nothing leaves the
//! returns empty; downstream references to a never-yielded name fail at
//! the referencing step.

use agentflow_core::ObjectType;
use agentflow_state::StepRecord;
use tracing::debug;
use uuid::Uuid;

use super::HandlerResult;
use crate::tick::TickContext;

/// Merge yields from completed statement blocks into this step's returns.
pub fn statement_capture_begin(step: &mut StepRecord, ctx: &mut TickContext<'_>) -> HandlerResult {
    let mut blocks: Vec<StepRecord> = ctx
        .blocks_of_step(step.step_id)
        .into_iter()
        .filter(|b| b.is_complete())
        .collect();
    blocks.sort_by_key(|b| b.created);

    for block in blocks {
        merge_yields_from_block(step, ctx, block.step_id);
    }

    HandlerResult::Advance
}

/// Merge yields from completed mixin blocks. Reserved: no mixin blocks
/// are created in the current runtime.
pub fn mixin_capture_begin(step: &mut StepRecord, ctx: &mut TickContext<'_>) -> HandlerResult {
    let mixin_blocks: Vec<StepRecord> = ctx
        .blocks_of_step(step.step_id)
        .into_iter()
        .filter(|b| b.container_type.as_deref() == Some("Facet") && b.is_complete())
        .collect();

    for block in mixin_blocks {
        merge_yields_from_block(step, ctx, block.step_id);
    }

    HandlerResult::Advance
}

fn merge_yields_from_block(step: &mut StepRecord, ctx: &TickContext<'_>, block_id: Uuid) {
    let mut yields: Vec<StepRecord> = ctx
        .steps_in_block(block_id)
        .into_iter()
        .filter(|s| s.object_type == ObjectType::YieldAssignment && s.is_complete())
        .collect();
    yields.sort_by_key(|y| y.created);

    for yield_step in yields {
        debug!(
            step_id = %step.step_id,
            yield_step_id = %yield_step.step_id,
            attrs = yield_step.attributes.params.len(),
            "Merging yield into step returns"
        );
        for (name, attr) in &yield_step.attributes.params {
            step.attributes
                .set_return(name.clone(), attr.value.clone(), attr.type_hint.clone());
        }
    }
}
