// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Script phase: sandbox invocation for script-bodied facets.
//!
//! Statement-level scripts are reserved and identity-transition in the
//! dispatch table.

use agentflow_core::{AflError, ObjectType, TargetKind};
use agentflow_state::StepRecord;
use tracing::debug;

use super::HandlerResult;
use crate::tick::TickContext;

/// Run the facet's script body through the sandbox, if it has one.
pub fn facet_scripts_begin(step: &mut StepRecord, ctx: &mut TickContext<'_>) -> HandlerResult {
    if step.object_type != ObjectType::VariableAssignment {
        return HandlerResult::Advance;
    }

    let Some((facet, kind)) = ctx.find_facet(&step.facet_name) else {
        return HandlerResult::Advance;
    };
    // Event facets dispatch their bodies externally in EventTransmit.
    if kind != TargetKind::Facet {
        return HandlerResult::Advance;
    }
    let Some(script) = facet.script_block() else {
        return HandlerResult::Advance;
    };

    let Some(sandbox) = ctx.sandbox else {
        return HandlerResult::Error(AflError::Script(format!(
            "facet '{}' has a script body but no sandbox is configured",
            step.facet_name
        )));
    };

    debug!(
        step_id = %step.step_id,
        facet = %step.facet_name,
        language = %script.language,
        "Invoking sandbox"
    );

    let params = step.attributes.param_values();
    match sandbox.execute(&script.language, &script.code, &params) {
        Ok(result) => {
            for (name, value) in result {
                step.attributes.set_return(name, value, None);
            }
            HandlerResult::Advance
        }
        Err(message) => HandlerResult::Error(AflError::Script(message)),
    }
}
