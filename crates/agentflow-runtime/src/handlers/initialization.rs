// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Initialization phase: argument evaluation.
//!
//! `FacetInitializationBegin` is where `$.input + 1` becomes a concrete
//! value. Arguments are evaluated in the containing block's scope, facet
//! parameter defaults fill the gaps, and the results land on the step as
//! parameter attributes. Schema instantiations store the same values as
//! returns, making `step.field` readable downstream.

use agentflow_core::{evaluate, evaluate_args, AflError, EvalScope, ObjectType};
use agentflow_state::StepRecord;
use serde_json::Value;
use tracing::debug;

use super::HandlerResult;
use crate::tick::TickContext;

/// Evaluate the step's call arguments and store them as attributes.
pub fn facet_initialization_begin(
    step: &mut StepRecord,
    ctx: &mut TickContext<'_>,
) -> HandlerResult {
    // The workflow root's parameters are populated at creation time from
    // the runner inputs.
    if step.container_id.is_none() && step.block_id.is_none() {
        return HandlerResult::Advance;
    }

    let Some(stmt) = ctx.statement_for(step) else {
        return HandlerResult::Advance;
    };

    let ctx_ref: &TickContext<'_> = ctx;
    let inputs = ctx_ref.input_scope_for(step);
    let foreach = ctx_ref.foreach_binding_for(step);
    let (foreach_var, foreach_value) = match &foreach {
        Some((var, value)) => (Some(var.as_str()), Some(value)),
        None => (None, None),
    };

    let block_id = step.block_id;
    let step_output = move |name: &str, attr: &str| -> Result<Value, String> {
        let Some(block_id) = block_id else {
            return Err(format!("Step '{name}' is not in scope"));
        };
        let Some(sibling) = ctx_ref.completed_step_by_name(name, block_id) else {
            return Err(format!("Step '{name}' not found or not complete"));
        };
        sibling
            .attributes
            .get(attr)
            .cloned()
            .ok_or_else(|| format!("Attribute '{attr}' not found on step '{name}'"))
    };

    let scope = EvalScope {
        inputs: &inputs,
        step_output: &step_output,
        foreach_var,
        foreach_value,
    };

    let mut evaluated = match evaluate_args(&stmt.args, &scope) {
        Ok(values) => values,
        Err(err) => return HandlerResult::Error(err),
    };

    // Facet defaults for parameters the call left unspecified.
    if let Some((facet, _)) = ctx_ref.find_facet(&step.facet_name) {
        for param in &facet.params {
            if evaluated.contains_key(&param.name) {
                continue;
            }
            if let Some(default) = &param.default {
                match evaluate(default, &scope) {
                    Ok(value) => {
                        evaluated.insert(param.name.clone(), value);
                    }
                    Err(err) => return HandlerResult::Error(err),
                }
            }
        }
    }

    debug!(
        step_id = %step.step_id,
        facet = %step.facet_name,
        args = evaluated.len(),
        "Facet initialization evaluated arguments"
    );

    match step.object_type {
        ObjectType::SchemaInstantiation => {
            let schema = ctx_ref.program.find_schema(&step.facet_name);
            for (name, value) in evaluated {
                let hint = schema.as_ref().and_then(|(s, _)| {
                    s.fields
                        .iter()
                        .find(|f| f.name == name)
                        .map(|f| f.type_name.clone())
                });
                step.attributes.set_return(name, value, hint);
            }
        }
        ObjectType::AndThenBlock => {
            return HandlerResult::Error(AflError::InvalidStepState {
                step_id: step.step_id,
                state: step.state.to_string(),
            })
        }
        _ => {
            let facet = ctx_ref.find_facet(&step.facet_name).map(|(f, _)| f);
            for (name, value) in evaluated {
                let hint = facet.and_then(|f| f.param(&name).map(|p| p.type_name.clone()));
                step.attributes.set_param(name, value, hint);
            }
        }
    }

    HandlerResult::Advance
}
