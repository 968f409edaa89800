// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Block execution: the block executor's Begin/Continue/End phases.
//!
//! Begin analyzes the block body and creates steps for dependency-free
//! statements; foreach blocks instead spawn one sub-block per element of
//! the iterable. Continue re-checks progress each visit, creating
//! newly-eligible steps, until every statement (or sub-block) is
//! complete. Creation is idempotent on the block-local statement ID.

use std::collections::HashSet;

use agentflow_core::{evaluate, AflError, AndThenBlock, DependencyGraph, EvalScope, ForeachClause, ObjectType};
use agentflow_state::StepRecord;
use serde_json::Value;
use tracing::debug;

use super::HandlerResult;
use crate::analysis::StepAnalysis;
use crate::tick::TickContext;

/// Analyze the block and create initially-eligible child steps.
pub fn block_execution_begin(step: &mut StepRecord, ctx: &mut TickContext<'_>) -> HandlerResult {
    let Some(ast) = ctx.block_ast(step) else {
        return HandlerResult::Advance;
    };

    if let Some(foreach) = ast.foreach.clone() {
        return begin_foreach(step, ctx, &ast, &foreach);
    }

    let graph = match ctx.graph_for_block(step) {
        Ok(Some(graph)) => graph,
        Ok(None) => return HandlerResult::Advance,
        Err(err) => return HandlerResult::Error(err),
    };

    debug!(
        block_id = %step.step_id,
        statements = graph.len(),
        "Block execution begin"
    );

    create_ready_steps(step, ctx, &graph, &HashSet::new());
    HandlerResult::Advance
}

/// Poll block progress; create newly-ready steps; finish when every
/// statement has a complete step.
pub fn block_execution_continue(step: &mut StepRecord, ctx: &mut TickContext<'_>) -> HandlerResult {
    let Some(ast) = ctx.block_ast(step) else {
        return HandlerResult::Advance;
    };

    if ast.foreach.is_some() {
        return continue_foreach(step, ctx);
    }

    let graph = match ctx.graph_for_block(step) {
        Ok(Some(graph)) => graph,
        Ok(None) => return HandlerResult::Advance,
        Err(err) => return HandlerResult::Error(err),
    };

    let children = ctx.steps_in_block(step.step_id);
    let statements = graph.all_statements();
    let analysis = StepAnalysis::load(step.step_id, &statements, &children);

    if analysis.done {
        return HandlerResult::Advance;
    }

    let completed = analysis.completed_ids();
    create_ready_steps(step, ctx, &graph, &completed);

    HandlerResult::Stay { push: true }
}

/// Spawn one sub-block per element of the foreach iterable.
fn begin_foreach(
    step: &mut StepRecord,
    ctx: &mut TickContext<'_>,
    ast: &AndThenBlock,
    foreach: &ForeachClause,
) -> HandlerResult {
    let inputs = ctx.input_scope_for_block(step);
    let binding = ctx.foreach_binding_for(step);
    let (foreach_var, foreach_value) = match &binding {
        Some((var, value)) => (Some(var.as_str()), Some(value)),
        None => (None, None),
    };

    let scope = EvalScope {
        inputs: &inputs,
        step_output: &|name: &str, _: &str| Err(format!("Step '{name}' is not in scope")),
        foreach_var,
        foreach_value,
    };

    let iterable = match evaluate(&foreach.iterable, &scope) {
        Ok(value) => value,
        Err(err) => return HandlerResult::Error(err),
    };

    let items = match iterable {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => {
            return HandlerResult::Error(AflError::evaluation(
                other.to_string(),
                "foreach iterable must be an array",
            ))
        }
    };

    if items.is_empty() {
        // Nothing to iterate; the block completes immediately.
        return HandlerResult::Advance;
    }

    let body = ast.without_foreach();
    let body_value = match serde_json::to_value(&body) {
        Ok(value) => value,
        Err(err) => return HandlerResult::Error(err.into()),
    };

    for (index, element) in items.into_iter().enumerate() {
        let statement_id = format!("foreach-{index}");
        if ctx.step_in_block_exists(&statement_id, step.step_id) {
            continue;
        }

        let mut sub_block = StepRecord::create(
            step.runner_id,
            step.workflow_id,
            step.flow_id,
            ObjectType::AndThenBlock,
            "",
            statement_id,
            step.container_id,
            Some(step.step_id),
            step.root_id.or(step.container_id),
        );
        sub_block.foreach_var = Some(foreach.variable.clone());
        sub_block.foreach_value = Some(element);
        sub_block.block_body = Some(body_value.clone());

        debug!(
            block_id = %step.step_id,
            sub_block_id = %sub_block.step_id,
            index,
            variable = %foreach.variable,
            "Foreach sub-block created"
        );
        ctx.changes.add_created_step(sub_block);
    }

    HandlerResult::Advance
}

/// Foreach blocks track sub-block completion instead of a graph.
fn continue_foreach(step: &mut StepRecord, ctx: &mut TickContext<'_>) -> HandlerResult {
    let sub_blocks = ctx.steps_in_block(step.step_id);
    if sub_blocks.is_empty() {
        return HandlerResult::Advance;
    }

    let completed = sub_blocks.iter().filter(|s| s.is_complete()).count();
    debug!(
        block_id = %step.step_id,
        completed,
        total = sub_blocks.len(),
        "Foreach block continue"
    );

    if completed == sub_blocks.len() {
        HandlerResult::Advance
    } else {
        HandlerResult::Stay { push: true }
    }
}

/// Create steps for statements whose dependencies are satisfied.
fn create_ready_steps(
    block: &StepRecord,
    ctx: &mut TickContext<'_>,
    graph: &DependencyGraph,
    completed: &HashSet<String>,
) {
    for stmt in graph.ready_statements(completed) {
        if ctx.step_in_block_exists(&stmt.id, block.step_id) {
            continue;
        }

        let mut new_step = StepRecord::create(
            block.runner_id,
            block.workflow_id,
            block.flow_id,
            stmt.object_type,
            stmt.facet_name.clone(),
            stmt.id.clone(),
            block.container_id,
            Some(block.step_id),
            block.root_id.or(block.container_id),
        );
        new_step.statement_name = Some(stmt.name.clone());

        debug!(
            block_id = %block.step_id,
            statement_id = %stmt.id,
            facet = %stmt.facet_name,
            "Step created"
        );
        ctx.changes.add_created_step(new_step);
    }
}
