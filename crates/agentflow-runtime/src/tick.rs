// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Per-tick execution context.
//!
//! A tick snapshots the runner's step tree and tasks once, then drives
//! every step synchronously against that snapshot plus the tick's own
//! uncommitted writes. State handlers never touch the store directly:
//! reads go through the overlay here, writes go into the change set, and
//! the engine commits the set when the pass is done. This is what keeps
//! handlers free of blocking I/O.

use std::collections::HashMap;

use agentflow_core::{
    AndThenBlock, DependencyGraph, Facet, Program, Result, StatementInfo, TargetKind,
};
use agentflow_state::{ChangeSet, RunnerRecord, StepRecord, TaskRecord};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::sandbox::Sandbox;

/// Snapshot-plus-overlay context for one execution tick.
pub struct TickContext<'a> {
    /// The compiled program.
    pub program: &'a Program,

    /// The workflow declaration being executed.
    pub workflow: &'a Facet,

    /// The runner being advanced.
    pub runner: &'a RunnerRecord,

    /// Task list for tasks emitted this tick.
    pub task_list: String,

    /// Optional sandbox for script-block facets.
    pub sandbox: Option<&'a dyn Sandbox>,

    /// Writes accumulated this tick.
    pub changes: ChangeSet,

    snapshot: HashMap<Uuid, StepRecord>,
    snapshot_order: Vec<Uuid>,
    tasks: Vec<TaskRecord>,
    graphs: HashMap<Uuid, DependencyGraph>,
}

impl<'a> TickContext<'a> {
    /// Build a context from a freshly loaded snapshot.
    pub fn new(
        program: &'a Program,
        workflow: &'a Facet,
        runner: &'a RunnerRecord,
        steps: Vec<StepRecord>,
        tasks: Vec<TaskRecord>,
        task_list: impl Into<String>,
        sandbox: Option<&'a dyn Sandbox>,
    ) -> Self {
        let snapshot_order = steps.iter().map(|s| s.step_id).collect();
        let snapshot = steps.into_iter().map(|s| (s.step_id, s)).collect();
        Self {
            program,
            workflow,
            runner,
            task_list: task_list.into(),
            sandbox,
            changes: ChangeSet::default(),
            snapshot,
            snapshot_order,
            tasks,
            graphs: HashMap::new(),
        }
    }

    /// Step IDs in snapshot (creation) order.
    pub fn step_ids(&self) -> Vec<Uuid> {
        self.snapshot_order.clone()
    }

    /// Find a step, preferring this tick's uncommitted writes.
    pub fn find_step(&self, step_id: Uuid) -> Option<StepRecord> {
        self.changes
            .find_step(step_id)
            .cloned()
            .or_else(|| self.snapshot.get(&step_id).cloned())
    }

    /// All steps visible this tick: snapshot overlaid with pending writes,
    /// plus pending creations.
    pub fn all_steps(&self) -> Vec<StepRecord> {
        let mut steps: Vec<StepRecord> = self
            .snapshot_order
            .iter()
            .filter_map(|id| self.find_step(*id))
            .collect();
        for created in &self.changes.created_steps {
            if !self.snapshot.contains_key(&created.step_id) {
                steps.push(created.clone());
            }
        }
        steps
    }

    /// Children of a block, overlay included.
    pub fn steps_in_block(&self, block_id: Uuid) -> Vec<StepRecord> {
        self.all_steps()
            .into_iter()
            .filter(|s| s.block_id == Some(block_id))
            .collect()
    }

    /// Block steps owned by a container step, overlay included.
    pub fn blocks_of_step(&self, container_id: Uuid) -> Vec<StepRecord> {
        self.all_steps()
            .into_iter()
            .filter(|s| s.container_id == Some(container_id) && s.is_block())
            .collect()
    }

    /// Whether a step with the block-local statement key exists, in the
    /// snapshot or the pending writes.
    pub fn step_in_block_exists(&self, statement_id: &str, block_id: Uuid) -> bool {
        self.changes.created_step_exists(statement_id, block_id)
            || self
                .snapshot
                .values()
                .any(|s| s.block_id == Some(block_id) && s.statement_id == statement_id)
    }

    /// Whether a block step with the container-local statement key exists.
    pub fn block_step_exists(&self, statement_id: &str, container_id: Uuid) -> bool {
        self.changes.created_block_exists(statement_id, container_id)
            || self.snapshot.values().any(|s| {
                s.container_id == Some(container_id)
                    && s.statement_id == statement_id
                    && s.is_block()
            })
    }

    /// Tasks emitted by a step, oldest first, pending writes included.
    pub fn tasks_for_step(&self, step_id: Uuid) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|t| t.step_id == Some(step_id))
            .cloned()
            .collect();
        for pending in &self.changes.created_tasks {
            if pending.step_id == Some(step_id) {
                tasks.push(pending.clone());
            }
        }
        tasks.sort_by_key(|t| t.created);
        tasks
    }

    /// The workflow root step, if it exists yet.
    pub fn root_step(&self) -> Option<StepRecord> {
        if let Some(root_id) = self.runner.root_step_id {
            if let Some(step) = self.find_step(root_id) {
                return Some(step);
            }
        }
        self.all_steps()
            .into_iter()
            .find(|s| s.container_id.is_none() && s.block_id.is_none())
    }

    /// Look up a facet-like declaration with its kind.
    pub fn find_facet(&self, name: &str) -> Option<(&'a Facet, TargetKind)> {
        self.program
            .find_facet(name)
            .map(|(facet, kind, _)| (facet, kind))
    }

    /// The andThen body blocks a step would materialize, in priority
    /// order: workflow body for the root, inline statement body, then the
    /// facet's own body.
    pub fn body_blocks_for(&self, step: &StepRecord) -> Vec<AndThenBlock> {
        if step.container_id.is_none() && step.block_id.is_none() {
            return self
                .workflow
                .and_then_blocks()
                .into_iter()
                .cloned()
                .collect();
        }

        if let Some(stmt) = self.statement_for(step) {
            if let Some(body) = &stmt.body {
                let blocks: Vec<AndThenBlock> = match body {
                    agentflow_core::Body::Many(blocks) => blocks.clone(),
                    agentflow_core::Body::One(agentflow_core::BodyBlock::AndThenBlock(b)) => {
                        vec![b.clone()]
                    }
                    _ => Vec::new(),
                };
                if !blocks.is_empty() {
                    return blocks;
                }
            }
        }

        if !step.facet_name.is_empty() {
            if let Some((facet, _)) = self.find_facet(&step.facet_name) {
                return facet.and_then_blocks().into_iter().cloned().collect();
            }
        }

        Vec::new()
    }

    /// The block AST a block step executes.
    ///
    /// Foreach sub-blocks carry their body on the record; other block
    /// steps recover it from their container's body list by index.
    pub fn block_ast(&self, block_step: &StepRecord) -> Option<AndThenBlock> {
        if let Some(cached) = &block_step.block_body {
            return serde_json::from_value(cached.clone()).ok();
        }

        let container_id = block_step.container_id?;
        let container = self.find_step(container_id)?;
        let bodies = self.body_blocks_for(&container);

        let index = block_step
            .statement_id
            .strip_prefix("block-")
            .and_then(|i| i.parse::<usize>().ok())?;
        bodies.into_iter().nth(index)
    }

    /// The dependency graph of a non-foreach block, cached per tick.
    pub fn graph_for_block(&mut self, block_step: &StepRecord) -> Result<Option<DependencyGraph>> {
        if let Some(graph) = self.graphs.get(&block_step.step_id) {
            return Ok(Some(graph.clone()));
        }
        let Some(ast) = self.block_ast(block_step) else {
            return Ok(None);
        };
        let graph = DependencyGraph::from_block(&ast, self.program)?;
        self.graphs.insert(block_step.step_id, graph.clone());
        Ok(Some(graph))
    }

    /// The statement definition a step was created from, found in its
    /// parent block's graph.
    pub fn statement_for(&self, step: &StepRecord) -> Option<StatementInfo> {
        let block_id = step.block_id?;
        let block_step = self.find_step(block_id)?;
        let ast = self.block_ast(&block_step)?;
        let graph = DependencyGraph::from_block(&ast, self.program).ok()?;
        graph.statement(&step.statement_id).cloned()
    }

    /// Resolve the `$.` input scope for a step.
    ///
    /// Steps in the workflow root block read the root step's parameters
    /// (the runner inputs). Steps in a nested block read the parameters of
    /// the step that owns the block.
    pub fn input_scope_for(&self, step: &StepRecord) -> Map<String, Value> {
        if let Some(block_id) = step.block_id {
            if let Some(block_step) = self.find_step(block_id) {
                if let Some(container_id) = block_step.container_id {
                    if let Some(container) = self.find_step(container_id) {
                        if container.container_id.is_some() {
                            return container.attributes.param_values();
                        }
                    }
                }
            }
        }

        self.root_step()
            .map(|root| root.attributes.param_values())
            .unwrap_or_default()
    }

    /// The input scope of a block step itself (for foreach iterables).
    pub fn input_scope_for_block(&self, block_step: &StepRecord) -> Map<String, Value> {
        if let Some(container_id) = block_step.container_id {
            if let Some(container) = self.find_step(container_id) {
                if container.container_id.is_some() {
                    return container.attributes.param_values();
                }
            }
        }
        self.root_step()
            .map(|root| root.attributes.param_values())
            .unwrap_or_default()
    }

    /// The foreach binding visible to a step, read off its owning block.
    pub fn foreach_binding_for(&self, step: &StepRecord) -> Option<(String, Value)> {
        let block_id = step.block_id?;
        let block_step = self.find_step(block_id)?;
        let var = block_step.foreach_var?;
        Some((var, block_step.foreach_value.unwrap_or(Value::Null)))
    }

    /// Find a completed sibling step by statement name within a block.
    pub fn completed_step_by_name(&self, name: &str, block_id: Uuid) -> Option<StepRecord> {
        self.steps_in_block(block_id)
            .into_iter()
            .find(|s| s.statement_name.as_deref() == Some(name) && s.is_complete())
    }
}
