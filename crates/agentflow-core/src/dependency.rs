// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Dependency analysis for a block's statements.
//!
//! Every step-statement and yield-statement of a block becomes a
//! [`StatementInfo`]. Dependencies are extracted structurally from
//! argument expressions: a `StepRef` whose head names a sibling statement
//! creates an edge; `InputRef` never does. The resulting partial order
//! drives step creation in the block executor.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::error::{AflError, Result};
use crate::program::{AndThenBlock, Body, Expression, NamedArg, Program};
use crate::resolver::TargetKind;

/// The runtime object type of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    /// A step-statement calling a facet.
    VariableAssignment,

    /// A yield-statement publishing values to the enclosing step.
    YieldAssignment,

    /// A step-statement instantiating a schema.
    SchemaInstantiation,

    /// A block step owning sibling statements.
    AndThenBlock,
}

impl ObjectType {
    /// Whether this object type is a block.
    pub fn is_block(self) -> bool {
        matches!(self, Self::AndThenBlock)
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VariableAssignment => write!(f, "VariableAssignment"),
            Self::YieldAssignment => write!(f, "YieldAssignment"),
            Self::SchemaInstantiation => write!(f, "SchemaInstantiation"),
            Self::AndThenBlock => write!(f, "AndThenBlock"),
        }
    }
}

/// The static form of one statement, before it becomes a runtime step.
#[derive(Debug, Clone)]
pub struct StatementInfo {
    /// Stable statement ID within the block.
    pub id: String,

    /// Statement name, referenced by sibling `StepRef` expressions.
    pub name: String,

    /// Runtime object type of the step this statement creates.
    pub object_type: ObjectType,

    /// Resolved (qualified) facet or schema name. Unresolvable targets
    /// keep their written form.
    pub facet_name: String,

    /// The call's named arguments.
    pub args: Vec<NamedArg>,

    /// Inline andThen body attached to the statement, if any.
    pub body: Option<Body>,

    /// Whether this is a yield-statement.
    pub is_yield: bool,

    /// Statement IDs this statement depends on.
    pub dependencies: HashSet<String>,
}

/// Dependency graph over a block's statements.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Statements keyed by statement ID, in declaration order.
    order: Vec<String>,
    statements: HashMap<String, StatementInfo>,
    name_to_id: HashMap<String, String>,
}

impl DependencyGraph {
    /// Build the dependency graph for a block body.
    ///
    /// Call targets are resolved against `program`: schema targets make the
    /// statement a [`ObjectType::SchemaInstantiation`], everything else a
    /// [`ObjectType::VariableAssignment`]. A reference cycle between
    /// statements is rejected with [`AflError::CyclicDependency`].
    pub fn from_block(block: &AndThenBlock, program: &Program) -> Result<Self> {
        let mut graph = Self::default();

        for stmt in &block.steps {
            let id = stmt.statement_id().to_string();
            let target = program.resolve_target(&stmt.call.target);
            let (object_type, facet_name) = match target {
                Some(t) if t.kind == TargetKind::Schema => {
                    (ObjectType::SchemaInstantiation, t.qualified_name)
                }
                Some(t) => (ObjectType::VariableAssignment, t.qualified_name),
                None => (ObjectType::VariableAssignment, stmt.call.target.clone()),
            };

            graph.name_to_id.insert(stmt.name.clone(), id.clone());
            graph.order.push(id.clone());
            graph.statements.insert(
                id.clone(),
                StatementInfo {
                    id,
                    name: stmt.name.clone(),
                    object_type,
                    facet_name,
                    args: stmt.call.args.clone(),
                    body: stmt.body.clone(),
                    is_yield: false,
                    dependencies: HashSet::new(),
                },
            );
        }

        for stmt in block.all_yields() {
            let id = stmt.statement_id().to_string();
            let facet_name = program
                .resolve_target(&stmt.call.target)
                .map(|t| t.qualified_name)
                .unwrap_or_else(|| stmt.call.target.clone());

            graph.order.push(id.clone());
            graph.statements.insert(
                id.clone(),
                StatementInfo {
                    id: id.clone(),
                    name: format!("_yield_{id}"),
                    object_type: ObjectType::YieldAssignment,
                    facet_name,
                    args: stmt.call.args.clone(),
                    body: None,
                    is_yield: true,
                    dependencies: HashSet::new(),
                },
            );
        }

        // Second pass: extract dependencies now that all names are known.
        let ids: Vec<String> = graph.order.clone();
        for id in &ids {
            let args = graph.statements[id].args.clone();
            let mut deps = HashSet::new();
            for arg in &args {
                graph.collect_refs(&arg.value, &mut deps);
            }
            if let Some(stmt) = graph.statements.get_mut(id) {
                stmt.dependencies = deps;
            }
        }

        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Recursively collect sibling-statement references from an expression.
    fn collect_refs(&self, expr: &Expression, deps: &mut HashSet<String>) {
        match expr {
            Expression::StepRef { path } => {
                if let Some(step_name) = path.first() {
                    if let Some(id) = self.name_to_id.get(step_name) {
                        deps.insert(id.clone());
                    }
                }
            }
            Expression::ConcatExpr { operands } => {
                for operand in operands {
                    self.collect_refs(operand, deps);
                }
            }
            Expression::BinaryExpr { left, right, .. } => {
                self.collect_refs(left, deps);
                self.collect_refs(right, deps);
            }
            Expression::UnaryExpr { operand, .. } => self.collect_refs(operand, deps),
            Expression::ArrayLiteral { elements } => {
                for element in elements {
                    self.collect_refs(element, deps);
                }
            }
            Expression::MapLiteral { entries } => {
                for entry in entries {
                    self.collect_refs(&entry.value, deps);
                }
            }
            Expression::IndexExpr { target, index } => {
                self.collect_refs(target, deps);
                self.collect_refs(index, deps);
            }
            // Literals and InputRef contribute nothing.
            _ => {}
        }
    }

    /// Reject reference cycles between statements.
    fn check_acyclic(&self) -> Result<()> {
        let mut petgraph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();

        for id in &self.order {
            nodes.insert(id.as_str(), petgraph.add_node(id.as_str()));
        }
        for (id, stmt) in &self.statements {
            for dep in &stmt.dependencies {
                if let (Some(&from), Some(&to)) = (nodes.get(dep.as_str()), nodes.get(id.as_str()))
                {
                    petgraph.add_edge(from, to, ());
                }
            }
        }

        toposort(&petgraph, None).map_err(|_| AflError::CyclicDependency)?;
        Ok(())
    }

    /// Whether a statement's dependencies are all in `completed`.
    pub fn can_create(&self, statement_id: &str, completed: &HashSet<String>) -> bool {
        self.statements
            .get(statement_id)
            .is_some_and(|s| s.dependencies.is_subset(completed))
    }

    /// Statements whose dependencies are satisfied and which are not yet
    /// in `completed`, in declaration order.
    pub fn ready_statements(&self, completed: &HashSet<String>) -> Vec<&StatementInfo> {
        self.order
            .iter()
            .filter(|id| !completed.contains(*id) && self.can_create(id, completed))
            .filter_map(|id| self.statements.get(id))
            .collect()
    }

    /// Look up a statement by ID.
    pub fn statement(&self, statement_id: &str) -> Option<&StatementInfo> {
        self.statements.get(statement_id)
    }

    /// All statements, in declaration order.
    pub fn all_statements(&self) -> Vec<&StatementInfo> {
        self.order
            .iter()
            .filter_map(|id| self.statements.get(id))
            .collect()
    }

    /// Number of statements in the block.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the block has no statements.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Statement IDs in a valid creation order (dependencies first).
    pub fn topological_order(&self) -> Vec<String> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut order: Vec<String> = Vec::new();

        fn visit(
            id: &str,
            statements: &HashMap<String, StatementInfo>,
            visited: &mut HashSet<String>,
            order: &mut Vec<String>,
        ) {
            if !visited.insert(id.to_string()) {
                return;
            }
            if let Some(stmt) = statements.get(id) {
                let mut deps: Vec<&String> = stmt.dependencies.iter().collect();
                deps.sort();
                for dep in deps {
                    visit(dep, statements, visited, order);
                }
            }
            order.push(id.to_string());
        }

        for id in &self.order {
            visit(id, &self.statements, &mut visited, &mut order);
        }
        order
    }
}
