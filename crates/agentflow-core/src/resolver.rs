// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Name resolution over a compiled program.
//!
//! Facet, schema, and workflow names appearing in call expressions may be
//! unqualified. Resolution searches declarations in declaration order:
//! the current level first, then nested namespaces, building dotted
//! qualified names as it descends. Workflow lookup additionally supports
//! the flat emitter layout where a namespace's `name` is itself dotted
//! ("a.b.c").

use crate::program::{Declaration, Facet, Namespace, Program, Schema};

/// What a call target resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    /// A facet with a runtime-executed body.
    Facet,
    /// An externally handled event facet.
    EventFacet,
    /// A workflow entry point.
    Workflow,
    /// A schema; instantiation stores arguments as returns.
    Schema,
}

/// A resolved call target: kind plus fully-qualified name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// The declaration kind.
    pub kind: TargetKind,
    /// Dotted qualified name.
    pub qualified_name: String,
}

fn qualify(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Iterate a namespace's facet-like declarations with their kinds,
/// covering both the typed lists and the flattened declarations.
fn facet_entries<'a>(
    declarations: &'a [Declaration],
    facets: &'a [Facet],
    event_facets: &'a [Facet],
    workflows: &'a [Facet],
) -> Vec<(&'a Facet, TargetKind)> {
    let mut entries: Vec<(&Facet, TargetKind)> = Vec::new();
    for decl in declarations {
        match decl {
            Declaration::FacetDecl(f) => entries.push((f, TargetKind::Facet)),
            Declaration::EventFacetDecl(f) => entries.push((f, TargetKind::EventFacet)),
            Declaration::WorkflowDecl(f) => entries.push((f, TargetKind::Workflow)),
            _ => {}
        }
    }
    entries.extend(facets.iter().map(|f| (f, TargetKind::Facet)));
    entries.extend(event_facets.iter().map(|f| (f, TargetKind::EventFacet)));
    entries.extend(workflows.iter().map(|f| (f, TargetKind::Workflow)));
    entries
}

fn schema_entries<'a>(declarations: &'a [Declaration], schemas: &'a [Schema]) -> Vec<&'a Schema> {
    let mut entries: Vec<&Schema> = Vec::new();
    for decl in declarations {
        if let Declaration::SchemaDecl(s) = decl {
            entries.push(s);
        }
    }
    entries.extend(schemas.iter());
    entries
}

fn child_namespaces<'a>(
    declarations: &'a [Declaration],
    namespaces: &'a [Namespace],
) -> Vec<&'a Namespace> {
    let mut entries: Vec<&Namespace> = Vec::new();
    for decl in declarations {
        if let Declaration::Namespace(ns) = decl {
            entries.push(ns);
        }
    }
    entries.extend(namespaces.iter());
    entries
}

/// One level of the program tree, abstracting Program vs Namespace.
struct Level<'a> {
    declarations: &'a [Declaration],
    namespaces: &'a [Namespace],
    facets: &'a [Facet],
    event_facets: &'a [Facet],
    workflows: &'a [Facet],
    schemas: &'a [Schema],
}

impl<'a> Level<'a> {
    fn of_program(p: &'a Program) -> Self {
        Self {
            declarations: &p.declarations,
            namespaces: &p.namespaces,
            facets: &p.facets,
            event_facets: &p.event_facets,
            workflows: &p.workflows,
            schemas: &p.schemas,
        }
    }

    fn of_namespace(ns: &'a Namespace) -> Self {
        Self {
            declarations: &ns.declarations,
            namespaces: &ns.namespaces,
            facets: &ns.facets,
            event_facets: &ns.event_facets,
            workflows: &ns.workflows,
            schemas: &ns.schemas,
        }
    }
}

fn find_facet_in_level<'a>(
    level: &Level<'a>,
    name: &str,
    prefix: &str,
) -> Option<(&'a Facet, TargetKind, String)> {
    // Qualified name: peel the first segment and descend.
    if let Some((head, rest)) = name.split_once('.') {
        for ns in child_namespaces(level.declarations, level.namespaces) {
            if ns.name == head {
                let child = Level::of_namespace(ns);
                if let Some(found) = find_facet_in_level(&child, rest, &qualify(prefix, head)) {
                    return Some(found);
                }
            }
            // Flat layout: the namespace name is the full dotted prefix.
            if let Some(short) = name.strip_prefix(&format!("{}.", ns.name)) {
                let child = Level::of_namespace(ns);
                if let Some(found) = find_facet_in_level(&child, short, &qualify(prefix, &ns.name))
                {
                    return Some(found);
                }
            }
        }
        return None;
    }

    for (facet, kind) in facet_entries(
        level.declarations,
        level.facets,
        level.event_facets,
        level.workflows,
    ) {
        if facet.name == name {
            return Some((facet, kind, qualify(prefix, name)));
        }
    }

    for ns in child_namespaces(level.declarations, level.namespaces) {
        let child = Level::of_namespace(ns);
        if let Some(found) = find_facet_in_level(&child, name, &qualify(prefix, &ns.name)) {
            return Some(found);
        }
    }

    None
}

fn find_schema_in_level<'a>(
    level: &Level<'a>,
    name: &str,
    prefix: &str,
) -> Option<(&'a Schema, String)> {
    if let Some((head, rest)) = name.split_once('.') {
        for ns in child_namespaces(level.declarations, level.namespaces) {
            if ns.name == head {
                let child = Level::of_namespace(ns);
                if let Some(found) = find_schema_in_level(&child, rest, &qualify(prefix, head)) {
                    return Some(found);
                }
            }
            if let Some(short) = name.strip_prefix(&format!("{}.", ns.name)) {
                let child = Level::of_namespace(ns);
                if let Some(found) = find_schema_in_level(&child, short, &qualify(prefix, &ns.name))
                {
                    return Some(found);
                }
            }
        }
        return None;
    }

    for schema in schema_entries(level.declarations, level.schemas) {
        if schema.name == name {
            return Some((schema, qualify(prefix, name)));
        }
    }

    for ns in child_namespaces(level.declarations, level.namespaces) {
        let child = Level::of_namespace(ns);
        if let Some(found) = find_schema_in_level(&child, name, &qualify(prefix, &ns.name)) {
            return Some(found);
        }
    }

    None
}

impl Program {
    /// Find a facet-like declaration (facet, event facet, or workflow) by
    /// simple or dotted name, together with its kind and qualified name.
    pub fn find_facet(&self, name: &str) -> Option<(&Facet, TargetKind, String)> {
        find_facet_in_level(&Level::of_program(self), name, "")
    }

    /// Find a schema by simple or dotted name.
    pub fn find_schema(&self, name: &str) -> Option<(&Schema, String)> {
        find_schema_in_level(&Level::of_program(self), name, "")
    }

    /// Find a workflow by simple or dotted name.
    pub fn find_workflow(&self, name: &str) -> Option<&Facet> {
        match self.find_facet(name) {
            Some((facet, TargetKind::Workflow, _)) => Some(facet),
            _ => None,
        }
    }

    /// Resolve a call target to its kind and qualified name.
    ///
    /// Schemas win over facets only when no facet matches, mirroring
    /// declaration-order search. Unresolvable names return `None`; the
    /// dependency builder leaves such targets unqualified.
    pub fn resolve_target(&self, name: &str) -> Option<ResolvedTarget> {
        if name.is_empty() {
            return None;
        }
        // A schema and a facet sharing a name is a validator error upstream;
        // the runtime prefers the schema, matching instantiation syntax.
        if let Some((_, qualified)) = self.find_schema(name) {
            return Some(ResolvedTarget {
                kind: TargetKind::Schema,
                qualified_name: qualified,
            });
        }
        self.find_facet(name)
            .map(|(_, kind, qualified)| ResolvedTarget {
                kind,
                qualified_name: qualified,
            })
    }

    /// Whether a call target names an event facet.
    pub fn is_event_facet(&self, name: &str) -> bool {
        matches!(
            self.find_facet(name),
            Some((_, TargetKind::EventFacet, _))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_program() -> Program {
        Program::from_json(
            r#"{
                "declarations": [
                    {"type": "Namespace", "name": "geo", "declarations": [
                        {"type": "SchemaDecl", "name": "Addr", "fields": [{"name": "city", "type": "String"}]},
                        {"type": "EventFacetDecl", "name": "Geocode",
                         "params": [{"name": "query", "type": "String"}],
                         "returns": [{"name": "lat", "type": "Double"}]},
                        {"type": "Namespace", "name": "inner", "declarations": [
                            {"type": "FacetDecl", "name": "Refine"}
                        ]}
                    ]},
                    {"type": "WorkflowDecl", "name": "Lookup"},
                    {"type": "FacetDecl", "name": "Plain"}
                ]
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_unqualified_resolution() {
        let program = sample_program();

        let target = program.resolve_target("Geocode").unwrap();
        assert_eq!(target.kind, TargetKind::EventFacet);
        assert_eq!(target.qualified_name, "geo.Geocode");

        let target = program.resolve_target("Plain").unwrap();
        assert_eq!(target.kind, TargetKind::Facet);
        assert_eq!(target.qualified_name, "Plain");

        let target = program.resolve_target("Refine").unwrap();
        assert_eq!(target.qualified_name, "geo.inner.Refine");
    }

    #[test]
    fn test_qualified_resolution() {
        let program = sample_program();

        let target = program.resolve_target("geo.Geocode").unwrap();
        assert_eq!(target.kind, TargetKind::EventFacet);
        assert_eq!(target.qualified_name, "geo.Geocode");

        let target = program.resolve_target("geo.inner.Refine").unwrap();
        assert_eq!(target.kind, TargetKind::Facet);
        assert_eq!(target.qualified_name, "geo.inner.Refine");

        assert!(program.resolve_target("geo.Missing").is_none());
    }

    #[test]
    fn test_schema_resolution() {
        let program = sample_program();
        let target = program.resolve_target("Addr").unwrap();
        assert_eq!(target.kind, TargetKind::Schema);
        assert_eq!(target.qualified_name, "geo.Addr");
    }

    #[test]
    fn test_workflow_lookup() {
        let program = sample_program();
        assert!(program.find_workflow("Lookup").is_some());
        assert!(program.find_workflow("Plain").is_none());
        assert!(program.find_workflow("Nope").is_none());
    }

    #[test]
    fn test_flat_namespace_layout() {
        let program = Program::from_json(
            r#"{
                "namespaces": [{
                    "name": "a.b",
                    "workflows": [{"name": "W", "type": "WorkflowDecl"}]
                }]
            }"#,
        )
        .unwrap();

        let facet = program.find_workflow("a.b.W").unwrap();
        assert_eq!(facet.name, "W");
        let target = program.resolve_target("W").unwrap();
        assert_eq!(target.qualified_name, "a.b.W");
    }

    #[test]
    fn test_event_facet_check() {
        let program = sample_program();
        assert!(program.is_event_facet("Geocode"));
        assert!(program.is_event_facet("geo.Geocode"));
        assert!(!program.is_event_facet("Plain"));
        assert!(!program.is_event_facet("Addr"));
    }
}
