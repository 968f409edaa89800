// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Compiled agent-flow program model.
//!
//! The runtime consumes a fully elaborated program AST in JSON form, as
//! produced by the surface-language compiler. This module is the serde
//! mirror of that schema. Unknown fields are ignored so that newer
//! compiler output remains loadable.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Root of a compiled agent-flow program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Program {
    /// Child namespaces.
    #[serde(default)]
    pub namespaces: Vec<Namespace>,

    /// Top-level facets.
    #[serde(default)]
    pub facets: Vec<Facet>,

    /// Top-level event facets.
    #[serde(default, rename = "eventFacets")]
    pub event_facets: Vec<Facet>,

    /// Top-level workflows.
    #[serde(default)]
    pub workflows: Vec<Facet>,

    /// Top-level schemas.
    #[serde(default)]
    pub schemas: Vec<Schema>,

    /// Implicit declarations (reserved).
    #[serde(default)]
    pub implicits: Vec<serde_json::Value>,

    /// Flattened union of all declarations, in declaration order.
    #[serde(default)]
    pub declarations: Vec<Declaration>,
}

impl Program {
    /// Parse a program from its compiled JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize the program back to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A namespace grouping declarations under a (possibly dotted) name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Namespace {
    /// Namespace name. May be dotted ("a.b.c") in the flat emitter layout.
    pub name: String,

    /// Imported namespaces.
    #[serde(default)]
    pub uses: Vec<String>,

    /// Child namespaces (nested emitter layout).
    #[serde(default)]
    pub namespaces: Vec<Namespace>,

    /// Facets declared in this namespace.
    #[serde(default)]
    pub facets: Vec<Facet>,

    /// Event facets declared in this namespace.
    #[serde(default, rename = "eventFacets")]
    pub event_facets: Vec<Facet>,

    /// Workflows declared in this namespace.
    #[serde(default)]
    pub workflows: Vec<Facet>,

    /// Schemas declared in this namespace.
    #[serde(default)]
    pub schemas: Vec<Schema>,

    /// Flattened union of declarations, in declaration order.
    #[serde(default)]
    pub declarations: Vec<Declaration>,
}

/// One declaration in a `declarations` list, tagged by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Declaration {
    /// A nested namespace.
    Namespace(Namespace),

    /// A callable facet.
    FacetDecl(Facet),

    /// An externally handled event facet.
    EventFacetDecl(Facet),

    /// A workflow entry point.
    WorkflowDecl(Facet),

    /// A record type.
    SchemaDecl(Schema),

    /// An implicit declaration (reserved).
    ImplicitDecl(Implicit),
}

/// A facet-like declaration: facet, event facet, or workflow.
///
/// The three kinds share the same field set; the declaration kind is
/// carried by the enclosing [`Declaration`] variant or the typed list the
/// facet appears in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Facet {
    /// Declared name (unqualified).
    pub name: String,

    /// Call parameters.
    #[serde(default)]
    pub params: Vec<Param>,

    /// Declared return parameters.
    #[serde(default)]
    pub returns: Vec<Param>,

    /// Mixins attached to the declaration (reserved at runtime).
    #[serde(default)]
    pub mixins: Vec<Mixin>,

    /// Optional body: child-step blocks, a script block, or a prompt block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
}

impl Facet {
    /// Look up a declared parameter by name.
    pub fn param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    /// The facet's body as andThen blocks, if it has any.
    pub fn and_then_blocks(&self) -> Vec<&AndThenBlock> {
        match &self.body {
            Some(Body::One(BodyBlock::AndThenBlock(block))) => vec![block],
            Some(Body::Many(blocks)) => blocks.iter().collect(),
            _ => Vec::new(),
        }
    }

    /// The facet's script block, if its body is one.
    pub fn script_block(&self) -> Option<&ScriptBlock> {
        match &self.body {
            Some(Body::One(BodyBlock::ScriptBlock(script))) => Some(script),
            _ => None,
        }
    }
}

/// A named record type whose instantiation behaves like a facet call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Schema {
    /// Declared name (unqualified).
    pub name: String,

    /// Record fields.
    #[serde(default)]
    pub fields: Vec<SchemaField>,
}

/// One field of a schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaField {
    /// Field name.
    pub name: String,

    /// Declared type name.
    #[serde(rename = "type", default)]
    pub type_name: String,
}

/// A declared parameter with an optional default expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Param {
    /// Parameter name.
    pub name: String,

    /// Declared type name.
    #[serde(rename = "type", default)]
    pub type_name: String,

    /// Default value expression, applied when the call omits the parameter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Expression>,
}

/// A mixin decoration on a facet or call. Reserved at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mixin {
    /// Mixin name.
    #[serde(default)]
    pub name: String,
}

/// An implicit declaration. Reserved at runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Implicit {
    /// Implicit name.
    #[serde(default)]
    pub name: String,
}

/// A facet body: one block, a list of blocks, a script, or a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Body {
    /// A list of andThen blocks.
    Many(Vec<AndThenBlock>),

    /// A single tagged body block.
    One(BodyBlock),
}

/// A single body block, tagged by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BodyBlock {
    /// A block of child steps.
    AndThenBlock(AndThenBlock),

    /// Sandboxed code.
    ScriptBlock(ScriptBlock),

    /// An LLM prompt (executed externally, like an event facet).
    PromptBlock(PromptBlock),
}

/// Sandboxed code attached to a facet body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptBlock {
    /// Script language. The runtime guarantees transport for `python`.
    #[serde(default)]
    pub language: String,

    /// The script source.
    pub code: String,
}

/// An LLM prompt body. Dispatched externally like an event facet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptBlock {
    /// The prompt template text.
    pub prompt: String,
}

/// A block of sibling step statements with optional yields and iteration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AndThenBlock {
    /// Iteration clause. When present the block spawns one sub-block per
    /// element and declares no statements of its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreach: Option<ForeachClause>,

    /// Step statements, in textual order.
    #[serde(default)]
    pub steps: Vec<StepStmt>,

    /// Single yield statement (older emitter layout).
    #[serde(default, rename = "yield", skip_serializing_if = "Option::is_none")]
    pub yield_stmt: Option<YieldStmt>,

    /// Multiple yield statements.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub yields: Vec<YieldStmt>,
}

impl AndThenBlock {
    /// All yield statements of the block, regardless of emitter layout.
    pub fn all_yields(&self) -> Vec<&YieldStmt> {
        if !self.yields.is_empty() {
            self.yields.iter().collect()
        } else {
            self.yield_stmt.iter().collect()
        }
    }

    /// A copy of this block with the foreach clause removed. Used as the
    /// cached body of foreach sub-blocks.
    pub fn without_foreach(&self) -> AndThenBlock {
        AndThenBlock {
            foreach: None,
            steps: self.steps.clone(),
            yield_stmt: self.yield_stmt.clone(),
            yields: self.yields.clone(),
        }
    }
}

/// The iteration clause of a foreach block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeachClause {
    /// Loop variable name, visible to the sub-block's expressions.
    pub variable: String,

    /// Expression producing the iterable, evaluated in the enclosing scope.
    pub iterable: Expression,
}

/// A step statement inside a block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepStmt {
    /// Stable statement ID within the block. Falls back to `name` when the
    /// emitter omits it.
    #[serde(default)]
    pub id: String,

    /// Statement name, referenced by sibling `StepRef` expressions.
    #[serde(default)]
    pub name: String,

    /// The facet or schema call.
    pub call: CallExpr,

    /// Optional inline andThen body attached to the statement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
}

impl StepStmt {
    /// The statement's stable ID, defaulting to its name.
    pub fn statement_id(&self) -> &str {
        if self.id.is_empty() {
            &self.name
        } else {
            &self.id
        }
    }
}

/// A yield statement publishing values to the enclosing step's returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YieldStmt {
    /// Stable statement ID within the block.
    #[serde(default)]
    pub id: String,

    /// The target call whose arguments name the published values.
    pub call: CallExpr,
}

impl YieldStmt {
    /// The statement's stable ID, defaulting to `"yield"`.
    pub fn statement_id(&self) -> &str {
        if self.id.is_empty() {
            "yield"
        } else {
            &self.id
        }
    }
}

/// A call expression: target name plus named arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CallExpr {
    /// The called facet/schema name, possibly unqualified.
    #[serde(default)]
    pub target: String,

    /// Named arguments.
    #[serde(default)]
    pub args: Vec<NamedArg>,

    /// Call-level mixins (reserved at runtime).
    #[serde(default)]
    pub mixins: Vec<Mixin>,
}

/// One named argument of a call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedArg {
    /// Argument name.
    pub name: String,

    /// Argument value expression.
    pub value: Expression,
}

/// One entry of a map literal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapEntry {
    /// Entry key.
    pub key: String,

    /// Entry value expression.
    pub value: Expression,
}

/// The expression union of the compiled AST.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Expression {
    /// String literal.
    String {
        /// Literal value.
        #[serde(default)]
        value: String,
    },

    /// Integer literal.
    Int {
        /// Literal value.
        #[serde(default)]
        value: i64,
    },

    /// Floating-point literal.
    Double {
        /// Literal value.
        #[serde(default)]
        value: f64,
    },

    /// Boolean literal.
    Boolean {
        /// Literal value.
        #[serde(default)]
        value: bool,
    },

    /// Null literal.
    Null,

    /// Reference into the enclosing input scope: `$.head.tail…`.
    InputRef {
        /// Path segments, head first.
        #[serde(default)]
        path: Vec<String>,
    },

    /// Reference to a sibling step's output: `step.attr.tail…`.
    StepRef {
        /// Path segments: step name, attribute, then field accesses.
        #[serde(default)]
        path: Vec<String>,
    },

    /// Text concatenation of all operands.
    ConcatExpr {
        /// Operand expressions.
        #[serde(default)]
        operands: Vec<Expression>,
    },

    /// Binary arithmetic.
    BinaryExpr {
        /// One of `+ - * / %`.
        operator: String,
        /// Left operand.
        left: Box<Expression>,
        /// Right operand.
        right: Box<Expression>,
    },

    /// Unary arithmetic (negation).
    UnaryExpr {
        /// The operator, `-`.
        operator: String,
        /// Operand.
        operand: Box<Expression>,
    },

    /// Ordered list literal.
    ArrayLiteral {
        /// Element expressions.
        #[serde(default)]
        elements: Vec<Expression>,
    },

    /// Name-keyed map literal.
    MapLiteral {
        /// Entries.
        #[serde(default)]
        entries: Vec<MapEntry>,
    },

    /// Index access: `target[index]`.
    IndexExpr {
        /// The indexed expression.
        target: Box<Expression>,
        /// The index expression.
        index: Box<Expression>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_program() {
        let json = r#"{
            "type": "Program",
            "workflows": [{
                "type": "WorkflowDecl",
                "name": "Hello",
                "params": [{"name": "x", "type": "Long"}],
                "returns": [{"name": "result", "type": "Long"}],
                "body": {
                    "type": "AndThenBlock",
                    "steps": [{
                        "type": "StepStmt",
                        "id": "s1",
                        "name": "step",
                        "call": {
                            "type": "CallExpr",
                            "target": "AddOne",
                            "args": [{"name": "input", "value": {"type": "InputRef", "path": ["x"]}}]
                        }
                    }],
                    "yield": {
                        "type": "YieldStmt",
                        "id": "y1",
                        "call": {
                            "type": "CallExpr",
                            "target": "Hello",
                            "args": [{"name": "result", "value": {"type": "StepRef", "path": ["step", "output"]}}]
                        }
                    }
                }
            }],
            "eventFacets": [{
                "type": "EventFacetDecl",
                "name": "AddOne",
                "params": [{"name": "input", "type": "Long"}],
                "returns": [{"name": "output", "type": "Long"}]
            }]
        }"#;

        let program = Program::from_json(json).unwrap();
        assert_eq!(program.workflows.len(), 1);
        assert_eq!(program.event_facets.len(), 1);

        let workflow = &program.workflows[0];
        assert_eq!(workflow.name, "Hello");
        let blocks = workflow.and_then_blocks();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].steps.len(), 1);
        assert_eq!(blocks[0].steps[0].statement_id(), "s1");
        assert_eq!(blocks[0].all_yields().len(), 1);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let json = r#"{
            "type": "Program",
            "compilerVersion": "9.9",
            "facets": [{"type": "FacetDecl", "name": "F", "sourceLocation": {"line": 3}}]
        }"#;
        let program = Program::from_json(json).unwrap();
        assert_eq!(program.facets.len(), 1);
        assert_eq!(program.facets[0].name, "F");
    }

    #[test]
    fn test_declarations_union_round_trip() {
        let json = r#"{
            "declarations": [
                {"type": "Namespace", "name": "ns", "declarations": [
                    {"type": "SchemaDecl", "name": "Addr", "fields": [
                        {"name": "city", "type": "String"},
                        {"name": "zip", "type": "String"}
                    ]}
                ]},
                {"type": "FacetDecl", "name": "Top"}
            ]
        }"#;
        let program = Program::from_json(json).unwrap();
        assert_eq!(program.declarations.len(), 2);
        match &program.declarations[0] {
            Declaration::Namespace(ns) => {
                assert_eq!(ns.name, "ns");
                assert!(matches!(&ns.declarations[0], Declaration::SchemaDecl(s) if s.name == "Addr"));
            }
            other => panic!("expected namespace, got {other:?}"),
        }
    }

    #[test]
    fn test_body_layouts() {
        // Single block body.
        let single: Facet = serde_json::from_str(
            r#"{"name": "A", "body": {"type": "AndThenBlock", "steps": []}}"#,
        )
        .unwrap();
        assert_eq!(single.and_then_blocks().len(), 1);

        // List-of-blocks body.
        let many: Facet = serde_json::from_str(
            r#"{"name": "B", "body": [{"type": "AndThenBlock"}, {"type": "AndThenBlock"}]}"#,
        )
        .unwrap();
        assert_eq!(many.and_then_blocks().len(), 2);

        // Script body.
        let script: Facet = serde_json::from_str(
            r#"{"name": "C", "body": {"type": "ScriptBlock", "language": "python", "code": "result = {}"}}"#,
        )
        .unwrap();
        assert!(script.and_then_blocks().is_empty());
        assert_eq!(script.script_block().unwrap().language, "python");
    }

    #[test]
    fn test_foreach_block_without_foreach() {
        let block: AndThenBlock = serde_json::from_str(
            r#"{
                "foreach": {"variable": "item", "iterable": {"type": "InputRef", "path": ["items"]}},
                "steps": [{"id": "s", "name": "s", "call": {"target": "F"}}]
            }"#,
        )
        .unwrap();
        assert!(block.foreach.is_some());

        let body = block.without_foreach();
        assert!(body.foreach.is_none());
        assert_eq!(body.steps.len(), 1);
    }
}
