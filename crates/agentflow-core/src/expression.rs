// Copyright (c) 2025 AgentFlow Runtime Team
// SPDX-License-Identifier: Apache-2.0

//! Expression evaluation over the compiled AST.
//!
//! Evaluation is pure: the same scope and expression always produce the
//! same value, and nothing is mutated. Values are `serde_json::Value`,
//! which is also the runtime's persisted attribute representation.

use serde_json::{Map, Value};

use crate::error::{AflError, Result};
use crate::program::{Expression, NamedArg};

/// Callback resolving a sibling step's output attribute.
///
/// Returns `Err` with a human-readable message when the step is unknown,
/// not yet complete, or lacks the attribute.
pub type StepOutputFn<'a> = dyn Fn(&str, &str) -> std::result::Result<Value, String> + 'a;

/// The scope an expression is evaluated in.
pub struct EvalScope<'a> {
    /// Input bindings: workflow inputs or the enclosing facet's parameters.
    pub inputs: &'a Map<String, Value>,

    /// Resolver for `StepRef` expressions.
    pub step_output: &'a StepOutputFn<'a>,

    /// Foreach loop variable, shadowing `inputs` when set.
    pub foreach_var: Option<&'a str>,

    /// Value bound to the foreach variable.
    pub foreach_value: Option<&'a Value>,
}

impl<'a> EvalScope<'a> {
    /// A scope with inputs only; step references fail to resolve.
    pub fn inputs_only(inputs: &'a Map<String, Value>) -> Self {
        Self {
            inputs,
            step_output: &|step, _| Err(format!("Step '{step}' is not in scope")),
            foreach_var: None,
            foreach_value: None,
        }
    }
}

/// Evaluate a single expression in a scope.
pub fn evaluate(expr: &Expression, scope: &EvalScope<'_>) -> Result<Value> {
    match expr {
        Expression::String { value } => Ok(Value::String(value.clone())),
        Expression::Int { value } => Ok(Value::from(*value)),
        Expression::Double { value } => Ok(Value::from(*value)),
        Expression::Boolean { value } => Ok(Value::Bool(*value)),
        Expression::Null => Ok(Value::Null),
        Expression::InputRef { path } => eval_input_ref(path, scope),
        Expression::StepRef { path } => eval_step_ref(path, scope),
        Expression::ConcatExpr { operands } => eval_concat(operands, scope),
        Expression::BinaryExpr {
            operator,
            left,
            right,
        } => eval_binary(operator, left, right, scope),
        Expression::UnaryExpr { operator, operand } => eval_unary(operator, operand, scope),
        Expression::ArrayLiteral { elements } => {
            let values = elements
                .iter()
                .map(|e| evaluate(e, scope))
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(values))
        }
        Expression::MapLiteral { entries } => {
            let mut map = Map::new();
            for entry in entries {
                map.insert(entry.key.clone(), evaluate(&entry.value, scope)?);
            }
            Ok(Value::Object(map))
        }
        Expression::IndexExpr { target, index } => eval_index(target, index, scope),
    }
}

/// Evaluate every named argument of a call, in argument order.
pub fn evaluate_args(args: &[NamedArg], scope: &EvalScope<'_>) -> Result<Map<String, Value>> {
    let mut result = Map::new();
    for arg in args {
        result.insert(arg.name.clone(), evaluate(&arg.value, scope)?);
    }
    Ok(result)
}

fn eval_input_ref(path: &[String], scope: &EvalScope<'_>) -> Result<Value> {
    let Some(head) = path.first() else {
        return Err(AflError::reference("$", "Empty input reference path"));
    };

    let value = if scope.foreach_var == Some(head.as_str()) {
        scope.foreach_value.cloned().unwrap_or(Value::Null)
    } else {
        match scope.inputs.get(head) {
            Some(v) => v.clone(),
            None => {
                return Err(AflError::reference(
                    format!("$.{head}"),
                    format!("Input parameter '{head}' not found"),
                ))
            }
        }
    };

    resolve_path(value, &path[1..], &format!("$.{head}"))
}

fn eval_step_ref(path: &[String], scope: &EvalScope<'_>) -> Result<Value> {
    if path.len() < 2 {
        return Err(AflError::reference(
            path.join("."),
            "Step reference requires at least step.attribute",
        ));
    }

    let step_name = &path[0];
    let attr_name = &path[1];
    let value = (scope.step_output)(step_name, attr_name)
        .map_err(|msg| AflError::reference(format!("{step_name}.{attr_name}"), msg))?;

    resolve_path(value, &path[2..], &format!("{step_name}.{attr_name}"))
}

/// Follow trailing path segments via record field access.
fn resolve_path(mut value: Value, remaining: &[String], base: &str) -> Result<Value> {
    let mut base = base.to_string();
    for segment in remaining {
        let reference = format!("{base}.{segment}");
        value = match value {
            Value::Null => {
                return Err(AflError::reference(
                    reference,
                    "Cannot access property on null",
                ))
            }
            Value::Object(mut map) => match map.remove(segment) {
                Some(v) => v,
                None => {
                    return Err(AflError::reference(
                        reference,
                        format!("Property '{segment}' not found"),
                    ))
                }
            },
            other => {
                return Err(AflError::reference(
                    reference,
                    format!("Cannot access '{segment}' on {}", kind_name(&other)),
                ))
            }
        };
        base = reference;
    }
    Ok(value)
}

fn eval_concat(operands: &[Expression], scope: &EvalScope<'_>) -> Result<Value> {
    let mut out = String::new();
    for operand in operands {
        let value = evaluate(operand, scope)?;
        out.push_str(&to_text(&value));
    }
    Ok(Value::String(out))
}

/// Text coercion for concatenation: null is empty, scalars render bare,
/// arrays and maps render as compact JSON.
fn to_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// A numeric operand, integer or float.
#[derive(Debug, Clone, Copy)]
enum Num {
    Int(i64),
    Float(f64),
}

fn as_num(value: &Value) -> Option<Num> {
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Num::Int(i))
            } else {
                n.as_f64().map(Num::Float)
            }
        }
        _ => None,
    }
}

fn num_value_int(i: i64) -> Value {
    Value::from(i)
}

fn num_value_float(f: f64) -> Value {
    serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
}

fn eval_binary(
    operator: &str,
    left: &Expression,
    right: &Expression,
    scope: &EvalScope<'_>,
) -> Result<Value> {
    let lhs = evaluate(left, scope)?;
    let rhs = evaluate(right, scope)?;
    let render = || format!("{lhs} {operator} {rhs}");

    // String concatenation via `+` mirrors the original runtime.
    if operator == "+" {
        if let (Value::String(a), Value::String(b)) = (&lhs, &rhs) {
            return Ok(Value::String(format!("{a}{b}")));
        }
    }

    let (Some(a), Some(b)) = (as_num(&lhs), as_num(&rhs)) else {
        return Err(AflError::evaluation(
            render(),
            format!(
                "Type error in {operator} operation: {} and {}",
                kind_name(&lhs),
                kind_name(&rhs)
            ),
        ));
    };

    match operator {
        "+" => Ok(match (a, b) {
            (Num::Int(x), Num::Int(y)) => num_value_int(x.wrapping_add(y)),
            _ => num_value_float(to_f64(a) + to_f64(b)),
        }),
        "-" => Ok(match (a, b) {
            (Num::Int(x), Num::Int(y)) => num_value_int(x.wrapping_sub(y)),
            _ => num_value_float(to_f64(a) - to_f64(b)),
        }),
        "*" => Ok(match (a, b) {
            (Num::Int(x), Num::Int(y)) => num_value_int(x.wrapping_mul(y)),
            _ => num_value_float(to_f64(a) * to_f64(b)),
        }),
        "/" => {
            if to_f64(b) == 0.0 {
                return Err(AflError::evaluation(render(), "Division by zero"));
            }
            // Division always produces a float, as in the original runtime.
            Ok(num_value_float(to_f64(a) / to_f64(b)))
        }
        "%" => match (a, b) {
            (_, Num::Int(0)) => Err(AflError::evaluation(render(), "Division by zero")),
            (Num::Int(x), Num::Int(y)) => Ok(num_value_int(x.rem_euclid(y))),
            _ => {
                if to_f64(b) == 0.0 {
                    Err(AflError::evaluation(render(), "Division by zero"))
                } else {
                    Ok(num_value_float(to_f64(a) % to_f64(b)))
                }
            }
        },
        other => Err(AflError::evaluation(
            render(),
            format!("Unknown operator: {other}"),
        )),
    }
}

fn to_f64(n: Num) -> f64 {
    match n {
        Num::Int(i) => i as f64,
        Num::Float(f) => f,
    }
}

fn eval_unary(operator: &str, operand: &Expression, scope: &EvalScope<'_>) -> Result<Value> {
    let value = evaluate(operand, scope)?;
    match operator {
        "-" => match as_num(&value) {
            Some(Num::Int(i)) => Ok(num_value_int(-i)),
            Some(Num::Float(f)) => Ok(num_value_float(-f)),
            None => Err(AflError::evaluation(
                format!("-{value}"),
                format!("Cannot negate {}", kind_name(&value)),
            )),
        },
        other => Err(AflError::evaluation(
            format!("{other}{value}"),
            format!("Unknown operator: {other}"),
        )),
    }
}

fn eval_index(target: &Expression, index: &Expression, scope: &EvalScope<'_>) -> Result<Value> {
    let target_value = evaluate(target, scope)?;
    let index_value = evaluate(index, scope)?;
    let render = || format!("{target_value}[{index_value}]");

    match (&target_value, &index_value) {
        (Value::Array(items), Value::Number(n)) => {
            let idx = n
                .as_u64()
                .and_then(|i| usize::try_from(i).ok())
                .ok_or_else(|| AflError::evaluation(render(), "Index error: invalid index"))?;
            items.get(idx).cloned().ok_or_else(|| {
                AflError::evaluation(
                    render(),
                    format!("Index error: index {idx} out of range for length {}", items.len()),
                )
            })
        }
        (Value::Object(map), Value::String(key)) => map.get(key).cloned().ok_or_else(|| {
            AflError::evaluation(render(), format!("Index error: key '{key}' not found"))
        }),
        _ => Err(AflError::evaluation(
            render(),
            format!(
                "Index error: cannot index {} with {}",
                kind_name(&target_value),
                kind_name(&index_value)
            ),
        )),
    }
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn expr(json: Value) -> Expression {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_literals() {
        let inputs = Map::new();
        let scope = EvalScope::inputs_only(&inputs);

        assert_eq!(
            evaluate(&expr(json!({"type": "String", "value": "hi"})), &scope).unwrap(),
            json!("hi")
        );
        assert_eq!(
            evaluate(&expr(json!({"type": "Int", "value": 42})), &scope).unwrap(),
            json!(42)
        );
        assert_eq!(
            evaluate(&expr(json!({"type": "Double", "value": 1.5})), &scope).unwrap(),
            json!(1.5)
        );
        assert_eq!(
            evaluate(&expr(json!({"type": "Boolean", "value": true})), &scope).unwrap(),
            json!(true)
        );
        assert_eq!(
            evaluate(&expr(json!({"type": "Null"})), &scope).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_input_ref() {
        let inputs = inputs(&[("x", json!(41)), ("addr", json!({"city": "X"}))]);
        let scope = EvalScope::inputs_only(&inputs);

        let value = evaluate(&expr(json!({"type": "InputRef", "path": ["x"]})), &scope).unwrap();
        assert_eq!(value, json!(41));

        let value = evaluate(
            &expr(json!({"type": "InputRef", "path": ["addr", "city"]})),
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!("X"));

        let err = evaluate(&expr(json!({"type": "InputRef", "path": ["nope"]})), &scope)
            .unwrap_err();
        assert!(matches!(err, AflError::Reference { .. }));
    }

    #[test]
    fn test_foreach_shadows_inputs() {
        let inputs = inputs(&[("item", json!("outer"))]);
        let foreach_value = json!(7);
        let scope = EvalScope {
            inputs: &inputs,
            step_output: &|_, _| Err("no steps".into()),
            foreach_var: Some("item"),
            foreach_value: Some(&foreach_value),
        };

        let value = evaluate(&expr(json!({"type": "InputRef", "path": ["item"]})), &scope).unwrap();
        assert_eq!(value, json!(7));
    }

    #[test]
    fn test_step_ref() {
        let inputs = Map::new();
        let scope = EvalScope {
            inputs: &inputs,
            step_output: &|step, attr| {
                if step == "s1" && attr == "output" {
                    Ok(json!(5))
                } else {
                    Err(format!("Attribute '{attr}' not found on step '{step}'"))
                }
            },
            foreach_var: None,
            foreach_value: None,
        };

        let value = evaluate(
            &expr(json!({"type": "StepRef", "path": ["s1", "output"]})),
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!(5));

        let err = evaluate(
            &expr(json!({"type": "StepRef", "path": ["s1", "missing"]})),
            &scope,
        )
        .unwrap_err();
        assert!(matches!(err, AflError::Reference { .. }));

        // A bare step name is not a valid reference.
        let err = evaluate(&expr(json!({"type": "StepRef", "path": ["s1"]})), &scope).unwrap_err();
        assert!(matches!(err, AflError::Reference { .. }));
    }

    #[test]
    fn test_concat_coerces_and_drops_null() {
        let inputs = Map::new();
        let scope = EvalScope::inputs_only(&inputs);

        let value = evaluate(
            &expr(json!({"type": "ConcatExpr", "operands": [
                {"type": "String", "value": "n="},
                {"type": "Int", "value": 3},
                {"type": "Null"},
                {"type": "Boolean", "value": true}
            ]})),
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!("n=3true"));
    }

    #[test]
    fn test_arithmetic() {
        let inputs = Map::new();
        let scope = EvalScope::inputs_only(&inputs);

        let value = evaluate(
            &expr(json!({"type": "BinaryExpr", "operator": "+",
                "left": {"type": "Int", "value": 2},
                "right": {"type": "Int", "value": 3}})),
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!(5));

        // Mixed int/float promotes.
        let value = evaluate(
            &expr(json!({"type": "BinaryExpr", "operator": "*",
                "left": {"type": "Int", "value": 2},
                "right": {"type": "Double", "value": 1.5}})),
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!(3.0));

        // Division always yields a float.
        let value = evaluate(
            &expr(json!({"type": "BinaryExpr", "operator": "/",
                "left": {"type": "Int", "value": 7},
                "right": {"type": "Int", "value": 2}})),
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!(3.5));

        let value = evaluate(
            &expr(json!({"type": "BinaryExpr", "operator": "%",
                "left": {"type": "Int", "value": 7},
                "right": {"type": "Int", "value": 3}})),
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!(1));
    }

    #[test]
    fn test_division_by_zero() {
        let inputs = Map::new();
        let scope = EvalScope::inputs_only(&inputs);

        let err = evaluate(
            &expr(json!({"type": "BinaryExpr", "operator": "/",
                "left": {"type": "Int", "value": 1},
                "right": {"type": "Int", "value": 0}})),
            &scope,
        )
        .unwrap_err();
        assert!(matches!(err, AflError::Evaluation { .. }));
        assert!(err.to_string().contains("Division by zero"));
    }

    #[test]
    fn test_string_plus_string_concatenates() {
        let inputs = Map::new();
        let scope = EvalScope::inputs_only(&inputs);

        let value = evaluate(
            &expr(json!({"type": "BinaryExpr", "operator": "+",
                "left": {"type": "String", "value": "ab"},
                "right": {"type": "String", "value": "cd"}})),
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!("abcd"));
    }

    #[test]
    fn test_unary_negation() {
        let inputs = Map::new();
        let scope = EvalScope::inputs_only(&inputs);

        let value = evaluate(
            &expr(json!({"type": "UnaryExpr", "operator": "-",
                "operand": {"type": "Int", "value": 4}})),
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!(-4));

        let err = evaluate(
            &expr(json!({"type": "UnaryExpr", "operator": "-",
                "operand": {"type": "String", "value": "x"}})),
            &scope,
        )
        .unwrap_err();
        assert!(matches!(err, AflError::Evaluation { .. }));
    }

    #[test]
    fn test_array_map_index() {
        let inputs = Map::new();
        let scope = EvalScope::inputs_only(&inputs);

        let value = evaluate(
            &expr(json!({"type": "IndexExpr",
                "target": {"type": "ArrayLiteral", "elements": [
                    {"type": "Int", "value": 10}, {"type": "Int", "value": 20}]},
                "index": {"type": "Int", "value": 1}})),
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!(20));

        let value = evaluate(
            &expr(json!({"type": "IndexExpr",
                "target": {"type": "MapLiteral", "entries": [
                    {"key": "a", "value": {"type": "Int", "value": 1}}]},
                "index": {"type": "String", "value": "a"}})),
            &scope,
        )
        .unwrap();
        assert_eq!(value, json!(1));

        let err = evaluate(
            &expr(json!({"type": "IndexExpr",
                "target": {"type": "ArrayLiteral", "elements": []},
                "index": {"type": "Int", "value": 0}})),
            &scope,
        )
        .unwrap_err();
        assert!(matches!(err, AflError::Evaluation { .. }));
    }

    #[test]
    fn test_evaluate_args_in_order() {
        let inputs = inputs(&[("x", json!(1))]);
        let scope = EvalScope::inputs_only(&inputs);

        let args: Vec<NamedArg> = serde_json::from_value(json!([
            {"name": "a", "value": {"type": "InputRef", "path": ["x"]}},
            {"name": "b", "value": {"type": "Int", "value": 2}}
        ]))
        .unwrap();

        let evaluated = evaluate_args(&args, &scope).unwrap();
        assert_eq!(evaluated.len(), 2);
        assert_eq!(evaluated["a"], json!(1));
        assert_eq!(evaluated["b"], json!(2));
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let inputs = inputs(&[("x", json!(3))]);
        let scope = EvalScope::inputs_only(&inputs);
        let e = expr(json!({"type": "BinaryExpr", "operator": "+",
            "left": {"type": "InputRef", "path": ["x"]},
            "right": {"type": "Int", "value": 4}}));

        let first = evaluate(&e, &scope).unwrap();
        let second = evaluate(&e, &scope).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, json!(7));
    }
}
