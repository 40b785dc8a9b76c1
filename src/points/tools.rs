//! Tool-trace graders over structured tool-call records.
//!
//! These consume the tool calls attached to a model response; when a
//! response carries no structured trace, a best-effort extraction from the
//! response text (a JSON array of calls, or an object with a `toolCalls`
//! list) is used instead.

use serde_json::Value;

use crate::llm::ToolCall;

use super::{PointFnResult, PointFunctionRegistry};

pub(crate) fn register(registry: &mut PointFunctionRegistry) {
    registry.register("tool_called", |response, args, ctx| {
        let Some(name) = args.as_str() else {
            return PointFnResult::Error("tool_called expects a tool name".to_string());
        };
        let calls = effective_calls(response, ctx.tool_calls);
        PointFnResult::Bool(calls.iter().any(|c| c.name == name))
    });

    registry.register("tool_args_match", |response, args, ctx| {
        tool_args_match(response, args, ctx.tool_calls)
    });

    registry.register("tool_call_count_between", |response, args, ctx| {
        tool_call_count_between(response, args, ctx.tool_calls)
    });

    registry.register("tool_call_order", |response, args, ctx| {
        let Some(names) = super::string_list_arg(args) else {
            return PointFnResult::Error("tool_call_order expects a list of tool names".to_string());
        };
        let calls = effective_calls(response, ctx.tool_calls);
        PointFnResult::Bool(is_subsequence(&names, &calls))
    });
}

/// Structured calls if present, else an extraction attempt from the text.
fn effective_calls(response: &str, structured: &[ToolCall]) -> Vec<ToolCall> {
    if !structured.is_empty() {
        return structured.to_vec();
    }
    extract_calls_from_text(response)
}

fn extract_calls_from_text(text: &str) -> Vec<ToolCall> {
    let Ok(value) = serde_json::from_str::<Value>(text.trim()) else {
        return Vec::new();
    };
    let list = match &value {
        Value::Array(items) => items.clone(),
        Value::Object(map) => map
            .get("toolCalls")
            .or_else(|| map.get("tool_calls"))
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    };
    list.iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let name = obj
                .get("name")
                .or_else(|| obj.get("tool_name"))?
                .as_str()?
                .to_string();
            let arguments = obj
                .get("arguments")
                .or_else(|| obj.get("args"))
                .cloned()
                .unwrap_or(Value::Null);
            Some(ToolCall { name, arguments })
        })
        .collect()
}

fn tool_args_match(response: &str, args: &Value, structured: &[ToolCall]) -> PointFnResult {
    let Some(spec) = args.as_object() else {
        return PointFnResult::Error(
            "tool_args_match expects {name, where, normalizeWhitespace?}".to_string(),
        );
    };
    let Some(name) = spec.get("name").and_then(|v| v.as_str()) else {
        return PointFnResult::Error("tool_args_match requires a tool name".to_string());
    };
    let Some(where_clause) = spec.get("where") else {
        return PointFnResult::Error("tool_args_match requires a where clause".to_string());
    };
    let normalize = spec
        .get("normalizeWhitespace")
        .or_else(|| spec.get("normalize_whitespace"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let calls = effective_calls(response, structured);
    let candidates: Vec<&ToolCall> = calls.iter().filter(|c| c.name == name).collect();
    if candidates.is_empty() {
        return PointFnResult::Bool(false);
    }

    match where_clause {
        // Partial object deep-match against any matching call's arguments.
        Value::Object(_) => PointFnResult::Bool(
            candidates
                .iter()
                .any(|c| deep_subset_match(where_clause, &c.arguments, normalize)),
        ),
        // Predicate expression with the call arguments bound as `args`.
        Value::String(expr) => {
            for call in candidates {
                match eval_predicate(expr, &call.arguments) {
                    Ok(true) => return PointFnResult::Bool(true),
                    Ok(false) => {}
                    Err(e) => return PointFnResult::Error(e),
                }
            }
            PointFnResult::Bool(false)
        }
        _ => PointFnResult::Error(
            "tool_args_match where clause must be an object or a predicate string".to_string(),
        ),
    }
}

/// Every key in `expected` must be present in `actual` with a matching
/// value; objects recurse, everything else compares for equality.
fn deep_subset_match(expected: &Value, actual: &Value, normalize_whitespace: bool) -> bool {
    match (expected, actual) {
        (Value::Object(exp), Value::Object(act)) => exp.iter().all(|(key, exp_value)| {
            act.get(key)
                .is_some_and(|act_value| deep_subset_match(exp_value, act_value, normalize_whitespace))
        }),
        (Value::String(exp), Value::String(act)) if normalize_whitespace => {
            collapse_whitespace(exp) == collapse_whitespace(act)
        }
        _ => expected == actual,
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn eval_predicate(expr: &str, arguments: &Value) -> Result<bool, String> {
    let engine = rhai::Engine::new();
    let args_dynamic = rhai::serde::to_dynamic(arguments)
        .map_err(|e| format!("cannot bind tool arguments: {e}"))?;
    let mut scope = rhai::Scope::new();
    scope.push_dynamic("args", args_dynamic);
    engine
        .eval_with_scope::<bool>(&mut scope, expr)
        .map_err(|e| format!("predicate error: {e}"))
}

fn tool_call_count_between(
    response: &str,
    args: &Value,
    structured: &[ToolCall],
) -> PointFnResult {
    let Some(items) = args.as_array().filter(|a| a.len() == 2 || a.len() == 3) else {
        return PointFnResult::Error(
            "tool_call_count_between expects [min, max, name?]".to_string(),
        );
    };
    let (Some(min), Some(max)) = (items[0].as_u64(), items[1].as_u64()) else {
        return PointFnResult::Error(
            "tool_call_count_between expects numeric bounds".to_string(),
        );
    };
    if max < min {
        return PointFnResult::Error(format!(
            "tool_call_count_between requires min <= max, got [{min}, {max}]"
        ));
    }
    let name = items.get(2).and_then(|v| v.as_str());

    let calls = effective_calls(response, structured);
    let count = calls
        .iter()
        .filter(|c| name.is_none_or(|n| c.name == n))
        .count() as u64;
    PointFnResult::Bool(count >= min && count <= max)
}

/// Whether `names` occurs as a (not necessarily contiguous) subsequence of
/// the call trace.
fn is_subsequence(names: &[String], calls: &[ToolCall]) -> bool {
    let mut want = names.iter();
    let mut next = want.next();
    for call in calls {
        match next {
            Some(name) if *name == call.name => next = want.next(),
            Some(_) => {}
            None => break,
        }
    }
    next.is_none()
}
