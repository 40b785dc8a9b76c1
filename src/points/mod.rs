//! Deterministic point-function library.
//!
//! A registry maps function names to pure graders over a response string.
//! Every positive grader automatically has a `not_<name>` variant: booleans
//! invert, numeric scores become `1 - score`, and errors pass through
//! unchanged, so partial-coverage negatives grade smoothly.

mod external;
mod script;
mod text;
mod tools;

pub use external::{ExternalCallContext, ExternalServiceCaller, ExternalVerdict};
pub use script::run_script;

use std::collections::HashMap;

use serde_json::Value;

use crate::llm::ToolCall;

/// Context handed to every grader alongside the response text.
pub struct PointFnContext<'a> {
    pub prompt_id: &'a str,
    pub model_id: &'a str,
    /// Structured tool trace from the model response, when present
    pub tool_calls: &'a [ToolCall],
}

impl Default for PointFnContext<'_> {
    fn default() -> Self {
        Self {
            prompt_id: "",
            model_id: "",
            tool_calls: &[],
        }
    }
}

/// Result of one grader invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum PointFnResult {
    Bool(bool),
    /// Graded score in [0, 1]
    Score(f64),
    /// Graded score with an explanation
    Detailed { score: f64, explain: Option<String> },
    Error(String),
}

impl PointFnResult {
    /// Collapse to a numeric score, clamping numbers into [0, 1].
    pub fn score(&self) -> Option<f64> {
        match self {
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Score(s) => Some(s.clamp(0.0, 1.0)),
            Self::Detailed { score, .. } => Some(score.clamp(0.0, 1.0)),
            Self::Error(_) => None,
        }
    }

    pub fn explain(&self) -> Option<&str> {
        match self {
            Self::Detailed { explain, .. } => explain.as_deref(),
            _ => None,
        }
    }

    /// Negation: booleans flip, scores become their complement, errors are
    /// untouched.
    pub fn inverted(self) -> Self {
        match self {
            Self::Bool(b) => Self::Bool(!b),
            Self::Score(s) => Self::Score(1.0 - s.clamp(0.0, 1.0)),
            Self::Detailed { score, explain } => Self::Detailed {
                score: 1.0 - score.clamp(0.0, 1.0),
                explain,
            },
            err @ Self::Error(_) => err,
        }
    }
}

type PointFn = Box<dyn Fn(&str, &Value, &PointFnContext) -> PointFnResult + Send + Sync>;

/// Registry of deterministic graders.
pub struct PointFunctionRegistry {
    functions: HashMap<&'static str, PointFn>,
}

impl PointFunctionRegistry {
    /// Registry with every built-in grader.
    pub fn builtin() -> Self {
        let mut registry = Self {
            functions: HashMap::new(),
        };
        text::register(&mut registry);
        tools::register(&mut registry);
        registry.register("js", |response, args, _ctx| match args.as_str() {
            Some(src) => script::run_script(src, response),
            None => PointFnResult::Error("js expects a script string".to_string()),
        });
        registry.register("script", |response, args, _ctx| match args.as_str() {
            Some(src) => script::run_script(src, response),
            None => PointFnResult::Error("script expects a script string".to_string()),
        });
        registry
    }

    pub(crate) fn register<F>(&mut self, name: &'static str, f: F)
    where
        F: Fn(&str, &Value, &PointFnContext) -> PointFnResult + Send + Sync + 'static,
    {
        self.functions.insert(name, Box::new(f));
    }

    /// Whether a name resolves, including `not_` variants.
    pub fn contains(&self, name: &str) -> bool {
        if self.functions.contains_key(name) {
            return true;
        }
        name.strip_prefix("not_")
            .is_some_and(|base| self.functions.contains_key(base))
    }

    /// Registered positive grader names.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self.functions.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Invoke a grader by name. `not_<name>` resolves to the positive
    /// grader with the result inverted.
    pub fn grade(
        &self,
        name: &str,
        response: &str,
        args: &Value,
        ctx: &PointFnContext<'_>,
    ) -> PointFnResult {
        if let Some(f) = self.functions.get(name) {
            return f(response, args, ctx);
        }
        if let Some(base) = name.strip_prefix("not_") {
            if let Some(f) = self.functions.get(base) {
                return f(response, args, ctx).inverted();
            }
        }
        PointFnResult::Error(format!("unknown point function '{name}'"))
    }
}

/// Read a string argument, accepting both a bare string and `[s]`.
pub(crate) fn string_arg(args: &Value) -> Option<String> {
    match args {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) if items.len() == 1 => {
            items[0].as_str().map(|s| s.to_string())
        }
        _ => None,
    }
}

/// Read a list-of-strings argument.
pub(crate) fn string_list_arg(args: &Value) -> Option<Vec<String>> {
    let items = args.as_array()?;
    items
        .iter()
        .map(|v| v.as_str().map(|s| s.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn registry_resolves_positive_and_negated_names() {
        let registry = PointFunctionRegistry::builtin();
        assert!(registry.contains("contains"));
        assert!(registry.contains("not_contains"));
        assert!(registry.contains("not_icontains_any_of"));
        assert!(!registry.contains("not_a_function"));
        assert!(!registry.contains("not_not_contains"));
    }

    #[test]
    fn unknown_function_is_an_error() {
        let registry = PointFunctionRegistry::builtin();
        let result = registry.grade("frobnicate", "x", &json!("y"), &PointFnContext::default());
        assert!(matches!(result, PointFnResult::Error(_)));
    }

    #[test]
    fn negation_of_booleans_and_scores() {
        assert_eq!(PointFnResult::Bool(true).inverted(), PointFnResult::Bool(false));
        assert_eq!(PointFnResult::Score(0.25).inverted(), PointFnResult::Score(0.75));
        let err = PointFnResult::Error("boom".to_string()).inverted();
        assert_eq!(err, PointFnResult::Error("boom".to_string()));
    }

    #[test]
    fn negated_graded_functions_complement_smoothly() {
        let registry = PointFunctionRegistry::builtin();
        let ctx = PointFnContext::default();
        let args = json!(["alpha", "beta", "gamma", "delta"]);
        let positive = registry.grade("contains_all_of", "alpha beta", &args, &ctx);
        let negative = registry.grade("not_contains_all_of", "alpha beta", &args, &ctx);
        let p = positive.score().unwrap();
        let n = negative.score().unwrap();
        assert!((p - 0.5).abs() < 1e-9);
        assert!((n - 0.5).abs() < 1e-9);
        assert!((p + n - 1.0).abs() < 1e-9);
    }

    #[test]
    fn score_clamps_out_of_range_values() {
        assert_eq!(PointFnResult::Score(1.5).score(), Some(1.0));
        assert_eq!(PointFnResult::Score(-0.5).score(), Some(0.0));
        assert_eq!(PointFnResult::Error("x".to_string()).score(), None);
    }
}
