//! Sandboxed script grader.
//!
//! Runs a user-supplied script in an embedded rhai engine with a single
//! bound variable holding the response text (as both `r` and `response`).
//! The engine exposes no filesystem, network, or process capabilities; a
//! progress hook enforces a hard wall-clock abort.

use std::time::{Duration, Instant};

use rhai::{Dynamic, Engine, Scope};

use super::PointFnResult;

/// Hard execution budget for one script invocation.
const SCRIPT_TIMEOUT: Duration = Duration::from_millis(100);

/// Evaluate `src` against a response. Accepts expression and statement
/// forms; a top-level `return` works like an expression result.
///
/// Result coercion: bool as-is; numbers clamped to [0, 1]; unit → false;
/// `#{score, explain}` maps pass through; any other type is an error.
pub fn run_script(src: &str, response: &str) -> PointFnResult {
    let mut engine = Engine::new();

    let start = Instant::now();
    engine.on_progress(move |_| {
        if start.elapsed() > SCRIPT_TIMEOUT {
            Some(Dynamic::UNIT)
        } else {
            None
        }
    });
    // Containment limits on top of the capability-free engine.
    engine.set_max_string_size(1_000_000);
    engine.set_max_array_size(100_000);
    engine.set_max_map_size(10_000);
    engine.set_max_call_levels(32);

    let mut scope = Scope::new();
    scope.push("r", response.to_string());
    scope.push("response", response.to_string());

    match engine.eval_with_scope::<Dynamic>(&mut scope, src) {
        Ok(value) => coerce(value),
        Err(err) => {
            if matches!(*err, rhai::EvalAltResult::ErrorTerminated(..)) {
                PointFnResult::Error(format!(
                    "script timed out after {}ms",
                    SCRIPT_TIMEOUT.as_millis()
                ))
            } else {
                PointFnResult::Error(format!("script error: {err}"))
            }
        }
    }
}

fn coerce(value: Dynamic) -> PointFnResult {
    if value.is_unit() {
        return PointFnResult::Bool(false);
    }
    if let Ok(b) = value.as_bool() {
        return PointFnResult::Bool(b);
    }
    if let Ok(i) = value.as_int() {
        return PointFnResult::Score((i as f64).clamp(0.0, 1.0));
    }
    if let Ok(f) = value.as_float() {
        return PointFnResult::Score(f.clamp(0.0, 1.0));
    }
    if value.is_map() {
        let map = value.cast::<rhai::Map>();
        let explain = map
            .get("explain")
            .and_then(|v| v.clone().into_string().ok());
        let Some(score_value) = map.get("score") else {
            return PointFnResult::Error("script result map has no 'score'".to_string());
        };
        let score = if let Ok(b) = score_value.as_bool() {
            if b {
                1.0
            } else {
                0.0
            }
        } else if let Ok(i) = score_value.as_int() {
            (i as f64).clamp(0.0, 1.0)
        } else if let Ok(f) = score_value.as_float() {
            f.clamp(0.0, 1.0)
        } else {
            return PointFnResult::Error("script 'score' is not a bool or number".to_string());
        };
        return PointFnResult::Detailed { score, explain };
    }
    PointFnResult::Error(format!(
        "script returned unsupported type '{}'",
        value.type_name()
    ))
}
