//! Substring, regex, and structural graders.

use regex::Regex;
use serde_json::Value;

use super::{string_arg, string_list_arg, PointFnResult, PointFunctionRegistry};

pub(crate) fn register(registry: &mut PointFunctionRegistry) {
    registry.register("contains", |response, args, _| {
        with_string(args, "contains", |needle| {
            PointFnResult::Bool(response.contains(needle))
        })
    });
    registry.register("icontains", |response, args, _| {
        with_string(args, "icontains", |needle| {
            PointFnResult::Bool(response.to_lowercase().contains(&needle.to_lowercase()))
        })
    });

    registry.register("contains_any_of", |response, args, _| {
        with_list(args, "contains_any_of", |needles| {
            PointFnResult::Bool(needles.iter().any(|n| response.contains(n.as_str())))
        })
    });
    registry.register("icontains_any_of", |response, args, _| {
        with_list(args, "icontains_any_of", |needles| {
            let haystack = response.to_lowercase();
            PointFnResult::Bool(needles.iter().any(|n| haystack.contains(&n.to_lowercase())))
        })
    });

    registry.register("contains_all_of", |response, args, _| {
        with_list(args, "contains_all_of", |needles| {
            fraction_found(needles.len(), |i| response.contains(needles[i].as_str()))
        })
    });
    registry.register("icontains_all_of", |response, args, _| {
        with_list(args, "icontains_all_of", |needles| {
            let haystack = response.to_lowercase();
            fraction_found(needles.len(), |i| haystack.contains(&needles[i].to_lowercase()))
        })
    });

    registry.register("contains_at_least_n_of", |response, args, _| {
        at_least_n(args, "contains_at_least_n_of", |needle| {
            Ok(response.contains(needle))
        })
    });
    registry.register("icontains_at_least_n_of", |response, args, _| {
        let haystack = response.to_lowercase();
        at_least_n(args, "icontains_at_least_n_of", |needle| {
            Ok(haystack.contains(&needle.to_lowercase()))
        })
    });

    registry.register("starts_with", |response, args, _| {
        with_string(args, "starts_with", |prefix| {
            PointFnResult::Bool(response.starts_with(prefix))
        })
    });
    registry.register("istarts_with", |response, args, _| {
        with_string(args, "istarts_with", |prefix| {
            PointFnResult::Bool(response.to_lowercase().starts_with(&prefix.to_lowercase()))
        })
    });
    registry.register("ends_with", |response, args, _| {
        with_string(args, "ends_with", |suffix| {
            PointFnResult::Bool(response.ends_with(suffix))
        })
    });
    registry.register("iends_with", |response, args, _| {
        with_string(args, "iends_with", |suffix| {
            PointFnResult::Bool(response.to_lowercase().ends_with(&suffix.to_lowercase()))
        })
    });

    registry.register("contains_word", |response, args, _| {
        with_string(args, "contains_word", |word| {
            match contains_word(response, word, false) {
                Ok(found) => PointFnResult::Bool(found),
                Err(e) => PointFnResult::Error(e),
            }
        })
    });
    registry.register("icontains_word", |response, args, _| {
        with_string(args, "icontains_word", |word| {
            match contains_word(response, word, true) {
                Ok(found) => PointFnResult::Bool(found),
                Err(e) => PointFnResult::Error(e),
            }
        })
    });

    registry.register("matches", |response, args, _| {
        with_string(args, "matches", |pattern| {
            match compile(pattern, false) {
                Ok(re) => PointFnResult::Bool(re.is_match(response)),
                Err(e) => PointFnResult::Error(e),
            }
        })
    });
    registry.register("imatches", |response, args, _| {
        with_string(args, "imatches", |pattern| {
            match compile(pattern, true) {
                Ok(re) => PointFnResult::Bool(re.is_match(response)),
                Err(e) => PointFnResult::Error(e),
            }
        })
    });

    registry.register("matches_all_of", |response, args, _| {
        with_list(args, "matches_all_of", |patterns| {
            match_fraction(response, patterns, false)
        })
    });
    registry.register("imatches_all_of", |response, args, _| {
        with_list(args, "imatches_all_of", |patterns| {
            match_fraction(response, patterns, true)
        })
    });

    registry.register("matches_at_least_n_of", |response, args, _| {
        at_least_n(args, "matches_at_least_n_of", |pattern| {
            compile(pattern, false).map(|re| re.is_match(response))
        })
    });
    registry.register("imatches_at_least_n_of", |response, args, _| {
        at_least_n(args, "imatches_at_least_n_of", |pattern| {
            compile(pattern, true).map(|re| re.is_match(response))
        })
    });

    registry.register("is_json", |response, _, _| {
        let parsed: Result<Value, _> = serde_json::from_str(response.trim());
        PointFnResult::Bool(matches!(
            parsed,
            Ok(Value::Object(_)) | Ok(Value::Array(_))
        ))
    });

    registry.register("word_count_between", |response, args, _| {
        word_count_between(response, args)
    });
}

fn with_string(
    args: &Value,
    name: &str,
    f: impl FnOnce(&str) -> PointFnResult,
) -> PointFnResult {
    match string_arg(args) {
        Some(s) => f(&s),
        None => PointFnResult::Error(format!("{name} expects a string argument")),
    }
}

fn with_list(
    args: &Value,
    name: &str,
    f: impl FnOnce(&[String]) -> PointFnResult,
) -> PointFnResult {
    match string_list_arg(args) {
        Some(list) => f(&list),
        None => PointFnResult::Error(format!("{name} expects a list of strings")),
    }
}

/// Fraction of needles found; an empty list scores 1.
fn fraction_found(total: usize, found: impl Fn(usize) -> bool) -> PointFnResult {
    if total == 0 {
        return PointFnResult::Score(1.0);
    }
    let hits = (0..total).filter(|&i| found(i)).count();
    PointFnResult::Score(hits as f64 / total as f64)
}

fn match_fraction(response: &str, patterns: &[String], case_insensitive: bool) -> PointFnResult {
    if patterns.is_empty() {
        return PointFnResult::Score(1.0);
    }
    let mut hits = 0usize;
    for pattern in patterns {
        match compile(pattern, case_insensitive) {
            Ok(re) => {
                if re.is_match(response) {
                    hits += 1;
                }
            }
            Err(e) => return PointFnResult::Error(e),
        }
    }
    PointFnResult::Score(hits as f64 / patterns.len() as f64)
}

/// `[n, [items]]` → min(1, found/n); n ≤ 0 scores 1.
fn at_least_n(
    args: &Value,
    name: &str,
    check: impl Fn(&str) -> Result<bool, String>,
) -> PointFnResult {
    let Some(items) = args.as_array().filter(|a| a.len() == 2) else {
        return PointFnResult::Error(format!("{name} expects [n, [items]]"));
    };
    let Some(n) = items[0].as_f64() else {
        return PointFnResult::Error(format!("{name} expects a numeric n"));
    };
    let Some(candidates) = string_list_arg(&items[1]) else {
        return PointFnResult::Error(format!("{name} expects a list of strings"));
    };
    if n <= 0.0 {
        return PointFnResult::Score(1.0);
    }
    let mut found = 0usize;
    for candidate in &candidates {
        match check(candidate) {
            Ok(true) => found += 1,
            Ok(false) => {}
            Err(e) => return PointFnResult::Error(e),
        }
    }
    PointFnResult::Score((found as f64 / n).min(1.0))
}

fn compile(pattern: &str, case_insensitive: bool) -> Result<Regex, String> {
    let source = if case_insensitive {
        format!("(?i){pattern}")
    } else {
        pattern.to_string()
    };
    Regex::new(&source).map_err(|e| format!("invalid regex '{pattern}': {e}"))
}

/// Unicode word character: letters, digits, underscore.
fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whole-word containment with Unicode-aware boundaries: an occurrence
/// counts only when it is neither preceded nor followed by a letter, digit,
/// or underscore.
fn contains_word(haystack: &str, word: &str, case_insensitive: bool) -> Result<bool, String> {
    if word.is_empty() {
        return Ok(false);
    }
    let escaped = regex::escape(word);
    let source = if case_insensitive {
        format!("(?i){escaped}")
    } else {
        escaped
    };
    let re = Regex::new(&source).map_err(|e| format!("invalid word '{word}': {e}"))?;

    for found in re.find_iter(haystack) {
        let before_ok = haystack[..found.start()]
            .chars()
            .next_back()
            .map_or(true, |c| !is_word_char(c));
        let after_ok = haystack[found.end()..]
            .chars()
            .next()
            .map_or(true, |c| !is_word_char(c));
        if before_ok && after_ok {
            return Ok(true);
        }
    }
    Ok(false)
}

/// `[min, max]` → 1 inside the range; wc/min below; max/wc above.
fn word_count_between(response: &str, args: &Value) -> PointFnResult {
    let Some(items) = args.as_array().filter(|a| a.len() == 2) else {
        return PointFnResult::Error("word_count_between expects [min, max]".to_string());
    };
    let (Some(min), Some(max)) = (items[0].as_f64(), items[1].as_f64()) else {
        return PointFnResult::Error("word_count_between expects numeric bounds".to_string());
    };
    if min < 0.0 || max < min {
        return PointFnResult::Error(format!(
            "word_count_between requires 0 <= min <= max, got [{min}, {max}]"
        ));
    }

    let wc = response.split_whitespace().count() as f64;
    let score = if wc < min {
        if min > 0.0 {
            wc / min
        } else {
            1.0
        }
    } else if wc > max {
        if wc > 0.0 {
            max / wc
        } else {
            1.0
        }
    } else {
        1.0
    };
    PointFnResult::Score(score)
}
