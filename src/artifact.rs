//! Run artifact: the single self-contained JSON document persisted per
//! pipeline execution.

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::blueprint::{Blueprint, IDEAL_MODEL_ID};
use crate::cohort::{effective_model_ids, ResponseMap};
use crate::error::{Error, Result};
use crate::evaluators::{CoverageMap, SimilarityMatrix, SimilarityResult};
use crate::llm::ChatMessage;

/// Evaluation outputs carried by the artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub similarity_matrix: Option<SimilarityMatrix>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_prompt_similarities: Option<HashMap<String, SimilarityMatrix>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_coverage_scores: Option<CoverageMap>,
}

/// The persisted run document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunArtifact {
    pub config_id: String,
    pub config_title: String,
    /// Content hash of the normalized blueprint
    pub run_label: String,
    /// URL-safe ISO-8601 derivative, no `:` or `.`
    pub safe_timestamp: String,
    pub eval_methods_used: Vec<String>,
    /// Sorted; includes the synthetic ideal id when any prompt has an
    /// ideal response
    pub effective_models: Vec<String>,
    /// Sorted
    pub prompt_ids: Vec<String>,
    pub prompt_contexts: HashMap<String, Vec<ChatMessage>>,
    /// System prompt used per (prompt, effective model) cell; two-level
    /// like the responses, since per-prompt system fallbacks can differ
    /// under one effective model id
    pub model_system_prompts: HashMap<String, HashMap<String, Option<String>>>,
    /// prompt id → effective model id → final text (error cells carry the
    /// `<error>` sentinel)
    pub all_final_assistant_responses: HashMap<String, HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_conversation_histories: Option<HashMap<String, HashMap<String, Vec<ChatMessage>>>>,
    pub evaluation_results: EvaluationResults,
    /// Sparse: only errored cells appear
    #[serde(default)]
    pub errors: HashMap<String, HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executive_summary: Option<String>,
}

impl RunArtifact {
    /// Artifact file name: `{runLabel}_{safeTimestamp}_comparison.json`.
    pub fn file_name(&self) -> String {
        format!("{}_{}_comparison.json", self.run_label, self.safe_timestamp)
    }

    /// Validate the structural invariants before persistence.
    pub fn validate(&self) -> Result<()> {
        let mut sorted_models = self.effective_models.clone();
        sorted_models.sort_unstable();
        if sorted_models != self.effective_models {
            return Err(Error::Internal("effective models are not sorted".to_string()));
        }
        let mut sorted_prompts = self.prompt_ids.clone();
        sorted_prompts.sort_unstable();
        if sorted_prompts != self.prompt_ids {
            return Err(Error::Internal("prompt ids are not sorted".to_string()));
        }
        if self.safe_timestamp.contains(':') || self.safe_timestamp.contains('.') {
            return Err(Error::Internal(format!(
                "unsafe timestamp '{}'",
                self.safe_timestamp
            )));
        }

        for prompt_id in &self.prompt_ids {
            let responses = self.all_final_assistant_responses.get(prompt_id);
            for model_id in &self.effective_models {
                let has_response = responses.is_some_and(|m| m.contains_key(model_id));
                // The ideal column only exists for prompts with an ideal.
                if model_id == IDEAL_MODEL_ID {
                    continue;
                }
                if !has_response {
                    return Err(Error::Internal(format!(
                        "cell ({prompt_id}, {model_id}) has no response entry"
                    )));
                }
                let text = responses
                    .and_then(|m| m.get(model_id))
                    .map(String::as_str)
                    .unwrap_or_default();
                let errored = self
                    .errors
                    .get(prompt_id)
                    .is_some_and(|m| m.contains_key(model_id));
                if text.starts_with("<error>") && !errored {
                    return Err(Error::Internal(format!(
                        "error cell ({prompt_id}, {model_id}) missing from the error map"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// URL-safe timestamp: fresh ISO-8601 with `:` and `.` replaced by `-`.
pub fn safe_timestamp_now() -> String {
    sanitize_timestamp(&Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn sanitize_timestamp(iso: &str) -> String {
    iso.replace([':', '.'], "-")
}

/// Model id made safe for object keys: `:/\?#%[]` become `_`.
pub fn safe_model_id(model_id: &str) -> String {
    model_id.replace([':', '/', '\\', '?', '#', '%', '[', ']'], "_")
}

/// Assemble the artifact from the pipeline outputs.
pub fn build_artifact(
    blueprint: &Blueprint,
    response_map: &ResponseMap,
    similarity: Option<SimilarityResult>,
    coverage: Option<CoverageMap>,
    include_histories: bool,
) -> Result<RunArtifact> {
    let has_ideal = blueprint.prompts.iter().any(|p| p.ideal_response.is_some());

    let mut models = effective_model_ids(blueprint);
    if has_ideal {
        models.push(IDEAL_MODEL_ID.to_string());
    }
    models.sort_unstable();
    models.dedup();

    let mut prompt_ids: Vec<String> = blueprint.prompts.iter().map(|p| p.id.clone()).collect();
    prompt_ids.sort_unstable();

    let prompt_contexts = blueprint
        .prompts
        .iter()
        .map(|p| (p.id.clone(), p.resolved_messages()))
        .collect();

    let mut all_responses: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut errors: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut histories: HashMap<String, HashMap<String, Vec<ChatMessage>>> = HashMap::new();
    let mut model_system_prompts: HashMap<String, HashMap<String, Option<String>>> =
        HashMap::new();

    for (prompt_id, cells) in response_map {
        for (model_id, detail) in cells {
            all_responses
                .entry(prompt_id.clone())
                .or_default()
                .insert(model_id.clone(), detail.final_assistant_response_text.clone());
            if detail.has_error {
                errors.entry(prompt_id.clone()).or_default().insert(
                    model_id.clone(),
                    detail
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                );
            }
            if include_histories {
                histories
                    .entry(prompt_id.clone())
                    .or_default()
                    .insert(model_id.clone(), detail.full_conversation_history.clone());
            }
            model_system_prompts
                .entry(prompt_id.clone())
                .or_default()
                .insert(model_id.clone(), detail.system_prompt_used.clone());
        }
    }

    let mut eval_methods = Vec::new();
    if similarity.is_some() {
        eval_methods.push("embedding".to_string());
    }
    if coverage.is_some() {
        eval_methods.push("llm-coverage".to_string());
    }

    let evaluation_results = EvaluationResults {
        similarity_matrix: similarity.as_ref().map(|s| s.similarity_matrix.clone()),
        per_prompt_similarities: similarity.map(|s| s.per_prompt_similarities),
        llm_coverage_scores: coverage,
    };

    let artifact = RunArtifact {
        config_id: blueprint.id.clone(),
        config_title: blueprint
            .title
            .clone()
            .unwrap_or_else(|| blueprint.id.clone()),
        run_label: blueprint.run_label(),
        safe_timestamp: safe_timestamp_now(),
        eval_methods_used: eval_methods,
        effective_models: models,
        prompt_ids,
        prompt_contexts,
        model_system_prompts,
        all_final_assistant_responses: all_responses,
        full_conversation_histories: include_histories.then_some(histories),
        evaluation_results,
        errors,
        executive_summary: None,
    };
    artifact.validate()?;
    Ok(artifact)
}
