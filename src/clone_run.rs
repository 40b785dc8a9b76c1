//! Run cloner: computes the delta between a source run and a target
//! blueprint, reuses overlapping responses and coverage judgements, and
//! leaves only the missing cells for generation.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::artifact::RunArtifact;
use crate::blueprint::{Blueprint, IDEAL_MODEL_ID};
use crate::cohort::{expand_cohort, ResponseMap};
use crate::error::{Error, Result};
use crate::evaluators::CoverageMap;
use crate::generation::ModelResponseDetail;
use crate::llm::ChatMessage;
use crate::storage::ObjectStore;

/// Identifier of the run being cloned from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloneSource {
    pub config_id: String,
    pub run_label: String,
    pub safe_timestamp: String,
}

impl CloneSource {
    pub fn file_name(&self) -> String {
        format!("{}_{}_comparison.json", self.run_label, self.safe_timestamp)
    }
}

/// Reuse-vs-generate split for a clone run.
#[derive(Debug, Default)]
pub struct ClonePlan {
    /// Cells fed straight into the response map
    pub reuse_responses: ResponseMap,
    /// Per-cell coverage fed into the evaluator as prefill
    pub prefilled_coverage: CoverageMap,
    pub added_prompts: Vec<String>,
    pub removed_prompts: Vec<String>,
    pub changed_prompts: Vec<String>,
    pub reused_cells: usize,
    pub generate_cells: usize,
    pub target_run_label: String,
}

/// Plans clone runs against a storage backend.
pub struct RunCloner {
    storage: Arc<dyn ObjectStore>,
}

impl RunCloner {
    pub fn new(storage: Arc<dyn ObjectStore>) -> Self {
        Self { storage }
    }

    /// Load the source artifact and compute the reuse plan for `target`.
    pub async fn plan(&self, source: &CloneSource, target: &Blueprint) -> Result<ClonePlan> {
        let payload = self
            .storage
            .get_result_by_file_name(&source.config_id, &source.file_name())
            .await?
            .ok_or_else(|| {
                Error::Storage(format!(
                    "source run {}/{} not found",
                    source.config_id,
                    source.file_name()
                ))
            })?;
        let artifact: RunArtifact = serde_json::from_value(payload)?;

        let source_ids: HashSet<&str> = artifact.prompt_ids.iter().map(String::as_str).collect();
        let target_ids: HashSet<&str> = target.prompts.iter().map(|p| p.id.as_str()).collect();

        let mut added: Vec<String> = target_ids
            .difference(&source_ids)
            .map(|s| s.to_string())
            .collect();
        let mut removed: Vec<String> = source_ids
            .difference(&target_ids)
            .map(|s| s.to_string())
            .collect();
        let mut changed: Vec<String> = target
            .prompts
            .iter()
            .filter(|p| source_ids.contains(p.id.as_str()))
            .filter(|p| {
                artifact
                    .prompt_contexts
                    .get(&p.id)
                    .is_none_or(|messages| *messages != p.resolved_messages())
            })
            .map(|p| p.id.clone())
            .collect();
        added.sort_unstable();
        removed.sort_unstable();
        changed.sort_unstable();

        let target_run_label = target.run_label();
        info!(
            source_label = %artifact.run_label,
            target_label = %target_run_label,
            added = added.len(),
            removed = removed.len(),
            changed = changed.len(),
            "clone plan: +{}/-{}/~{} prompts",
            added.len(),
            removed.len(),
            changed.len()
        );

        let fresh: HashSet<&str> = added
            .iter()
            .chain(changed.iter())
            .map(String::as_str)
            .collect();

        let mut plan = ClonePlan {
            target_run_label,
            added_prompts: added.clone(),
            removed_prompts: removed,
            changed_prompts: changed.clone(),
            ..Default::default()
        };

        let source_coverage = artifact.evaluation_results.llm_coverage_scores.as_ref();
        for cell in expand_cohort(target) {
            if fresh.contains(cell.prompt_id.as_str()) {
                plan.generate_cells += 1;
                continue;
            }

            // Reuse requires the same effective model id with the same
            // resolved system prompt, and a non-errored source response.
            let source_response = artifact
                .all_final_assistant_responses
                .get(&cell.prompt_id)
                .and_then(|models| models.get(&cell.effective_model_id));
            let source_system = artifact
                .model_system_prompts
                .get(&cell.prompt_id)
                .and_then(|models| models.get(&cell.effective_model_id));
            let errored = artifact
                .errors
                .get(&cell.prompt_id)
                .is_some_and(|models| models.contains_key(&cell.effective_model_id));

            let reusable = match (source_response, source_system) {
                (Some(_), Some(system)) => !errored && *system == cell.system_prompt,
                _ => false,
            };
            if !reusable {
                plan.generate_cells += 1;
                continue;
            }

            let text = source_response.expect("reusable cell has a response").clone();
            let history = artifact
                .full_conversation_histories
                .as_ref()
                .and_then(|h| h.get(&cell.prompt_id))
                .and_then(|models| models.get(&cell.effective_model_id))
                .cloned()
                .unwrap_or_else(|| {
                    let mut history = artifact
                        .prompt_contexts
                        .get(&cell.prompt_id)
                        .cloned()
                        .unwrap_or_default();
                    history.push(ChatMessage::assistant(&text));
                    history
                });

            plan.reuse_responses
                .entry(cell.prompt_id.clone())
                .or_default()
                .insert(
                    cell.effective_model_id.clone(),
                    ModelResponseDetail {
                        final_assistant_response_text: text,
                        full_conversation_history: history,
                        has_error: false,
                        error_message: None,
                        error_kind: None,
                        system_prompt_used: cell.system_prompt.clone(),
                        tool_calls: Vec::new(),
                    },
                );
            plan.reused_cells += 1;

            if let Some(coverage) = source_coverage
                .and_then(|map| map.get(&cell.prompt_id))
                .and_then(|models| models.get(&cell.effective_model_id))
                .filter(|result| result.error.is_none())
            {
                plan.prefilled_coverage
                    .entry(cell.prompt_id.clone())
                    .or_default()
                    .insert(cell.effective_model_id.clone(), coverage.clone());
            }
        }

        // Ideal responses are re-injected from the target blueprint, never
        // reused from the source; their coverage judgements still carry
        // over for unchanged prompts.
        for models in plan.reuse_responses.values_mut() {
            models.remove(IDEAL_MODEL_ID);
        }
        for prompt in &target.prompts {
            if fresh.contains(prompt.id.as_str()) {
                continue;
            }
            if let Some(coverage) = source_coverage
                .and_then(|map| map.get(&prompt.id))
                .and_then(|models| models.get(IDEAL_MODEL_ID))
                .filter(|result| result.error.is_none())
            {
                plan.prefilled_coverage
                    .entry(prompt.id.clone())
                    .or_default()
                    .insert(IDEAL_MODEL_ID.to_string(), coverage.clone());
            }
        }

        Ok(plan)
    }
}
