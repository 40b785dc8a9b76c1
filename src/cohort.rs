//! Cohort fan-out: expands (prompt × model × temperature × system) cells
//! and drives each one through the generation service.
//!
//! Cells are embarrassingly parallel; a blueprint-level semaphore bounds
//! the pool and no ordering is guaranteed between cells. The artifact
//! imposes canonical sort later.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::blueprint::Blueprint;
use crate::error::{Error, Result};
use crate::generation::{GenerationRequest, GenerationService, ModelResponseDetail};

/// Default generation pool size.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Two-level response mapping: prompt id → effective model id → detail.
pub type ResponseMap = HashMap<String, HashMap<String, ModelResponseDetail>>;

/// One resolved cell of the cohort.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortCell {
    pub prompt_id: String,
    pub base_model_id: String,
    pub effective_model_id: String,
    /// Request temperature: the axis value, else the prompt's override
    pub temperature: Option<f64>,
    pub system_prompt: Option<String>,
    pub sp_idx: Option<usize>,
}

/// Cohort-unique model id: base + `[temp:X.X]` from the resolved
/// temperature axis, + `[sp_idx:N]` when the systems axis has ≥ 2 entries.
pub fn effective_model_id(
    base_model_id: &str,
    temperature: Option<f64>,
    sp_idx: Option<usize>,
) -> String {
    let mut id = format!("{base_model_id}[temp:{:.1}]", temperature.unwrap_or(0.0));
    if let Some(idx) = sp_idx {
        id.push_str(&format!("[sp_idx:{idx}]"));
    }
    id
}

/// Expand a blueprint into its full cell list.
pub fn expand_cohort(blueprint: &Blueprint) -> Vec<CohortCell> {
    let temperatures = blueprint.temperatures_to_run();
    let systems = blueprint.systems_to_run();
    let has_system_axis = blueprint
        .systems
        .as_ref()
        .is_some_and(|axis| !axis.is_empty());
    let suffix_systems = systems.len() >= 2;

    let mut cells = Vec::with_capacity(blueprint.cohort_size());
    for prompt in &blueprint.prompts {
        for model in &blueprint.models {
            for temp in &temperatures {
                for (sp_idx, system) in systems.iter().enumerate() {
                    // System precedence: the axis entry when an axis exists
                    // (null entries mean "no system"), else the prompt's
                    // system, else the blueprint scalar already folded into
                    // the singleton axis.
                    let resolved_system = if has_system_axis {
                        system.clone()
                    } else {
                        prompt.system.clone().or_else(|| system.clone())
                    };
                    cells.push(CohortCell {
                        prompt_id: prompt.id.clone(),
                        base_model_id: model.id().to_string(),
                        effective_model_id: effective_model_id(
                            model.id(),
                            *temp,
                            suffix_systems.then_some(sp_idx),
                        ),
                        temperature: temp.or(prompt.temperature),
                        system_prompt: resolved_system,
                        sp_idx: suffix_systems.then_some(sp_idx),
                    });
                }
            }
        }
    }
    cells
}

/// All effective model ids of a blueprint's cohort, unsorted.
pub fn effective_model_ids(blueprint: &Blueprint) -> Vec<String> {
    let temperatures = blueprint.temperatures_to_run();
    let systems = blueprint.systems_to_run();
    let suffix_systems = systems.len() >= 2;

    let mut ids = Vec::new();
    for model in &blueprint.models {
        for temp in &temperatures {
            for sp_idx in 0..systems.len() {
                ids.push(effective_model_id(
                    model.id(),
                    *temp,
                    suffix_systems.then_some(sp_idx),
                ));
            }
        }
    }
    ids
}

/// A recorded response usable in place of live generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureEntry {
    pub prompt_id: String,
    #[serde(default)]
    pub base_model_id: Option<String>,
    #[serde(default)]
    pub effective_model_id: Option<String>,
    #[serde(default)]
    pub run_label: Option<String>,
    pub response: String,
}

/// Recorded responses keyed by cell coordinates.
#[derive(Debug, Clone, Default)]
pub struct FixtureSet {
    pub entries: Vec<FixtureEntry>,
    /// When strict, a missing fixture is an error instead of a fallback to
    /// live generation.
    pub strict: bool,
}

impl FixtureSet {
    pub fn lookup(
        &self,
        prompt_id: &str,
        base_model_id: &str,
        effective_model_id: &str,
        run_label: &str,
    ) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| {
                e.prompt_id == prompt_id
                    && e.base_model_id
                        .as_deref()
                        .is_none_or(|m| m == base_model_id)
                    && e.effective_model_id
                        .as_deref()
                        .is_none_or(|m| m == effective_model_id)
                    && e.run_label.as_deref().is_none_or(|l| l == run_label)
            })
            .map(|e| e.response.as_str())
    }
}

/// Drives cohort cells through the generation service.
pub struct CohortRunner {
    generation: Arc<GenerationService>,
    fixtures: Option<FixtureSet>,
}

impl CohortRunner {
    pub fn new(generation: Arc<GenerationService>) -> Self {
        Self {
            generation,
            fixtures: None,
        }
    }

    pub fn with_fixtures(mut self, fixtures: FixtureSet) -> Self {
        self.fixtures = Some(fixtures);
        self
    }

    /// Run every cell not already present in `prefilled`, returning the
    /// completed response map. Every cell of the cartesian product ends up
    /// with an entry; error cells carry the `<error>` sentinel detail.
    pub async fn run(&self, blueprint: &Blueprint, prefilled: ResponseMap) -> Result<ResponseMap> {
        let run_label = blueprint.run_label();
        let cells = expand_cohort(blueprint);
        let concurrency = blueprint.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));

        debug!(
            cells = cells.len(),
            prefilled = prefilled.values().map(|m| m.len()).sum::<usize>(),
            concurrency,
            "running cohort"
        );

        let tasks: Vec<_> = cells
            .into_iter()
            .filter(|cell| {
                !prefilled
                    .get(&cell.prompt_id)
                    .is_some_and(|models| models.contains_key(&cell.effective_model_id))
            })
            .map(|cell| {
                let generation = Arc::clone(&self.generation);
                let semaphore = Arc::clone(&semaphore);
                let prompt = blueprint
                    .prompts
                    .iter()
                    .find(|p| p.id == cell.prompt_id)
                    .cloned();
                let fixture = self.fixtures.as_ref().and_then(|fixtures| {
                    fixtures
                        .lookup(
                            &cell.prompt_id,
                            &cell.base_model_id,
                            &cell.effective_model_id,
                            &run_label,
                        )
                        .map(|r| r.to_string())
                        .map(Ok)
                        .or_else(|| {
                            fixtures.strict.then(|| {
                                Err(format!(
                                    "no fixture for cell ({}, {})",
                                    cell.prompt_id, cell.effective_model_id
                                ))
                            })
                        })
                });

                async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .expect("cohort semaphore closed unexpectedly");

                    let prompt = prompt.expect("cell references a blueprint prompt");
                    let messages = prompt.resolved_messages();
                    // A supplied system prompt rides separately unless the
                    // conversation already opens with a system turn.
                    let system_prompt = if prompt.has_system_turn() {
                        None
                    } else {
                        cell.system_prompt.clone()
                    };

                    let detail = match fixture {
                        Some(Ok(response)) => ModelResponseDetail::success(
                            response,
                            messages,
                            system_prompt,
                            Vec::new(),
                        ),
                        Some(Err(message)) => {
                            let err = Error::Config(message);
                            ModelResponseDetail::from_error(&err, messages, system_prompt)
                        }
                        None => {
                            let request = GenerationRequest {
                                model_id: cell.base_model_id.clone(),
                                messages,
                                system_prompt,
                                temperature: cell.temperature,
                            };
                            generation.generate(request).await
                        }
                    };
                    (cell.prompt_id, cell.effective_model_id, detail)
                }
            })
            .collect();

        let results = join_all(tasks).await;

        let mut map = prefilled;
        for (prompt_id, effective_model_id, detail) in results {
            // Each cell writes a unique (prompt, model) slot.
            map.entry(prompt_id)
                .or_default()
                .insert(effective_model_id, detail);
        }
        Ok(map)
    }
}
