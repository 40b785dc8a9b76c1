//! Comparison pipeline: expands the cohort, drives generation, runs the two
//! evaluation families in parallel, and persists the run artifact.
//!
//! Every run owns its own dispatcher, limiter registry, and breaker state
//! through this context object; nothing here is a process-wide singleton.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact::{build_artifact, RunArtifact};
use crate::blueprint::{Blueprint, IDEAL_MODEL_ID, ModelRef};
use crate::cache::CacheService;
use crate::clone_run::{CloneSource, RunCloner};
use crate::cohort::{CohortRunner, FixtureSet, ResponseMap};
use crate::error::Result;
use crate::evaluators::{CoverageEvaluator, CoverageMap, EmbeddingEvaluator, SimilarityResult};
use crate::generation::{GenerationConfig, GenerationService, ModelResponseDetail};
use crate::limiter::{LimiterProfile, LimiterRegistry};
use crate::llm::ClientDispatcher;
use crate::storage::ObjectStore;

/// Pipeline tunables.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub generation: GenerationConfig,
    pub limiter_profile: LimiterProfile,
    pub fixtures: Option<FixtureSet>,
    pub run_embedding: bool,
    pub run_coverage: bool,
    pub include_histories: bool,
    /// Also persist one small JSON per (prompt, model) cell
    pub save_response_artifacts: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            generation: GenerationConfig::default(),
            limiter_profile: LimiterProfile::default(),
            fixtures: None,
            run_embedding: true,
            run_coverage: true,
            include_histories: true,
            save_response_artifacts: true,
        }
    }
}

/// One pipeline execution context.
pub struct ComparisonPipeline {
    dispatcher: Arc<ClientDispatcher>,
    limiters: Arc<LimiterRegistry>,
    cache: Arc<CacheService>,
    storage: Arc<dyn ObjectStore>,
    options: PipelineOptions,
}

impl ComparisonPipeline {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        cache: Arc<CacheService>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            dispatcher: Arc::new(ClientDispatcher::new()),
            limiters: Arc::new(LimiterRegistry::new(options.limiter_profile)),
            cache,
            storage,
            options,
        }
    }

    /// The run-scoped dispatcher, exposed so callers can register custom
    /// adapters before execution.
    pub fn dispatcher(&self) -> Arc<ClientDispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Execute a full comparison run for a blueprint.
    pub async fn execute(&self, blueprint: &Blueprint) -> Result<RunArtifact> {
        self.execute_with(blueprint, ResponseMap::new(), CoverageMap::new())
            .await
    }

    /// Execute a clone run: reuse overlapping responses and coverage from a
    /// prior run and generate only the delta.
    pub async fn execute_clone(
        &self,
        source: &CloneSource,
        blueprint: &Blueprint,
    ) -> Result<RunArtifact> {
        let cloner = RunCloner::new(Arc::clone(&self.storage));
        let plan = cloner.plan(source, blueprint).await?;
        info!(
            reused = plan.reused_cells,
            generating = plan.generate_cells,
            "clone run planned"
        );
        self.execute_with(blueprint, plan.reuse_responses, plan.prefilled_coverage)
            .await
    }

    async fn execute_with(
        &self,
        blueprint: &Blueprint,
        prefilled_responses: ResponseMap,
        prefilled_coverage: CoverageMap,
    ) -> Result<RunArtifact> {
        blueprint.validate()?;

        let run_id = Uuid::new_v4();
        info!(
            run_id = %run_id,
            blueprint = %blueprint.id,
            cohort = blueprint.cohort_size(),
            "starting comparison pipeline"
        );

        let custom_models: Vec<_> = blueprint
            .models
            .iter()
            .filter_map(|m| match m {
                ModelRef::Custom(def) => Some(def.clone()),
                ModelRef::Id(_) => None,
            })
            .collect();
        if !custom_models.is_empty() {
            self.dispatcher.register_custom_models(custom_models).await;
        }

        let generation = Arc::new(GenerationService::new(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.limiters),
            Arc::clone(&self.cache),
            self.options.generation.clone(),
        ));
        let mut runner = CohortRunner::new(generation);
        if let Some(ref fixtures) = self.options.fixtures {
            runner = runner.with_fixtures(fixtures.clone());
        }

        let mut response_map = runner.run(blueprint, prefilled_responses).await?;
        inject_ideal_responses(blueprint, &mut response_map);

        let similarity = self.run_embedding(blueprint, &response_map).await?;
        let coverage = if self.options.run_coverage {
            let evaluator = CoverageEvaluator::new(
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.cache),
                blueprint,
            );
            Some(
                evaluator
                    .evaluate(blueprint, &response_map, &prefilled_coverage)
                    .await,
            )
        } else {
            None
        };

        let artifact = build_artifact(
            blueprint,
            &response_map,
            similarity,
            coverage,
            self.options.include_histories,
        )?;
        self.persist(&artifact, &response_map).await?;

        info!(
            run_id = %run_id,
            file = %artifact.file_name(),
            "pipeline complete"
        );
        Ok(artifact)
    }

    async fn run_embedding(
        &self,
        blueprint: &Blueprint,
        response_map: &ResponseMap,
    ) -> Result<Option<SimilarityResult>> {
        if !self.options.run_embedding {
            return Ok(None);
        }
        let evaluator = EmbeddingEvaluator::new(
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.cache),
            blueprint.embedding_model.clone(),
        );
        evaluator.evaluate(response_map).await.map(Some)
    }

    /// Persist per-response artefacts first, the main document last; a
    /// failure anywhere surfaces as a storage error and no main document
    /// exists for a partially-written run.
    async fn persist(&self, artifact: &RunArtifact, response_map: &ResponseMap) -> Result<()> {
        if self.options.save_response_artifacts {
            for (prompt_id, models) in response_map {
                for (model_id, detail) in models {
                    let coverage = artifact
                        .evaluation_results
                        .llm_coverage_scores
                        .as_ref()
                        .and_then(|map| map.get(prompt_id))
                        .and_then(|models| models.get(model_id));
                    let payload = json!({
                        "promptId": prompt_id,
                        "modelId": model_id,
                        "response": detail,
                        "coverage": coverage,
                    });
                    self.storage
                        .save_response_artifact(
                            &artifact.config_id,
                            &artifact.run_label,
                            &artifact.safe_timestamp,
                            prompt_id,
                            model_id,
                            &payload,
                        )
                        .await?;
                }
            }
        }

        let payload = serde_json::to_value(artifact)?;
        self.storage
            .save_result(&artifact.config_id, &artifact.file_name(), &payload)
            .await?;
        Ok(())
    }
}

/// Insert the synthetic ideal column for every prompt carrying an ideal
/// response.
fn inject_ideal_responses(blueprint: &Blueprint, response_map: &mut ResponseMap) {
    for prompt in &blueprint.prompts {
        let Some(ref ideal) = prompt.ideal_response else {
            continue;
        };
        let entry = response_map.entry(prompt.id.clone()).or_default();
        if entry.contains_key(IDEAL_MODEL_ID) {
            continue;
        }
        entry.insert(
            IDEAL_MODEL_ID.to_string(),
            ModelResponseDetail::success(
                ideal.clone(),
                prompt.resolved_messages(),
                None,
                Vec::new(),
            ),
        );
    }
    if response_map.is_empty() {
        warn!("response map is empty after cohort run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::{EvaluationConfig, JudgeMode, PointDefinition, Prompt};
    use crate::error::Result as CoreResult;
    use crate::llm::{ApiCallOptions, ChatAdapter, ChatCompletion, ChunkStream};
    use crate::storage::LocalObjectStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves generation, judging, and embeddings for the e2e scenarios.
    #[derive(Debug)]
    struct ScenarioAdapter {
        generation_calls: Arc<AtomicUsize>,
        /// Text returned for generation calls to `openai:m`
        answer: String,
        /// Verdict JSON returned for judge calls
        verdict: String,
        /// Embedding vector; empty simulates a broken backend
        embedding: Vec<f32>,
    }

    #[async_trait]
    impl ChatAdapter for ScenarioAdapter {
        async fn complete(&self, options: &ApiCallOptions) -> CoreResult<ChatCompletion> {
            let text = if options.model_id == "openai:judge" {
                self.verdict.clone()
            } else {
                self.generation_calls.fetch_add(1, Ordering::SeqCst);
                self.answer.clone()
            };
            Ok(ChatCompletion {
                text,
                ..Default::default()
            })
        }

        async fn stream(&self, _options: &ApiCallOptions) -> CoreResult<ChunkStream> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn embed(&self, _model: &str, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.embedding.clone()).collect())
        }

        fn provider_key(&self) -> &str {
            "openai"
        }
    }

    fn scenario_blueprint() -> Blueprint {
        Blueprint {
            id: "bp".to_string(),
            title: Some("Scenario".to_string()),
            description: None,
            prompts: vec![Prompt {
                id: "p1".to_string(),
                messages: None,
                prompt_text: Some("Say A".to_string()),
                system: None,
                temperature: None,
                points: vec![PointDefinition::Text("says A".to_string())],
                should_not: vec![],
                ideal_response: Some("A".to_string()),
                citation: None,
                description: None,
            }],
            models: vec![ModelRef::Id("openai:m".to_string())],
            temperatures: None,
            systems: None,
            temperature: None,
            system: None,
            concurrency: None,
            embedding_model: None,
            evaluation_config: Some(EvaluationConfig {
                judge_models: vec!["openai:judge".to_string()],
                judge_mode: JudgeMode::Failover,
            }),
            tags: vec![],
            external_services: HashMap::new(),
        }
    }

    fn pipeline(storage: Arc<LocalObjectStore>) -> ComparisonPipeline {
        ComparisonPipeline::new(
            storage,
            Arc::new(CacheService::disabled()),
            PipelineOptions {
                generation: GenerationConfig {
                    retries: 0,
                    use_cache: false,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    async fn with_adapter(
        pipeline: &ComparisonPipeline,
        adapter: ScenarioAdapter,
    ) -> Arc<AtomicUsize> {
        let calls = Arc::clone(&adapter.generation_calls);
        pipeline
            .dispatcher()
            .insert_adapter("openai", Arc::new(adapter))
            .await;
        calls
    }

    #[tokio::test]
    async fn single_model_single_prompt_run() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalObjectStore::new(dir.path()));
        let pipeline = pipeline(Arc::clone(&storage));
        with_adapter(
            &pipeline,
            ScenarioAdapter {
                generation_calls: Arc::new(AtomicUsize::new(0)),
                answer: "A".to_string(),
                verdict: r#"{"coverage_extent": 1.0, "reflection": "exact"}"#.to_string(),
                embedding: vec![1.0, 0.0],
            },
        )
        .await;

        let blueprint = scenario_blueprint();
        let artifact = pipeline.execute(&blueprint).await.unwrap();

        assert_eq!(
            artifact.effective_models,
            vec![IDEAL_MODEL_ID.to_string(), "openai:m[temp:0.0]".to_string()]
        );
        assert_eq!(
            artifact.all_final_assistant_responses["p1"]["openai:m[temp:0.0]"],
            "A"
        );
        assert_eq!(artifact.all_final_assistant_responses["p1"][IDEAL_MODEL_ID], "A");
        assert!(artifact.errors.is_empty());
        assert_eq!(
            artifact.eval_methods_used,
            vec!["embedding".to_string(), "llm-coverage".to_string()]
        );

        let coverage = artifact
            .evaluation_results
            .llm_coverage_scores
            .as_ref()
            .unwrap();
        assert_eq!(
            coverage["p1"]["openai:m[temp:0.0]"].avg_coverage_extent,
            Some(1.0)
        );

        // The artifact round-trips from storage.
        let stored = storage
            .get_result_by_file_name("bp", &artifact.file_name())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["runLabel"], artifact.run_label);
    }

    #[tokio::test]
    async fn total_embedding_failure_aborts_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalObjectStore::new(dir.path()));
        let pipeline = pipeline(Arc::clone(&storage));
        with_adapter(
            &pipeline,
            ScenarioAdapter {
                generation_calls: Arc::new(AtomicUsize::new(0)),
                answer: "A".to_string(),
                verdict: r#"{"coverage_extent": 1.0}"#.to_string(),
                embedding: vec![],
            },
        )
        .await;

        let blueprint = scenario_blueprint();
        let err = pipeline.execute(&blueprint).await.unwrap_err();
        assert_eq!(err.kind(), "embedding-fail");
        assert!(storage.list_runs_for_config("bp").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_blueprint_aborts_before_any_call() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalObjectStore::new(dir.path()));
        let pipeline = pipeline(storage);
        let calls = with_adapter(
            &pipeline,
            ScenarioAdapter {
                generation_calls: Arc::new(AtomicUsize::new(0)),
                answer: "A".to_string(),
                verdict: r#"{"coverage_extent": 1.0}"#.to_string(),
                embedding: vec![1.0],
            },
        )
        .await;

        let mut blueprint = scenario_blueprint();
        blueprint.prompts.push(blueprint.prompts[0].clone());
        let err = pipeline.execute(&blueprint).await.unwrap_err();
        assert_eq!(err.kind(), "config");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn clone_run_generates_only_the_delta() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalObjectStore::new(dir.path()));

        // Source run over p1 + p2.
        let source_pipeline = pipeline(Arc::clone(&storage));
        let source_calls = with_adapter(
            &source_pipeline,
            ScenarioAdapter {
                generation_calls: Arc::new(AtomicUsize::new(0)),
                answer: "A".to_string(),
                verdict: r#"{"coverage_extent": 0.9}"#.to_string(),
                embedding: vec![1.0, 0.0],
            },
        )
        .await;
        let mut source_blueprint = scenario_blueprint();
        source_blueprint.prompts.push(Prompt {
            id: "p2".to_string(),
            messages: None,
            prompt_text: Some("Say B".to_string()),
            system: None,
            temperature: None,
            points: vec![PointDefinition::Text("says B".to_string())],
            should_not: vec![],
            ideal_response: None,
            citation: None,
            description: None,
        });
        let source_artifact = source_pipeline.execute(&source_blueprint).await.unwrap();
        assert_eq!(source_calls.load(Ordering::SeqCst), 2);

        // Target changes p1 and adds p3.
        let mut target = source_blueprint.clone();
        target.prompts[0].prompt_text = Some("Say A, slowly".to_string());
        target.prompts.push(Prompt {
            id: "p3".to_string(),
            messages: None,
            prompt_text: Some("Say C".to_string()),
            system: None,
            temperature: None,
            points: vec![PointDefinition::Text("says C".to_string())],
            should_not: vec![],
            ideal_response: None,
            citation: None,
            description: None,
        });

        let clone_pipeline = pipeline(Arc::clone(&storage));
        let clone_calls = with_adapter(
            &clone_pipeline,
            ScenarioAdapter {
                generation_calls: Arc::new(AtomicUsize::new(0)),
                answer: "A".to_string(),
                verdict: r#"{"coverage_extent": 0.9}"#.to_string(),
                embedding: vec![1.0, 0.0],
            },
        )
        .await;

        let source = CloneSource {
            config_id: source_artifact.config_id.clone(),
            run_label: source_artifact.run_label.clone(),
            safe_timestamp: source_artifact.safe_timestamp.clone(),
        };
        let clone_artifact = clone_pipeline.execute_clone(&source, &target).await.unwrap();

        // Only p1 (changed) and p3 (new) were generated.
        assert_eq!(clone_calls.load(Ordering::SeqCst), 2);
        assert_ne!(clone_artifact.run_label, source_artifact.run_label);
        assert_eq!(
            clone_artifact.prompt_ids,
            vec!["p1".to_string(), "p2".to_string(), "p3".to_string()]
        );
        assert_eq!(
            clone_artifact.all_final_assistant_responses["p2"]["openai:m[temp:0.0]"],
            source_artifact.all_final_assistant_responses["p2"]["openai:m[temp:0.0]"]
        );
    }

    #[tokio::test]
    async fn clone_with_identical_blueprint_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(LocalObjectStore::new(dir.path()));

        let source_pipeline = pipeline(Arc::clone(&storage));
        with_adapter(
            &source_pipeline,
            ScenarioAdapter {
                generation_calls: Arc::new(AtomicUsize::new(0)),
                answer: "A".to_string(),
                verdict: r#"{"coverage_extent": 1.0}"#.to_string(),
                embedding: vec![1.0, 0.0],
            },
        )
        .await;
        let blueprint = scenario_blueprint();
        let source_artifact = source_pipeline.execute(&blueprint).await.unwrap();

        let clone_pipeline = pipeline(Arc::clone(&storage));
        let clone_calls = with_adapter(
            &clone_pipeline,
            ScenarioAdapter {
                generation_calls: Arc::new(AtomicUsize::new(0)),
                answer: "ignored".to_string(),
                verdict: r#"{"coverage_extent": 0.0}"#.to_string(),
                embedding: vec![1.0, 0.0],
            },
        )
        .await;

        let source = CloneSource {
            config_id: source_artifact.config_id.clone(),
            run_label: source_artifact.run_label.clone(),
            safe_timestamp: source_artifact.safe_timestamp.clone(),
        };
        let clone_artifact = clone_pipeline
            .execute_clone(&source, &blueprint)
            .await
            .unwrap();

        // No new generation; same label; identical responses and coverage.
        assert_eq!(clone_calls.load(Ordering::SeqCst), 0);
        assert_eq!(clone_artifact.run_label, source_artifact.run_label);
        assert_eq!(
            clone_artifact.all_final_assistant_responses,
            source_artifact.all_final_assistant_responses
        );
        let source_cov = source_artifact
            .evaluation_results
            .llm_coverage_scores
            .unwrap();
        let clone_cov = clone_artifact
            .evaluation_results
            .llm_coverage_scores
            .unwrap();
        assert_eq!(
            clone_cov["p1"]["openai:m[temp:0.0]"].avg_coverage_extent,
            source_cov["p1"]["openai:m[temp:0.0]"].avg_coverage_extent
        );
    }
}
