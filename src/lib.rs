//! # rubric-core
//!
//! A blueprint-driven evaluation pipeline for comparing text generated by
//! multiple LLM endpoints. A blueprint enumerates prompts, models, cohort
//! axes (temperatures and system prompts), optional ideal responses, and
//! per-prompt grading points; the pipeline fans the cohort out across
//! providers, runs embedding-similarity and criterion-coverage evaluation
//! in parallel, and persists a single run artifact.
//!
//! ## Core Components
//!
//! - **Blueprint**: the declarative evaluation specification
//! - **Cohort**: cartesian fan-out of prompts × models × temperatures × systems
//! - **Dispatcher**: uniform routing over chat/completion protocol families
//! - **Limiter**: per-provider AIMD concurrency control
//! - **Points**: deterministic graders plus judge-LLM criteria
//! - **Pipeline**: orchestration, aggregation, and persistence
//!
//! ## Example
//!
//! ```rust,ignore
//! use rubric_core::{ComparisonPipeline, PipelineOptions, CacheService, LocalObjectStore};
//! use std::sync::Arc;
//!
//! let storage = Arc::new(LocalObjectStore::new("./results"));
//! let cache = Arc::new(CacheService::disabled());
//! let pipeline = ComparisonPipeline::new(storage, cache, PipelineOptions::default());
//!
//! let artifact = pipeline.execute(&blueprint).await?;
//! println!("run {} complete", artifact.run_label);
//! ```

pub mod artifact;
pub mod blueprint;
pub mod cache;
pub mod clone_run;
pub mod cohort;
pub mod error;
pub mod evaluators;
pub mod generation;
pub mod limiter;
pub mod llm;
pub mod pipeline;
pub mod points;
pub mod storage;

// Re-exports for convenience
pub use artifact::{
    build_artifact, safe_model_id, safe_timestamp_now, EvaluationResults, RunArtifact,
};
pub use blueprint::{
    AltPathGroup, Blueprint, EvaluationConfig, ExternalServiceConfig, JudgeMode, ModelRef,
    PointDefinition, Prompt, RichPoint, IDEAL_MODEL_ID,
};
pub use cache::{CacheKey, CacheNamespace, CacheService, CacheStore, MemoryCacheStore, SqliteCacheStore};
pub use clone_run::{ClonePlan, CloneSource, RunCloner};
pub use cohort::{
    effective_model_id, expand_cohort, CohortCell, CohortRunner, FixtureEntry, FixtureSet,
    ResponseMap, DEFAULT_CONCURRENCY,
};
pub use error::{Error, Result};
pub use evaluators::{
    normalize_points, CoverageEvaluator, CoverageMap, CoverageResult, EmbeddingEvaluator,
    IndividualJudgement, JudgeConfig, NormalizedPoint, PointAssessment, SimilarityResult,
    DEFAULT_EMBEDDING_MODEL, DEFAULT_JUDGE_MODELS,
};
pub use generation::{GenerationConfig, GenerationRequest, GenerationService, ModelResponseDetail};
pub use limiter::{AdaptiveRateLimiter, LimiterProfile, LimiterRegistry, LimiterSnapshot};
pub use llm::{
    parse_model_id, ApiCallOptions, ChatAdapter, ChatCompletion, ChatMessage, ChatRole,
    ChunkStream, ClientDispatcher, CustomModelDefinition, ProviderFamily, ProviderId,
    ReasoningEffort, StreamChunk, TokenUsage, ToolCall, WireFormat,
};
pub use pipeline::{ComparisonPipeline, PipelineOptions};
pub use points::{
    run_script, ExternalCallContext, ExternalServiceCaller, ExternalVerdict, PointFnContext,
    PointFnResult, PointFunctionRegistry,
};
pub use storage::{LocalObjectStore, ObjectStore};
