//! Evaluation families run over the response map.
//!
//! The embedding evaluator builds pairwise similarity matrices; the
//! coverage evaluator grades every prompt's points against every model's
//! response. The two run in parallel over the same immutable response map.

mod coverage;
mod embedding;

pub use coverage::{
    normalize_points, CoverageEvaluator, CoverageMap, CoverageResult, IndividualJudgement,
    JudgeConfig, NormalizedPoint, PointAssessment, DEFAULT_JUDGE_MODELS,
};
pub use embedding::{
    EmbeddingEvaluator, SimilarityMatrix, SimilarityResult, DEFAULT_EMBEDDING_MODEL,
};
