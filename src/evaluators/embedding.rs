//! Embedding evaluator: per-prompt cosine-similarity matrices across model
//! responses (and the ideal response when present).
//!
//! Long responses are split by character ranges and mean-pooled. A run
//! where every non-self similarity is undefined aborts the pipeline: that
//! is an embedding-backend failure, not data.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheNamespace, CacheService};
use crate::cohort::ResponseMap;
use crate::error::{Error, Result};
use crate::llm::ClientDispatcher;

/// Embedding model used when the blueprint does not name one.
pub const DEFAULT_EMBEDDING_MODEL: &str = "openai:text-embedding-3-small";

/// Safe character budget per embedding request.
const CHUNK_CHAR_BUDGET: usize = 6000;

/// Pairwise similarities; `None` marks an undefined score.
pub type SimilarityMatrix = HashMap<String, HashMap<String, Option<f64>>>;

/// Output of the embedding evaluator.
#[derive(Debug, Clone, Default)]
pub struct SimilarityResult {
    /// Mean similarity per model pair across all prompts
    pub similarity_matrix: SimilarityMatrix,
    /// Per-prompt matrices
    pub per_prompt_similarities: HashMap<String, SimilarityMatrix>,
}

/// Computes similarity matrices over the response map.
pub struct EmbeddingEvaluator {
    dispatcher: Arc<ClientDispatcher>,
    cache: Arc<CacheService>,
    model: String,
}

impl EmbeddingEvaluator {
    pub fn new(
        dispatcher: Arc<ClientDispatcher>,
        cache: Arc<CacheService>,
        model: Option<String>,
    ) -> Self {
        Self {
            dispatcher,
            cache,
            model: model.unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
        }
    }

    /// Build per-prompt and averaged similarity matrices. Errors only when
    /// every non-self score in the whole run is undefined.
    pub async fn evaluate(&self, response_map: &ResponseMap) -> Result<SimilarityResult> {
        let mut per_prompt = HashMap::new();
        let mut defined = 0usize;
        let mut undefined = 0usize;

        for (prompt_id, models) in response_map {
            // Error cells embed as empty text and surface as undefined pairs.
            let mut ids: Vec<&String> = models.keys().collect();
            ids.sort_unstable();

            let mut vectors: HashMap<&String, Option<Vec<f32>>> = HashMap::new();
            for id in &ids {
                let detail = &models[*id];
                let vector = if detail.has_error {
                    None
                } else {
                    self.embed_pooled(&detail.final_assistant_response_text)
                        .await?
                };
                vectors.insert(*id, vector);
            }

            let mut matrix: SimilarityMatrix = HashMap::new();
            for a in &ids {
                for b in &ids {
                    if a == b {
                        continue;
                    }
                    let score = match (&vectors[*a], &vectors[*b]) {
                        (Some(va), Some(vb)) => cosine_similarity(va, vb),
                        _ => None,
                    };
                    match score {
                        Some(_) => defined += 1,
                        None => undefined += 1,
                    }
                    matrix
                        .entry((*a).clone())
                        .or_default()
                        .insert((*b).clone(), score);
                }
            }
            per_prompt.insert(prompt_id.clone(), matrix);
        }

        if defined == 0 && undefined > 0 {
            return Err(Error::EmbeddingFail(
                "all non-self similarity scores are undefined".to_string(),
            ));
        }
        if undefined > 0 {
            warn!(undefined, defined, "some similarity scores are undefined");
        }

        Ok(SimilarityResult {
            similarity_matrix: average_matrices(per_prompt.values()),
            per_prompt_similarities: per_prompt,
        })
    }

    /// Embed one text, chunking and mean-pooling past the character budget.
    async fn embed_pooled(&self, text: &str) -> Result<Option<Vec<f32>>> {
        if text.is_empty() {
            return Ok(None);
        }

        let cache_key = CacheKey::from_value(&json!({ "model": self.model, "text": text }));
        if let Some(vector) = self
            .cache
            .get::<Vec<f32>>(CacheNamespace::Embeddings, &cache_key)
        {
            return Ok(normalize_empty(vector));
        }

        let chunks = split_chunks(text, CHUNK_CHAR_BUDGET);
        debug!(chunks = chunks.len(), model = %self.model, "embedding response");
        let vectors = self.dispatcher.embed(&self.model, &chunks).await?;
        let pooled = mean_pool(&vectors);

        if let Some(ref vector) = pooled {
            self.cache
                .put(CacheNamespace::Embeddings, &cache_key, vector);
        }
        Ok(pooled)
    }
}

fn normalize_empty(vector: Vec<f32>) -> Option<Vec<f32>> {
    if vector.is_empty() {
        None
    } else {
        Some(vector)
    }
}

/// Split by character ranges, never inside a code point.
fn split_chunks(text: &str, budget: usize) -> Vec<String> {
    if text.len() <= budget {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut current = String::with_capacity(budget);
    for c in text.chars() {
        if current.len() + c.len_utf8() > budget && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(c);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Element-wise mean of the chunk vectors. Mismatched or empty vectors
/// yield `None`.
fn mean_pool(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    if first.is_empty() || vectors.iter().any(|v| v.len() != first.len()) {
        return None;
    }
    let mut pooled = vec![0.0f32; first.len()];
    for vector in vectors {
        for (acc, value) in pooled.iter_mut().zip(vector) {
            *acc += value;
        }
    }
    let n = vectors.len() as f32;
    for value in &mut pooled {
        *value /= n;
    }
    Some(pooled)
}

/// Cosine similarity; `None` when either vector is degenerate.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    if score.is_nan() {
        None
    } else {
        Some(score)
    }
}

/// Mean of the per-prompt matrices over the pairs that are defined.
fn average_matrices<'a>(
    matrices: impl Iterator<Item = &'a SimilarityMatrix>,
) -> SimilarityMatrix {
    let mut sums: HashMap<(String, String), (f64, usize)> = HashMap::new();
    let mut seen_pairs: Vec<(String, String)> = Vec::new();

    for matrix in matrices {
        for (a, row) in matrix {
            for (b, score) in row {
                let pair = (a.clone(), b.clone());
                if !sums.contains_key(&pair) {
                    seen_pairs.push(pair.clone());
                    sums.insert(pair.clone(), (0.0, 0));
                }
                if let Some(score) = score {
                    let entry = sums.get_mut(&pair).expect("pair was just inserted");
                    entry.0 += score;
                    entry.1 += 1;
                }
            }
        }
    }

    let mut averaged: SimilarityMatrix = HashMap::new();
    for (a, b) in seen_pairs {
        let (sum, count) = sums[&(a.clone(), b.clone())];
        let mean = if count > 0 {
            Some(sum / count as f64)
        } else {
            None
        };
        averaged.entry(a).or_default().insert(b, mean);
    }
    averaged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as CoreResult;
    use crate::generation::ModelResponseDetail;
    use crate::llm::{ApiCallOptions, ChatAdapter, ChatCompletion, ChatMessage, ChunkStream};
    use async_trait::async_trait;

    #[test]
    fn cosine_basics() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]), Some(1.0));
        let orthogonal = cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
        assert!(orthogonal.abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), None);
        assert_eq!(cosine_similarity(&[], &[]), None);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), None);
    }

    #[test]
    fn chunking_respects_the_budget() {
        let text = "a".repeat(15_000);
        let chunks = split_chunks(&text, 6000);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 6000));
        assert_eq!(chunks.iter().map(String::len).sum::<usize>(), 15_000);

        // Short text stays whole.
        assert_eq!(split_chunks("short", 6000), vec!["short".to_string()]);
        // Multi-byte characters never split.
        let unicode = "é".repeat(4000);
        let chunks = split_chunks(&unicode, 6000);
        assert!(chunks.iter().all(|c| c.chars().all(|ch| ch == 'é')));
    }

    #[test]
    fn mean_pooling() {
        let pooled = mean_pool(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(pooled, vec![2.0, 3.0]);
        assert_eq!(mean_pool(&[]), None);
        assert_eq!(mean_pool(&[vec![]]), None);
        assert_eq!(mean_pool(&[vec![1.0], vec![1.0, 2.0]]), None);
    }

    #[derive(Debug)]
    struct VectorAdapter {
        /// Maps response text to a fixed vector; unknown text gets zeros.
        table: HashMap<String, Vec<f32>>,
    }

    #[async_trait]
    impl ChatAdapter for VectorAdapter {
        async fn complete(&self, _options: &ApiCallOptions) -> CoreResult<ChatCompletion> {
            unreachable!("embedding-only adapter")
        }

        async fn stream(&self, _options: &ApiCallOptions) -> CoreResult<ChunkStream> {
            unreachable!("embedding-only adapter")
        }

        async fn embed(&self, _model: &str, texts: &[String]) -> CoreResult<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| self.table.get(t).cloned().unwrap_or_default())
                .collect())
        }

        fn provider_key(&self) -> &str {
            "openai"
        }
    }

    fn detail(text: &str) -> ModelResponseDetail {
        ModelResponseDetail::success(
            text.to_string(),
            vec![ChatMessage::user("q")],
            None,
            Vec::new(),
        )
    }

    async fn evaluator(table: HashMap<String, Vec<f32>>) -> EmbeddingEvaluator {
        let dispatcher = Arc::new(crate::llm::ClientDispatcher::new());
        dispatcher
            .insert_adapter("openai", Arc::new(VectorAdapter { table }))
            .await;
        EmbeddingEvaluator::new(dispatcher, Arc::new(CacheService::disabled()), None)
    }

    #[tokio::test]
    async fn builds_symmetric_per_prompt_matrices() {
        let table = HashMap::from([
            ("same direction".to_string(), vec![1.0, 0.0]),
            ("also same".to_string(), vec![2.0, 0.0]),
            ("orthogonal".to_string(), vec![0.0, 1.0]),
        ]);
        let evaluator = evaluator(table).await;

        let mut response_map = ResponseMap::new();
        let models = response_map.entry("p1".to_string()).or_default();
        models.insert("m1".to_string(), detail("same direction"));
        models.insert("m2".to_string(), detail("also same"));
        models.insert("m3".to_string(), detail("orthogonal"));

        let result = evaluator.evaluate(&response_map).await.unwrap();
        let matrix = &result.per_prompt_similarities["p1"];
        let m1_m2 = matrix["m1"]["m2"].unwrap();
        assert!((m1_m2 - 1.0).abs() < 1e-6);
        assert!((matrix["m2"]["m1"].unwrap() - m1_m2).abs() < 1e-9);
        assert!(matrix["m1"]["m3"].unwrap().abs() < 1e-6);

        // The averaged matrix over one prompt equals the per-prompt one.
        assert_eq!(
            result.similarity_matrix["m1"]["m2"],
            matrix["m1"]["m2"]
        );
    }

    #[tokio::test]
    async fn total_embedding_failure_aborts() {
        // Every text maps to an empty vector.
        let evaluator = evaluator(HashMap::new()).await;

        let mut response_map = ResponseMap::new();
        let models = response_map.entry("p1".to_string()).or_default();
        models.insert("m1".to_string(), detail("a"));
        models.insert("m2".to_string(), detail("b"));

        let err = evaluator.evaluate(&response_map).await.unwrap_err();
        assert_eq!(err.kind(), "embedding-fail");
    }

    #[tokio::test]
    async fn partial_failure_is_tolerated() {
        let table = HashMap::from([
            ("good a".to_string(), vec![1.0, 0.0]),
            ("good b".to_string(), vec![1.0, 1.0]),
        ]);
        let evaluator = evaluator(table).await;

        let mut response_map = ResponseMap::new();
        let models = response_map.entry("p1".to_string()).or_default();
        models.insert("m1".to_string(), detail("good a"));
        models.insert("m2".to_string(), detail("good b"));
        models.insert("m3".to_string(), detail("unknown text"));

        let result = evaluator.evaluate(&response_map).await.unwrap();
        let matrix = &result.per_prompt_similarities["p1"];
        assert!(matrix["m1"]["m2"].is_some());
        assert!(matrix["m1"]["m3"].is_none());
    }

    #[tokio::test]
    async fn error_cells_yield_undefined_rows() {
        let table = HashMap::from([
            ("good a".to_string(), vec![1.0, 0.0]),
            ("good b".to_string(), vec![0.5, 0.5]),
        ]);
        let evaluator = evaluator(table).await;

        let mut response_map = ResponseMap::new();
        let models = response_map.entry("p1".to_string()).or_default();
        models.insert("m1".to_string(), detail("good a"));
        models.insert("m2".to_string(), detail("good b"));
        let err = Error::timeout(1000);
        models.insert(
            "m3".to_string(),
            ModelResponseDetail::from_error(&err, vec![ChatMessage::user("q")], None),
        );

        let result = evaluator.evaluate(&response_map).await.unwrap();
        let matrix = &result.per_prompt_similarities["p1"];
        assert!(matrix["m3"]["m1"].is_none());
        assert!(matrix["m1"]["m2"].is_some());
    }
}
