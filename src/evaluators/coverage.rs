//! Coverage evaluator: normalizes heterogeneous point definitions,
//! dispatches each point to the deterministic grader library, an external
//! grading service, or judge LLMs, and aggregates weighted scores with
//! alternative-path max collapse.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::blueprint::{Blueprint, JudgeMode, PointDefinition, Prompt};
use crate::cache::{CacheKey, CacheNamespace, CacheService};
use crate::cohort::ResponseMap;
use crate::error::{Error, Result};
use crate::generation::ModelResponseDetail;
use crate::llm::{ApiCallOptions, ChatMessage, ClientDispatcher};
use crate::points::{
    ExternalCallContext, ExternalServiceCaller, PointFnContext, PointFnResult,
    PointFunctionRegistry,
};

/// Judges used when the blueprint does not configure any.
pub const DEFAULT_JUDGE_MODELS: [&str; 2] = [
    "openai:gpt-4o-mini",
    "anthropic:claude-3-5-haiku-20241022",
];

/// Bound on concurrent point gradings, independent of the judge count.
const DEFAULT_POINT_CONCURRENCY: usize = 8;

/// Internal, normalized form of a point definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedPoint {
    pub id: String,
    pub display_text: String,
    pub multiplier: f64,
    pub is_function: bool,
    pub is_inverted: bool,
    /// `group:path` tag shared by the points of one alternative path
    pub path_id: Option<String>,
    pub text_to_evaluate: Option<String>,
    pub function_name: Option<String>,
    pub function_args: Option<Value>,
    pub citation: Option<String>,
}

/// One judge's verdict inside a consensus assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndividualJudgement {
    pub judge_model_id: String,
    pub coverage_extent: f64,
    #[serde(default)]
    pub reflection: Option<String>,
}

/// Graded outcome for one point against one response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointAssessment {
    pub key_point_text: String,
    /// Score in [0, 1]; absent when the point errored
    pub coverage_extent: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub reflection: Option<String>,
    pub multiplier: f64,
    #[serde(default)]
    pub citation: Option<String>,
    #[serde(default)]
    pub judge_model_id: Option<String>,
    #[serde(default)]
    pub individual_judgements: Option<Vec<IndividualJudgement>>,
    pub is_inverted: bool,
    #[serde(default)]
    pub path_id: Option<String>,
}

/// Coverage outcome for one (prompt, effective model) cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoverageResult {
    pub key_points_count: usize,
    /// Multiplier-weighted mean with alt-path max collapse; `None` when no
    /// point contributed
    pub avg_coverage_extent: Option<f64>,
    pub point_assessments: Vec<PointAssessment>,
    #[serde(default)]
    pub error: Option<String>,
}

/// prompt id → effective model id → coverage.
pub type CoverageMap = HashMap<String, HashMap<String, CoverageResult>>;

/// Judge models plus combination mode.
#[derive(Debug, Clone)]
pub struct JudgeConfig {
    pub models: Vec<String>,
    pub mode: JudgeMode,
}

impl JudgeConfig {
    pub fn from_blueprint(blueprint: &Blueprint) -> Self {
        match blueprint.evaluation_config {
            Some(ref config) if !config.judge_models.is_empty() => Self {
                models: config.judge_models.clone(),
                mode: config.judge_mode,
            },
            Some(ref config) => Self {
                models: DEFAULT_JUDGE_MODELS.iter().map(|m| m.to_string()).collect(),
                mode: config.judge_mode,
            },
            None => Self {
                models: DEFAULT_JUDGE_MODELS.iter().map(|m| m.to_string()).collect(),
                mode: JudgeMode::Failover,
            },
        }
    }
}

/// Produce the ordered normalized point list for a prompt.
pub fn normalize_points(prompt: &Prompt) -> Result<Vec<NormalizedPoint>> {
    let mut out = Vec::new();
    let mut group_ordinal = 0usize;
    for (definitions, inverted) in [(&prompt.points, false), (&prompt.should_not, true)] {
        for definition in definitions.iter() {
            normalize_definition(
                prompt,
                definition,
                inverted,
                None,
                &mut group_ordinal,
                &mut out,
            )?;
        }
    }
    Ok(out)
}

fn normalize_definition(
    prompt: &Prompt,
    definition: &PointDefinition,
    inverted: bool,
    path_id: Option<&str>,
    group_ordinal: &mut usize,
    out: &mut Vec<NormalizedPoint>,
) -> Result<()> {
    let ordinal = out.len();
    match definition {
        PointDefinition::Text(text) => {
            out.push(NormalizedPoint {
                id: format!("{}:{}", prompt.id, ordinal),
                display_text: text.clone(),
                multiplier: 1.0,
                is_function: false,
                is_inverted: inverted,
                path_id: path_id.map(str::to_string),
                text_to_evaluate: Some(text.clone()),
                function_name: None,
                function_args: None,
                citation: None,
            });
        }
        PointDefinition::Tuple(name, args) => {
            out.push(NormalizedPoint {
                id: format!("{}:{}", prompt.id, ordinal),
                display_text: function_display(name, args),
                multiplier: 1.0,
                is_function: true,
                is_inverted: inverted,
                path_id: path_id.map(str::to_string),
                text_to_evaluate: None,
                function_name: Some(name.clone()),
                function_args: Some(args.clone()),
                citation: None,
            });
        }
        PointDefinition::Rich(rich) => {
            let multiplier = rich.multiplier.unwrap_or(1.0);
            if multiplier <= 0.0 || !multiplier.is_finite() {
                return Err(Error::Config(format!(
                    "point multiplier must be positive, got {multiplier} in prompt '{}'",
                    prompt.id
                )));
            }
            let id = rich
                .id
                .clone()
                .unwrap_or_else(|| format!("{}:{}", prompt.id, ordinal));
            match (&rich.function, &rich.text) {
                (Some(name), _) => {
                    let args = rich.fn_args.clone().unwrap_or(Value::Null);
                    out.push(NormalizedPoint {
                        id,
                        display_text: function_display(name, &args),
                        multiplier,
                        is_function: true,
                        is_inverted: inverted,
                        path_id: path_id.map(str::to_string),
                        text_to_evaluate: None,
                        function_name: Some(name.clone()),
                        function_args: Some(args),
                        citation: rich.citation.clone(),
                    });
                }
                (None, Some(text)) => {
                    out.push(NormalizedPoint {
                        id,
                        display_text: text.clone(),
                        multiplier,
                        is_function: false,
                        is_inverted: inverted,
                        path_id: path_id.map(str::to_string),
                        text_to_evaluate: Some(text.clone()),
                        function_name: None,
                        function_args: None,
                        citation: rich.citation.clone(),
                    });
                }
                (None, None) => {
                    return Err(Error::Config(format!(
                        "point in prompt '{}' has neither 'text' nor 'fn'",
                        prompt.id
                    )));
                }
            }
        }
        PointDefinition::Paths(group) => {
            if path_id.is_some() {
                return Err(Error::Config(format!(
                    "nested alternativePaths in prompt '{}'",
                    prompt.id
                )));
            }
            let group_id = *group_ordinal;
            *group_ordinal += 1;
            for (path_index, path) in group.alternative_paths.iter().enumerate() {
                let tag = format!("{group_id}:{path_index}");
                for inner in path {
                    normalize_definition(
                        prompt,
                        inner,
                        inverted,
                        Some(&tag),
                        group_ordinal,
                        out,
                    )?;
                }
            }
        }
    }
    Ok(())
}

fn function_display(name: &str, args: &Value) -> String {
    match args {
        Value::Null => format!("{name}()"),
        other => format!("{name}({other})"),
    }
}

/// Weighted aggregation with alternative-path max collapse.
///
/// Non-path points contribute `multiplier × score` each; every alt-path
/// group contributes exactly its best path's weighted mean at that path's
/// weight. Errored points contribute nothing.
pub(crate) fn aggregate_assessments(assessments: &[PointAssessment]) -> Option<f64> {
    let mut weight_sum = 0.0f64;
    let mut weighted_sum = 0.0f64;

    // group id → path id → (weight, weighted score)
    let mut groups: HashMap<String, HashMap<String, (f64, f64)>> = HashMap::new();

    for assessment in assessments {
        let Some(extent) = assessment.coverage_extent else {
            continue;
        };
        match assessment.path_id {
            Some(ref path_id) => {
                let group = path_id.split(':').next().unwrap_or(path_id).to_string();
                let entry = groups
                    .entry(group)
                    .or_default()
                    .entry(path_id.clone())
                    .or_insert((0.0, 0.0));
                entry.0 += assessment.multiplier;
                entry.1 += assessment.multiplier * extent;
            }
            None => {
                weight_sum += assessment.multiplier;
                weighted_sum += assessment.multiplier * extent;
            }
        }
    }

    for (_, paths) in groups {
        let winner = paths
            .values()
            .filter(|(weight, _)| *weight > 0.0)
            .map(|(weight, weighted)| (*weight, weighted / weight))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if let Some((weight, score)) = winner {
            weight_sum += weight;
            weighted_sum += weight * score;
        }
    }

    if weight_sum > 0.0 {
        Some(weighted_sum / weight_sum)
    } else {
        None
    }
}

/// Cached judge verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JudgeVerdict {
    score: f64,
    reflection: Option<String>,
}

/// Grades every (prompt, model, point) and aggregates per cell.
pub struct CoverageEvaluator {
    dispatcher: Arc<ClientDispatcher>,
    cache: Arc<CacheService>,
    registry: PointFunctionRegistry,
    external: ExternalServiceCaller,
    judges: JudgeConfig,
    point_concurrency: usize,
}

impl CoverageEvaluator {
    pub fn new(
        dispatcher: Arc<ClientDispatcher>,
        cache: Arc<CacheService>,
        blueprint: &Blueprint,
    ) -> Self {
        Self {
            external: ExternalServiceCaller::new(
                blueprint.external_services.clone(),
                Arc::clone(&cache),
            ),
            judges: JudgeConfig::from_blueprint(blueprint),
            dispatcher,
            cache,
            registry: PointFunctionRegistry::builtin(),
            point_concurrency: DEFAULT_POINT_CONCURRENCY,
        }
    }

    pub fn with_judges(mut self, judges: JudgeConfig) -> Self {
        self.judges = judges;
        self
    }

    /// Grade all cells of the response map. Prefilled coverage (from a
    /// clone run) is reused; only missing cells and missing points within
    /// a prefilled cell are graded.
    pub async fn evaluate(
        &self,
        blueprint: &Blueprint,
        response_map: &ResponseMap,
        prefilled: &CoverageMap,
    ) -> CoverageMap {
        let semaphore = Arc::new(Semaphore::new(self.point_concurrency));

        let mut cell_futures = Vec::new();
        for prompt in &blueprint.prompts {
            let Some(models) = response_map.get(&prompt.id) else {
                continue;
            };
            for (effective_model_id, detail) in models {
                let prefill = prefilled
                    .get(&prompt.id)
                    .and_then(|m| m.get(effective_model_id))
                    .cloned();
                cell_futures.push(self.evaluate_cell(
                    prompt,
                    effective_model_id.clone(),
                    detail,
                    prefill,
                    Arc::clone(&semaphore),
                ));
            }
        }

        let results = join_all(cell_futures).await;
        let mut map: CoverageMap = HashMap::new();
        for (prompt_id, effective_model_id, result) in results {
            map.entry(prompt_id)
                .or_default()
                .insert(effective_model_id, result);
        }
        map
    }

    async fn evaluate_cell(
        &self,
        prompt: &Prompt,
        effective_model_id: String,
        detail: &ModelResponseDetail,
        prefill: Option<CoverageResult>,
        semaphore: Arc<Semaphore>,
    ) -> (String, String, CoverageResult) {
        let prompt_id = prompt.id.clone();

        if detail.has_error {
            let result = CoverageResult {
                key_points_count: 0,
                avg_coverage_extent: None,
                point_assessments: Vec::new(),
                error: Some(format!(
                    "response errored: {}",
                    detail.error_message.as_deref().unwrap_or("unknown")
                )),
            };
            return (prompt_id, effective_model_id, result);
        }

        let points = match normalize_points(prompt) {
            Ok(points) => points,
            Err(err) => {
                let result = CoverageResult {
                    key_points_count: 0,
                    avg_coverage_extent: None,
                    point_assessments: Vec::new(),
                    error: Some(err.to_string()),
                };
                return (prompt_id, effective_model_id, result);
            }
        };

        // Reuse prefilled assessments point-by-point; grade what is missing.
        let mut assessments: Vec<PointAssessment> = Vec::with_capacity(points.len());
        let mut to_grade: Vec<&NormalizedPoint> = Vec::new();
        let prefill_assessments = prefill
            .map(|p| p.point_assessments)
            .unwrap_or_default();
        for point in &points {
            let reused = prefill_assessments.iter().find(|a| {
                a.key_point_text == point.display_text
                    && a.is_inverted == point.is_inverted
                    && a.error.is_none()
            });
            match reused {
                Some(assessment) => assessments.push(assessment.clone()),
                None => to_grade.push(point),
            }
        }
        if !to_grade.is_empty() {
            debug!(
                prompt = %prompt_id,
                model = %effective_model_id,
                reused = assessments.len(),
                graded = to_grade.len(),
                "grading coverage cell"
            );
        }

        let graded = join_all(to_grade.into_iter().map(|point| {
            let semaphore = Arc::clone(&semaphore);
            let model_id = effective_model_id.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("point semaphore closed unexpectedly");
                self.grade_point(point, prompt, &model_id, detail).await
            }
        }))
        .await;
        assessments.extend(graded);

        let result = CoverageResult {
            key_points_count: points.len(),
            avg_coverage_extent: aggregate_assessments(&assessments),
            point_assessments: assessments,
            error: None,
        };
        (prompt_id, effective_model_id, result)
    }

    async fn grade_point(
        &self,
        point: &NormalizedPoint,
        prompt: &Prompt,
        effective_model_id: &str,
        detail: &ModelResponseDetail,
    ) -> PointAssessment {
        let response = &detail.final_assistant_response_text;
        let mut assessment = PointAssessment {
            key_point_text: point.display_text.clone(),
            coverage_extent: None,
            error: None,
            reflection: None,
            multiplier: point.multiplier,
            citation: point.citation.clone(),
            judge_model_id: None,
            individual_judgements: None,
            is_inverted: point.is_inverted,
            path_id: point.path_id.clone(),
        };

        if point.is_function {
            let name = point.function_name.as_deref().unwrap_or_default();
            let args = point.function_args.clone().unwrap_or(Value::Null);
            let (score, reflection, error) = self
                .grade_function(name, &args, prompt, effective_model_id, detail)
                .await;
            assessment.coverage_extent = score;
            assessment.reflection = reflection;
            assessment.error = error;
        } else {
            let criterion = point.text_to_evaluate.as_deref().unwrap_or_default();
            match self.judge(criterion, prompt, response).await {
                Ok(outcome) => {
                    assessment.coverage_extent = Some(outcome.score);
                    assessment.reflection = outcome.reflection;
                    assessment.judge_model_id = outcome.judge_model_id;
                    assessment.individual_judgements = outcome.individual_judgements;
                }
                Err(err) => assessment.error = Some(err.to_string()),
            }
        }

        if point.is_inverted {
            if let Some(extent) = assessment.coverage_extent {
                assessment.coverage_extent = Some(1.0 - extent.clamp(0.0, 1.0));
            }
        }
        assessment
    }

    /// Grade a function point: the external caller for `call`, the built-in
    /// registry for everything else.
    async fn grade_function(
        &self,
        name: &str,
        args: &Value,
        prompt: &Prompt,
        effective_model_id: &str,
        detail: &ModelResponseDetail,
    ) -> (Option<f64>, Option<String>, Option<String>) {
        let response = &detail.final_assistant_response_text;
        if name == "call" || name == "not_call" {
            let prompt_text = prompt.prompt_text.clone().unwrap_or_else(|| {
                prompt
                    .resolved_messages()
                    .last()
                    .map(|m| m.content.clone())
                    .unwrap_or_default()
            });
            let messages = prompt.resolved_messages();
            let ctx = ExternalCallContext {
                response,
                model_id: effective_model_id,
                prompt_id: &prompt.id,
                prompt_text: &prompt_text,
                messages: &messages,
            };
            return match self.external.call(args, &ctx).await {
                Ok(verdict) => {
                    let score = verdict.score.clamp(0.0, 1.0);
                    let score = if name == "not_call" { 1.0 - score } else { score };
                    (Some(score), verdict.explain, None)
                }
                Err(err) => (None, None, Some(err.to_string())),
            };
        }

        let ctx = PointFnContext {
            prompt_id: &prompt.id,
            model_id: effective_model_id,
            tool_calls: &detail.tool_calls,
        };
        match self.registry.grade(name, response, args, &ctx) {
            PointFnResult::Error(message) => (
                None,
                None,
                Some(Error::point_function(name, message).to_string()),
            ),
            result => (
                result.score(),
                result.explain().map(str::to_string),
                None,
            ),
        }
    }

    async fn judge(
        &self,
        criterion: &str,
        prompt: &Prompt,
        response: &str,
    ) -> Result<JudgeOutcome> {
        match self.judges.mode {
            JudgeMode::Failover => self.judge_failover(criterion, prompt, response).await,
            JudgeMode::Consensus => self.judge_consensus(criterion, prompt, response).await,
        }
    }

    async fn judge_failover(
        &self,
        criterion: &str,
        prompt: &Prompt,
        response: &str,
    ) -> Result<JudgeOutcome> {
        let mut failures = Vec::new();
        for judge_model in &self.judges.models {
            match self.judge_one(judge_model, criterion, prompt, response).await {
                Ok(verdict) => {
                    return Ok(JudgeOutcome {
                        score: verdict.score,
                        reflection: verdict.reflection,
                        judge_model_id: Some(judge_model.clone()),
                        individual_judgements: None,
                    });
                }
                Err(err) => {
                    warn!(judge = %judge_model, error = %err, "judge failed, trying next");
                    failures.push(format!("{judge_model}: {err}"));
                }
            }
        }
        Err(Error::Judge(format!(
            "all judges failed: {}",
            failures.join("; ")
        )))
    }

    async fn judge_consensus(
        &self,
        criterion: &str,
        prompt: &Prompt,
        response: &str,
    ) -> Result<JudgeOutcome> {
        let verdicts = join_all(self.judges.models.iter().map(|judge_model| async move {
            (
                judge_model.clone(),
                self.judge_one(judge_model, criterion, prompt, response).await,
            )
        }))
        .await;

        let mut judgements = Vec::new();
        let mut failures = Vec::new();
        for (judge_model, verdict) in verdicts {
            match verdict {
                Ok(verdict) => judgements.push(IndividualJudgement {
                    judge_model_id: judge_model,
                    coverage_extent: verdict.score,
                    reflection: verdict.reflection,
                }),
                Err(err) => failures.push(format!("{judge_model}: {err}")),
            }
        }

        if judgements.is_empty() {
            return Err(Error::Judge(format!(
                "all judges failed: {}",
                failures.join("; ")
            )));
        }
        let mean = judgements
            .iter()
            .map(|j| j.coverage_extent)
            .sum::<f64>()
            / judgements.len() as f64;
        Ok(JudgeOutcome {
            score: mean,
            reflection: None,
            judge_model_id: None,
            individual_judgements: Some(judgements),
        })
    }

    async fn judge_one(
        &self,
        judge_model: &str,
        criterion: &str,
        prompt: &Prompt,
        response: &str,
    ) -> Result<JudgeVerdict> {
        let cache_key = CacheKey::from_value(&json!({
            "judge": judge_model,
            "criterion": criterion,
            "response": response,
        }));
        if let Some(verdict) = self
            .cache
            .get::<JudgeVerdict>(CacheNamespace::JudgeVerdicts, &cache_key)
        {
            return Ok(verdict);
        }

        let options = ApiCallOptions {
            model_id: judge_model.to_string(),
            messages: vec![ChatMessage::user(judge_user_prompt(
                criterion, prompt, response,
            ))],
            system_prompt: Some(JUDGE_SYSTEM_PROMPT.to_string()),
            temperature: Some(0.0),
            max_tokens: Some(512),
            ..Default::default()
        };
        let completion = self
            .dispatcher
            .call(&options)
            .await
            .map_err(|err| Error::Judge(err.to_string()))?;

        let (score, reflection) = parse_judge_verdict(&completion.text)
            .ok_or_else(|| Error::Judge(format!("unparseable verdict: {}", completion.text)))?;
        let verdict = JudgeVerdict { score, reflection };
        self.cache
            .put(CacheNamespace::JudgeVerdicts, &cache_key, &verdict);
        Ok(verdict)
    }
}

struct JudgeOutcome {
    score: f64,
    reflection: Option<String>,
    judge_model_id: Option<String>,
    individual_judgements: Option<Vec<IndividualJudgement>>,
}

/// Stable judge prompt contract: a JSON object with `coverage_extent` in
/// [0, 1] and a free-text `reflection`.
const JUDGE_SYSTEM_PROMPT: &str = "You are an expert evaluator grading whether a response \
covers a specific criterion. Reply with only a JSON object of the form \
{\"coverage_extent\": <number between 0 and 1>, \"reflection\": \"<one or two sentences>\"}. \
Use 1 for full coverage, 0 for none, and intermediate values for partial coverage.";

fn judge_user_prompt(criterion: &str, prompt: &Prompt, response: &str) -> String {
    let question = prompt
        .resolved_messages()
        .iter()
        .filter(|m| m.role == crate::llm::ChatRole::User)
        .map(|m| m.content.clone())
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        "<prompt>\n{question}\n</prompt>\n\n<response>\n{response}\n</response>\n\n\
         <criterion>\n{criterion}\n</criterion>"
    )
}

/// Extract a verdict from judge output: a bare JSON object, a JSON object
/// embedded in prose, or as a last resort the first number in [0, 1].
fn parse_judge_verdict(text: &str) -> Option<(f64, Option<String>)> {
    let trimmed = text.trim();

    let candidates = [
        trimmed.to_string(),
        extract_json_object(trimmed).unwrap_or_default(),
    ];
    for candidate in candidates.iter().filter(|c| !c.is_empty()) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            let score = value
                .get("coverage_extent")
                .or_else(|| value.get("score"))
                .and_then(|v| v.as_f64());
            if let Some(score) = score {
                let reflection = value
                    .get("reflection")
                    .or_else(|| value.get("explain"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                return Some((score.clamp(0.0, 1.0), reflection));
            }
        }
    }

    // Last resort: a bare number somewhere in the text.
    static NUMBER: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = NUMBER.get_or_init(|| regex::Regex::new(r"\d*\.?\d+").unwrap());
    for capture in re.find_iter(trimmed) {
        if let Ok(number) = capture.as_str().parse::<f64>() {
            if (0.0..=1.0).contains(&number) {
                return Some((number, None));
            }
        }
    }
    None
}

fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| text[start..=end].to_string())
}
