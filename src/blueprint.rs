//! Blueprint data model: prompts, model references, cohort axes, and
//! grading point definitions.
//!
//! Blueprints are constructed externally (YAML/JSON authoring is out of
//! scope) and arrive here as pre-parsed objects. They are read-only through
//! the pipeline. The polymorphic point forms the authoring surface allows
//! (bare strings, `[fn, args]` tuples, rich objects, alternative-path
//! groups) are expressed as one untagged enum with a single normalization
//! step in the coverage evaluator.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cache::CacheKey;
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, ChatRole, CustomModelDefinition};

/// Synthetic model id carrying the ideal responses through the artifact.
pub const IDEAL_MODEL_ID: &str = "IDEAL_BENCHMARK";

/// A declarative evaluation specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub prompts: Vec<Prompt>,
    pub models: Vec<ModelRef>,
    /// Temperature axis; wins over the scalar `temperature` when present
    #[serde(default)]
    pub temperatures: Option<Vec<f64>>,
    /// System-prompt axis; `null` entries mean "no system prompt"
    #[serde(default)]
    pub systems: Option<Vec<Option<String>>>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub system: Option<String>,
    /// Generation pool size (default 10)
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub evaluation_config: Option<EvaluationConfig>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Named HTTP grading backends usable from `call` points
    #[serde(default)]
    pub external_services: HashMap<String, ExternalServiceConfig>,
}

/// One prompt of a blueprint, optionally multi-turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prompt {
    pub id: String,
    /// Ordered turns; mutually exclusive with `prompt_text`
    #[serde(default)]
    pub messages: Option<Vec<ChatMessage>>,
    /// Bare prompt, normalized to a single user turn
    #[serde(default, alias = "prompt_text")]
    pub prompt_text: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub points: Vec<PointDefinition>,
    #[serde(default, rename = "should_not")]
    pub should_not: Vec<PointDefinition>,
    #[serde(default, alias = "ideal_response")]
    pub ideal_response: Option<String>,
    #[serde(default)]
    pub citation: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl Prompt {
    /// The conversation sent to models: explicit turns, or the bare prompt
    /// text as a single user turn.
    pub fn resolved_messages(&self) -> Vec<ChatMessage> {
        if let Some(ref messages) = self.messages {
            return messages.clone();
        }
        match self.prompt_text {
            Some(ref text) => vec![ChatMessage::user(text)],
            None => Vec::new(),
        }
    }

    /// Whether the resolved conversation already starts with a system turn.
    pub fn has_system_turn(&self) -> bool {
        self.messages
            .as_ref()
            .is_some_and(|m| m.iter().any(|t| t.role == ChatRole::System))
    }
}

/// A model under evaluation: either a `provider:model` id string or a
/// custom endpoint definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ModelRef {
    Id(String),
    Custom(CustomModelDefinition),
}

impl ModelRef {
    /// The id used for routing, effective-model naming, and artifacts.
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Custom(def) => &def.id,
        }
    }
}

/// Judge configuration for the coverage evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationConfig {
    #[serde(default)]
    pub judge_models: Vec<String>,
    #[serde(default)]
    pub judge_mode: JudgeMode,
}

/// How multiple judge models are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeMode {
    /// Try judges in order; the first non-erroring verdict wins
    Failover,
    /// Query all judges; the score is the mean of non-erroring verdicts
    Consensus,
}

impl Default for JudgeMode {
    fn default() -> Self {
        Self::Failover
    }
}

/// An HTTP grading backend referenced from `call` points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalServiceConfig {
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub cacheable: bool,
    /// Default parameters merged under the point's own arguments
    #[serde(default)]
    pub params: HashMap<String, Value>,
}

/// A grading criterion in any of the authoring surface's forms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointDefinition {
    /// Literal assertion judged by an LLM
    Text(String),
    /// `[fn, args]` shorthand
    Tuple(String, Value),
    /// `{alternativePaths: [[…], […]]}` scored as the max path
    Paths(AltPathGroup),
    /// Rich object with either `text` or `fn`
    Rich(RichPoint),
}

/// Alternative-path group; each inner list is one path of points.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AltPathGroup {
    #[serde(rename = "alternativePaths", alias = "alternative_paths")]
    pub alternative_paths: Vec<Vec<PointDefinition>>,
}

/// Rich point object form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RichPoint {
    #[serde(default)]
    pub id: Option<String>,
    /// LLM criterion text
    #[serde(default)]
    pub text: Option<String>,
    /// Deterministic point-function name
    #[serde(default, rename = "fn")]
    pub function: Option<String>,
    #[serde(default, alias = "arg", alias = "args")]
    pub fn_args: Option<Value>,
    #[serde(default)]
    pub multiplier: Option<f64>,
    #[serde(default)]
    pub citation: Option<String>,
}

impl Blueprint {
    /// Temperature axis to run: the explicit axis wins over the scalar; an
    /// absent axis and scalar yield a single undefined entry resolved at
    /// the adapter level.
    pub fn temperatures_to_run(&self) -> Vec<Option<f64>> {
        match self.temperatures {
            Some(ref axis) if !axis.is_empty() => axis.iter().copied().map(Some).collect(),
            _ => vec![self.temperature],
        }
    }

    /// System-prompt axis to run; `None` entries are legitimate and mean
    /// "no system prompt".
    pub fn systems_to_run(&self) -> Vec<Option<String>> {
        match self.systems {
            Some(ref axis) if !axis.is_empty() => axis.clone(),
            _ => vec![self.system.clone()],
        }
    }

    /// Total cohort size: prompts × models × temperatures × systems.
    pub fn cohort_size(&self) -> usize {
        self.prompts.len()
            * self.models.len()
            * self.temperatures_to_run().len()
            * self.systems_to_run().len()
    }

    /// Validate the blueprint invariants the pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Config("blueprint id is required".to_string()));
        }
        if self.models.is_empty() {
            return Err(Error::Config("blueprint has no models".to_string()));
        }
        if self.prompts.is_empty() {
            return Err(Error::Config("blueprint has no prompts".to_string()));
        }

        let mut seen_prompts = HashSet::new();
        for prompt in &self.prompts {
            if prompt.id.trim().is_empty() {
                return Err(Error::Config("prompt id is required".to_string()));
            }
            if !seen_prompts.insert(prompt.id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate prompt id '{}'",
                    prompt.id
                )));
            }
            if prompt.resolved_messages().is_empty() {
                return Err(Error::Config(format!(
                    "prompt '{}' has neither messages nor prompt text",
                    prompt.id
                )));
            }
        }

        let mut seen_models = HashSet::new();
        for model in &self.models {
            if !seen_models.insert(model.id()) {
                return Err(Error::Config(format!(
                    "duplicate model '{}'",
                    model.id()
                )));
            }
        }

        if let Some(concurrency) = self.concurrency {
            if concurrency == 0 {
                return Err(Error::Config("concurrency must be > 0".to_string()));
            }
        }
        Ok(())
    }

    /// Deterministic content hash over the fields that define a run: model
    /// ids, prompts with their points, and the cohort axes. Field order and
    /// order-irrelevant collections do not affect the label.
    pub fn run_label(&self) -> String {
        let mut model_ids: Vec<&str> = self.models.iter().map(|m| m.id()).collect();
        model_ids.sort_unstable();

        let mut prompts: Vec<&Prompt> = self.prompts.iter().collect();
        prompts.sort_by(|a, b| a.id.cmp(&b.id));
        let prompt_values: Vec<Value> = prompts
            .iter()
            .map(|p| {
                json!({
                    "id": p.id,
                    "messages": p.resolved_messages(),
                    "system": p.system,
                    "temperature": p.temperature,
                    "points": p.points,
                    "should_not": p.should_not,
                    "idealResponse": p.ideal_response,
                })
            })
            .collect();

        let temperatures: Vec<Value> = self
            .temperatures_to_run()
            .into_iter()
            .map(|t| t.map(|t| json!(format!("{t:.3}"))).unwrap_or(Value::Null))
            .collect();

        let payload = json!({
            "models": model_ids,
            "prompts": prompt_values,
            "temperatures": temperatures,
            "systems": self.systems_to_run(),
        });
        let key = CacheKey::from_value(&payload);
        key.0[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    pub(crate) fn minimal_blueprint() -> Blueprint {
        Blueprint {
            id: "bp-1".to_string(),
            title: Some("Test".to_string()),
            description: None,
            prompts: vec![Prompt {
                id: "p1".to_string(),
                messages: None,
                prompt_text: Some("What is the capital of France?".to_string()),
                system: None,
                temperature: None,
                points: vec![PointDefinition::Text("mentions Paris".to_string())],
                should_not: vec![],
                ideal_response: None,
                citation: None,
                description: None,
            }],
            models: vec![ModelRef::Id("openai:gpt-4o-mini".to_string())],
            temperatures: None,
            systems: None,
            temperature: None,
            system: None,
            concurrency: None,
            embedding_model: None,
            evaluation_config: None,
            tags: vec![],
            external_services: HashMap::new(),
        }
    }

    #[test]
    fn prompt_text_normalizes_to_single_user_turn() {
        let blueprint = minimal_blueprint();
        let messages = blueprint.prompts[0].resolved_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[0].content, "What is the capital of France?");
    }

    #[test]
    fn axes_fall_back_to_scalars() {
        let mut blueprint = minimal_blueprint();
        assert_eq!(blueprint.temperatures_to_run(), vec![None]);
        assert_eq!(blueprint.systems_to_run(), vec![None]);

        blueprint.temperature = Some(0.7);
        blueprint.system = Some("be terse".to_string());
        assert_eq!(blueprint.temperatures_to_run(), vec![Some(0.7)]);
        assert_eq!(
            blueprint.systems_to_run(),
            vec![Some("be terse".to_string())]
        );
    }

    #[test]
    fn temperature_axis_wins_over_scalar() {
        let mut blueprint = minimal_blueprint();
        blueprint.temperature = Some(0.7);
        blueprint.temperatures = Some(vec![0.1]);
        assert_eq!(blueprint.temperatures_to_run(), vec![Some(0.1)]);
    }

    #[test]
    fn cohort_size_is_the_cartesian_product() {
        let mut blueprint = minimal_blueprint();
        blueprint.temperatures = Some(vec![0.1, 0.9]);
        blueprint.systems = Some(vec![Some("s1".to_string()), Some("s2".to_string()), None]);
        assert_eq!(blueprint.cohort_size(), 1 * 1 * 2 * 3);
    }

    #[test]
    fn validation_rejects_duplicates_and_empty() {
        let mut blueprint = minimal_blueprint();
        assert!(blueprint.validate().is_ok());

        blueprint.prompts.push(blueprint.prompts[0].clone());
        let err = blueprint.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate prompt id"));

        let mut no_models = minimal_blueprint();
        no_models.models.clear();
        assert!(no_models.validate().is_err());

        let mut empty_prompt = minimal_blueprint();
        empty_prompt.prompts[0].prompt_text = None;
        assert!(empty_prompt.validate().is_err());
    }

    #[test]
    fn point_definitions_deserialize_in_all_forms() {
        let points: Vec<PointDefinition> = serde_json::from_str(
            r#"[
                "mentions Paris",
                ["contains", "Paris"],
                {"text": "explains why", "multiplier": 2.0, "citation": "ref-1"},
                {"fn": "word_count_between", "fnArgs": [10, 100]},
                {"alternativePaths": [["path one"], [["icontains", "x"]]]}
            ]"#,
        )
        .unwrap();

        assert!(matches!(points[0], PointDefinition::Text(_)));
        match &points[1] {
            PointDefinition::Tuple(name, args) => {
                assert_eq!(name, "contains");
                assert_eq!(args, &json!("Paris"));
            }
            other => panic!("expected tuple form, got {other:?}"),
        }
        match &points[2] {
            PointDefinition::Rich(rich) => {
                assert_eq!(rich.text.as_deref(), Some("explains why"));
                assert_eq!(rich.multiplier, Some(2.0));
            }
            other => panic!("expected rich form, got {other:?}"),
        }
        match &points[3] {
            PointDefinition::Rich(rich) => {
                assert_eq!(rich.function.as_deref(), Some("word_count_between"));
                assert_eq!(rich.fn_args, Some(json!([10, 100])));
            }
            other => panic!("expected rich function form, got {other:?}"),
        }
        match &points[4] {
            PointDefinition::Paths(group) => {
                assert_eq!(group.alternative_paths.len(), 2);
            }
            other => panic!("expected alt-path group, got {other:?}"),
        }
    }

    #[test]
    fn run_label_is_deterministic_and_model_order_insensitive() {
        let mut a = minimal_blueprint();
        a.models = vec![
            ModelRef::Id("openai:gpt-4o-mini".to_string()),
            ModelRef::Id("anthropic:claude-3-5-haiku-20241022".to_string()),
        ];
        let mut b = a.clone();
        b.models.reverse();
        b.title = Some("Different title".to_string());

        assert_eq!(a.run_label(), b.run_label());
        assert_eq!(a.run_label().len(), 16);
    }

    #[test]
    fn run_label_changes_with_content() {
        let a = minimal_blueprint();
        let mut b = a.clone();
        b.prompts[0].points.push(PointDefinition::Text("extra".to_string()));
        assert_ne!(a.run_label(), b.run_label());

        let mut c = a.clone();
        c.temperatures = Some(vec![0.2]);
        assert_ne!(a.run_label(), c.run_label());
    }

    #[test]
    fn scalar_and_singleton_axis_share_a_label() {
        let mut scalar = minimal_blueprint();
        scalar.temperature = Some(0.5);
        let mut axis = minimal_blueprint();
        axis.temperatures = Some(vec![0.5]);
        assert_eq!(scalar.run_label(), axis.run_label());
    }

    #[test]
    fn model_ref_forms() {
        let refs: Vec<ModelRef> = serde_json::from_str(
            r#"[
                "openrouter:meta/llama-3.1-8b",
                {"id": "my-endpoint", "url": "https://x.test/api", "inherit": "openai"}
            ]"#,
        )
        .unwrap();
        assert_eq!(refs[0].id(), "openrouter:meta/llama-3.1-8b");
        assert_eq!(refs[1].id(), "my-endpoint");
    }
}
