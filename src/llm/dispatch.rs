//! Model-id routing over the protocol adapters.
//!
//! Model ids take the form `<provider>:<model-name>` (provider
//! case-insensitive, model names may contain `/` but never `:`). A model id
//! whose full string matches a registered custom definition bypasses
//! provider parsing entirely. Adapter instances are created lazily on first
//! use and cached for the dispatcher's lifetime; the dispatcher itself is
//! owned by a pipeline context, not a process-wide singleton.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{Error, Result};

use super::adapters::{
    AdapterConfig, ChatAdapter, HttpChatAdapter, PromptFormat, ProviderFamily, WireFormat,
};
use super::types::{ApiCallOptions, ChatCompletion, ChunkStream};

/// Built-in providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    OpenAi,
    Anthropic,
    Google,
    Mistral,
    Together,
    Xai,
    OpenRouter,
}

impl ProviderId {
    pub const ALL: [ProviderId; 7] = [
        ProviderId::OpenAi,
        ProviderId::Anthropic,
        ProviderId::Google,
        ProviderId::Mistral,
        ProviderId::Together,
        ProviderId::Xai,
        ProviderId::OpenRouter,
    ];

    /// Case-insensitive provider lookup.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "google" => Some(Self::Google),
            "mistral" => Some(Self::Mistral),
            "together" => Some(Self::Together),
            "xai" => Some(Self::Xai),
            "openrouter" => Some(Self::OpenRouter),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
            Self::Mistral => "mistral",
            Self::Together => "together",
            Self::Xai => "xai",
            Self::OpenRouter => "openrouter",
        }
    }

    pub fn family(&self) -> ProviderFamily {
        match self {
            Self::Anthropic => ProviderFamily::Anthropic,
            Self::Google => ProviderFamily::Google,
            _ => ProviderFamily::OpenAiCompat,
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com",
            Self::Google => "https://generativelanguage.googleapis.com",
            Self::Mistral => "https://api.mistral.ai/v1",
            Self::Together => "https://api.together.xyz/v1",
            Self::Xai => "https://api.x.ai/v1",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }

    pub fn api_key_env(&self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Google => "GOOGLE_API_KEY",
            Self::Mistral => "MISTRAL_API_KEY",
            Self::Together => "TOGETHER_API_KEY",
            Self::Xai => "XAI_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
        }
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `<provider>:<model-name>` id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedModelId {
    pub provider: ProviderId,
    pub model: String,
}

/// Parse a model id string. Model names may contain `/` and most other
/// characters; a second `:` is rejected.
pub fn parse_model_id(model_id: &str) -> Result<ParsedModelId> {
    let (provider_part, model_part) = model_id.split_once(':').ok_or_else(|| {
        Error::Config(format!(
            "model id '{model_id}' is not of the form '<provider>:<model-name>'"
        ))
    })?;
    if model_part.is_empty() {
        return Err(Error::Config(format!(
            "model id '{model_id}' has an empty model name"
        )));
    }
    if model_part.contains(':') {
        return Err(Error::Config(format!(
            "model name in '{model_id}' must not contain ':'"
        )));
    }
    let provider = ProviderId::parse(provider_part).ok_or_else(|| {
        Error::Config(format!(
            "unrecognized provider '{provider_part}' in model id '{model_id}'"
        ))
    })?;
    Ok(ParsedModelId {
        provider,
        model: model_part.to_string(),
    })
}

/// User-defined HTTP provider bound to a single model id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomModelDefinition {
    /// Full model id that routes to this definition
    pub id: String,
    /// Complete endpoint URL
    pub url: String,
    /// Model name sent on the wire
    #[serde(default)]
    pub model_name: Option<String>,
    /// Built-in provider whose wire family this endpoint speaks
    pub inherit: ProviderId,
    #[serde(default)]
    pub format: WireFormat,
    #[serde(default)]
    pub prompt_format: Option<PromptFormat>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Renames of standard body keys to provider-native names
    #[serde(default)]
    pub parameter_mapping: HashMap<String, String>,
    /// Parameters applied to the body last; `null` deletes a key
    #[serde(default)]
    pub parameters: HashMap<String, Value>,
}

/// Routing layer over the protocol adapters.
pub struct ClientDispatcher {
    custom: RwLock<HashMap<String, CustomModelDefinition>>,
    adapters: RwLock<HashMap<String, Arc<dyn ChatAdapter>>>,
}

impl ClientDispatcher {
    pub fn new() -> Self {
        Self {
            custom: RwLock::new(HashMap::new()),
            adapters: RwLock::new(HashMap::new()),
        }
    }

    /// Register user-defined model endpoints. A later registration with the
    /// same id replaces the earlier one and drops its cached adapter.
    pub async fn register_custom_models(&self, definitions: Vec<CustomModelDefinition>) {
        let mut custom = self.custom.write().await;
        let mut adapters = self.adapters.write().await;
        for def in definitions {
            adapters.remove(&def.id);
            custom.insert(def.id.clone(), def);
        }
    }

    /// Pre-seed the adapter cache for a provider key or custom model id.
    /// Tests and fixtures use this to inject mock adapters.
    pub async fn insert_adapter(&self, key: impl Into<String>, adapter: Arc<dyn ChatAdapter>) {
        self.adapters.write().await.insert(key.into(), adapter);
    }

    /// Provider key a model id routes through (the custom id itself, or the
    /// built-in provider name). This is the rate-limiter key.
    pub async fn provider_key(&self, model_id: &str) -> Result<String> {
        if self.custom.read().await.contains_key(model_id) {
            return Ok(model_id.to_string());
        }
        Ok(parse_model_id(model_id)?.provider.as_str().to_string())
    }

    /// Resolve the adapter for a model id, creating and caching it on first
    /// use. Missing credentials surface here, on the first call.
    pub async fn resolve(&self, model_id: &str) -> Result<Arc<dyn ChatAdapter>> {
        // Custom definitions match on the full id and bypass provider parsing.
        let custom_def = self.custom.read().await.get(model_id).cloned();
        let key = match custom_def {
            Some(_) => model_id.to_string(),
            None => parse_model_id(model_id)?.provider.as_str().to_string(),
        };

        if let Some(adapter) = self.adapters.read().await.get(&key) {
            return Ok(Arc::clone(adapter));
        }

        let mut adapters = self.adapters.write().await;
        if let Some(adapter) = adapters.get(&key) {
            return Ok(Arc::clone(adapter));
        }

        let adapter: Arc<dyn ChatAdapter> = match custom_def {
            Some(def) => Arc::new(HttpChatAdapter::new(custom_adapter_config(&def))),
            None => {
                let parsed = parse_model_id(model_id)?;
                Arc::new(HttpChatAdapter::new(builtin_adapter_config(
                    parsed.provider,
                )?))
            }
        };
        debug!(provider = %key, "constructed adapter");
        adapters.insert(key, Arc::clone(&adapter));
        Ok(adapter)
    }

    /// Non-streaming call routed by `options.model_id`.
    pub async fn call(&self, options: &ApiCallOptions) -> Result<ChatCompletion> {
        let adapter = self.resolve(&options.model_id).await?;
        adapter.complete(options).await
    }

    /// Streaming call routed by `options.model_id`.
    pub async fn stream(&self, options: &ApiCallOptions) -> Result<ChunkStream> {
        let adapter = self.resolve(&options.model_id).await?;
        adapter.stream(options).await
    }

    /// Embed texts with an embedding model id of the same `provider:model`
    /// form.
    pub async fn embed(&self, model_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let adapter = self.resolve(model_id).await?;
        let wire_model = match model_id.split_once(':') {
            Some((_, model)) => model.to_string(),
            None => model_id.to_string(),
        };
        adapter.embed(&wire_model, texts).await
    }
}

impl Default for ClientDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn builtin_adapter_config(provider: ProviderId) -> Result<AdapterConfig> {
    let env_var = provider.api_key_env();
    let api_key = std::env::var(env_var)
        .ok()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| {
            Error::provider_auth(provider.as_str(), format!("set the {env_var} env var"))
        })?;
    Ok(AdapterConfig::new(
        provider.as_str(),
        provider.family(),
        provider.base_url(),
        Some(api_key),
    ))
}

fn custom_adapter_config(def: &CustomModelDefinition) -> AdapterConfig {
    let mut config = AdapterConfig::new(&def.id, def.inherit.family(), &def.url, None);
    config.url_is_endpoint = true;
    config.format = def.format;
    config.prompt_format = def.prompt_format.unwrap_or_default();
    config.headers = def.headers.clone();
    config.model_name_override = def.model_name.clone();
    config.parameter_mapping = def.parameter_mapping.clone();
    config.parameters = def.parameters.clone();
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    #[test]
    fn parses_builtin_providers_case_insensitively() {
        let parsed = parse_model_id("OpenAI:gpt-4o-mini").unwrap();
        assert_eq!(parsed.provider, ProviderId::OpenAi);
        assert_eq!(parsed.model, "gpt-4o-mini");

        let parsed = parse_model_id("openrouter:meta/llama-3.1-8b").unwrap();
        assert_eq!(parsed.provider, ProviderId::OpenRouter);
        assert_eq!(parsed.model, "meta/llama-3.1-8b");
    }

    #[test]
    fn rejects_colon_in_model_name() {
        let err = parse_model_id("openai:gpt:4o").unwrap_err();
        assert!(err.to_string().contains("must not contain ':'"));
    }

    #[test]
    fn rejects_unknown_provider_naming_the_model_id() {
        let err = parse_model_id("acme:model-1").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("acme"));
        assert!(message.contains("acme:model-1"));
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn rejects_missing_colon_and_empty_model() {
        assert!(parse_model_id("gpt-4o").is_err());
        assert!(parse_model_id("openai:").is_err());
    }

    #[test]
    fn provider_families_and_envs() {
        assert_eq!(ProviderId::Mistral.family(), ProviderFamily::OpenAiCompat);
        assert_eq!(ProviderId::Anthropic.family(), ProviderFamily::Anthropic);
        assert_eq!(ProviderId::Google.family(), ProviderFamily::Google);
        assert_eq!(ProviderId::Xai.api_key_env(), "XAI_API_KEY");
    }

    #[derive(Debug)]
    struct EchoAdapter;

    #[async_trait]
    impl ChatAdapter for EchoAdapter {
        async fn complete(&self, options: &ApiCallOptions) -> Result<ChatCompletion> {
            Ok(ChatCompletion {
                text: format!("echo:{}", options.model_id),
                ..Default::default()
            })
        }

        async fn stream(&self, _options: &ApiCallOptions) -> Result<ChunkStream> {
            Ok(Box::pin(futures::stream::empty()))
        }

        fn provider_key(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn injected_adapter_is_used_for_the_provider() {
        let dispatcher = ClientDispatcher::new();
        dispatcher.insert_adapter("openai", Arc::new(EchoAdapter)).await;

        let options = ApiCallOptions::new("openai:gpt-4o-mini");
        let completion = dispatcher.call(&options).await.unwrap();
        assert_eq!(completion.text, "echo:openai:gpt-4o-mini");
    }

    #[tokio::test]
    async fn custom_model_id_bypasses_provider_parsing() {
        let dispatcher = ClientDispatcher::new();
        dispatcher
            .register_custom_models(vec![CustomModelDefinition {
                id: "my-endpoint".to_string(),
                url: "https://inference.example.test/api".to_string(),
                model_name: Some("llama-groomed".to_string()),
                inherit: ProviderId::OpenAi,
                format: WireFormat::Chat,
                prompt_format: None,
                headers: HashMap::new(),
                parameter_mapping: HashMap::new(),
                parameters: HashMap::new(),
            }])
            .await;

        // "my-endpoint" has no colon but resolves through the custom registry.
        assert_eq!(
            dispatcher.provider_key("my-endpoint").await.unwrap(),
            "my-endpoint"
        );
        assert!(dispatcher.resolve("my-endpoint").await.is_ok());
    }

    #[tokio::test]
    async fn unknown_provider_fails_resolution() {
        let dispatcher = ClientDispatcher::new();
        let err = dispatcher.resolve("acme:model-1").await.unwrap_err();
        assert!(err.to_string().contains("acme:model-1"));
    }

    #[test]
    fn custom_definition_deserializes_from_camel_case() {
        let def: CustomModelDefinition = serde_json::from_str(
            r#"{
                "id": "local-llama",
                "url": "http://localhost:8080/v1/chat/completions",
                "modelName": "llama-3.1-8b",
                "inherit": "openai",
                "format": "completions",
                "promptFormat": "raw",
                "parameterMapping": {"max_tokens": "n_predict"},
                "parameters": {"cache_prompt": true}
            }"#,
        )
        .unwrap();
        assert_eq!(def.model_name.as_deref(), Some("llama-3.1-8b"));
        assert_eq!(def.inherit, ProviderId::OpenAi);
        assert_eq!(def.format, WireFormat::Completions);
        assert_eq!(def.prompt_format, Some(PromptFormat::Raw));
        assert_eq!(def.parameter_mapping["max_tokens"], "n_predict");
    }
}
