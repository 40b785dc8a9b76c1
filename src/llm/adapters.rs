//! Protocol adapters for the chat/completion families.
//!
//! One HTTP adapter implementation covers every provider; the differences
//! between the openai-compatible, anthropic, and google wire formats live in
//! request/response builder functions parameterized by a [`ProviderFamily`]
//! tag. Custom user-defined providers reuse the same adapter with their own
//! URL, headers, and parameter overrides.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{Error, Result};

use super::sse;
use super::types::{
    ApiCallOptions, ChatCompletion, ChatMessage, ChatRole, ChunkStream, StreamChunk, TokenUsage,
    ToolCall,
};

/// Wire-format family an adapter speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderFamily {
    /// OpenAI-style chat/completions (openai, mistral, together, xai, openrouter)
    OpenAiCompat,
    Anthropic,
    Google,
}

/// Endpoint shape for custom providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    Chat,
    Completions,
}

impl Default for WireFormat {
    fn default() -> Self {
        Self::Chat
    }
}

/// Prompt construction mode for completions-format endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptFormat {
    /// Turns labeled `User: `/`Assistant: ` with a trailing `Assistant:` cue
    Conversational,
    /// Contents concatenated with separators, no role labels
    Raw,
}

impl Default for PromptFormat {
    fn default() -> Self {
        Self::Conversational
    }
}

/// Default per-call deadline when the caller does not set one.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Everything an adapter instance needs to talk to one endpoint.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Provider key for logs and error messages
    pub provider_key: String,
    pub family: ProviderFamily,
    pub format: WireFormat,
    pub prompt_format: PromptFormat,
    /// API base for built-in providers; the full endpoint URL for custom ones
    pub base_url: String,
    /// Whether `base_url` is already the complete endpoint
    pub url_is_endpoint: bool,
    pub api_key: Option<String>,
    pub headers: HashMap<String, String>,
    /// Model name sent on the wire instead of the parsed one (custom models)
    pub model_name_override: Option<String>,
    /// Renames of standard body keys to provider-native names
    pub parameter_mapping: HashMap<String, String>,
    /// User parameters applied to the body last; `null` deletes the key
    pub parameters: HashMap<String, Value>,
}

impl AdapterConfig {
    pub fn new(
        provider_key: impl Into<String>,
        family: ProviderFamily,
        base_url: impl Into<String>,
        api_key: Option<String>,
    ) -> Self {
        Self {
            provider_key: provider_key.into(),
            family,
            format: WireFormat::Chat,
            prompt_format: PromptFormat::Conversational,
            base_url: base_url.into(),
            url_is_endpoint: false,
            api_key,
            headers: HashMap::new(),
            model_name_override: None,
            parameter_mapping: HashMap::new(),
            parameters: HashMap::new(),
        }
    }
}

/// Uniform adapter interface: one non-streaming call, one streaming call,
/// and an embedding call for the families that support it.
#[async_trait]
pub trait ChatAdapter: Send + Sync + std::fmt::Debug {
    /// Non-streaming chat/completion call.
    async fn complete(&self, options: &ApiCallOptions) -> Result<ChatCompletion>;

    /// Streaming call; the returned stream is lazy and not restartable.
    async fn stream(&self, options: &ApiCallOptions) -> Result<ChunkStream>;

    /// Single-vector embeddings over a list of texts.
    async fn embed(&self, _model: &str, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(Error::provider(
            self.provider_key(),
            "embeddings are not supported by this provider",
        ))
    }

    /// Provider key for logs and error attribution.
    fn provider_key(&self) -> &str;
}

/// HTTP adapter covering all three wire families.
#[derive(Debug)]
pub struct HttpChatAdapter {
    config: AdapterConfig,
    http: reqwest::Client,
}

impl HttpChatAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    fn timeout_ms(options: &ApiCallOptions) -> u64 {
        options.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    /// Model name sent on the wire: custom override, else the name parsed
    /// out of the `provider:model` id (the full id when there is no colon).
    fn wire_model(&self, options: &ApiCallOptions) -> String {
        if let Some(ref name) = self.config.model_name_override {
            return name.clone();
        }
        match options.model_id.split_once(':') {
            Some((_, model)) => model.to_string(),
            None => options.model_id.clone(),
        }
    }

    fn endpoint(&self, model: &str, streaming: bool) -> String {
        if self.config.url_is_endpoint {
            return self.config.base_url.clone();
        }
        let base = self.config.base_url.trim_end_matches('/');
        match self.config.family {
            ProviderFamily::OpenAiCompat => match self.config.format {
                WireFormat::Chat => format!("{base}/chat/completions"),
                WireFormat::Completions => format!("{base}/completions"),
            },
            ProviderFamily::Anthropic => format!("{base}/v1/messages"),
            ProviderFamily::Google => {
                let verb = if streaming {
                    "streamGenerateContent?alt=sse"
                } else {
                    "generateContent"
                };
                format!("{base}/v1beta/models/{model}:{verb}")
            }
        }
    }

    /// Build the request body for this family, then apply the custom
    /// parameter mapping and overrides.
    fn build_body(&self, options: &ApiCallOptions, model: &str, streaming: bool) -> Value {
        let mut body = match self.config.family {
            ProviderFamily::OpenAiCompat => match self.config.format {
                WireFormat::Chat => build_openai_chat_body(options, model),
                WireFormat::Completions => {
                    build_completions_body(options, model, self.config.prompt_format)
                }
            },
            ProviderFamily::Anthropic => build_anthropic_body(options, model),
            ProviderFamily::Google => build_google_body(options),
        };

        if streaming && self.config.family != ProviderFamily::Google {
            body["stream"] = Value::Bool(true);
        }

        let obj = body.as_object_mut().expect("request body is an object");
        for (standard, native) in &self.config.parameter_mapping {
            if let Some(value) = obj.remove(standard) {
                obj.insert(native.clone(), value);
            }
        }
        for (key, value) in &self.config.parameters {
            if value.is_null() {
                obj.remove(key);
            } else {
                obj.insert(key.clone(), value.clone());
            }
        }
        body
    }

    fn request(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self.http.post(url).header("content-type", "application/json");

        match self.config.family {
            ProviderFamily::OpenAiCompat => {
                if let Some(ref key) = self.config.api_key {
                    req = req.header("Authorization", format!("Bearer {key}"));
                }
            }
            ProviderFamily::Anthropic => {
                // Custom endpoints may carry auth in their own headers.
                if let Some(ref key) = self.config.api_key {
                    req = req.header("x-api-key", key.as_str());
                }
                req = req.header("anthropic-version", "2023-06-01");
            }
            ProviderFamily::Google => {
                if let Some(ref key) = self.config.api_key {
                    req = req.header("x-goog-api-key", key);
                }
            }
        }
        for (k, v) in &self.config.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req.json(body)
    }

    async fn send(&self, url: &str, body: &Value, timeout_ms: u64) -> Result<String> {
        let provider = self.config.provider_key.clone();
        let req = self.request(url, body);

        let fut = async {
            let response = req
                .send()
                .await
                .map_err(|e| Error::Transport(format!("{provider}: {e}")))?;
            let status = response.status();
            if status.as_u16() == 429 {
                let retry_after_ms = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(|secs| secs * 1000);
                return Err(Error::RateLimited {
                    provider: provider.clone(),
                    retry_after_ms,
                });
            }
            let text = response
                .text()
                .await
                .map_err(|e| Error::Transport(format!("{provider}: {e}")))?;
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return Err(Error::provider_auth(&provider, truncate_body(&text)));
            }
            if !status.is_success() {
                return Err(Error::provider(
                    &provider,
                    format!("{status}: {}", truncate_body(&text)),
                ));
            }
            Ok(text)
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(timeout_ms)),
        }
    }
}

#[async_trait]
impl ChatAdapter for HttpChatAdapter {
    async fn complete(&self, options: &ApiCallOptions) -> Result<ChatCompletion> {
        let model = self.wire_model(options);
        let url = self.endpoint(&model, false);
        let body = self.build_body(options, &model, false);

        debug!(
            provider = %self.config.provider_key,
            model = %model,
            messages = options.messages.len(),
            "dispatching chat completion"
        );

        let text = self.send(&url, &body, Self::timeout_ms(options)).await?;
        match self.config.family {
            ProviderFamily::OpenAiCompat => match self.config.format {
                WireFormat::Chat => parse_openai_chat(&text),
                WireFormat::Completions => parse_openai_completions(&text),
            },
            ProviderFamily::Anthropic => parse_anthropic(&text),
            ProviderFamily::Google => parse_google(&text),
        }
    }

    async fn stream(&self, options: &ApiCallOptions) -> Result<ChunkStream> {
        let model = self.wire_model(options);
        let url = self.endpoint(&model, true);
        let body = self.build_body(options, &model, true);
        let timeout_ms = Self::timeout_ms(options);
        let provider = self.config.provider_key.clone();

        let req = self.request(&url, &body);
        let send = async {
            req.send()
                .await
                .map_err(|e| Error::Transport(format!("{provider}: {e}")))
        };
        let response = match tokio::time::timeout(Duration::from_millis(timeout_ms), send).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(Error::timeout(timeout_ms)),
        };
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::provider(
                &self.config.provider_key,
                format!("{status}: {}", truncate_body(&text)),
            ));
        }

        let parser: fn(&str) -> Result<Vec<StreamChunk>> = match self.config.family {
            ProviderFamily::OpenAiCompat => sse::parse_openai_line,
            ProviderFamily::Anthropic => sse::parse_anthropic_line,
            ProviderFamily::Google => sse::parse_google_line,
        };

        Ok(sse_chunk_stream(response.bytes_stream().boxed(), parser))
    }

    async fn embed(&self, model: &str, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.config.family != ProviderFamily::OpenAiCompat {
            return Err(Error::provider(
                &self.config.provider_key,
                "embeddings are not supported by this provider",
            ));
        }
        let base = self.config.base_url.trim_end_matches('/');
        let url = format!("{base}/embeddings");
        let body = json!({ "model": model, "input": texts });
        let text = self.send(&url, &body, DEFAULT_TIMEOUT_MS).await?;

        #[derive(Deserialize)]
        struct EmbeddingResponse {
            data: Vec<EmbeddingDatum>,
        }
        #[derive(Deserialize)]
        struct EmbeddingDatum {
            embedding: Vec<f32>,
        }

        let parsed: EmbeddingResponse = serde_json::from_str(&text)
            .map_err(|e| Error::Format(format!("bad embedding response: {e}")))?;
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn provider_key(&self) -> &str {
        &self.config.provider_key
    }
}

/// Wrap a byte stream + line parser into a lazy [`ChunkStream`].
fn sse_chunk_stream<S, B, E>(inner: S, parser: fn(&str) -> Result<Vec<StreamChunk>>) -> ChunkStream
where
    S: futures::Stream<Item = std::result::Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    struct State<S> {
        inner: S,
        parser: fn(&str) -> Result<Vec<StreamChunk>>,
        buf: String,
        pending: VecDeque<StreamChunk>,
        done: bool,
    }

    let state = State {
        inner,
        parser,
        buf: String::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.pending.pop_front() {
                // A terminal error ends the stream on the next poll.
                if matches!(chunk, StreamChunk::Error(_)) {
                    st.done = true;
                    st.pending.clear();
                }
                return Some((chunk, st));
            }
            if st.done {
                return None;
            }
            match st.inner.next().await {
                Some(Ok(bytes)) => {
                    st.buf.push_str(&String::from_utf8_lossy(bytes.as_ref()));
                    while let Some(pos) = st.buf.find('\n') {
                        let line: String = st.buf.drain(..=pos).collect();
                        match (st.parser)(line.trim_end_matches(['\n', '\r'])) {
                            Ok(chunks) => st.pending.extend(chunks),
                            Err(e) => {
                                st.pending.push_back(StreamChunk::Error(e.to_string()));
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    st.pending
                        .push_back(StreamChunk::Error(format!("stream transport error: {e}")));
                }
                None => {
                    // Flush any final unterminated line.
                    if !st.buf.is_empty() {
                        let line = std::mem::take(&mut st.buf);
                        if let Ok(chunks) = (st.parser)(line.trim_end_matches('\r')) {
                            st.pending.extend(chunks);
                        }
                    }
                    st.done = true;
                }
            }
        }
    }))
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 600;
    if body.len() <= MAX {
        body.to_string()
    } else {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

// ---- Request builders -------------------------------------------------

fn insert_opt(obj: &mut Map<String, Value>, key: &str, value: Option<Value>) {
    if let Some(value) = value {
        obj.insert(key.to_string(), value);
    }
}

/// Per-call passthrough parameters, merged into the body by every family.
fn apply_custom_parameters(obj: &mut Map<String, Value>, options: &ApiCallOptions) {
    for (key, value) in &options.custom_parameters {
        obj.insert(key.clone(), value.clone());
    }
}

fn build_openai_chat_body(options: &ApiCallOptions, model: &str) -> Value {
    let mut messages: Vec<Value> = Vec::new();
    if let Some(ref system) = options.system_prompt {
        messages.push(json!({ "role": "system", "content": system }));
    }
    for m in &options.messages {
        messages.push(json!({ "role": m.role.as_str(), "content": m.content }));
    }

    let mut body = json!({ "model": model, "messages": messages });
    let obj = body.as_object_mut().expect("body is an object");
    insert_opt(obj, "max_tokens", options.max_tokens.map(Value::from));
    insert_opt(obj, "temperature", options.temperature.map(Value::from));
    insert_opt(obj, "top_p", options.top_p.map(Value::from));
    insert_opt(
        obj,
        "presence_penalty",
        options.presence_penalty.map(Value::from),
    );
    insert_opt(
        obj,
        "frequency_penalty",
        options.frequency_penalty.map(Value::from),
    );
    insert_opt(
        obj,
        "stop",
        options.stop.as_ref().map(|s| json!(s)),
    );
    insert_opt(
        obj,
        "reasoning_effort",
        options.reasoning_effort.map(|e| Value::from(e.as_str())),
    );
    apply_custom_parameters(obj, options);
    body
}

/// Build a prompt string from conversation turns for completions endpoints.
pub fn build_completions_prompt(
    options: &ApiCallOptions,
    prompt_format: PromptFormat,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(ref system) = options.system_prompt {
        parts.push(system.clone());
    }
    match prompt_format {
        PromptFormat::Conversational => {
            for m in &options.messages {
                let label = match m.role {
                    ChatRole::Assistant => "Assistant: ",
                    _ => "User: ",
                };
                parts.push(format!("{label}{}", m.content));
            }
            parts.push("Assistant:".to_string());
        }
        PromptFormat::Raw => {
            for m in &options.messages {
                parts.push(m.content.clone());
            }
        }
    }
    parts.join("\n\n")
}

fn build_completions_body(
    options: &ApiCallOptions,
    model: &str,
    prompt_format: PromptFormat,
) -> Value {
    let prompt = build_completions_prompt(options, prompt_format);
    let mut body = json!({ "model": model, "prompt": prompt });
    let obj = body.as_object_mut().expect("body is an object");
    insert_opt(obj, "max_tokens", options.max_tokens.map(Value::from));
    insert_opt(obj, "temperature", options.temperature.map(Value::from));
    insert_opt(obj, "top_p", options.top_p.map(Value::from));
    insert_opt(obj, "stop", options.stop.as_ref().map(|s| json!(s)));
    apply_custom_parameters(obj, options);
    body
}

fn build_anthropic_body(options: &ApiCallOptions, model: &str) -> Value {
    // Anthropic takes system at the top level and only user/assistant turns.
    let messages: Vec<Value> = options
        .messages
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();

    let mut body = json!({
        "model": model,
        "messages": messages,
        "max_tokens": options.max_tokens.unwrap_or(4096),
    });
    let obj = body.as_object_mut().expect("body is an object");
    insert_opt(
        obj,
        "system",
        options.system_prompt.as_ref().map(|s| Value::from(s.as_str())),
    );
    insert_opt(obj, "temperature", options.temperature.map(Value::from));
    insert_opt(obj, "top_p", options.top_p.map(Value::from));
    insert_opt(obj, "top_k", options.top_k.map(Value::from));
    insert_opt(
        obj,
        "stop_sequences",
        options.stop.as_ref().map(|s| json!(s)),
    );
    if let Some(budget) = options.resolved_thinking_budget() {
        obj.insert(
            "thinking".to_string(),
            json!({ "type": "enabled", "budget_tokens": budget }),
        );
    }
    apply_custom_parameters(obj, options);
    body
}

fn build_google_body(options: &ApiCallOptions) -> Value {
    let contents: Vec<Value> = options
        .messages
        .iter()
        .filter(|m| m.role != ChatRole::System)
        .map(|m| {
            let role = match m.role {
                ChatRole::Assistant => "model",
                _ => "user",
            };
            json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect();

    let mut generation_config = Map::new();
    insert_opt(
        &mut generation_config,
        "temperature",
        options.temperature.map(Value::from),
    );
    insert_opt(
        &mut generation_config,
        "maxOutputTokens",
        options.max_tokens.map(Value::from),
    );
    insert_opt(&mut generation_config, "topP", options.top_p.map(Value::from));
    insert_opt(&mut generation_config, "topK", options.top_k.map(Value::from));
    insert_opt(
        &mut generation_config,
        "stopSequences",
        options.stop.as_ref().map(|s| json!(s)),
    );
    if let Some(budget) = options.resolved_thinking_budget() {
        generation_config.insert(
            "thinkingConfig".to_string(),
            json!({ "thinkingBudget": budget }),
        );
    }

    let mut body = json!({ "contents": contents });
    let obj = body.as_object_mut().expect("body is an object");
    if let Some(ref system) = options.system_prompt {
        obj.insert(
            "systemInstruction".to_string(),
            json!({ "parts": [{ "text": system }] }),
        );
    }
    if !generation_config.is_empty() {
        obj.insert("generationConfig".to_string(), Value::Object(generation_config));
    }
    apply_custom_parameters(obj, options);
    body
}

// ---- Response parsers -------------------------------------------------

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    #[serde(default)]
    message: Option<OpenAiMessage>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<OpenAiToolCall>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    #[serde(default)]
    function: Option<OpenAiToolFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn parse_openai_chat(body: &str) -> Result<ChatCompletion> {
    let parsed: OpenAiChatResponse = serde_json::from_str(body)
        .map_err(|e| Error::Format(format!("bad chat response: {e}")))?;
    let choice = parsed
        .choices
        .first()
        .ok_or_else(|| Error::Format("no choices in response".to_string()))?;
    let message = choice
        .message
        .as_ref()
        .ok_or_else(|| Error::Format("choice carries no message".to_string()))?;

    let tool_calls = message
        .tool_calls
        .iter()
        .filter_map(|tc| tc.function.as_ref())
        .map(|f| ToolCall {
            name: f.name.clone(),
            arguments: serde_json::from_str(&f.arguments).unwrap_or(Value::Null),
        })
        .collect();

    Ok(ChatCompletion {
        text: message.content.clone().unwrap_or_default(),
        reasoning: message.reasoning_content.clone(),
        tool_calls,
        usage: parsed.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
        model: parsed.model,
    })
}

fn parse_openai_completions(body: &str) -> Result<ChatCompletion> {
    let parsed: OpenAiChatResponse = serde_json::from_str(body)
        .map_err(|e| Error::Format(format!("bad completions response: {e}")))?;
    let choice = parsed
        .choices
        .first()
        .ok_or_else(|| Error::Format("no choices in response".to_string()))?;
    Ok(ChatCompletion {
        text: choice.text.clone().unwrap_or_default(),
        reasoning: None,
        tool_calls: Vec::new(),
        usage: parsed.usage.map(|u| TokenUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        }),
        model: parsed.model,
    })
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

fn parse_anthropic(body: &str) -> Result<ChatCompletion> {
    let parsed: AnthropicResponse = serde_json::from_str(body)
        .map_err(|e| Error::Format(format!("bad messages response: {e}")))?;

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in &parsed.content {
        match block.block_type.as_str() {
            "text" => {
                if let Some(ref t) = block.text {
                    text.push_str(t);
                }
            }
            "thinking" => {
                if let Some(ref t) = block.thinking {
                    reasoning.push_str(t);
                }
            }
            "tool_use" => {
                if let Some(ref name) = block.name {
                    tool_calls.push(ToolCall {
                        name: name.clone(),
                        arguments: block.input.clone().unwrap_or(Value::Null),
                    });
                }
            }
            _ => {}
        }
    }

    Ok(ChatCompletion {
        text,
        reasoning: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls,
        usage: parsed.usage.map(|u| TokenUsage {
            input_tokens: u.input_tokens,
            output_tokens: u.output_tokens,
        }),
        model: parsed.model,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    #[serde(default)]
    usage_metadata: Option<GoogleUsage>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GoogleCandidate {
    #[serde(default)]
    content: Option<GoogleContent>,
}

#[derive(Debug, Deserialize)]
struct GoogleContent {
    #[serde(default)]
    parts: Vec<GooglePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GooglePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
    #[serde(default)]
    function_call: Option<GoogleFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct GoogleFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleUsage {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

fn parse_google(body: &str) -> Result<ChatCompletion> {
    let parsed: GoogleResponse = serde_json::from_str(body)
        .map_err(|e| Error::Format(format!("bad generateContent response: {e}")))?;
    let candidate = parsed
        .candidates
        .first()
        .ok_or_else(|| Error::Format("no candidates in response".to_string()))?;

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    if let Some(ref content) = candidate.content {
        for part in &content.parts {
            if let Some(ref call) = part.function_call {
                tool_calls.push(ToolCall {
                    name: call.name.clone(),
                    arguments: call.args.clone(),
                });
            }
            if let Some(ref t) = part.text {
                if part.thought.unwrap_or(false) {
                    reasoning.push_str(t);
                } else {
                    text.push_str(t);
                }
            }
        }
    }

    Ok(ChatCompletion {
        text,
        reasoning: (!reasoning.is_empty()).then_some(reasoning),
        tool_calls,
        usage: parsed.usage_metadata.map(|u| TokenUsage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        }),
        model: parsed.model_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::ReasoningEffort;
    use pretty_assertions::assert_eq;

    fn options() -> ApiCallOptions {
        ApiCallOptions::new("openai:gpt-4o-mini")
            .with_system("be brief")
            .with_message(ChatMessage::user("hello"))
            .with_message(ChatMessage::assistant("hi"))
            .with_message(ChatMessage::user("bye"))
            .with_temperature(0.5)
            .with_max_tokens(128)
    }

    #[test]
    fn openai_body_has_leading_system_message() {
        let body = build_openai_chat_body(&options(), "gpt-4o-mini");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "be brief");
        assert_eq!(messages[3]["content"], "bye");
        assert_eq!(body["max_tokens"], 128);
        assert_eq!(body["temperature"], 0.5);
    }

    #[test]
    fn anthropic_body_separates_system_and_filters_turns() {
        let mut opts = options();
        opts.messages.insert(0, ChatMessage::system("inline system"));
        let body = build_anthropic_body(&opts, "claude-x");
        assert_eq!(body["system"], "be brief");
        let messages = body["messages"].as_array().unwrap();
        // The inline system turn is filtered out.
        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m["role"] != "system"));
        assert_eq!(body["max_tokens"], 128);
    }

    #[test]
    fn anthropic_defaults_max_tokens() {
        let mut opts = options();
        opts.max_tokens = None;
        let body = build_anthropic_body(&opts, "claude-x");
        assert_eq!(body["max_tokens"], 4096);
    }

    #[test]
    fn anthropic_thinking_from_effort() {
        let mut opts = options();
        opts.reasoning_effort = Some(ReasoningEffort::Medium);
        let body = build_anthropic_body(&opts, "claude-x");
        assert_eq!(body["thinking"]["type"], "enabled");
        assert_eq!(body["thinking"]["budget_tokens"], 4096);
    }

    #[test]
    fn google_body_remaps_roles_and_nests_config() {
        let body = build_google_body(&options());
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(body["generationConfig"]["temperature"], 0.5);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 128);
    }

    #[test]
    fn google_thinking_budget() {
        let mut opts = options();
        opts.thinking_budget = Some(2048);
        let body = build_google_body(&opts);
        assert_eq!(
            body["generationConfig"]["thinkingConfig"]["thinkingBudget"],
            2048
        );
    }

    #[test]
    fn conversational_prompt_labels_turns() {
        let prompt = build_completions_prompt(&options(), PromptFormat::Conversational);
        assert_eq!(
            prompt,
            "be brief\n\nUser: hello\n\nAssistant: hi\n\nUser: bye\n\nAssistant:"
        );
    }

    #[test]
    fn raw_prompt_has_no_labels() {
        let prompt = build_completions_prompt(&options(), PromptFormat::Raw);
        assert_eq!(prompt, "be brief\n\nhello\n\nhi\n\nbye");
        assert!(!prompt.contains("User:"));
        assert!(!prompt.contains("Assistant:"));
    }

    #[test]
    fn parameter_override_null_deletes_and_false_sets() {
        let mut config = AdapterConfig::new(
            "custom-1",
            ProviderFamily::OpenAiCompat,
            "https://example.test/v1",
            None,
        );
        config
            .parameters
            .insert("temperature".to_string(), Value::Null);
        config
            .parameters
            .insert("logprobs".to_string(), Value::Bool(false));
        config
            .parameters
            .insert("n".to_string(), Value::from(0));
        let adapter = HttpChatAdapter::new(config);

        let body = adapter.build_body(&options(), "m", false);
        assert!(body.get("temperature").is_none());
        assert_eq!(body["logprobs"], false);
        assert_eq!(body["n"], 0);
    }

    #[test]
    fn parameter_mapping_renames_standard_keys() {
        let mut config = AdapterConfig::new(
            "custom-2",
            ProviderFamily::OpenAiCompat,
            "https://example.test/v1",
            None,
        );
        config
            .parameter_mapping
            .insert("max_tokens".to_string(), "max_new_tokens".to_string());
        let adapter = HttpChatAdapter::new(config);

        let body = adapter.build_body(&options(), "m", false);
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["max_new_tokens"], 128);
    }

    #[test]
    fn custom_parameters_pass_through_to_every_family() {
        let mut opts = options();
        opts.custom_parameters
            .insert("seed".to_string(), Value::from(7));
        opts.custom_parameters
            .insert("logit_bias".to_string(), serde_json::json!({"50256": -100}));

        let chat = build_openai_chat_body(&opts, "m");
        assert_eq!(chat["seed"], 7);
        assert_eq!(chat["logit_bias"]["50256"], -100);

        let completions = build_completions_body(&opts, "m", PromptFormat::Raw);
        assert_eq!(completions["seed"], 7);

        let anthropic = build_anthropic_body(&opts, "m");
        assert_eq!(anthropic["seed"], 7);

        let google = build_google_body(&opts);
        assert_eq!(google["seed"], 7);
    }

    #[test]
    fn streaming_flag_set_for_openai_family() {
        let config = AdapterConfig::new(
            "openai",
            ProviderFamily::OpenAiCompat,
            "https://api.openai.com/v1",
            Some("k".to_string()),
        );
        let adapter = HttpChatAdapter::new(config);
        let body = adapter.build_body(&options(), "m", true);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn endpoints_per_family() {
        let openai = HttpChatAdapter::new(AdapterConfig::new(
            "openai",
            ProviderFamily::OpenAiCompat,
            "https://api.openai.com/v1",
            None,
        ));
        assert_eq!(
            openai.endpoint("m", false),
            "https://api.openai.com/v1/chat/completions"
        );

        let anthropic = HttpChatAdapter::new(AdapterConfig::new(
            "anthropic",
            ProviderFamily::Anthropic,
            "https://api.anthropic.com",
            None,
        ));
        assert_eq!(
            anthropic.endpoint("m", false),
            "https://api.anthropic.com/v1/messages"
        );

        let google = HttpChatAdapter::new(AdapterConfig::new(
            "google",
            ProviderFamily::Google,
            "https://generativelanguage.googleapis.com",
            None,
        ));
        assert_eq!(
            google.endpoint("gemini-2.0-flash", false),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert!(google.endpoint("gemini-2.0-flash", true).contains("alt=sse"));
    }

    #[test]
    fn custom_endpoint_is_used_verbatim() {
        let mut config = AdapterConfig::new(
            "my-model",
            ProviderFamily::OpenAiCompat,
            "https://inference.example.test/api/generate",
            None,
        );
        config.url_is_endpoint = true;
        let adapter = HttpChatAdapter::new(config);
        assert_eq!(
            adapter.endpoint("m", false),
            "https://inference.example.test/api/generate"
        );
    }

    #[test]
    fn parse_openai_chat_response() {
        let body = r#"{
            "id": "chatcmpl-1", "model": "gpt-4o-mini",
            "choices": [{"index":0,"message":{"role":"assistant","content":"Hello!","tool_calls":[{"id":"c1","type":"function","function":{"name":"lookup","arguments":"{\"q\":\"x\"}"}}]},"finish_reason":"stop"}],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3}
        }"#;
        let completion = parse_openai_chat(body).unwrap();
        assert_eq!(completion.text, "Hello!");
        assert_eq!(completion.tool_calls.len(), 1);
        assert_eq!(completion.tool_calls[0].name, "lookup");
        assert_eq!(completion.tool_calls[0].arguments["q"], "x");
        assert_eq!(
            completion.usage,
            Some(TokenUsage {
                input_tokens: 7,
                output_tokens: 3
            })
        );
    }

    #[test]
    fn parse_openai_completions_response() {
        let body = r#"{"choices":[{"text":" raw text"}]}"#;
        let completion = parse_openai_completions(body).unwrap();
        assert_eq!(completion.text, " raw text");
    }

    #[test]
    fn parse_anthropic_response_with_thinking() {
        let body = r#"{
            "id":"msg_1","model":"claude-x",
            "content":[
                {"type":"thinking","thinking":"let me think"},
                {"type":"text","text":"Answer."},
                {"type":"tool_use","id":"t1","name":"search","input":{"q":1}}
            ],
            "usage":{"input_tokens":10,"output_tokens":4}
        }"#;
        let completion = parse_anthropic(body).unwrap();
        assert_eq!(completion.text, "Answer.");
        assert_eq!(completion.reasoning.as_deref(), Some("let me think"));
        assert_eq!(completion.tool_calls[0].name, "search");
    }

    #[test]
    fn parse_google_response() {
        let body = r#"{
            "candidates":[{"content":{"parts":[{"text":"Bonjour"}],"role":"model"}}],
            "usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":2}
        }"#;
        let completion = parse_google(body).unwrap();
        assert_eq!(completion.text, "Bonjour");
        assert_eq!(
            completion.usage,
            Some(TokenUsage {
                input_tokens: 5,
                output_tokens: 2
            })
        );
    }

    #[test]
    fn empty_choices_is_format_error() {
        assert!(matches!(
            parse_openai_chat(r#"{"choices":[]}"#),
            Err(Error::Format(_))
        ));
    }
}
