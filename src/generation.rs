//! Generation service: wraps a single dispatch call with caching, the
//! provider rate-limiter gate, timeouts, bounded retries, and a per-model
//! circuit breaker.
//!
//! A cell never aborts the pipeline: every failure is recovered into a
//! [`ModelResponseDetail`] carrying an `<error>…</error>` sentinel and the
//! error kind.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::cache::{CacheKey, CacheNamespace, CacheService};
use crate::error::Error;
use crate::limiter::LimiterRegistry;
use crate::llm::{ApiCallOptions, ChatMessage, ClientDispatcher, ToolCall};

/// Consecutive cell failures that trip a model's breaker.
const BREAKER_THRESHOLD: u32 = 10;
/// Base backoff between retry attempts.
const RETRY_BASE_DELAY_MS: u64 = 250;
/// Cap on how long a 429's retry-after hint is honored.
const MAX_RETRY_AFTER_MS: u64 = 5_000;

/// Outcome of one generation cell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponseDetail {
    pub final_assistant_response_text: String,
    /// Conversation including the final assistant turn
    pub full_conversation_history: Vec<ChatMessage>,
    pub has_error: bool,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub error_kind: Option<String>,
    pub system_prompt_used: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponseDetail {
    /// Successful detail from a response text.
    pub fn success(
        text: String,
        mut conversation: Vec<ChatMessage>,
        system_prompt: Option<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        conversation.push(ChatMessage::assistant(&text));
        Self {
            final_assistant_response_text: text,
            full_conversation_history: conversation,
            has_error: false,
            error_message: None,
            error_kind: None,
            system_prompt_used: system_prompt,
            tool_calls,
        }
    }

    /// Error detail with the sentinel response text.
    pub fn from_error(
        err: &Error,
        conversation: Vec<ChatMessage>,
        system_prompt: Option<String>,
    ) -> Self {
        Self {
            final_assistant_response_text: format!("<error>{err}</error>"),
            full_conversation_history: conversation,
            has_error: true,
            error_message: Some(err.to_string()),
            error_kind: Some(err.kind().to_string()),
            system_prompt_used: system_prompt,
            tool_calls: Vec::new(),
        }
    }
}

/// One cell to generate.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Base model id (routing key and breaker key)
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
}

/// Tunables for the generation service.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Per-call deadline
    pub timeout_ms: u64,
    /// Retries after the first attempt, on transient errors
    pub retries: u32,
    pub use_cache: bool,
    /// Extra cache-key scope so distinct runs can be isolated
    pub cache_scope: Option<String>,
    pub max_tokens: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            retries: 2,
            use_cache: true,
            cache_scope: None,
            max_tokens: None,
        }
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    tripped: bool,
}

/// Per-call wrapper over the dispatcher.
pub struct GenerationService {
    dispatcher: Arc<ClientDispatcher>,
    limiters: Arc<LimiterRegistry>,
    cache: Arc<CacheService>,
    config: GenerationConfig,
    breakers: Mutex<HashMap<String, BreakerState>>,
}

impl GenerationService {
    pub fn new(
        dispatcher: Arc<ClientDispatcher>,
        limiters: Arc<LimiterRegistry>,
        cache: Arc<CacheService>,
        config: GenerationConfig,
    ) -> Self {
        Self {
            dispatcher,
            limiters,
            cache,
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the breaker for a base model is open.
    pub fn breaker_open(&self, model_id: &str) -> bool {
        let breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        breakers.get(model_id).is_some_and(|b| b.tripped)
    }

    fn record_cell_failure(&self, model_id: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        let state = breakers.entry(model_id.to_string()).or_default();
        state.consecutive_failures += 1;
        if !state.tripped && state.consecutive_failures >= BREAKER_THRESHOLD {
            state.tripped = true;
            warn!(model = %model_id, "circuit breaker tripped");
        }
    }

    fn record_cell_success(&self, model_id: &str) {
        let mut breakers = self.breakers.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(state) = breakers.get_mut(model_id) {
            state.consecutive_failures = 0;
            state.tripped = false;
        }
    }

    fn cache_key(&self, request: &GenerationRequest) -> CacheKey {
        CacheKey::from_value(&json!({
            "model": request.model_id,
            "messages": request.messages,
            "system": request.system_prompt,
            "temperature": request.temperature,
            "scope": self.config.cache_scope,
        }))
    }

    /// Drive one cell to a final outcome. Cell-level errors are recovered
    /// into the returned detail, never propagated.
    pub async fn generate(&self, request: GenerationRequest) -> ModelResponseDetail {
        if self.breaker_open(&request.model_id) {
            let err = Error::BreakerOpen {
                model: request.model_id.clone(),
            };
            return ModelResponseDetail::from_error(
                &err,
                request.messages.clone(),
                request.system_prompt.clone(),
            );
        }

        let cache_key = self.cache_key(&request);
        if self.config.use_cache {
            if let Some(text) = self
                .cache
                .get::<String>(CacheNamespace::Generation, &cache_key)
            {
                debug!(model = %request.model_id, "generation cache hit");
                return ModelResponseDetail::success(
                    text,
                    request.messages.clone(),
                    request.system_prompt.clone(),
                    Vec::new(),
                );
            }
        }

        let provider_key = match self.dispatcher.provider_key(&request.model_id).await {
            Ok(key) => key,
            Err(err) => {
                return ModelResponseDetail::from_error(
                    &err,
                    request.messages.clone(),
                    request.system_prompt.clone(),
                );
            }
        };
        let limiter = self.limiters.for_provider(&provider_key);
        let _permit = limiter.acquire().await;

        // Another cell may have tripped the breaker while this one waited
        // for a slot.
        if self.breaker_open(&request.model_id) {
            let err = Error::BreakerOpen {
                model: request.model_id.clone(),
            };
            return ModelResponseDetail::from_error(
                &err,
                request.messages.clone(),
                request.system_prompt.clone(),
            );
        }

        let options = ApiCallOptions {
            model_id: request.model_id.clone(),
            messages: request.messages.clone(),
            system_prompt: request.system_prompt.clone(),
            temperature: request.temperature,
            max_tokens: self.config.max_tokens,
            timeout_ms: Some(self.config.timeout_ms),
            ..Default::default()
        };

        let mut attempt = 0u32;
        let outcome = loop {
            match self.dispatcher.call(&options).await {
                Ok(completion) => break Ok(completion),
                Err(err) => {
                    // Each concrete 429 drives the limiter immediately.
                    if let Error::RateLimited { retry_after_ms, .. } = err {
                        limiter.on_rate_limit(retry_after_ms.map(Duration::from_millis));
                    }
                    if attempt >= self.config.retries || !err.is_transient() {
                        break Err(err);
                    }
                    let delay = match err {
                        Error::RateLimited {
                            retry_after_ms: Some(ms),
                            ..
                        } => ms.min(MAX_RETRY_AFTER_MS),
                        _ => RETRY_BASE_DELAY_MS * 2u64.pow(attempt),
                    };
                    debug!(
                        model = %request.model_id,
                        attempt,
                        delay_ms = delay,
                        error = %err,
                        "retrying generation"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        };

        // Only the final outcome drives the AIMD success/error events.
        match outcome {
            Ok(completion) => {
                limiter.on_success();
                self.record_cell_success(&request.model_id);
                if let Some(usage) = completion.usage {
                    debug!(
                        model = %request.model_id,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "generation complete"
                    );
                }
                if self.config.use_cache {
                    self.cache.put(
                        CacheNamespace::Generation,
                        &cache_key,
                        &completion.text,
                    );
                }
                ModelResponseDetail::success(
                    completion.text,
                    request.messages.clone(),
                    request.system_prompt.clone(),
                    completion.tool_calls,
                )
            }
            Err(err) => {
                if !matches!(err, Error::RateLimited { .. }) {
                    limiter.on_error();
                }
                // Cancellation must not advance the breaker.
                if !matches!(err, Error::Cancelled(_)) {
                    self.record_cell_failure(&request.model_id);
                }
                ModelResponseDetail::from_error(
                    &err,
                    request.messages.clone(),
                    request.system_prompt.clone(),
                )
            }
        }
    }
}
