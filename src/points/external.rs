//! External HTTP grading backends, used as the `call` point function.
//!
//! A point invokes a named service from the blueprint's service map or an
//! inline URL. The request body carries the response under grading plus
//! user parameters with template placeholders substituted; headers support
//! `${ENV_VAR}` expansion. Retries and timeouts come from the service
//! configuration, and responses must be `{score: 0..1, explain?}`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::blueprint::ExternalServiceConfig;
use crate::cache::{CacheKey, CacheNamespace, CacheService};
use crate::error::{Error, Result};
use crate::llm::ChatMessage;

/// Default deadline for one grading request.
const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;
/// Base backoff between retry attempts.
const RETRY_BASE_DELAY_MS: u64 = 200;

/// Everything a service call can substitute into its parameters.
pub struct ExternalCallContext<'a> {
    pub response: &'a str,
    pub model_id: &'a str,
    pub prompt_id: &'a str,
    pub prompt_text: &'a str,
    pub messages: &'a [ChatMessage],
}

/// Verdict returned by a grading backend.
#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
pub struct ExternalVerdict {
    pub score: f64,
    #[serde(default)]
    pub explain: Option<String>,
}

/// Caller over the blueprint's named grading services.
pub struct ExternalServiceCaller {
    http: reqwest::Client,
    services: HashMap<String, ExternalServiceConfig>,
    cache: Arc<CacheService>,
}

impl ExternalServiceCaller {
    pub fn new(
        services: HashMap<String, ExternalServiceConfig>,
        cache: Arc<CacheService>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            services,
            cache,
        }
    }

    /// Invoke a grading backend for one point.
    ///
    /// `args` selects the service: a bare service name, an object with
    /// `service` plus extra parameters, or an object with an inline `url`.
    pub async fn call(
        &self,
        args: &Value,
        ctx: &ExternalCallContext<'_>,
    ) -> Result<ExternalVerdict> {
        let (config, user_params) = self.resolve(args)?;
        let body = build_body(&config, &user_params, ctx);

        let cache_key = config.cacheable.then(|| {
            CacheKey::from_value(&json!({ "url": config.url, "body": body }))
        });
        if let Some(ref key) = cache_key {
            if let Some(verdict) = self
                .cache
                .get::<ExternalVerdict>(CacheNamespace::ExternalServices, key)
            {
                debug!(url = %config.url, "external grader cache hit");
                return Ok(verdict);
            }
        }

        let verdict = self.post_with_retries(&config, &body).await?;
        if verdict.score.is_nan() || !(0.0..=1.0).contains(&verdict.score) {
            return Err(Error::point_function(
                "call",
                format!("service returned score {} outside [0, 1]", verdict.score),
            ));
        }

        if let Some(ref key) = cache_key {
            self.cache
                .put(CacheNamespace::ExternalServices, key, &verdict);
        }
        Ok(verdict)
    }

    /// Resolve the call arguments into a service config plus user params.
    fn resolve(&self, args: &Value) -> Result<(ExternalServiceConfig, Map<String, Value>)> {
        match args {
            Value::String(name) => {
                let config = self.named(name)?;
                Ok((config, Map::new()))
            }
            Value::Object(map) => {
                let mut params = map.clone();
                params.remove("service");
                params.remove("url");

                if let Some(name) = map.get("service").and_then(|v| v.as_str()) {
                    return Ok((self.named(name)?, params));
                }
                if let Some(url) = map.get("url").and_then(|v| v.as_str()) {
                    return Ok((
                        ExternalServiceConfig {
                            url: url.to_string(),
                            headers: HashMap::new(),
                            timeout_ms: None,
                            retries: 0,
                            cacheable: false,
                            params: HashMap::new(),
                        },
                        params,
                    ));
                }
                Err(Error::point_function(
                    "call",
                    "arguments need a 'service' name or inline 'url'",
                ))
            }
            _ => Err(Error::point_function(
                "call",
                "arguments must be a service name or an object",
            )),
        }
    }

    fn named(&self, name: &str) -> Result<ExternalServiceConfig> {
        self.services.get(name).cloned().ok_or_else(|| {
            Error::point_function("call", format!("unknown external service '{name}'"))
        })
    }

    async fn post_with_retries(
        &self,
        config: &ExternalServiceConfig,
        body: &Value,
    ) -> Result<ExternalVerdict> {
        let timeout = Duration::from_millis(config.timeout_ms.unwrap_or(DEFAULT_CALL_TIMEOUT_MS));
        let mut attempt = 0u32;
        loop {
            match self.post_once(config, body, timeout).await {
                Ok(verdict) => return Ok(verdict),
                Err(err) => {
                    if attempt >= config.retries || !err.is_transient() {
                        return Err(err);
                    }
                    let delay = RETRY_BASE_DELAY_MS * 2u64.pow(attempt);
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn post_once(
        &self,
        config: &ExternalServiceConfig,
        body: &Value,
        timeout: Duration,
    ) -> Result<ExternalVerdict> {
        let mut req = self
            .http
            .post(&config.url)
            .header("content-type", "application/json");
        for (key, value) in &config.headers {
            req = req.header(key.as_str(), expand_env(value).as_str());
        }

        let fut = async {
            let response = req
                .json(body)
                .send()
                .await
                .map_err(|e| Error::Transport(format!("external service: {e}")))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| Error::Transport(format!("external service: {e}")))?;
            if !status.is_success() {
                return Err(Error::provider("external-service", format!("{status}: {text}")));
            }
            serde_json::from_str::<ExternalVerdict>(&text)
                .map_err(|e| Error::Format(format!("bad grader response: {e}")))
        };

        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::timeout(timeout.as_millis() as u64)),
        }
    }
}

/// Build the request body: the graded response and ids, then the service's
/// default params, then the point's own params, all template-substituted.
fn build_body(
    config: &ExternalServiceConfig,
    user_params: &Map<String, Value>,
    ctx: &ExternalCallContext<'_>,
) -> Value {
    let mut body = Map::new();
    body.insert("response".to_string(), Value::from(ctx.response));
    body.insert("modelId".to_string(), Value::from(ctx.model_id));
    body.insert("promptId".to_string(), Value::from(ctx.prompt_id));
    for (key, value) in &config.params {
        body.insert(key.clone(), substitute(value, ctx));
    }
    for (key, value) in user_params {
        body.insert(key.clone(), substitute(value, ctx));
    }
    Value::Object(body)
}

/// Apply `{response}`/`{modelId}`/`{promptId}`/`{messages}`/`{promptText}`
/// placeholders to string values, recursing through containers.
fn substitute(value: &Value, ctx: &ExternalCallContext<'_>) -> Value {
    match value {
        Value::String(s) => {
            let messages_json = serde_json::to_string(ctx.messages).unwrap_or_default();
            let substituted = s
                .replace("{response}", ctx.response)
                .replace("{modelId}", ctx.model_id)
                .replace("{promptId}", ctx.prompt_id)
                .replace("{messages}", &messages_json)
                .replace("{promptText}", ctx.prompt_text);
            Value::String(substituted)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| substitute(v, ctx)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute(v, ctx)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Expand `${ENV_VAR}` references in a header value; unset vars expand to
/// an empty string.
fn expand_env(value: &str) -> String {
    static ENV_REF: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = ENV_REF.get_or_init(|| regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());
    re.replace_all(value, |caps: &regex::Captures<'_>| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}
