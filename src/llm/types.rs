//! Shared request, response, and stream types for the client dispatcher.

use std::collections::HashMap;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    /// Wire name used by the OpenAI-style APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Reasoning effort request, mapped to a thinking budget when a provider
/// only takes token budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    /// Token budget used when only an effort level is given.
    pub fn budget_tokens(&self) -> u32 {
        match self {
            Self::Low => 1024,
            Self::Medium => 4096,
            Self::High => 8192,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Options for a single chat/completion call, uniform across adapters.
#[derive(Debug, Clone, Default)]
pub struct ApiCallOptions {
    /// Full model id, e.g. `openai:gpt-4o-mini` or a registered custom id
    pub model_id: String,
    /// Conversation turns
    pub messages: Vec<ChatMessage>,
    /// System prompt, kept separate from the turns
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    /// Per-call deadline; adapters enforce this cooperatively
    pub timeout_ms: Option<u64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub presence_penalty: Option<f64>,
    pub frequency_penalty: Option<f64>,
    pub stop: Option<Vec<String>>,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Thinking budget in tokens; wins over `reasoning_effort` when both set
    pub thinking_budget: Option<u32>,
    /// Passthrough parameters applied to the request body last
    pub custom_parameters: HashMap<String, Value>,
}

impl ApiCallOptions {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    /// Resolved thinking budget: explicit budget first, then effort mapping.
    pub fn resolved_thinking_budget(&self) -> Option<u32> {
        self.thinking_budget
            .or_else(|| self.reasoning_effort.map(|e| e.budget_tokens()))
    }
}

/// A structured tool invocation extracted from a model response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

/// Token usage statistics, when the provider reports them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Normalized non-streaming response from any adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletion {
    /// Final assistant text
    pub text: String,
    /// Reasoning/thinking content, surfaced separately from the answer
    pub reasoning: Option<String>,
    /// Structured tool invocations, if the provider returned any
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<TokenUsage>,
    /// Model name echoed by the provider, if present
    pub model: Option<String>,
}

/// One element of a streaming response.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Assistant content delta
    Content(String),
    /// Reasoning/thinking delta
    Reasoning(String),
    /// Terminal error; no further chunks follow
    Error(String),
}

/// Lazy sequence of stream chunks. Not restartable; cancellation is
/// cooperative by dropping the stream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_builders() {
        let msg = ChatMessage::user("Hello");
        assert_eq!(msg.role, ChatRole::User);
        assert_eq!(msg.content, "Hello");
        assert_eq!(ChatMessage::assistant("x").role, ChatRole::Assistant);
        assert_eq!(ChatMessage::system("x").role, ChatRole::System);
    }

    #[test]
    fn effort_budget_mapping() {
        assert_eq!(ReasoningEffort::Low.budget_tokens(), 1024);
        assert_eq!(ReasoningEffort::Medium.budget_tokens(), 4096);
        assert_eq!(ReasoningEffort::High.budget_tokens(), 8192);
    }

    #[test]
    fn explicit_thinking_budget_wins_over_effort() {
        let mut opts = ApiCallOptions::new("openai:gpt-4o-mini");
        opts.reasoning_effort = Some(ReasoningEffort::High);
        opts.thinking_budget = Some(2048);
        assert_eq!(opts.resolved_thinking_budget(), Some(2048));

        opts.thinking_budget = None;
        assert_eq!(opts.resolved_thinking_budget(), Some(8192));
    }

    #[test]
    fn options_builder() {
        let opts = ApiCallOptions::new("anthropic:claude-x")
            .with_system("be brief")
            .with_message(ChatMessage::user("hi"))
            .with_temperature(0.3)
            .with_max_tokens(256)
            .with_timeout_ms(10_000);

        assert_eq!(opts.model_id, "anthropic:claude-x");
        assert_eq!(opts.system_prompt.as_deref(), Some("be brief"));
        assert_eq!(opts.messages.len(), 1);
        assert_eq!(opts.temperature, Some(0.3));
        assert_eq!(opts.max_tokens, Some(256));
        assert_eq!(opts.timeout_ms, Some(10_000));
    }
}
