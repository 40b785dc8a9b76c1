//! LLM client dispatcher: uniform request/response contract over multiple
//! chat/completion protocols.
//!
//! Model ids of the form `<provider>:<model-name>` route to a lazily-built
//! protocol adapter; custom user-defined HTTP endpoints register under their
//! own ids and bypass provider parsing. Every adapter exposes a
//! non-streaming call, a streaming call yielding
//! `{content | reasoning | error}` chunks, and (where the family supports
//! it) an embedding call.

mod adapters;
mod dispatch;
mod sse;
mod types;

pub use adapters::{
    AdapterConfig, ChatAdapter, HttpChatAdapter, PromptFormat, ProviderFamily, WireFormat,
    DEFAULT_TIMEOUT_MS,
};
pub use dispatch::{
    parse_model_id, ClientDispatcher, CustomModelDefinition, ParsedModelId, ProviderId,
};
pub use sse::{parse_anthropic_line, parse_google_line, parse_openai_line};
pub use types::{
    ApiCallOptions, ChatCompletion, ChatMessage, ChatRole, ChunkStream, ReasoningEffort,
    StreamChunk, TokenUsage, ToolCall,
};
