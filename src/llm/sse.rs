//! SSE (Server-Sent Events) line parsers for streaming adapters.
//!
//! Each provider family frames streaming deltas as `data:` lines. The
//! parsers here turn one line into zero or more [`StreamChunk`] values;
//! adapters feed them from a byte stream split on newlines.
//!
//! OpenAI-style frames look like:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hello"}}]}
//! data: [DONE]
//! ```

use serde::Deserialize;

use crate::error::{Error, Result};

use super::types::StreamChunk;

/// End-of-stream sentinel used by the OpenAI-compatible APIs.
const DONE_SENTINEL: &str = "[DONE]";

/// Extract the payload of a `data:` line, or `None` for boundaries,
/// comments, and `event:`/`id:`/`retry:` framing lines.
fn data_payload(line: &str) -> Option<&str> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let payload = line.strip_prefix("data:")?.trim_start();
    if payload.is_empty() {
        None
    } else {
        Some(payload)
    }
}

// OpenAI-compatible delta frames.

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    choices: Vec<OpenAiDeltaChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDeltaChoice {
    #[serde(default)]
    delta: OpenAiDeltaContent,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OpenAiDeltaContent {
    #[serde(default)]
    content: Option<String>,
    /// Reasoning delta name used by OpenRouter and several compat servers
    #[serde(default, alias = "reasoning")]
    reasoning_content: Option<String>,
}

/// Parse one OpenAI-compatible SSE line. Handles both chat deltas
/// (`choices[0].delta.content`) and completions deltas (`choices[0].text`).
pub fn parse_openai_line(line: &str) -> Result<Vec<StreamChunk>> {
    let Some(payload) = data_payload(line) else {
        return Ok(vec![]);
    };
    if payload == DONE_SENTINEL {
        return Ok(vec![]);
    }

    let delta: OpenAiDelta = serde_json::from_str(payload)
        .map_err(|e| Error::Format(format!("bad stream delta: {e}")))?;

    let mut chunks = Vec::new();
    if let Some(choice) = delta.choices.first() {
        if let Some(reasoning) = choice
            .delta
            .reasoning_content
            .as_ref()
            .filter(|r| !r.is_empty())
        {
            chunks.push(StreamChunk::Reasoning(reasoning.clone()));
        }
        let text = choice.delta.content.as_ref().or(choice.text.as_ref());
        if let Some(text) = text.filter(|t| !t.is_empty()) {
            chunks.push(StreamChunk::Content(text.clone()));
        }
    }
    Ok(chunks)
}

// Anthropic event frames. Only `content_block_delta` events carry text;
// message_start/message_delta/ping frames are skipped.

#[derive(Debug, Deserialize)]
struct AnthropicEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    delta: Option<AnthropicEventDelta>,
}

#[derive(Debug, Deserialize)]
struct AnthropicEventDelta {
    #[serde(rename = "type", default)]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

/// Parse one Anthropic SSE line.
pub fn parse_anthropic_line(line: &str) -> Result<Vec<StreamChunk>> {
    let Some(payload) = data_payload(line) else {
        return Ok(vec![]);
    };

    let event: AnthropicEvent = serde_json::from_str(payload)
        .map_err(|e| Error::Format(format!("bad stream delta: {e}")))?;

    if event.event_type == "error" {
        return Ok(vec![StreamChunk::Error("provider stream error".to_string())]);
    }
    if event.event_type != "content_block_delta" {
        return Ok(vec![]);
    }

    let Some(delta) = event.delta else {
        return Ok(vec![]);
    };
    let chunk = match delta.delta_type.as_str() {
        "text_delta" => delta.text.filter(|t| !t.is_empty()).map(StreamChunk::Content),
        "thinking_delta" => delta
            .thinking
            .filter(|t| !t.is_empty())
            .map(StreamChunk::Reasoning),
        _ => None,
    };
    Ok(chunk.into_iter().collect())
}

// Google frames: each data line is a full GenerateContentResponse slice.

#[derive(Debug, Deserialize)]
struct GoogleFrame {
    #[serde(default)]
    candidates: Vec<GoogleFrameCandidate>,
}

#[derive(Debug, Deserialize)]
struct GoogleFrameCandidate {
    #[serde(default)]
    content: Option<GoogleFrameContent>,
}

#[derive(Debug, Deserialize)]
struct GoogleFrameContent {
    #[serde(default)]
    parts: Vec<GoogleFramePart>,
}

#[derive(Debug, Deserialize)]
struct GoogleFramePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
}

/// Parse one Google `streamGenerateContent?alt=sse` line.
pub fn parse_google_line(line: &str) -> Result<Vec<StreamChunk>> {
    let Some(payload) = data_payload(line) else {
        return Ok(vec![]);
    };

    let frame: GoogleFrame = serde_json::from_str(payload)
        .map_err(|e| Error::Format(format!("bad stream delta: {e}")))?;

    let mut chunks = Vec::new();
    if let Some(content) = frame.candidates.first().and_then(|c| c.content.as_ref()) {
        for part in &content.parts {
            if let Some(text) = part.text.as_ref().filter(|t| !t.is_empty()) {
                if part.thought.unwrap_or(false) {
                    chunks.push(StreamChunk::Reasoning(text.clone()));
                } else {
                    chunks.push(StreamChunk::Content(text.clone()));
                }
            }
        }
    }
    Ok(chunks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_framing_lines() {
        assert!(parse_openai_line("").unwrap().is_empty());
        assert!(parse_openai_line(": keep-alive").unwrap().is_empty());
        assert!(parse_openai_line("event: message").unwrap().is_empty());
        assert!(parse_openai_line("data:").unwrap().is_empty());
        assert!(parse_openai_line("data: [DONE]").unwrap().is_empty());
    }

    #[test]
    fn openai_content_delta() {
        let line = r#"data: {"choices":[{"index":0,"delta":{"content":"Hello"}}]}"#;
        assert_eq!(
            parse_openai_line(line).unwrap(),
            vec![StreamChunk::Content("Hello".to_string())]
        );
    }

    #[test]
    fn openai_reasoning_delta() {
        let line = r#"data: {"choices":[{"delta":{"reasoning_content":"thinking..."}}]}"#;
        assert_eq!(
            parse_openai_line(line).unwrap(),
            vec![StreamChunk::Reasoning("thinking...".to_string())]
        );
    }

    #[test]
    fn openai_completions_text_delta() {
        let line = r#"data: {"choices":[{"text":"raw"}]}"#;
        assert_eq!(
            parse_openai_line(line).unwrap(),
            vec![StreamChunk::Content("raw".to_string())]
        );
    }

    #[test]
    fn openai_role_only_delta_is_empty() {
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert!(parse_openai_line(line).unwrap().is_empty());
    }

    #[test]
    fn openai_bad_json_is_format_error() {
        assert!(matches!(
            parse_openai_line("data: {nope"),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn anthropic_text_and_thinking() {
        let text =
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        assert_eq!(
            parse_anthropic_line(text).unwrap(),
            vec![StreamChunk::Content("Hi".to_string())]
        );

        let thinking = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#;
        assert_eq!(
            parse_anthropic_line(thinking).unwrap(),
            vec![StreamChunk::Reasoning("hmm".to_string())]
        );

        let ping = r#"data: {"type":"ping"}"#;
        assert!(parse_anthropic_line(ping).unwrap().is_empty());
    }

    #[test]
    fn google_parts() {
        let line = r#"data: {"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b","thought":true}],"role":"model"}}]}"#;
        assert_eq!(
            parse_google_line(line).unwrap(),
            vec![
                StreamChunk::Content("a".to_string()),
                StreamChunk::Reasoning("b".to_string()),
            ]
        );
    }

    #[test]
    fn full_openai_stream() {
        let stream = [
            r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#,
            "",
            r#"data: {"choices":[{"delta":{"content":" world"}}]}"#,
            "",
            "data: [DONE]",
        ];
        let mut all = Vec::new();
        for line in &stream {
            all.extend(parse_openai_line(line).unwrap());
        }
        assert_eq!(
            all,
            vec![
                StreamChunk::Content("Hello".to_string()),
                StreamChunk::Content(" world".to_string()),
            ]
        );
    }
}
