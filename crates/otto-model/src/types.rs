// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Conversation messages ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Message content: either a plain string or a list of typed text parts.
/// Providers accept both shapes; the runtime emits strings unless a caller
/// explicitly builds parts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<TextPart>),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(t),
            Self::Parts(parts) if parts.len() == 1 => Some(&parts[0].text),
            Self::Parts(_) => None,
        }
    }

    /// Character length of all text in this content (for token estimation).
    pub fn char_len(&self) -> usize {
        match self {
            Self::Text(t) => t.len(),
            Self::Parts(parts) => parts.iter().map(|p| p.text.len()).sum(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPart {
    #[serde(rename = "type")]
    pub part_type: String,
    pub text: String,
}

/// One tool call as carried on an assistant message (function-calling shape).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: String,
    pub function: FunctionCall,
}

impl ToolCallPayload {
    pub fn function_call(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            call_type: "function".into(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    /// JSON-encoded argument object
    pub arguments: String,
}

/// A single message in the conversation history, in the provider wire shape:
/// `{role, content?, tool_calls?, tool_call_id?, name?}`.
///
/// Invariant: a `tool` message's `tool_call_id` matches an id inside a
/// preceding assistant message's `tool_calls`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Participant name, for providers that distinguish named senders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(MessageContent::Text(text.into())),
            tool_calls: None,
            tool_call_id: None,
            name: None,
        }
    }

    /// Assistant message carrying tool calls.  `text` becomes the content
    /// when non-empty (models may emit prose alongside tool calls).
    pub fn assistant_with_tool_calls(text: &str, calls: Vec<ToolCallPayload>) -> Self {
        Self {
            role: Role::Assistant,
            content: if text.is_empty() {
                None
            } else {
                Some(MessageContent::Text(text.to_string()))
            },
            tool_calls: Some(calls),
            tool_call_id: None,
            name: None,
        }
    }

    pub fn tool_result(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(MessageContent::Text(content.into())),
            tool_calls: None,
            tool_call_id: Some(id.into()),
            name: None,
        }
    }

    /// Plain text of this message, if it is a single text body.
    pub fn as_text(&self) -> Option<&str> {
        self.content.as_ref().and_then(|c| c.as_text())
    }

    /// Character count of everything this message will put on the wire.
    /// Used by token estimators.
    pub fn char_len(&self) -> usize {
        let content = self.content.as_ref().map(|c| c.char_len()).unwrap_or(0);
        let calls: usize = self
            .tool_calls
            .iter()
            .flatten()
            .map(|tc| tc.function.name.len() + tc.function.arguments.len())
            .sum();
        content + calls
    }

    /// `true` when this assistant message carries at least one tool call.
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }
}

// ─── Accumulated response blocks ─────────────────────────────────────────────

/// A completed content block in an assembled response.
///
/// Serialization is tag-driven: only the fields of the active variant appear
/// on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse {
        id: String,
        name: String,
        /// Parsed JSON arguments.  When the model emitted arguments that do
        /// not parse as JSON, this is `{"_raw": <original string>}`.
        input: Value,
    },
}

/// Why the model stopped emitting.
///
/// Canonical set plus a passthrough for reasons this runtime does not model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    #[serde(untagged)]
    Other(String),
}

impl StopReason {
    /// Translate an OpenAI-style `finish_reason` into the canonical set.
    pub fn from_finish_reason(reason: &str) -> Self {
        match reason {
            "stop" => Self::EndTurn,
            "tool_calls" => Self::ToolUse,
            "length" => Self::MaxTokens,
            "stop_sequence" => Self::StopSequence,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Token usage for one turn (or a running total).  Additive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Tokens served from the provider's prompt cache (read hit).
    pub cache_read_tokens: u64,
    /// Tokens written into the provider's prompt cache (creation).
    pub cache_creation_tokens: u64,
}

impl Usage {
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_creation_tokens += other.cache_creation_tokens;
    }

    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// ─── Wire request ────────────────────────────────────────────────────────────

/// Tool definition in the function-calling schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub def_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn function(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            def_type: "function".into(),
            function: FunctionDefinition {
                name: name.into(),
                description: description.into(),
                parameters,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// A completion request in the provider wire shape.  The client forces
/// `stream = true` and `stream_options.include_usage = true` before sending.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    pub stream_options: StreamOptions,
    /// Provider-specific fields merged verbatim into the request body
    /// (thinking budget, beta flags, user metadata).  Only populated when
    /// there is anything to send; an empty map flattens to nothing.
    #[serde(flatten)]
    pub extra_body: serde_json::Map<String, Value>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            tools: Vec::new(),
            stream: true,
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: Vec::new(),
            stream_options: StreamOptions { include_usage: true },
            extra_body: serde_json::Map::new(),
        }
    }
}

// ─── Wire response chunks ────────────────────────────────────────────────────

/// One SSE data frame from the model: `{id, object, created, model,
/// choices[], usage?}`.  Unknown fields are ignored; absent fields default so
/// that partial frames (usage-only, delta-only) all deserialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: u64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Chain-of-thought delta.  `reasoning_content` is the common field name
    /// (llama.cpp, DeepSeek, Qwen); `reasoning` is the aggregator variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

impl ChunkDelta {
    /// The reasoning text of this delta, preferring `reasoning_content`.
    pub fn reasoning_text(&self) -> Option<&str> {
        self.reasoning_content
            .as_deref()
            .filter(|s| !s.is_empty())
            .or(self.reasoning.as_deref().filter(|s| !s.is_empty()))
    }
}

/// An incremental fragment of one tool call.  `index` identifies which
/// logical call the fragment belongs to; id and name arrive only on the
/// first fragment for that index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallDelta {
    #[serde(default)]
    pub index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default)]
    pub function: FunctionDelta,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens_details: Option<PromptTokensDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
}

impl WireUsage {
    /// Translate provider usage into the canonical shape.
    pub fn to_usage(&self) -> Usage {
        Usage {
            input_tokens: self.prompt_tokens,
            output_tokens: self.completion_tokens,
            cache_read_tokens: self
                .prompt_tokens_details
                .as_ref()
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
            cache_creation_tokens: self.cache_creation_input_tokens.unwrap_or(0),
        }
    }
}

// Chunk constructors used by the scripted mock client and by tests.
impl StreamChunk {
    pub fn text_delta(text: impl Into<String>) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta: ChunkDelta {
                    content: Some(text.into()),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    pub fn thinking_delta(text: impl Into<String>) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta: ChunkDelta {
                    reasoning_content: Some(text.into()),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    pub fn tool_call_delta(
        index: u32,
        id: Option<&str>,
        name: Option<&str>,
        arguments: &str,
    ) -> Self {
        Self {
            choices: vec![ChunkChoice {
                delta: ChunkDelta {
                    tool_calls: Some(vec![ToolCallDelta {
                        index,
                        id: id.map(Into::into),
                        call_type: id.map(|_| "function".to_string()),
                        function: FunctionDelta {
                            name: name.map(Into::into),
                            arguments: Some(arguments.to_string()),
                        },
                    }]),
                    ..Default::default()
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    pub fn finish(reason: &str) -> Self {
        Self {
            choices: vec![ChunkChoice {
                finish_reason: Some(reason.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    pub fn usage(input: u64, output: u64) -> Self {
        Self {
            usage: Some(WireUsage {
                prompt_tokens: input,
                completion_tokens: output,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Message construction ──────────────────────────────────────────────────

    #[test]
    fn user_message_sets_role_and_text() {
        let m = ChatMessage::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.as_text(), Some("hello"));
        assert!(m.tool_calls.is_none());
    }

    #[test]
    fn tool_result_carries_correlation_id() {
        let m = ChatMessage::tool_result("call_1", "output");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(m.as_text(), Some("output"));
    }

    #[test]
    fn assistant_with_tool_calls_omits_empty_content() {
        let m = ChatMessage::assistant_with_tool_calls(
            "",
            vec![ToolCallPayload::function_call("c1", "shell", "{}")],
        );
        assert!(m.content.is_none());
        assert!(m.has_tool_calls());
    }

    #[test]
    fn assistant_with_tool_calls_keeps_text() {
        let m = ChatMessage::assistant_with_tool_calls(
            "running it now",
            vec![ToolCallPayload::function_call("c1", "shell", "{}")],
        );
        assert_eq!(m.as_text(), Some("running it now"));
    }

    #[test]
    fn char_len_counts_content_and_calls() {
        let m = ChatMessage::assistant_with_tool_calls(
            "abcd", // 4
            vec![ToolCallPayload::function_call("c1", "shell", r#"{"x":1}"#)], // 5 + 7
        );
        assert_eq!(m.char_len(), 16);
    }

    // ── Wire serialization: no field bleed-through ────────────────────────────

    #[test]
    fn user_message_serializes_without_tool_fields() {
        let json = serde_json::to_value(ChatMessage::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hi");
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("tool_call_id").is_none());
    }

    #[test]
    fn tool_message_serializes_with_correlation_id() {
        let json = serde_json::to_value(ChatMessage::tool_result("c9", "out")).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "c9");
    }

    #[test]
    fn content_block_serialization_is_tagged() {
        let block = ContentBlock::Text { text: "hi".into() };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "text");
        assert_eq!(json["text"], "hi");
        assert!(json.get("thinking").is_none());
        assert!(json.get("input").is_none());
    }

    #[test]
    fn tool_use_block_round_trips() {
        let block = ContentBlock::ToolUse {
            id: "c1".into(),
            name: "shell".into(),
            input: serde_json::json!({"command": "ls"}),
        };
        let json = serde_json::to_string(&block).unwrap();
        let back: ContentBlock = serde_json::from_str(&json).unwrap();
        assert_eq!(back, block);
    }

    // ── StopReason translation ────────────────────────────────────────────────

    #[test]
    fn finish_reason_stop_maps_to_end_turn() {
        assert_eq!(StopReason::from_finish_reason("stop"), StopReason::EndTurn);
    }

    #[test]
    fn finish_reason_tool_calls_maps_to_tool_use() {
        assert_eq!(
            StopReason::from_finish_reason("tool_calls"),
            StopReason::ToolUse
        );
    }

    #[test]
    fn finish_reason_length_maps_to_max_tokens() {
        assert_eq!(
            StopReason::from_finish_reason("length"),
            StopReason::MaxTokens
        );
    }

    #[test]
    fn unknown_finish_reason_passes_through() {
        assert_eq!(
            StopReason::from_finish_reason("content_filter"),
            StopReason::Other("content_filter".into())
        );
    }

    // ── Usage ─────────────────────────────────────────────────────────────────

    #[test]
    fn usage_adds_all_fields() {
        let mut a = Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 3,
            cache_creation_tokens: 1,
        };
        a.add(&Usage {
            input_tokens: 1,
            output_tokens: 2,
            cache_read_tokens: 4,
            cache_creation_tokens: 8,
        });
        assert_eq!(a.input_tokens, 11);
        assert_eq!(a.output_tokens, 7);
        assert_eq!(a.cache_read_tokens, 7);
        assert_eq!(a.cache_creation_tokens, 9);
    }

    #[test]
    fn wire_usage_translates_cached_tokens() {
        let w = WireUsage {
            prompt_tokens: 200,
            completion_tokens: 40,
            prompt_tokens_details: Some(PromptTokensDetails { cached_tokens: 150 }),
            cache_creation_input_tokens: None,
        };
        let u = w.to_usage();
        assert_eq!(u.input_tokens, 200);
        assert_eq!(u.cache_read_tokens, 150);
        assert_eq!(u.cache_creation_tokens, 0);
    }

    // ── CompletionRequest serialization ───────────────────────────────────────

    #[test]
    fn request_omits_empty_optionals() {
        let req = CompletionRequest::new("m", vec![ChatMessage::user("q")]);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["stream_options"]["include_usage"], true);
        assert!(json.get("tools").is_none());
        assert!(json.get("max_tokens").is_none());
        assert!(json.get("stop").is_none());
    }

    #[test]
    fn request_extra_body_is_flattened() {
        let mut req = CompletionRequest::new("m", vec![ChatMessage::user("q")]);
        req.extra_body
            .insert("reasoning_format".into(), serde_json::json!("deepseek"));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["reasoning_format"], "deepseek");
    }

    #[test]
    fn request_includes_tool_definitions() {
        let mut req = CompletionRequest::new("m", vec![ChatMessage::user("q")]);
        req.tools.push(ToolDefinition::function(
            "shell",
            "run a command",
            serde_json::json!({"type": "object"}),
        ));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["tools"][0]["type"], "function");
        assert_eq!(json["tools"][0]["function"]["name"], "shell");
    }

    // ── StreamChunk parsing ───────────────────────────────────────────────────

    #[test]
    fn chunk_with_text_delta_parses() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"id":"1","object":"chat.completion.chunk","created":0,"model":"m",
                "choices":[{"index":0,"delta":{"content":"hi"}}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hi"));
    }

    #[test]
    fn usage_only_chunk_parses() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":3}}"#,
        )
        .unwrap();
        assert_eq!(chunk.usage.unwrap().prompt_tokens, 7);
    }

    #[test]
    fn reasoning_text_prefers_reasoning_content() {
        let delta = ChunkDelta {
            reasoning_content: Some("preferred".into()),
            reasoning: Some("fallback".into()),
            ..Default::default()
        };
        assert_eq!(delta.reasoning_text(), Some("preferred"));
    }

    #[test]
    fn reasoning_text_empty_string_is_none() {
        let delta = ChunkDelta {
            reasoning_content: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(delta.reasoning_text(), None);
    }
}
