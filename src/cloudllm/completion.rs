//! The provider-agnostic completion data model.
//!
//! A [`CompletionRequest`] is the sole input accepted by every vendor facade in
//! [`crate::cloudllm::clients`]; a [`CompletionChunk`] stream is the sole output. Everything in
//! this module is wire-format agnostic — the per-vendor conversion into and out of these shapes
//! lives in `clients::<vendor>` and [`crate::cloudllm::tool_schema`].
//!
//! # Example
//!
//! ```rust
//! use cloudllm::completion::{CompletionMessage, CompletionRequest, Role};
//!
//! let request = CompletionRequest {
//!     model: "claude-haiku-4-5".to_string(),
//!     system: Some("You are terse.".to_string()),
//!     messages: vec![CompletionMessage::user("Hi")],
//!     tools: None,
//!     max_tokens: 0,
//!     enable_thinking: false,
//!     thinking_budget_tokens: None,
//! };
//! assert_eq!(request.messages.len(), 1);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// The role a [`CompletionMessage`] was authored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Primes or constrains assistant behaviour. Never appears as a vendor dialogue turn —
    /// every message converter lifts or drops system messages per [`CompletionRequest::system`]
    /// and the vendor's own system field.
    System,
    /// A human (or tool-relaying) turn.
    User,
    /// A model-authored turn, optionally carrying [`CompletionMessage::tool_calls`].
    Assistant,
    /// A tool-result turn; only [`CompletionMessage::tool_results`] is meaningful.
    Tool,
}

/// One requested (assistant-authored) tool invocation, pending execution by the agent runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned or synthesized call id. MUST match byte-for-byte the `tool_call_id`
    /// a later [`ToolResult`] references (§3 invariant 3).
    pub id: String,
    /// Tool name, matching one of the [`ToolDefinition`]s sent in the request.
    pub name: String,
    /// Raw JSON arguments, verbatim as assembled from the vendor stream.
    pub input: serde_json::Value,
}

/// An image attachment produced by tool execution and relayed back as part of a tool result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultImage {
    /// Raw image bytes, base64-encoded for wire transport.
    pub data_base64: String,
    /// MIME type, e.g. `"image/png"`.
    pub mime_type: String,
}

/// The outcome of one tool execution, carried on a `Role::Tool` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Must match the [`ToolCall::id`] it answers.
    pub tool_call_id: String,
    /// Tool output, rendered as text.
    pub content: String,
    /// Whether the tool execution itself failed (distinct from a conversion failure).
    pub is_error: bool,
    /// Images returned by the tool (e.g. a screenshot from a computer-use tool).
    #[serde(default)]
    pub images: Vec<ToolResultImage>,
}

/// Where an [`Attachment`]'s bytes live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Currently only `"image"` is recognised end to end; other kinds are accepted but will be
    /// dropped by every message converter per §4.5 ("unsupported attachments are silently
    /// dropped").
    #[serde(rename = "type")]
    pub kind: String,
    /// `https://…`, `data:<mime>;base64,…`, or `file://…`.
    pub url: String,
    /// Declared MIME type, if the caller knows it up front.
    pub mime_type: Option<String>,
    /// Original filename, used as a last-resort MIME guess.
    pub filename: Option<String>,
}

impl Attachment {
    /// Construct an image attachment from a URL (`https://`, `data:`, or `file://`).
    pub fn image(url: impl Into<String>) -> Self {
        Attachment {
            kind: "image".to_string(),
            url: url.into(),
            mime_type: None,
            filename: None,
        }
    }
}

/// One tool definition, forwarded to [`crate::cloudllm::tool_schema`] for vendor-specific
/// rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name as it will appear in the vendor's `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// Raw JSON-Schema bytes describing the accepted parameters.
    pub parameters_schema: serde_json::Value,
    /// Carried through from [`Tool::computer_use_config`]; presence opts the request into the
    /// Anthropic computer-use beta path (§6).
    #[serde(default)]
    pub computer_use_config: Option<ComputerUseConfig>,
}

/// Optional computer-use configuration a [`Tool`] may expose.
///
/// Presence of a single such tool in a request opts that request into the Anthropic beta path
/// (§6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ComputerUseConfig {
    pub display_width_px: u32,
    pub display_height_px: u32,
    pub display_number: Option<u32>,
}

/// The read-only surface of a tool that the core needs: enough to build a vendor tool schema.
/// Execution is the agent runtime's responsibility and is deliberately absent from this trait
/// (§3, §6): the core only ever calls `name`/`description`/`schema`.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// Raw JSON-Schema bytes for the tool's parameters.
    fn schema(&self) -> serde_json::Value;
    /// Opts the request into the Anthropic computer-use beta path when present.
    fn computer_use_config(&self) -> Option<ComputerUseConfig> {
        None
    }
}

impl From<&dyn Tool> for ToolDefinition {
    fn from(tool: &dyn Tool) -> Self {
        ToolDefinition {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            parameters_schema: tool.schema(),
            computer_use_config: tool.computer_use_config(),
        }
    }
}

/// One turn in a [`CompletionRequest`]'s conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: Role,
    /// May be empty; empty-content messages with no tool_calls/tool_results/attachments are
    /// illegal on the wire for most vendors and are dropped by every message converter (§4.5).
    #[serde(default)]
    pub content: String,
    /// Only meaningful when `role == Role::Assistant`.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Only meaningful when `role == Role::Tool`.
    #[serde(default)]
    pub tool_results: Vec<ToolResult>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl CompletionMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn plain(role: Role, content: impl Into<String>) -> Self {
        CompletionMessage {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            attachments: Vec::new(),
        }
    }

    /// True when this message carries no content, tool calls, tool results, or attachments —
    /// the shape every message converter must refuse to emit on the wire (§4.5).
    pub fn is_empty_turn(&self) -> bool {
        self.content.is_empty()
            && self.tool_calls.is_empty()
            && self.tool_results.is_empty()
            && self.attachments.is_empty()
    }
}

/// The sole input to a [`crate::cloudllm::provider::CompletionProvider::complete`] call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// May be empty, in which case the provider falls back to its configured default model.
    #[serde(default)]
    pub model: String,
    pub system: Option<String>,
    pub messages: Vec<CompletionMessage>,
    pub tools: Option<Vec<ToolDefinition>>,
    /// 0 means "use the vendor/provider default".
    #[serde(default)]
    pub max_tokens: u64,
    #[serde(default)]
    pub enable_thinking: bool,
    pub thinking_budget_tokens: Option<u64>,
}

impl CompletionRequest {
    /// Minimal request builder for tests and simple callers.
    pub fn new(model: impl Into<String>, messages: Vec<CompletionMessage>) -> Self {
        CompletionRequest {
            model: model.into(),
            system: None,
            messages,
            tools: None,
            max_tokens: 0,
            enable_thinking: false,
            thinking_budget_tokens: None,
        }
    }
}

/// End-of-turn token accounting.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A normalized, incremental output unit (§3). Exactly one terminal chunk (`Done` or `Error`)
/// ends a turn, always last (invariant 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionChunk {
    /// Non-empty text delta.
    Text { text: String },
    /// Reasoning-trace delta.
    Thinking { text: String },
    /// Start of a reasoning-trace block.
    ThinkingStart,
    /// End of a reasoning-trace block.
    ThinkingEnd,
    /// A *complete* tool call — partial tool-call chunks are never exposed (invariant 2).
    ToolCall { call: ToolCall },
    /// End-of-turn prompt token count.
    InputTokens { count: u64 },
    /// End-of-turn completion token count.
    OutputTokens { count: u64 },
    /// Terminal: the turn completed normally.
    Done { usage: Usage },
    /// Terminal: the turn failed. Carries the classified error, or a cancellation marker.
    Error { error: ChunkError },
}

impl CompletionChunk {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CompletionChunk::Done { .. } | CompletionChunk::Error { .. })
    }
}

/// The payload of a terminal [`CompletionChunk::Error`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChunkError {
    /// A classified provider failure.
    Provider(crate::cloudllm::error::ProviderError),
    /// The ambient context was cancelled mid-stream.
    Cancelled,
}

impl fmt::Display for ChunkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkError::Provider(e) => write!(f, "{}", e),
            ChunkError::Cancelled => write!(f, "completion cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_turn_detection() {
        let msg = CompletionMessage::plain(Role::Assistant, "");
        assert!(msg.is_empty_turn());

        let mut with_call = msg.clone();
        with_call.tool_calls.push(ToolCall {
            id: "call_1".into(),
            name: "x".into(),
            input: serde_json::json!({}),
        });
        assert!(!with_call.is_empty_turn());
    }

    #[test]
    fn chunk_terminal_classification() {
        assert!(CompletionChunk::Done { usage: Usage::default() }.is_terminal());
        assert!(CompletionChunk::Error { error: ChunkError::Cancelled }.is_terminal());
        assert!(!CompletionChunk::Text { text: "hi".into() }.is_terminal());
    }

    #[test]
    fn request_builder_defaults() {
        let req = CompletionRequest::new("gpt-4.1", vec![CompletionMessage::user("hi")]);
        assert_eq!(req.max_tokens, 0);
        assert!(req.tools.is_none());
    }
}
