//! Provider-agnostic streaming LLM client core: a uniform chunk contract, message/tool
//! conversion, a shared retry/failover taxonomy, and a record/replay tape for deterministic
//! testing, across Anthropic, OpenAI, Gemini, Bedrock, Azure, OpenRouter, Ollama, and
//! Copilot-compatible back-ends.
//!
//! Vendor facades live under [`cloudllm::clients`]; most callers only need the re-exports below
//! plus a facade constructor (e.g. [`cloudllm::clients::claude::ClaudeProvider`]).

pub mod cloudllm;

pub use cloudllm::clients;
pub use cloudllm::{
    ChunkError, ChunkStream, CompletionChunk, CompletionMessage, CompletionProvider, CompletionRequest,
    FailoverReason, Model, ProviderError, ProviderRegistry, Recorder, ReplayMode, ReplayTools, Replayer, Role,
    Tape, Tool, ToolCall, ToolDefinition, ToolResult, Usage,
};
