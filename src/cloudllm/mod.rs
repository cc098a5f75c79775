//! Provider-agnostic streaming LLM client core (§1 "Purpose & Scope").
//!
//! [`completion`] defines the wire-independent request/response types every facade in
//! [`clients`] speaks; [`provider`] defines the [`CompletionProvider`] trait itself.
//! [`error`] and [`retry`] are the shared failure taxonomy and retry engine; [`tool_schema`] and
//! [`attachment`] handle per-vendor tool-schema rendering and attachment resolution. [`decode`]
//! holds the three wire-shape decoders shared across facades. [`registry`] and [`telemetry`] are
//! the runtime lookup table and observability hooks. [`tape`] is the record/replay subsystem.

pub mod attachment;
pub mod clients;
pub mod completion;
pub mod decode;
pub mod error;
pub mod provider;
pub mod registry;
pub mod retry;
pub mod tape;
pub mod telemetry;
pub mod tool_schema;

pub use completion::{
    Attachment as CompletionAttachment, ChunkError, CompletionChunk, CompletionMessage, CompletionRequest,
    ComputerUseConfig, Role, Tool, ToolCall, ToolDefinition, ToolResult, ToolResultImage, Usage,
};
pub use error::{FailoverReason, ProviderError};
pub use provider::{ChunkStream, CompletionProvider, Model};
pub use registry::ProviderRegistry;
pub use retry::{BackoffStrategy, RetryConfig, RetryOutcome};
pub use tape::{Recorder, ReplayMode, ReplayTools, Replayer, Tape};
pub use telemetry::{NoopTelemetry, TelemetryHook};
