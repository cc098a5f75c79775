//! The external-facing contract every vendor facade implements (§4.7, §6).
//!
//! An agent runtime depends on nothing below this module: `CompletionProvider`,
//! [`crate::cloudllm::completion::Tool`], and [`Model`] are the whole surface.

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use tokio_util::sync::CancellationToken;

use crate::cloudllm::completion::{CompletionChunk, CompletionRequest};
use crate::cloudllm::error::ProviderError;

/// One model a provider exposes (§6 `models()`).
#[derive(Debug, Clone)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub context_size: u64,
    pub supports_vision: bool,
}

/// The output of a `complete` call: a stream of normalized chunks terminated by exactly one
/// `Done` or `Error` (§3 invariant 1). Boxed so every vendor facade can return the same concrete
/// type regardless of how its producer is implemented internally.
pub type ChunkStream = Pin<Box<dyn Stream<Item = CompletionChunk> + Send>>;

/// The per-vendor facade contract (§4.7, §6).
///
/// `complete` returns quickly: validation, message/tool conversion, and request construction all
/// happen before the stream is handed back, so a non-retryable failure at any of those stages is
/// an `Err` here rather than a terminal chunk on the stream (§7). Everything discovered once the
/// vendor stream is open (transport errors, malformed events, cancellation) surfaces instead as a
/// terminal [`CompletionChunk::Error`] on the returned stream.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Stable lowercase identifier, e.g. `"anthropic"`, `"openai"`, `"bedrock"`.
    fn name(&self) -> &str;

    /// The models this provider instance knows about.
    fn models(&self) -> Vec<Model>;

    /// Whether this provider can carry `tools` in a [`CompletionRequest`].
    fn supports_tools(&self) -> bool;

    /// Validate, convert, open the vendor stream (through the retry engine), and return a
    /// channel of normalized chunks. `cancel` is the ambient context (§5): cancelling it must
    /// cause the producer to emit exactly one terminal error chunk and release the vendor
    /// stream.
    async fn complete(
        &self,
        cancel: CancellationToken,
        request: CompletionRequest,
    ) -> Result<ChunkStream, ProviderError>;
}
