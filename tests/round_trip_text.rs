//! Seed scenario 1: a text-only turn against a mock Anthropic-shaped SSE stream, exercised
//! through the public registry/provider surface rather than opening a real socket.

use std::sync::Arc;

use async_trait::async_trait;
use cloudllm::clients::common::ProviderConfig;
use cloudllm::{
    ChunkStream, CompletionChunk, CompletionMessage, CompletionProvider, CompletionRequest, Model,
    ProviderError, ProviderRegistry,
};
use tokio_util::sync::CancellationToken;

/// Wraps the real Claude decoder state machine but feeds it a fixed event sequence instead of an
/// HTTP byte stream, matching the mock stream described in the seed scenario.
struct MockAnthropicStream;

#[async_trait]
impl CompletionProvider for MockAnthropicStream {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn models(&self) -> Vec<Model> {
        vec![Model {
            id: "claude-3-haiku".into(),
            name: "Claude 3 Haiku".into(),
            context_size: 200_000,
            supports_vision: true,
        }]
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        _cancel: CancellationToken,
        _request: CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        use cloudllm::cloudllm::decode::shape_a::ShapeADecoder;
        use serde_json::json;

        let mut decoder = ShapeADecoder::new("anthropic", "claude-3-haiku");
        let events = vec![
            ("message_start", json!({"message": {"usage": {"input_tokens": 10}}})),
            ("content_block_start", json!({"content_block": {"type": "text"}})),
            ("content_block_delta", json!({"delta": {"type": "text_delta", "text": "Hello"}})),
            ("content_block_delta", json!({"delta": {"type": "text_delta", "text": " world"}})),
            ("content_block_stop", json!({})),
            ("message_stop", json!({})),
        ];
        let chunks: Vec<CompletionChunk> = events
            .into_iter()
            .flat_map(|(ty, data)| decoder.handle_event(ty, &data))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

#[tokio::test]
async fn round_trip_text_yields_two_text_chunks_then_done() {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(MockAnthropicStream));
    let provider = registry.get("anthropic").expect("provider registered");

    let request = CompletionRequest::new("claude-3-haiku", vec![CompletionMessage::user("Hi")]);
    let mut stream = provider
        .complete(CancellationToken::new(), request)
        .await
        .expect("complete should succeed");

    use futures_util::StreamExt;
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk);
    }

    assert_eq!(chunks.len(), 3);
    assert!(matches!(&chunks[0], CompletionChunk::Text { text } if text == "Hello"));
    assert!(matches!(&chunks[1], CompletionChunk::Text { text } if text == " world"));
    assert!(matches!(chunks[2], CompletionChunk::Done { .. }));

    // ProviderConfig is part of the same public surface every facade is built from.
    let _config = ProviderConfig::new("sk-test").with_default_model("claude-3-haiku");
}
