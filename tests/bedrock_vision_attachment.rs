//! Seed scenario 6: an oversized image attachment on the Bedrock path fails synchronously, before
//! any producer starts, classified as non-retryable — unlike every other vendor's silent-drop
//! policy. Gated behind the `bedrock` feature since it needs the AWS SDK types.

#![cfg(feature = "bedrock")]

use cloudllm::clients::bedrock::{BedrockConfig, BedrockProvider};
use cloudllm::{CompletionMessage, CompletionProvider, CompletionRequest};
use tokio_util::sync::CancellationToken;

fn oversized_data_url() -> String {
    // One byte over the 20 MiB cap once base64-decoded; base64 expands by ~4/3, so encode enough.
    let raw = vec![0u8; 21 * 1024 * 1024];
    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &raw);
    format!("data:image/png;base64,{}", encoded)
}

#[tokio::test]
async fn oversized_attachment_rejects_synchronously_before_any_producer_starts() {
    let provider = BedrockProvider::new(BedrockConfig::new().with_default_model("anthropic.claude-sonnet-4-5-20250929-v1:0")).await;

    let mut message = CompletionMessage::user("what is in this image?");
    message.attachments.push(cloudllm::cloudllm::completion::Attachment::image(oversized_data_url()));
    let request = CompletionRequest::new("anthropic.claude-sonnet-4-5-20250929-v1:0", vec![message]);

    let result = provider.complete(CancellationToken::new(), request).await;
    let err = result.expect_err("oversized attachment must fail before the stream opens");
    assert!(!err.is_retryable());
}
