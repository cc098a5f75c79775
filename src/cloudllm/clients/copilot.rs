//! Copilot-compatible gateway facade (Shape B, reuses [`super::openai`]'s producer and decoder
//! wiring).
//!
//! Talks to a local Copilot-proxy gateway that mirrors the OpenAI Chat Completions wire shape.
//! Defaults to `http://localhost:3000/v1` with a 128k context window per §6 "Configuration
//! surface per provider".

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::cloudllm::attachment::{self, DEFAULT_MAX_BYTES};
use crate::cloudllm::completion::CompletionRequest;
use crate::cloudllm::error::{FailoverReason, ProviderError};
use crate::cloudllm::provider::{ChunkStream, CompletionProvider, Model};

use super::common::{self, ProviderConfig, ResolvedImage, ResolvedImages, CHUNK_CHANNEL_CAPACITY};
use super::openai;

const DEFAULT_BASE_URL: &str = "http://localhost:3000/v1";
const DEFAULT_CONTEXT_SIZE: u64 = 128_000;

pub struct CopilotProvider {
    config: ProviderConfig,
}

impl CopilotProvider {
    pub fn new(config: ProviderConfig) -> Self {
        CopilotProvider { config }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    fn resolve_model(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        if !request.model.is_empty() {
            return Ok(request.model.clone());
        }
        self.config
            .default_model
            .clone()
            .ok_or_else(|| invalid_request("copilot", "", "no model specified and no default model configured"))
    }
}

fn invalid_request(provider: &str, model: &str, message: impl Into<String>) -> ProviderError {
    ProviderError {
        provider: provider.to_string(),
        model: model.to_string(),
        status: None,
        code: None,
        message: message.into(),
        request_id: None,
        reason: FailoverReason::InvalidRequest,
        cause: None,
    }
}

#[async_trait]
impl CompletionProvider for CopilotProvider {
    fn name(&self) -> &str {
        "copilot"
    }

    fn models(&self) -> Vec<Model> {
        vec![
            Model { id: "gpt-4o".into(), name: "Copilot GPT-4o".into(), context_size: DEFAULT_CONTEXT_SIZE, supports_vision: true },
            Model { id: "claude-sonnet-4.5".into(), name: "Copilot Claude Sonnet 4.5".into(), context_size: DEFAULT_CONTEXT_SIZE, supports_vision: true },
        ]
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        cancel: CancellationToken,
        request: CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        if self.config.api_key.trim().is_empty() {
            return Err(ProviderError {
                provider: self.name().to_string(),
                model: request.model.clone(),
                status: None,
                code: None,
                message: "empty API key".to_string(),
                request_id: None,
                reason: FailoverReason::Auth,
                cause: None,
            });
        }

        let model = self.resolve_model(&request)?;
        let images = resolve_images(&request, self.name(), &model).await;
        let messages = common::convert_messages_openai_style(&request, &images);

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            body["tools"] = Value::Array(common::convert_tools_openai_style(tools));
        }
        if request.max_tokens > 0 {
            body["max_completion_tokens"] = json!(request.max_tokens);
        }

        let url = format!("{}/chat/completions", self.base_url());
        let headers = openai::build_headers(&self.config.api_key)?;
        let retry_config = self.config.retry_config();
        let provider = self.name().to_string();

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(openai::run_producer(provider, model, cancel, body, url, headers, retry_config, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn needs_local_resolution(url: &str) -> bool {
    !url.starts_with("http://") && !url.starts_with("https://")
}

async fn resolve_images(request: &CompletionRequest, provider: &str, model: &str) -> ResolvedImages {
    let mut images = ResolvedImages::new();
    let client = common::shared_http_client();
    for msg in &request.messages {
        for attachment in &msg.attachments {
            if !needs_local_resolution(&attachment.url) || images.contains_key(&attachment.url) {
                continue;
            }
            match attachment::resolve(attachment, client, DEFAULT_MAX_BYTES).await {
                Ok(resolved) => {
                    images.insert(
                        attachment.url.clone(),
                        ResolvedImage {
                            data_base64: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &resolved.bytes),
                            mime_type: resolved.mime_type,
                        },
                    );
                }
                Err(err) => {
                    log::warn!("{}/{}: dropping attachment {}: {}", provider, model, attachment.url, err);
                }
            }
        }
    }
    images
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_base_url_is_local_gateway() {
        let provider = CopilotProvider::new(ProviderConfig::new("dummy-token"));
        assert_eq!(provider.base_url(), "http://localhost:3000/v1");
    }

    #[test]
    fn default_models_report_128k_context() {
        let provider = CopilotProvider::new(ProviderConfig::new("dummy-token"));
        assert!(provider.models().iter().all(|m| m.context_size == 128_000));
    }

    #[tokio::test]
    async fn empty_api_key_is_rejected_before_any_network_call() {
        let provider = CopilotProvider::new(ProviderConfig::new(""));
        let request = CompletionRequest::new("gpt-4o", vec![crate::cloudllm::completion::CompletionMessage::user("hi")]);
        let err = provider.complete(CancellationToken::new(), request).await.unwrap_err();
        assert_eq!(err.reason, FailoverReason::Auth);
    }
}
