//! OpenRouter facade (Shape B, reuses [`super::openai`]'s producer and decoder wiring).
//!
//! OpenRouter speaks the same Chat Completions wire shape as OpenAI itself, fronting many
//! upstream vendors behind one endpoint and a bearer token (§4.7, §6 "Configuration surface per
//! provider").

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

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

pub struct OpenRouterProvider {
    config: ProviderConfig,
}

impl OpenRouterProvider {
    pub fn new(config: ProviderConfig) -> Self {
        OpenRouterProvider { config }
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
            .ok_or_else(|| invalid_request("openrouter", "", "no model specified and no default model configured"))
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
impl CompletionProvider for OpenRouterProvider {
    fn name(&self) -> &str {
        "openrouter"
    }

    fn models(&self) -> Vec<Model> {
        vec![
            Model { id: "anthropic/claude-sonnet-4.5".into(), name: "Claude Sonnet 4.5 (via OpenRouter)".into(), context_size: 200_000, supports_vision: true },
            Model { id: "openai/gpt-5.1".into(), name: "GPT-5.1 (via OpenRouter)".into(), context_size: 400_000, supports_vision: true },
            Model { id: "google/gemini-2.5-pro".into(), name: "Gemini 2.5 Pro (via OpenRouter)".into(), context_size: 1_000_000, supports_vision: true },
            Model { id: "meta-llama/llama-3.3-70b-instruct".into(), name: "Llama 3.3 70B (via OpenRouter)".into(), context_size: 128_000, supports_vision: false },
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
    fn default_base_url_is_the_public_openrouter_endpoint() {
        let provider = OpenRouterProvider::new(ProviderConfig::new("sk-test"));
        assert_eq!(provider.base_url(), DEFAULT_BASE_URL);
    }

    #[test]
    fn custom_base_url_overrides_the_default() {
        let provider = OpenRouterProvider::new(ProviderConfig::new("sk-test").with_base_url("https://self-hosted.example/api/v1"));
        assert_eq!(provider.base_url(), "https://self-hosted.example/api/v1");
    }

    #[tokio::test]
    async fn empty_api_key_is_rejected_before_any_network_call() {
        let provider = OpenRouterProvider::new(ProviderConfig::new(""));
        let request = CompletionRequest::new("openai/gpt-5.1", vec![crate::cloudllm::completion::CompletionMessage::user("hi")]);
        let err = provider.complete(CancellationToken::new(), request).await.unwrap_err();
        assert_eq!(err.reason, FailoverReason::Auth);
    }

    #[tokio::test]
    async fn missing_model_without_a_default_is_a_synchronous_error() {
        let provider = OpenRouterProvider::new(ProviderConfig::new("sk-test"));
        let request = CompletionRequest::new("", vec![crate::cloudllm::completion::CompletionMessage::user("hi")]);
        let err = provider.complete(CancellationToken::new(), request).await.unwrap_err();
        assert_eq!(err.reason, FailoverReason::InvalidRequest);
    }
}
