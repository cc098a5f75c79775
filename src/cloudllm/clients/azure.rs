//! Azure OpenAI facade (Shape B, reuses [`super::openai`]'s producer and decoder wiring).
//!
//! Azure's Chat Completions body shape matches OpenAI's; only the auth header (`api-key` instead
//! of a bearer token), URL shape (deployment + api-version query param), and the absence of a
//! sensible default base URL differ (§6 "Configuration surface per provider").

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
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

const DEFAULT_API_VERSION: &str = "2024-06-01";

pub struct AzureProvider {
    config: ProviderConfig,
    api_version: String,
}

impl AzureProvider {
    pub fn new(config: ProviderConfig) -> Self {
        AzureProvider { config, api_version: DEFAULT_API_VERSION.to_string() }
    }

    pub fn with_api_version(mut self, api_version: impl Into<String>) -> Self {
        self.api_version = api_version.into();
        self
    }

    fn resolve_deployment(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        if !request.model.is_empty() {
            return Ok(request.model.clone());
        }
        self.config
            .default_model
            .clone()
            .ok_or_else(|| invalid_request("azure", "", "no deployment specified and no default model configured"))
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
impl CompletionProvider for AzureProvider {
    fn name(&self) -> &str {
        "azure"
    }

    fn models(&self) -> Vec<Model> {
        // Azure OpenAI is deployment-based: the caller names a deployment (via `request.model` or
        // `default_model`) that maps to whatever model the Azure resource was provisioned with.
        // There is no fixed model catalog to enumerate here.
        Vec::new()
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
                provider: "azure".to_string(),
                model: request.model.clone(),
                status: None,
                code: None,
                message: "empty API key".to_string(),
                request_id: None,
                reason: FailoverReason::Auth,
                cause: None,
            });
        }

        let base_url = self
            .config
            .base_url
            .clone()
            .ok_or_else(|| invalid_request("azure", "", "azure requires an explicit resource base_url"))?;
        let deployment = self.resolve_deployment(&request)?;

        let images = resolve_images(&request, "azure", &deployment).await;
        let messages = common::convert_messages_openai_style(&request, &images);
        let mut body = json!({
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

        let url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            base_url.trim_end_matches('/'),
            deployment,
            self.api_version
        );
        let headers = build_headers(&self.config.api_key)?;
        let retry_config = self.config.retry_config();

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(openai::run_producer("azure".to_string(), deployment, cancel, body, url, headers, retry_config, tx));

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

fn build_headers(api_key: &str) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::HeaderName::from_static("api-key"),
        HeaderValue::from_str(api_key).map_err(|_| invalid_request("azure", "", "api key contains invalid header bytes"))?,
    );
    headers.insert(reqwest::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_base_url_is_a_synchronous_error() {
        let provider = AzureProvider::new(ProviderConfig::new("sk-test"));
        let request = CompletionRequest::new(
            "gpt-4o-deployment",
            vec![crate::cloudllm::completion::CompletionMessage::user("hi")],
        );
        let err = provider.complete(CancellationToken::new(), request).await.unwrap_err();
        assert_eq!(err.reason, FailoverReason::InvalidRequest);
    }

    #[tokio::test]
    async fn empty_api_key_is_rejected_before_base_url_check() {
        let provider = AzureProvider::new(ProviderConfig::new(""));
        let request = CompletionRequest::new(
            "gpt-4o-deployment",
            vec![crate::cloudllm::completion::CompletionMessage::user("hi")],
        );
        let err = provider.complete(CancellationToken::new(), request).await.unwrap_err();
        assert_eq!(err.reason, FailoverReason::Auth);
    }
}
