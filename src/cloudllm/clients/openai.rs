//! OpenAI Chat Completions facade (Shape B, §4.5/§4.6/§4.7).
//!
//! Also the base implementation Azure, OpenRouter, and Copilot-proxy facades build on: only the
//! base URL, auth header, and default model list differ between them (§4.7).

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::cloudllm::attachment::{self, DEFAULT_MAX_BYTES};
use crate::cloudllm::completion::{ChunkError, CompletionChunk, CompletionRequest};
use crate::cloudllm::decode::shape_b::ShapeBDecoder;
use crate::cloudllm::error::{FailoverReason, ProviderError};
use crate::cloudllm::provider::{ChunkStream, CompletionProvider, Model};
use crate::cloudllm::retry::{self, RetryOutcome};

use super::common::{self, ProviderConfig, ResolvedImage, ResolvedImages, CHUNK_CHANNEL_CAPACITY};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAIProvider {
    config: ProviderConfig,
}

impl OpenAIProvider {
    pub fn new(config: ProviderConfig) -> Self {
        OpenAIProvider { config }
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
            .ok_or_else(|| invalid_request("openai", "", "no model specified and no default model configured"))
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
impl CompletionProvider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn models(&self) -> Vec<Model> {
        vec![
            Model { id: "gpt-5.1".into(), name: "GPT-5.1".into(), context_size: 400_000, supports_vision: true },
            Model { id: "gpt-5.1-mini".into(), name: "GPT-5.1 Mini".into(), context_size: 400_000, supports_vision: true },
            Model { id: "gpt-4.1".into(), name: "GPT-4.1".into(), context_size: 128_000, supports_vision: true },
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
        let headers = build_headers(&self.config.api_key)?;
        let retry_config = self.config.retry_config();
        let provider = self.name().to_string();

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(run_producer(provider, model, cancel, body, url, headers, retry_config, tx));

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

pub(super) fn build_headers(api_key: &str) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| invalid_request("openai", "", "api key contains invalid header bytes"))?,
    );
    headers.insert(reqwest::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

fn classify_http_error(provider: &str, model: &str, status: u16, body: &str) -> ProviderError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    if let Some(code) = parsed.as_ref().and_then(|v| v.get("error")).and_then(|e| e.get("code")).and_then(Value::as_str) {
        let message = parsed
            .as_ref()
            .and_then(|v| v.get("error"))
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or(body);
        return ProviderError::from_vendor_code(provider, model, code, message).with_status(status);
    }
    ProviderError::from_status(provider, model, status, body)
}

#[allow(clippy::too_many_arguments)]
pub(super) async fn run_producer(
    provider: String,
    model: String,
    cancel: CancellationToken,
    body: Value,
    url: String,
    headers: HeaderMap,
    retry_config: crate::cloudllm::retry::RetryConfig,
    tx: mpsc::Sender<CompletionChunk>,
) {
    let client = common::shared_http_client();

    let open_result = retry::retry(
        &retry_config,
        &cancel,
        |err: &ProviderError| err.is_retryable(),
        |_attempt| {
            let client = client.clone();
            let url = url.clone();
            let headers = headers.clone();
            let body = body.clone();
            let provider = provider.clone();
            let model = model.clone();
            async move {
                let response = client
                    .post(&url)
                    .headers(headers)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| ProviderError::from_cause(&provider, &model, Some(Box::new(e))))?;
                let status = response.status();
                if status.is_success() {
                    Ok(response)
                } else {
                    let text = response.text().await.unwrap_or_default();
                    Err(classify_http_error(&provider, &model, status.as_u16(), &text))
                }
            }
        },
    )
    .await;

    let response = match open_result {
        Ok(response) => response,
        Err(RetryOutcome::Failed(err)) => {
            let _ = tx.send(CompletionChunk::Error { error: ChunkError::Provider(err) }).await;
            return;
        }
        Err(RetryOutcome::Cancelled) => {
            let _ = tx.send(CompletionChunk::Error { error: ChunkError::Cancelled }).await;
            return;
        }
    };

    let mut decoder = ShapeBDecoder::new();

    use eventsource_stream::Eventsource;
    use futures_util::StreamExt;
    let mut events = response.bytes_stream().eventsource();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(CompletionChunk::Error { error: ChunkError::Cancelled }).await;
                return;
            }
            next = events.next() => {
                match next {
                    None => {
                        for chunk in decoder.finalize_on_eof() {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }
                    Some(Ok(event)) => {
                        if event.data.trim() == "[DONE]" {
                            for chunk in decoder.finalize_on_eof() {
                                if tx.send(chunk).await.is_err() {
                                    return;
                                }
                            }
                            return;
                        }
                        let data: Value = match serde_json::from_str(&event.data) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        if let Some(chunks) = handle_chunk(&mut decoder, &provider, &model, &data) {
                            for chunk in chunks {
                                if tx.send(chunk).await.is_err() {
                                    return;
                                }
                            }
                            if decoder.is_done() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let err = ProviderError::from_cause(&provider, &model, Some(Box::new(e)));
                        let _ = tx.send(CompletionChunk::Error { error: ChunkError::Provider(err) }).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Feed one decoded SSE data payload into the shared [`ShapeBDecoder`], returning the chunks it
/// produced (§4.6 Shape B). Shared between OpenAI, Azure, OpenRouter, and Copilot since they all
/// emit the same Chat Completions streaming body shape.
pub(super) fn handle_chunk(
    decoder: &mut ShapeBDecoder,
    provider: &str,
    model: &str,
    data: &Value,
) -> Option<Vec<CompletionChunk>> {
    if let Some(error) = data.get("error") {
        let message = error.get("message").and_then(Value::as_str).unwrap_or("unknown error").to_string();
        return Some(vec![decoder.handle_transport_error(provider, model, std::io::Error::new(std::io::ErrorKind::Other, message))]);
    }

    let mut out = Vec::new();

    if let Some(usage) = data.get("usage") {
        let prompt = usage.get("prompt_tokens").and_then(Value::as_u64);
        let completion = usage.get("completion_tokens").and_then(Value::as_u64);
        decoder.handle_usage(prompt, completion);
    }

    let choice = data.get("choices").and_then(|c| c.get(0));
    let choice = match choice {
        Some(c) => c,
        None => return Some(out),
    };

    if let Some(delta) = choice.get("delta") {
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if let Some(chunk) = decoder.handle_text_delta(text) {
                out.push(chunk);
            }
        }
        if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for tc in tool_calls {
                let index = tc.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                let id = tc.get("id").and_then(Value::as_str);
                let function = tc.get("function");
                let name = function.and_then(|f| f.get("name")).and_then(Value::as_str);
                let arguments = function.and_then(|f| f.get("arguments")).and_then(Value::as_str);
                decoder.handle_tool_call_delta(index, id, name, arguments);
            }
        }
    }

    if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
        out.extend(decoder.handle_finish_reason(reason));
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_delta_chunk_surfaces_text() {
        let mut decoder = ShapeBDecoder::new();
        let data = json!({"choices": [{"delta": {"content": "Hello"}}]});
        let out = handle_chunk(&mut decoder, "openai", "gpt-4.1", &data).unwrap();
        assert!(matches!(&out[0], CompletionChunk::Text { text } if text == "Hello"));
    }

    #[test]
    fn tool_call_delta_chunks_assemble_across_three_events() {
        let mut decoder = ShapeBDecoder::new();
        let d1 = json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "id": "call_1", "function": {"name": "get_weather"}}]}}]});
        let d2 = json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "{\"city\":"}}]}}]});
        let d3 = json!({"choices": [{"delta": {"tool_calls": [{"index": 0, "function": {"arguments": "\"London\"}"}}]}}]});
        let finish = json!({"choices": [{"delta": {}, "finish_reason": "tool_calls"}]});
        handle_chunk(&mut decoder, "openai", "gpt-4.1", &d1);
        handle_chunk(&mut decoder, "openai", "gpt-4.1", &d2);
        handle_chunk(&mut decoder, "openai", "gpt-4.1", &d3);
        let out = handle_chunk(&mut decoder, "openai", "gpt-4.1", &finish).unwrap();
        assert_eq!(out.len(), 1);
        match &out[0] {
            CompletionChunk::ToolCall { call } => {
                assert_eq!(call.id, "call_1");
                assert_eq!(call.input, json!({"city": "London"}));
            }
            other => panic!("unexpected chunk {:?}", other),
        }
    }

    #[test]
    fn mid_stream_error_object_terminates_decoder() {
        let mut decoder = ShapeBDecoder::new();
        let data = json!({"error": {"message": "upstream overloaded"}});
        let out = handle_chunk(&mut decoder, "openai", "gpt-4.1", &data).unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], CompletionChunk::Error { .. }));
        assert!(decoder.is_done());
    }

    #[test]
    fn classify_http_error_prefers_vendor_code() {
        let body = r#"{"error":{"code":"insufficient_quota","message":"add a payment method"}}"#;
        let err = classify_http_error("openai", "gpt-4.1", 429, body);
        assert_eq!(err.reason, FailoverReason::Billing);
    }
}
