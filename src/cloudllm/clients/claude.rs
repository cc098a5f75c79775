//! Anthropic Messages API facade (Shape A, §4.5/§4.6/§4.7).

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::cloudllm::attachment::{self, DEFAULT_MAX_BYTES};
use crate::cloudllm::completion::{
    ChunkError, CompletionChunk, CompletionMessage, CompletionRequest, Role, ToolDefinition,
};
use crate::cloudllm::decode::shape_a::ShapeADecoder;
use crate::cloudllm::error::ProviderError;
use crate::cloudllm::provider::{ChunkStream, CompletionProvider, Model};
use crate::cloudllm::retry::{self, RetryOutcome};
use crate::cloudllm::tool_schema;

use super::common::{self, ProviderConfig, ResolvedImage, ResolvedImages, CHUNK_CHANNEL_CAPACITY};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct ClaudeProvider {
    config: ProviderConfig,
}

impl ClaudeProvider {
    pub fn new(config: ProviderConfig) -> Self {
        ClaudeProvider { config }
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
            .ok_or_else(|| invalid_request("anthropic", "", "no model specified and no default model configured"))
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
        reason: crate::cloudllm::error::FailoverReason::InvalidRequest,
        cause: None,
    }
}

/// Presence of a computer-use tool opts a request into the Anthropic beta header (§6).
fn has_computer_use_tool(tools: &[ToolDefinition]) -> bool {
    tools.iter().any(|t| t.computer_use_config.is_some())
}

#[async_trait]
impl CompletionProvider for ClaudeProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn models(&self) -> Vec<Model> {
        vec![
            Model { id: "claude-opus-4-5".into(), name: "Claude Opus 4.5".into(), context_size: 200_000, supports_vision: true },
            Model { id: "claude-sonnet-4-5".into(), name: "Claude Sonnet 4.5".into(), context_size: 200_000, supports_vision: true },
            Model { id: "claude-haiku-4-5".into(), name: "Claude Haiku 4.5".into(), context_size: 200_000, supports_vision: true },
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
                provider: "anthropic".to_string(),
                model: request.model.clone(),
                status: None,
                code: None,
                message: "empty API key".to_string(),
                request_id: None,
                reason: crate::cloudllm::error::FailoverReason::Auth,
                cause: None,
            });
        }

        let model = self.resolve_model(&request)?;

        let tools = match &request.tools {
            Some(tools) if !tools.is_empty() => {
                let mut converted = Vec::with_capacity(tools.len());
                for tool in tools {
                    converted.push(
                        tool_schema::to_anthropic(tool).map_err(|msg| invalid_request("anthropic", &model, msg))?,
                    );
                }
                Some(converted)
            }
            _ => None,
        };

        let images = resolve_images(&request, &model).await;
        let system = common::system_prompt_text(&request);
        let messages = convert_messages_anthropic(&request, &images);

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
            "max_tokens": if request.max_tokens > 0 { request.max_tokens } else { 4096 },
        });
        if let Some(system) = system {
            body["system"] = Value::String(system);
        }
        if let Some(tools) = tools {
            body["tools"] = Value::Array(tools);
        }
        if request.enable_thinking {
            let mut thinking = json!({"type": "enabled"});
            if let Some(budget) = request.thinking_budget_tokens {
                thinking["budget_tokens"] = json!(budget);
            }
            body["thinking"] = thinking;
        }

        let url = format!("{}/v1/messages", self.base_url());
        let headers = build_headers(&self.config.api_key, has_computer_use_tool(request.tools.as_deref().unwrap_or(&[])))?;
        let retry_config = self.config.retry_config();
        let provider = "anthropic".to_string();

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(run_producer(provider, model, cancel, body, url, headers, retry_config, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

async fn resolve_images(request: &CompletionRequest, model: &str) -> ResolvedImages {
    let mut images = ResolvedImages::new();
    let client = common::shared_http_client();
    for msg in &request.messages {
        for attachment in &msg.attachments {
            if images.contains_key(&attachment.url) {
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
                    log::warn!("anthropic/{}: dropping attachment {}: {}", model, attachment.url, err);
                }
            }
        }
    }
    images
}

fn build_headers(api_key: &str, computer_use: bool) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("x-api-key"),
        HeaderValue::from_str(api_key).map_err(|_| invalid_request("anthropic", "", "api key contains invalid header bytes"))?,
    );
    headers.insert(HeaderName::from_static("anthropic-version"), HeaderValue::from_static(ANTHROPIC_VERSION));
    headers.insert(reqwest::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if computer_use {
        headers.insert(
            HeaderName::from_static("anthropic-beta"),
            HeaderValue::from_static("computer-use-2025-01-24"),
        );
    }
    Ok(headers)
}

/// §4.5: system lifted out separately; empty turns dropped; assistant tool_calls become
/// `tool_use` blocks; tool results become `tool_result` blocks on a user-role message.
fn convert_messages_anthropic(request: &CompletionRequest, images: &ResolvedImages) -> Vec<Value> {
    let mut out = Vec::new();

    for msg in &request.messages {
        match msg.role {
            Role::System => continue,
            Role::User => {
                if msg.is_empty_turn() {
                    continue;
                }
                out.push(user_message(msg, images));
            }
            Role::Assistant => {
                if msg.is_empty_turn() {
                    continue;
                }
                out.push(assistant_message(msg));
            }
            Role::Tool => {
                if msg.tool_results.is_empty() {
                    continue;
                }
                out.push(tool_result_message(msg));
            }
        }
    }

    out
}

fn user_message(msg: &CompletionMessage, images: &ResolvedImages) -> Value {
    let image_blocks: Vec<Value> = msg
        .attachments
        .iter()
        .filter_map(|att| images.get(&att.url))
        .map(|resolved| {
            json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": resolved.mime_type,
                    "data": resolved.data_base64,
                }
            })
        })
        .collect();

    if image_blocks.is_empty() {
        return json!({"role": "user", "content": msg.content});
    }

    let mut content = vec![json!({"type": "text", "text": msg.content})];
    content.extend(image_blocks);
    json!({"role": "user", "content": content})
}

fn assistant_message(msg: &CompletionMessage) -> Value {
    if msg.tool_calls.is_empty() {
        return json!({"role": "assistant", "content": msg.content});
    }

    let mut content = Vec::new();
    if !msg.content.is_empty() {
        content.push(json!({"type": "text", "text": msg.content}));
    }
    for call in &msg.tool_calls {
        content.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.input,
        }));
    }
    json!({"role": "assistant", "content": content})
}

fn tool_result_message(msg: &CompletionMessage) -> Value {
    let content: Vec<Value> = msg
        .tool_results
        .iter()
        .map(|result| {
            if result.images.is_empty() {
                json!({
                    "type": "tool_result",
                    "tool_use_id": result.tool_call_id,
                    "content": result.content,
                    "is_error": result.is_error,
                })
            } else {
                let mut blocks = vec![json!({"type": "text", "text": result.content})];
                for image in &result.images {
                    blocks.push(json!({
                        "type": "image",
                        "source": {"type": "base64", "media_type": image.mime_type, "data": image.data_base64},
                    }));
                }
                json!({
                    "type": "tool_result",
                    "tool_use_id": result.tool_call_id,
                    "content": blocks,
                    "is_error": result.is_error,
                })
            }
        })
        .collect();
    json!({"role": "user", "content": content})
}

fn classify_http_error(provider: &str, model: &str, status: u16, body: &str) -> ProviderError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    if let Some(code) = parsed.as_ref().and_then(|v| v.get("error")).and_then(|e| e.get("type")).and_then(Value::as_str) {
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
async fn run_producer(
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

    let mut decoder = ShapeADecoder::new(provider.clone(), model.clone());

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
                        let data: Value = serde_json::from_str(&event.data).unwrap_or(Value::Null);
                        let chunks = decoder.handle_event(&event.event, &data);
                        let done = decoder.is_done();
                        for chunk in chunks {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        if done {
                            return;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::completion::{Attachment, ToolCall, ToolResult};

    #[test]
    fn system_messages_are_never_dialogue_turns() {
        let mut request = CompletionRequest::new("claude-haiku-4-5", vec![
            CompletionMessage::system("be terse"),
            CompletionMessage::user("hi"),
        ]);
        request.system = Some("also be kind".into());
        let out = convert_messages_anthropic(&request, &ResolvedImages::new());
        assert!(out.iter().all(|m| m["role"] != "system"));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["role"], "user");
    }

    #[test]
    fn assistant_tool_calls_become_tool_use_blocks() {
        let mut msg = CompletionMessage::assistant("");
        msg.tool_calls.push(ToolCall { id: "toolu_1".into(), name: "get_weather".into(), input: json!({"city": "Paris"}) });
        let request = CompletionRequest::new("claude-haiku-4-5", vec![msg]);
        let out = convert_messages_anthropic(&request, &ResolvedImages::new());
        assert_eq!(out[0]["content"][0]["type"], "tool_use");
        assert_eq!(out[0]["content"][0]["id"], "toolu_1");
    }

    #[test]
    fn tool_results_become_user_role_tool_result_blocks() {
        let mut msg = CompletionMessage::plain(Role::Tool, "");
        msg.tool_results.push(ToolResult { tool_call_id: "toolu_1".into(), content: "sunny".into(), is_error: false, images: vec![] });
        let request = CompletionRequest::new("claude-haiku-4-5", vec![msg]);
        let out = convert_messages_anthropic(&request, &ResolvedImages::new());
        assert_eq!(out[0]["role"], "user");
        assert_eq!(out[0]["content"][0]["type"], "tool_result");
        assert_eq!(out[0]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn vision_attachment_embeds_resolved_base64() {
        let mut msg = CompletionMessage::user("what is this?");
        msg.attachments.push(Attachment::image("https://example.com/cat.png"));
        let mut images = ResolvedImages::new();
        images.insert("https://example.com/cat.png".to_string(), ResolvedImage { data_base64: "Zm9v".into(), mime_type: "image/png".into() });
        let request = CompletionRequest::new("claude-haiku-4-5", vec![msg]);
        let out = convert_messages_anthropic(&request, &images);
        assert_eq!(out[0]["content"][1]["type"], "image");
        assert_eq!(out[0]["content"][1]["source"]["data"], "Zm9v");
    }

    #[test]
    fn unresolved_attachment_is_dropped_silently() {
        let mut msg = CompletionMessage::user("what is this?");
        msg.attachments.push(Attachment::image("https://example.com/cat.png"));
        let request = CompletionRequest::new("claude-haiku-4-5", vec![msg]);
        let out = convert_messages_anthropic(&request, &ResolvedImages::new());
        assert_eq!(out[0]["content"], json!("what is this?"));
    }

    #[test]
    fn classify_http_error_prefers_vendor_code_over_status() {
        let body = r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#;
        let err = classify_http_error("anthropic", "claude-haiku-4-5", 429, body);
        assert_eq!(err.reason, crate::cloudllm::error::FailoverReason::RateLimit);
        assert_eq!(err.code.as_deref(), Some("rate_limit_error"));
    }

    #[test]
    fn empty_api_key_is_rejected_before_any_network_call() {
        let config = ProviderConfig::new("");
        assert!(config.api_key.trim().is_empty());
    }

    #[test]
    fn computer_use_tool_is_detected_from_tool_definition() {
        let plain = ToolDefinition {
            name: "get_weather".into(),
            description: "Looks up current weather".into(),
            parameters_schema: json!({"type": "object", "properties": {}}),
            computer_use_config: None,
        };
        assert!(!has_computer_use_tool(&[plain.clone()]));

        let computer_use = ToolDefinition {
            computer_use_config: Some(crate::cloudllm::completion::ComputerUseConfig {
                display_width_px: 1024,
                display_height_px: 768,
                display_number: None,
            }),
            ..plain
        };
        assert!(has_computer_use_tool(&[computer_use]));
    }

    #[test]
    fn build_headers_sets_beta_header_only_when_computer_use_present() {
        let without = build_headers("sk-test", false).unwrap();
        assert!(!without.contains_key("anthropic-beta"));

        let with = build_headers("sk-test", true).unwrap();
        assert_eq!(with.get("anthropic-beta").unwrap(), "computer-use-2025-01-24");
    }
}
