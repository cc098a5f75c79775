//! Google Gemini `generateContent` streaming facade (Shape C, §4.5/§4.6/§4.7).

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::cloudllm::attachment::{self, DEFAULT_MAX_BYTES};
use crate::cloudllm::completion::{ChunkError, CompletionChunk, CompletionMessage, CompletionRequest, Role};
use crate::cloudllm::decode::{self, shape_c::ShapeCDecoder};
use crate::cloudllm::error::{FailoverReason, ProviderError};
use crate::cloudllm::provider::{ChunkStream, CompletionProvider, Model};
use crate::cloudllm::retry::{self, RetryOutcome};
use crate::cloudllm::tool_schema;

use super::common::{self, ProviderConfig, ResolvedImage, ResolvedImages, CHUNK_CHANNEL_CAPACITY};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GeminiProvider {
    config: ProviderConfig,
}

impl GeminiProvider {
    pub fn new(config: ProviderConfig) -> Self {
        GeminiProvider { config }
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
            .ok_or_else(|| invalid_request("gemini", "", "no model specified and no default model configured"))
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
impl CompletionProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    fn models(&self) -> Vec<Model> {
        vec![
            Model { id: "gemini-2.5-pro".into(), name: "Gemini 2.5 Pro".into(), context_size: 2_000_000, supports_vision: true },
            Model { id: "gemini-2.5-flash".into(), name: "Gemini 2.5 Flash".into(), context_size: 1_000_000, supports_vision: true },
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
                provider: "gemini".to_string(),
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
        let images = resolve_images(&request, &model).await;
        let contents = convert_messages_gemini(&request, &images);

        let mut body = json!({"contents": contents});
        if let Some(system) = common::system_prompt_text(&request) {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }
        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            let declarations: Vec<Value> = tools.iter().filter_map(tool_schema::to_gemini).collect();
            if !declarations.is_empty() {
                body["tools"] = json!([{"functionDeclarations": declarations}]);
            }
        }
        if request.max_tokens > 0 {
            body["generationConfig"] = json!({"maxOutputTokens": request.max_tokens});
        }

        let url = format!("{}/models/{}:streamGenerateContent?alt=sse", self.base_url(), model);
        let headers = build_headers(&self.config.api_key)?;
        let retry_config = self.config.retry_config();
        let provider = "gemini".to_string();

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(run_producer(provider, model, cancel, body, url, headers, retry_config, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

fn build_headers(api_key: &str) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        reqwest::header::HeaderName::from_static("x-goog-api-key"),
        HeaderValue::from_str(api_key).map_err(|_| invalid_request("gemini", "", "api key contains invalid header bytes"))?,
    );
    headers.insert(reqwest::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
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
                    log::warn!("gemini/{}: dropping attachment {}: {}", model, attachment.url, err);
                }
            }
        }
    }
    images
}

/// §4.5: Gemini tool results become `functionResponse` parts on a user-role content, with the
/// function name recovered from a prior assistant `tool_calls` entry by id, falling back to the
/// synthetic-id scheme (§9 "Tool-call id synthesis") when the id was never recorded.
fn convert_messages_gemini(request: &CompletionRequest, images: &ResolvedImages) -> Vec<Value> {
    let mut out = Vec::new();
    let mut call_names: HashMap<String, String> = HashMap::new();

    for msg in &request.messages {
        match msg.role {
            Role::System => continue,
            Role::User => {
                if msg.is_empty_turn() {
                    continue;
                }
                out.push(user_content(msg, images));
            }
            Role::Assistant => {
                if msg.is_empty_turn() {
                    continue;
                }
                for call in &msg.tool_calls {
                    call_names.insert(call.id.clone(), call.name.clone());
                }
                out.push(assistant_content(msg));
            }
            Role::Tool => {
                if msg.tool_results.is_empty() {
                    continue;
                }
                out.push(tool_result_content(msg, &call_names));
            }
        }
    }

    out
}

fn user_content(msg: &CompletionMessage, images: &ResolvedImages) -> Value {
    let mut parts = vec![json!({"text": msg.content})];
    for attachment in &msg.attachments {
        if let Some(resolved) = images.get(&attachment.url) {
            parts.push(json!({"inlineData": {"mimeType": resolved.mime_type, "data": resolved.data_base64}}));
        }
    }
    json!({"role": "user", "parts": parts})
}

fn assistant_content(msg: &CompletionMessage) -> Value {
    let mut parts = Vec::new();
    if !msg.content.is_empty() {
        parts.push(json!({"text": msg.content}));
    }
    for call in &msg.tool_calls {
        parts.push(json!({"functionCall": {"name": call.name, "args": call.input}}));
    }
    json!({"role": "model", "parts": parts})
}

fn tool_result_content(msg: &CompletionMessage, call_names: &HashMap<String, String>) -> Value {
    let parts: Vec<Value> = msg
        .tool_results
        .iter()
        .map(|result| {
            let name = call_names
                .get(&result.tool_call_id)
                .cloned()
                .or_else(|| decode::function_name_from_synthetic_id(&result.tool_call_id).map(|s| s.to_string()))
                .unwrap_or_default();
            json!({"functionResponse": {"name": name, "response": {"content": result.content}}})
        })
        .collect();
    json!({"role": "user", "parts": parts})
}

fn classify_http_error(provider: &str, model: &str, status: u16, body: &str) -> ProviderError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let error = parsed.as_ref().and_then(|v| v.get("error")).or(parsed.as_ref().and_then(|v| v.get(0)).and_then(|v| v.get("error")));
    if let Some(code) = error.and_then(|e| e.get("status")).and_then(Value::as_str) {
        let message = error.and_then(|e| e.get("message")).and_then(Value::as_str).unwrap_or(body);
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

    let mut decoder = ShapeCDecoder::new();

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
                        let _ = tx.send(decoder.finalize()).await;
                        return;
                    }
                    Some(Ok(event)) => {
                        let data: Value = match serde_json::from_str(&event.data) {
                            Ok(v) => v,
                            Err(_) => continue,
                        };
                        let chunks = decoder.process_response(&data);
                        for chunk in chunks {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        let err = decoder.error(&provider, &model, e);
                        let _ = tx.send(err).await;
                        return;
                    }
                }
            }
        }
    }
}
