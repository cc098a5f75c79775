//! Ollama facade: NDJSON decoder over `/api/chat` (§4.6 "Ollama collapses into Shape B").
//!
//! Ollama emits one complete JSON object per line rather than SSE `data:` frames, and each line
//! carries the assistant message's full accumulated `tool_calls` array rather than an
//! index-keyed fragment, so a tool call can appear verbatim on more than one line. Calls are
//! deduped by `(name, arguments)` rather than by id, since Ollama never issues one (§9 open
//! question: two distinct calls to the same tool with identical arguments in one turn collapse
//! into one — left as specified, flagged rather than worked around).

use std::collections::HashSet;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::cloudllm::attachment::{self, DEFAULT_MAX_BYTES};
use crate::cloudllm::completion::{ChunkError, CompletionChunk, CompletionRequest, Role, ToolCall, Usage};
use crate::cloudllm::decode;
use crate::cloudllm::error::{FailoverReason, ProviderError};
use crate::cloudllm::provider::{ChunkStream, CompletionProvider, Model};
use crate::cloudllm::retry::{self, RetryOutcome};
use crate::cloudllm::tool_schema;

use super::common::{self, ProviderConfig, ResolvedImage, ResolvedImages, CHUNK_CHANNEL_CAPACITY};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaProvider {
    config: ProviderConfig,
}

impl OllamaProvider {
    pub fn new(config: ProviderConfig) -> Self {
        OllamaProvider { config }
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
            .ok_or_else(|| invalid_request("ollama", "", "no model specified and no default model configured"))
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
impl CompletionProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn models(&self) -> Vec<Model> {
        // Ollama's catalog is whatever the local daemon has pulled; there is no fixed list to
        // enumerate from here.
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
        // Ollama has no notion of an API key; local daemons are unauthenticated. Nothing to
        // validate synchronously before the model/messages themselves.
        let model = self.resolve_model(&request)?;
        let images = resolve_images(&request).await;
        let messages = convert_messages_ollama(&request, &images);

        let mut body = json!({
            "model": model,
            "messages": messages,
            "stream": true,
        });
        if let Some(tools) = request.tools.as_ref().filter(|t| !t.is_empty()) {
            body["tools"] = Value::Array(tools.iter().map(tool_schema::to_openai).collect());
        }
        if request.max_tokens > 0 {
            body["options"] = json!({"num_predict": request.max_tokens});
        }

        let url = format!("{}/api/chat", self.base_url());
        let retry_config = self.config.retry_config();
        let provider = self.name().to_string();

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(run_producer(provider, model, cancel, body, url, retry_config, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

async fn resolve_images(request: &CompletionRequest) -> ResolvedImages {
    let mut images = ResolvedImages::new();
    let client = common::shared_http_client();
    for msg in &request.messages {
        for attachment in &msg.attachments {
            if attachment.kind != "image" || images.contains_key(&attachment.url) {
                continue;
            }
            // Ollama's local daemon can't fetch remote URLs itself; every image must be
            // resolved to base64 regardless of scheme, unlike the OpenAI-style facades.
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
                    log::warn!("ollama: dropping attachment {}: {}", attachment.url, err);
                }
            }
        }
    }
    images
}

fn convert_messages_ollama(request: &CompletionRequest, images: &ResolvedImages) -> Vec<Value> {
    let mut out = Vec::new();

    if let Some(system) = common::system_prompt_text(request) {
        out.push(json!({"role": "system", "content": system}));
    }

    for msg in &request.messages {
        match msg.role {
            Role::System => continue,
            Role::User => {
                if msg.is_empty_turn() {
                    continue;
                }
                let image_data: Vec<String> = msg
                    .attachments
                    .iter()
                    .filter(|a| a.kind == "image")
                    .filter_map(|a| images.get(&a.url))
                    .map(|resolved| resolved.data_base64.clone())
                    .collect();
                let mut entry = json!({"role": "user", "content": msg.content});
                if !image_data.is_empty() {
                    entry["images"] = Value::Array(image_data.into_iter().map(Value::String).collect());
                }
                out.push(entry);
            }
            Role::Assistant => {
                if msg.is_empty_turn() {
                    continue;
                }
                let mut entry = json!({"role": "assistant", "content": msg.content});
                if !msg.tool_calls.is_empty() {
                    let tool_calls: Vec<Value> = msg
                        .tool_calls
                        .iter()
                        .map(|call| json!({"function": {"name": call.name, "arguments": call.input}}))
                        .collect();
                    entry["tool_calls"] = Value::Array(tool_calls);
                }
                out.push(entry);
            }
            Role::Tool => {
                for result in &msg.tool_results {
                    out.push(json!({"role": "tool", "content": result.content}));
                }
            }
        }
    }

    out
}

fn classify_http_error(provider: &str, model: &str, status: u16, body: &str) -> ProviderError {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| v.get("error")).and_then(Value::as_str).unwrap_or(body);
    ProviderError::from_status(provider, model, status, message)
}

struct OllamaDecoder {
    usage: Usage,
    done: bool,
    seen_tool_calls: HashSet<String>,
}

impl OllamaDecoder {
    fn new() -> Self {
        OllamaDecoder { usage: Usage::default(), done: false, seen_tool_calls: HashSet::new() }
    }

    fn handle_line(&mut self, data: &Value) -> Vec<CompletionChunk> {
        let mut out = Vec::new();

        if let Some(message) = data.get("message") {
            if let Some(text) = message.get("content").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push(CompletionChunk::Text { text: text.to_string() });
                }
            }
            if let Some(tool_calls) = message.get("tool_calls").and_then(Value::as_array) {
                for tc in tool_calls {
                    let function = tc.get("function");
                    let name = function.and_then(|f| f.get("name")).and_then(Value::as_str).unwrap_or("").to_string();
                    if name.is_empty() {
                        continue;
                    }
                    let arguments = function.and_then(|f| f.get("arguments")).cloned().unwrap_or_else(|| json!({}));
                    let key = format!("{}:{}", name, arguments);
                    if !self.seen_tool_calls.insert(key) {
                        continue;
                    }
                    out.push(CompletionChunk::ToolCall {
                        call: ToolCall { id: decode::synthesize_tool_call_id(&name), name, input: arguments },
                    });
                }
            }
        }

        if let Some(prompt_eval) = data.get("prompt_eval_count").and_then(Value::as_u64) {
            self.usage.input_tokens = prompt_eval;
        }
        if let Some(eval) = data.get("eval_count").and_then(Value::as_u64) {
            self.usage.output_tokens = eval;
        }

        if data.get("done").and_then(Value::as_bool).unwrap_or(false) {
            self.done = true;
            out.push(CompletionChunk::Done { usage: self.usage });
        }

        out
    }

    fn finalize_on_eof(&mut self) -> Vec<CompletionChunk> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![CompletionChunk::Done { usage: self.usage }]
    }
}

async fn run_producer(
    provider: String,
    model: String,
    cancel: CancellationToken,
    body: Value,
    url: String,
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
            let body = body.clone();
            let provider = provider.clone();
            let model = model.clone();
            async move {
                let response = client
                    .post(&url)
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

    let mut decoder = OllamaDecoder::new();
    let mut buffer: Vec<u8> = Vec::new();

    use futures_util::StreamExt;
    let mut bytes = response.bytes_stream();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(CompletionChunk::Error { error: ChunkError::Cancelled }).await;
                return;
            }
            next = bytes.next() => {
                match next {
                    None => {
                        for chunk in drain_lines(&mut decoder, &mut buffer) {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        for chunk in decoder.finalize_on_eof() {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }
                    Some(Ok(chunk)) => {
                        buffer.extend_from_slice(&chunk);
                        for chunk in drain_lines(&mut decoder, &mut buffer) {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                            if decoder.done {
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

fn drain_lines(decoder: &mut OllamaDecoder, buffer: &mut Vec<u8>) -> Vec<CompletionChunk> {
    let mut out = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        if line.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        match serde_json::from_slice::<Value>(line) {
            Ok(data) => out.extend(decoder.handle_line(&data)),
            Err(_) => continue,
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_line_surfaces_text() {
        let mut decoder = OllamaDecoder::new();
        let data = json!({"message": {"role": "assistant", "content": "hi"}, "done": false});
        let out = decoder.handle_line(&data);
        assert!(matches!(&out[0], CompletionChunk::Text { text } if text == "hi"));
    }

    #[test]
    fn repeated_tool_call_across_lines_is_deduped() {
        let mut decoder = OllamaDecoder::new();
        let call = json!({"function": {"name": "get_weather", "arguments": {"city": "London"}}});
        let line = json!({"message": {"role": "assistant", "tool_calls": [call.clone()]}, "done": false});
        let first = decoder.handle_line(&line);
        let second = decoder.handle_line(&line);
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn final_line_emits_done_with_token_counts() {
        let mut decoder = OllamaDecoder::new();
        let data = json!({"done": true, "prompt_eval_count": 10, "eval_count": 20});
        let out = decoder.handle_line(&data);
        match out.last().unwrap() {
            CompletionChunk::Done { usage } => {
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 20);
            }
            other => panic!("unexpected chunk {:?}", other),
        }
    }

    #[test]
    fn drain_lines_splits_buffer_on_newlines() {
        let mut decoder = OllamaDecoder::new();
        let mut buffer = b"{\"message\":{\"content\":\"a\"},\"done\":false}\n{\"done\":true}\n".to_vec();
        let out = drain_lines(&mut decoder, &mut buffer);
        assert_eq!(out.len(), 2);
        assert!(buffer.is_empty());
    }
}
