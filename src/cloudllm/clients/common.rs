//! Shared plumbing for every vendor facade (§2, §4.5).
//!
//! Holds the one process-wide [`reqwest::Client`] every facade and the attachment resolver reuse
//! (tuned the same way the source crate's `get_shared_http_client()` was), plus the message/tool
//! conversion helpers common to the whole OpenAI-compatible wire family (OpenAI, Azure,
//! OpenRouter, Copilot, Ollama, Bedrock Converse all share the same tagged-union message shape
//! per §4.5).

use std::collections::HashMap;
use std::time::Duration;

use lazy_static::lazy_static;
use serde_json::{json, Value};

use crate::cloudllm::completion::{CompletionRequest, Role, ToolDefinition};
use crate::cloudllm::tool_schema;

/// Bounded channel capacity for a facade's producer → consumer chunk stream (§5 "bounded
/// capacity").
pub const CHUNK_CHANNEL_CAPACITY: usize = 32;

/// Per-provider connection configuration (§6 "Configuration surface per provider").
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: String,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        ProviderConfig {
            api_key: api_key.into(),
            base_url: None,
            default_model: None,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Values `<= 0` coerce to the default of 3 (§6).
    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = if max_retries <= 0 { 3 } else { max_retries as u32 };
        self
    }

    /// Values `<= 0` coerce to the default of 1 second (§6).
    pub fn with_retry_delay_ms(mut self, retry_delay_ms: i64) -> Self {
        self.retry_delay = if retry_delay_ms <= 0 {
            Duration::from_secs(1)
        } else {
            Duration::from_millis(retry_delay_ms as u64)
        };
        self
    }

    pub fn retry_config(&self) -> crate::cloudllm::retry::RetryConfig {
        crate::cloudllm::retry::RetryConfig::new(self.max_retries, self.retry_delay)
    }
}

lazy_static! {
    /// Shared HTTP client with persistent connection pooling, reused by every vendor facade and
    /// by [`crate::cloudllm::attachment::resolve`].
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialized shared [`reqwest::Client`].
pub fn shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// One attachment's bytes, resolved and base64-encoded, keyed by the attachment's original URL
/// so message converters can look images up without doing any I/O themselves (§5: converters are
/// pure functions). Built by the facade from [`crate::cloudllm::attachment::resolve`] before
/// conversion; attachments that failed to resolve are simply absent from the map and are dropped
/// silently by every converter (§4.5).
pub type ResolvedImages = HashMap<String, ResolvedImage>;

#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub data_base64: String,
    pub mime_type: String,
}

/// Concatenate `request.system` with the content of any `Role::System` messages (§3 invariant 5,
/// §4.5: system content is lifted to a vendor-specific field, never a dialogue turn).
pub fn system_prompt_text(request: &CompletionRequest) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(system) = &request.system {
        if !system.is_empty() {
            parts.push(system.clone());
        }
    }
    for msg in &request.messages {
        if msg.role == Role::System && !msg.content.is_empty() {
            parts.push(msg.content.clone());
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Convert the internal message list into the OpenAI-compatible wire array (§4.5).
///
/// System content is emitted once, as the first message, under role `"developer"` — the role
/// OpenAI's own newer model family uses in place of `"system"` — never under the literal string
/// `"system"` (§8: `convertMessages` must never yield `role="system"`). Tool-role messages are
/// expanded one-per-result; assistant messages with tool calls serialize each call's input
/// verbatim, passing the raw string through unparsed on failure (OpenAI-style degradation rule,
/// §4.5).
pub fn convert_messages_openai_style(request: &CompletionRequest, images: &ResolvedImages) -> Vec<Value> {
    let mut out = Vec::new();

    if let Some(system) = system_prompt_text(request) {
        out.push(json!({"role": "developer", "content": system}));
    }

    for msg in &request.messages {
        match msg.role {
            Role::System => continue,
            Role::User => {
                if msg.is_empty_turn() {
                    continue;
                }
                out.push(user_message_openai(msg, images));
            }
            Role::Assistant => {
                if msg.is_empty_turn() {
                    continue;
                }
                out.push(assistant_message_openai(msg));
            }
            Role::Tool => {
                for result in &msg.tool_results {
                    out.push(json!({
                        "role": "tool",
                        "tool_call_id": result.tool_call_id,
                        "content": result.content,
                    }));
                }
            }
        }
    }

    out
}

fn user_message_openai(msg: &crate::cloudllm::completion::CompletionMessage, images: &ResolvedImages) -> Value {
    let image_parts: Vec<Value> = msg
        .attachments
        .iter()
        .filter_map(|att| image_url_part(att, images))
        .collect();

    if image_parts.is_empty() {
        return json!({"role": "user", "content": msg.content});
    }

    let mut parts = vec![json!({"type": "text", "text": msg.content})];
    parts.extend(image_parts);
    json!({"role": "user", "content": parts})
}

fn image_url_part(attachment: &crate::cloudllm::completion::Attachment, images: &ResolvedImages) -> Option<Value> {
    if attachment.kind != "image" {
        return None;
    }
    let url = match images.get(&attachment.url) {
        Some(resolved) => format!("data:{};base64,{}", resolved.mime_type, resolved.data_base64),
        None => attachment.url.clone(),
    };
    Some(json!({"type": "image_url", "image_url": {"url": url}}))
}

fn assistant_message_openai(msg: &crate::cloudllm::completion::CompletionMessage) -> Value {
    if msg.tool_calls.is_empty() {
        return json!({"role": "assistant", "content": msg.content});
    }

    let tool_calls: Vec<Value> = msg
        .tool_calls
        .iter()
        .map(|call| {
            json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    // OpenAI-style paths pass the raw string through verbatim (§4.5).
                    "arguments": serde_json::to_string(&call.input).unwrap_or_else(|_| call.input.to_string()),
                }
            })
        })
        .collect();

    json!({
        "role": "assistant",
        "content": if msg.content.is_empty() { Value::Null } else { Value::String(msg.content.clone()) },
        "tool_calls": tool_calls,
    })
}

/// Render every tool definition as an OpenAI-style `{type:"function", function:{...}}` entry
/// (§4.3).
pub fn convert_tools_openai_style(tools: &[ToolDefinition]) -> Vec<Value> {
    tools.iter().map(tool_schema::to_openai).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloudllm::completion::{Attachment, CompletionMessage, ToolCall};

    #[test]
    fn system_never_appears_as_a_dialogue_role() {
        let mut request = CompletionRequest::new("gpt-4.1", vec![
            CompletionMessage::system("be terse"),
            CompletionMessage::user("hi"),
        ]);
        request.system = Some("also be kind".to_string());
        let images = ResolvedImages::new();
        let out = convert_messages_openai_style(&request, &images);
        assert!(out.iter().all(|m| m["role"] != "system"));
        assert_eq!(out[0]["role"], "developer");
        assert!(out[0]["content"].as_str().unwrap().contains("also be kind"));
        assert!(out[0]["content"].as_str().unwrap().contains("be terse"));
    }

    #[test]
    fn empty_turns_are_dropped() {
        let request = CompletionRequest::new("gpt-4.1", vec![
            CompletionMessage::plain(crate::cloudllm::completion::Role::Assistant, ""),
            CompletionMessage::user("hi"),
        ]);
        let out = convert_messages_openai_style(&request, &ResolvedImages::new());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["role"], "user");
    }

    #[test]
    fn tool_results_expand_one_message_per_result() {
        let mut msg = CompletionMessage::plain(crate::cloudllm::completion::Role::Tool, "");
        msg.tool_results.push(crate::cloudllm::completion::ToolResult {
            tool_call_id: "call_1".into(),
            content: "72F and sunny".into(),
            is_error: false,
            images: vec![],
        });
        let request = CompletionRequest::new("gpt-4.1", vec![msg]);
        let out = convert_messages_openai_style(&request, &ResolvedImages::new());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0]["role"], "tool");
        assert_eq!(out[0]["tool_call_id"], "call_1");
    }

    #[test]
    fn assistant_tool_calls_serialize_input_verbatim() {
        let mut msg = CompletionMessage::assistant("");
        msg.tool_calls.push(ToolCall {
            id: "call_1".into(),
            name: "get_weather".into(),
            input: json!({"city": "London"}),
        });
        let request = CompletionRequest::new("gpt-4.1", vec![msg]);
        let out = convert_messages_openai_style(&request, &ResolvedImages::new());
        let args: Value = serde_json::from_str(out[0]["tool_calls"][0]["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args, json!({"city": "London"}));
    }

    #[test]
    fn vision_attachment_becomes_multipart_content() {
        let mut msg = CompletionMessage::user("what is in this image?");
        msg.attachments.push(Attachment::image("https://example.com/cat.png"));
        let request = CompletionRequest::new("gpt-4.1", vec![msg]);
        let out = convert_messages_openai_style(&request, &ResolvedImages::new());
        let content = out[0]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[1]["type"], "image_url");
    }

    #[test]
    fn provider_config_coerces_non_positive_overrides_to_defaults() {
        let config = ProviderConfig::new("sk-test").with_max_retries(-1).with_retry_delay_ms(0);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay, Duration::from_secs(1));
    }

    #[test]
    fn resolved_image_is_embedded_as_data_uri() {
        let mut msg = CompletionMessage::user("describe");
        msg.attachments.push(Attachment::image("file:///tmp/cat.png"));
        let mut images = ResolvedImages::new();
        images.insert(
            "file:///tmp/cat.png".to_string(),
            ResolvedImage { data_base64: "Zm9v".to_string(), mime_type: "image/png".to_string() },
        );
        let request = CompletionRequest::new("gpt-4.1", vec![msg]);
        let out = convert_messages_openai_style(&request, &images);
        let url = out[0]["content"][1]["image_url"]["url"].as_str().unwrap();
        assert!(url.starts_with("data:image/png;base64,Zm9v"));
    }
}
