//! Shape A: typed SSE events (Anthropic, Anthropic-beta), §4.6.
//!
//! The decoder is a pure state machine: feed it `(event_type, data)` pairs parsed from an SSE
//! body and it returns the [`CompletionChunk`]s that event produced. The facade owns the actual
//! HTTP/SSE plumbing (`clients::claude`); this module only knows the Anthropic event alphabet.

use serde_json::Value;

use crate::cloudllm::completion::{ChunkError, CompletionChunk, ToolCall, Usage};
use crate::cloudllm::error::ProviderError;

use super::MALFORMED_STREAM_GUARD;

struct ToolCallBuilder {
    id: String,
    name: String,
    buffer: String,
}

/// State for one turn's worth of Anthropic SSE events.
pub struct ShapeADecoder {
    provider: String,
    model: String,
    current_tool: Option<ToolCallBuilder>,
    in_thinking_block: bool,
    usage: Usage,
    consecutive_empty: usize,
    done: bool,
}

impl ShapeADecoder {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        ShapeADecoder {
            provider: provider.into(),
            model: model.into(),
            current_tool: None,
            in_thinking_block: false,
            usage: Usage::default(),
            consecutive_empty: 0,
            done: false,
        }
    }

    /// True once a terminal chunk has been produced; the facade should stop polling after this.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed one decoded SSE event, returning the chunks it produced (zero or more, never after
    /// `is_done()` becomes true).
    pub fn handle_event(&mut self, event_type: &str, data: &Value) -> Vec<CompletionChunk> {
        if self.done {
            return Vec::new();
        }

        let mut out = Vec::new();
        match event_type {
            "message_start" => {
                if let Some(tokens) = data
                    .get("message")
                    .and_then(|m| m.get("usage"))
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(Value::as_u64)
                {
                    self.usage.input_tokens = tokens;
                }
            }
            "content_block_start" => {
                let block_type = data
                    .get("content_block")
                    .and_then(|b| b.get("type"))
                    .and_then(Value::as_str)
                    .unwrap_or("");
                match block_type {
                    "thinking" => {
                        self.in_thinking_block = true;
                        out.push(CompletionChunk::ThinkingStart);
                    }
                    "tool_use" => {
                        let block = data.get("content_block").cloned().unwrap_or(Value::Null);
                        let id = block.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                        let name = block.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                        self.current_tool = Some(ToolCallBuilder {
                            id,
                            name,
                            buffer: String::new(),
                        });
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let delta = data.get("delta").cloned().unwrap_or(Value::Null);
                let delta_type = delta.get("type").and_then(Value::as_str).unwrap_or("");
                match delta_type {
                    "text_delta" => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            if !text.is_empty() {
                                out.push(CompletionChunk::Text { text: text.to_string() });
                            }
                        }
                    }
                    "thinking_delta" => {
                        if let Some(text) = delta.get("thinking").and_then(Value::as_str) {
                            out.push(CompletionChunk::Thinking { text: text.to_string() });
                        }
                    }
                    "input_json_delta" => {
                        if let Some(fragment) = delta.get("partial_json").and_then(Value::as_str) {
                            if let Some(builder) = self.current_tool.as_mut() {
                                builder.buffer.push_str(fragment);
                            }
                        }
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                if self.in_thinking_block {
                    self.in_thinking_block = false;
                    out.push(CompletionChunk::ThinkingEnd);
                } else if let Some(builder) = self.current_tool.take() {
                    out.push(finalize_tool_call(builder));
                }
            }
            "message_delta" => {
                if let Some(tokens) = data
                    .get("usage")
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(Value::as_u64)
                {
                    self.usage.output_tokens = tokens;
                }
            }
            "message_stop" => {
                self.done = true;
                out.push(CompletionChunk::Done { usage: self.usage });
            }
            "error" => {
                self.done = true;
                out.push(self.error_chunk(data));
            }
            _ => {}
        }

        if out.is_empty() {
            self.consecutive_empty += 1;
            if self.consecutive_empty >= MALFORMED_STREAM_GUARD {
                self.done = true;
                out.push(CompletionChunk::Error {
                    error: ChunkError::Provider(ProviderError::from_cause(
                        self.provider.clone(),
                        self.model.clone(),
                        Some(Box::from(format!(
                            "stream produced no activity for {} consecutive events",
                            MALFORMED_STREAM_GUARD
                        ))),
                    )),
                });
            }
        } else {
            self.consecutive_empty = 0;
        }

        out
    }

    fn error_chunk(&self, data: &Value) -> CompletionChunk {
        let message = data
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("unknown Anthropic stream error")
            .to_string();
        let code = data
            .get("error")
            .and_then(|e| e.get("type"))
            .and_then(Value::as_str)
            .map(|s| s.to_string());

        let err = match code {
            Some(code) => ProviderError::from_vendor_code(&self.provider, &self.model, code, message),
            None => ProviderError::from_cause(&self.provider, &self.model, Some(Box::from(message))),
        };
        CompletionChunk::Error { error: ChunkError::Provider(err) }
    }

    /// Called when the underlying byte stream ends without a `message_stop` event. If a tool
    /// call builder is still open it is finalized first, then a terminal `done` is emitted
    /// (§4.6 "On EOF with no message_stop").
    pub fn finalize_on_eof(&mut self) -> Vec<CompletionChunk> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let mut out = Vec::new();
        if let Some(builder) = self.current_tool.take() {
            out.push(finalize_tool_call(builder));
        }
        out.push(CompletionChunk::Done { usage: self.usage });
        out
    }
}

fn finalize_tool_call(builder: ToolCallBuilder) -> CompletionChunk {
    let input = serde_json::from_str(&builder.buffer).unwrap_or_else(|_| Value::Object(Default::default()));
    CompletionChunk::ToolCall {
        call: ToolCall {
            id: builder.id,
            name: builder.name,
            input,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunks(decoder: &mut ShapeADecoder, events: &[(&str, Value)]) -> Vec<CompletionChunk> {
        events
            .iter()
            .flat_map(|(ty, data)| decoder.handle_event(ty, data))
            .collect()
    }

    #[test]
    fn round_trip_text() {
        let mut decoder = ShapeADecoder::new("anthropic", "claude-3-haiku");
        let events = vec![
            ("message_start", json!({"message": {"usage": {"input_tokens": 10}}})),
            ("content_block_start", json!({"content_block": {"type": "text"}})),
            ("content_block_delta", json!({"delta": {"type": "text_delta", "text": "Hello"}})),
            ("content_block_delta", json!({"delta": {"type": "text_delta", "text": " world"}})),
            ("content_block_stop", json!({})),
            ("message_delta", json!({"usage": {"output_tokens": 5}})),
            ("message_stop", json!({})),
        ];
        let out = chunks(&mut decoder, &events);
        assert!(matches!(&out[0], CompletionChunk::Text { text } if text == "Hello"));
        assert!(matches!(&out[1], CompletionChunk::Text { text } if text == " world"));
        assert!(matches!(out.last().unwrap(), CompletionChunk::Done { usage } if usage.input_tokens == 10 && usage.output_tokens == 5));
        assert!(decoder.is_done());
    }

    #[test]
    fn tool_use_assembled_from_input_json_deltas() {
        let mut decoder = ShapeADecoder::new("anthropic", "claude-3-haiku");
        let events = vec![
            ("content_block_start", json!({"content_block": {"type": "tool_use", "id": "toolu_1", "name": "get_weather"}})),
            ("content_block_delta", json!({"delta": {"type": "input_json_delta", "partial_json": "{\"city\":"}})),
            ("content_block_delta", json!({"delta": {"type": "input_json_delta", "partial_json": "\"London\"}"}})),
            ("content_block_stop", json!({})),
            ("message_stop", json!({})),
        ];
        let out = chunks(&mut decoder, &events);
        match &out[0] {
            CompletionChunk::ToolCall { call } => {
                assert_eq!(call.id, "toolu_1");
                assert_eq!(call.name, "get_weather");
                assert_eq!(call.input, json!({"city": "London"}));
            }
            other => panic!("expected ToolCall, got {:?}", other),
        }
    }

    #[test]
    fn thinking_block_brackets_its_deltas() {
        let mut decoder = ShapeADecoder::new("anthropic", "claude-3-haiku");
        let events = vec![
            ("content_block_start", json!({"content_block": {"type": "thinking"}})),
            ("content_block_delta", json!({"delta": {"type": "thinking_delta", "thinking": "Let me think..."}})),
            ("content_block_stop", json!({})),
            ("message_stop", json!({})),
        ];
        let out = chunks(&mut decoder, &events);
        assert!(matches!(out[0], CompletionChunk::ThinkingStart));
        assert!(matches!(&out[1], CompletionChunk::Thinking { text } if text == "Let me think..."));
        assert!(matches!(out[2], CompletionChunk::ThinkingEnd));
    }

    #[test]
    fn error_event_is_terminal() {
        let mut decoder = ShapeADecoder::new("anthropic", "claude-3-haiku");
        let out = decoder.handle_event(
            "error",
            &json!({"error": {"type": "overloaded_error", "message": "servers are overloaded"}}),
        );
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], CompletionChunk::Error { .. }));
        assert!(decoder.is_done());
    }

    #[test]
    fn eof_without_message_stop_finalizes_open_tool_call() {
        let mut decoder = ShapeADecoder::new("anthropic", "claude-3-haiku");
        decoder.handle_event(
            "content_block_start",
            &json!({"content_block": {"type": "tool_use", "id": "toolu_2", "name": "noop"}}),
        );
        decoder.handle_event(
            "content_block_delta",
            &json!({"delta": {"type": "input_json_delta", "partial_json": "{}"}}),
        );
        let out = decoder.finalize_on_eof();
        assert!(matches!(out[0], CompletionChunk::ToolCall { .. }));
        assert!(matches!(out[1], CompletionChunk::Done { .. }));
    }

    #[test]
    fn malformed_stream_guard_trips_after_threshold() {
        let mut decoder = ShapeADecoder::new("anthropic", "claude-3-haiku");
        let mut last = Vec::new();
        for _ in 0..MALFORMED_STREAM_GUARD {
            last = decoder.handle_event("ping", &json!({}));
        }
        assert!(matches!(last.last().unwrap(), CompletionChunk::Error { .. }));
        assert!(decoder.is_done());
    }
}
