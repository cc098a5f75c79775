//! Shape C: an iterator of complete responses (Gemini `GenerateContentStream`), §4.6.
//!
//! Unlike Shape A/B there are no deltas to assemble: each response the iterator yields already
//! carries complete text and function-call parts. The only synthesis needed is a stable tool
//! call id, since Gemini never assigns one (§9 "Tool-call id synthesis").

use serde_json::Value;

use crate::cloudllm::completion::{ChunkError, CompletionChunk, ToolCall, Usage};
use crate::cloudllm::error::ProviderError;

use super::synthesize_tool_call_id;

#[derive(Default)]
pub struct ShapeCDecoder {
    usage: Usage,
    done: bool,
}

impl ShapeCDecoder {
    pub fn new() -> Self {
        ShapeCDecoder::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Process one fully-formed response object from the iterator, emitting a `text` chunk for
    /// every text part and a `toolCall` chunk for every function-call part, in part order
    /// (§4.6: "for each candidate's content's parts").
    pub fn process_response(&mut self, response: &Value) -> Vec<CompletionChunk> {
        let mut out = Vec::new();

        if let Some(tokens) = response
            .get("usageMetadata")
            .and_then(|u| u.get("promptTokenCount"))
            .and_then(Value::as_u64)
        {
            self.usage.input_tokens = tokens;
        }
        if let Some(tokens) = response
            .get("usageMetadata")
            .and_then(|u| u.get("candidatesTokenCount"))
            .and_then(Value::as_u64)
        {
            self.usage.output_tokens = tokens;
        }

        let parts = response
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for part in parts {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                if !text.is_empty() {
                    out.push(CompletionChunk::Text { text: text.to_string() });
                }
                continue;
            }
            if let Some(function_call) = part.get("functionCall") {
                let name = function_call
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let args = function_call.get("args").cloned().unwrap_or_else(|| Value::Object(Default::default()));
                out.push(CompletionChunk::ToolCall {
                    call: ToolCall {
                        id: synthesize_tool_call_id(&name),
                        name,
                        input: args,
                    },
                });
            }
        }

        out
    }

    /// A transport/SDK error ended the iterator early.
    pub fn error(&mut self, provider: &str, model: &str, cause: impl std::error::Error + Send + Sync + 'static) -> CompletionChunk {
        self.done = true;
        CompletionChunk::Error {
            error: ChunkError::Provider(ProviderError::from_cause(provider, model, Some(Box::new(cause)))),
        }
    }

    /// The iterator drained without error: emit the terminal `done` (§4.6 "After the iterator
    /// drains").
    pub fn finalize(&mut self) -> CompletionChunk {
        self.done = true;
        CompletionChunk::Done { usage: self.usage }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_parts_emit_in_order() {
        let mut decoder = ShapeCDecoder::new();
        let resp = json!({
            "candidates": [{"content": {"parts": [{"text": "Hello"}, {"text": " world"}]}}]
        });
        let out = decoder.process_response(&resp);
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], CompletionChunk::Text { text } if text == "Hello"));
    }

    #[test]
    fn function_call_part_synthesizes_recoverable_id() {
        let mut decoder = ShapeCDecoder::new();
        let resp = json!({
            "candidates": [{"content": {"parts": [{"functionCall": {"name": "get_weather", "args": {"city": "London"}}}]}}]
        });
        let out = decoder.process_response(&resp);
        match &out[0] {
            CompletionChunk::ToolCall { call } => {
                assert_eq!(call.name, "get_weather");
                assert_eq!(call.input, json!({"city": "London"}));
                assert!(call.id.starts_with("call_get_weather_"));
            }
            other => panic!("unexpected chunk {:?}", other),
        }
    }

    #[test]
    fn finalize_is_terminal_and_carries_usage() {
        let mut decoder = ShapeCDecoder::new();
        decoder.process_response(&json!({"usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3}}));
        let done = decoder.finalize();
        assert!(matches!(done, CompletionChunk::Done { usage } if usage.input_tokens == 7 && usage.output_tokens == 3));
        assert!(decoder.is_done());
    }
}
