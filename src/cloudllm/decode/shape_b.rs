//! Shape B: chunked deltas keyed by integer index (OpenAI, Azure, OpenRouter, Copilot proxy,
//! Bedrock Converse, Ollama), §4.6.
//!
//! Tool-call fragments arrive tagged by a small integer `index` rather than by id (the id, when
//! present at all, only appears on the first delta for that index). The decoder keeps one
//! [`ToolCallBuilder`] per index and only emits a call once it has both a name and a finish
//! reason of `tool_calls` (or end-of-stream) confirms it is complete.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::cloudllm::completion::{ChunkError, CompletionChunk, ToolCall, Usage};
use crate::cloudllm::error::ProviderError;

#[derive(Default)]
struct ToolCallBuilder {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallBuilder {
    fn is_complete(&self) -> bool {
        !self.id.is_empty() && !self.name.is_empty()
    }
}

/// State for one turn's worth of chunked-delta events.
#[derive(Default)]
pub struct ShapeBDecoder {
    builders: BTreeMap<usize, ToolCallBuilder>,
    usage: Usage,
    done: bool,
}

impl ShapeBDecoder {
    pub fn new() -> Self {
        ShapeBDecoder::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// A non-empty text delta (§4.6 "If text delta present").
    pub fn handle_text_delta(&self, text: &str) -> Option<CompletionChunk> {
        if text.is_empty() {
            None
        } else {
            Some(CompletionChunk::Text { text: text.to_string() })
        }
    }

    /// Merge one tool-call delta fragment into the builder at `index`, creating it if this is
    /// the first delta seen for that index.
    pub fn handle_tool_call_delta(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments_fragment: Option<&str>,
    ) {
        let builder = self.builders.entry(index).or_default();
        if let Some(id) = id {
            if !id.is_empty() {
                builder.id = id.to_string();
            }
        }
        if let Some(name) = name {
            if !name.is_empty() {
                builder.name = name.to_string();
            }
        }
        if let Some(fragment) = arguments_fragment {
            builder.arguments.push_str(fragment);
        }
    }

    pub fn handle_usage(&mut self, prompt_tokens: Option<u64>, completion_tokens: Option<u64>) {
        if let Some(t) = prompt_tokens {
            self.usage.input_tokens = t;
        }
        if let Some(t) = completion_tokens {
            self.usage.output_tokens = t;
        }
    }

    /// `finish_reason == "tool_calls"`: emit every complete builder, then reset the map so a
    /// subsequent round in the same turn (rare, but some gateways do this) starts fresh.
    pub fn handle_finish_reason(&mut self, reason: &str) -> Vec<CompletionChunk> {
        if reason != "tool_calls" {
            return Vec::new();
        }
        let builders = std::mem::take(&mut self.builders);
        builders
            .into_values()
            .filter(|b| b.is_complete())
            .map(finalize_tool_call)
            .collect()
    }

    /// End-of-stream: emit remaining complete builders, then a terminal `done`.
    pub fn finalize_on_eof(&mut self) -> Vec<CompletionChunk> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let mut out: Vec<CompletionChunk> = std::mem::take(&mut self.builders)
            .into_values()
            .filter(|b| b.is_complete())
            .map(finalize_tool_call)
            .collect();
        out.push(CompletionChunk::Done { usage: self.usage });
        out
    }

    /// A transport error occurred mid-stream; the stream is over (§4.6 "On transport error").
    pub fn handle_transport_error(
        &mut self,
        provider: &str,
        model: &str,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> CompletionChunk {
        self.done = true;
        CompletionChunk::Error {
            error: ChunkError::Provider(ProviderError::from_cause(provider, model, Some(Box::new(cause)))),
        }
    }
}

fn finalize_tool_call(builder: ToolCallBuilder) -> CompletionChunk {
    let input: Value = if builder.arguments.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(&builder.arguments).unwrap_or_else(|_| Value::Object(Default::default()))
    };
    CompletionChunk::ToolCall {
        call: ToolCall {
            id: builder.id,
            name: builder.name,
            input,
        },
    }
}
