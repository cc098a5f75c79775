//! Reusable decoder skeletons for the three vendor stream shapes (§4.6, §9 design note).
//!
//! Implementers of a new vendor facade should reach for one of these state machines rather than
//! hand-rolling a branch-per-vendor decode loop: [`shape_a`] for typed SSE events (Anthropic),
//! [`shape_b`] for chunked deltas keyed by index (OpenAI-style, Bedrock Converse), and [`shape_c`]
//! for an iterator of complete responses (Gemini).

pub mod shape_a;
pub mod shape_b;
pub mod shape_c;

/// Consecutive vendor-stream events that produce no observable chunk before the decoder gives up
/// and emits a terminal error (§4.6 "Malformed-stream guard", §9).
pub const MALFORMED_STREAM_GUARD: usize = 300;

/// Synthesize a stable tool-call id for vendors that don't issue one (Gemini, §9 "Tool-call id
/// synthesis"). Recoverable: the function name can be read back out of the id alone.
pub fn synthesize_tool_call_id(function_name: &str) -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    format!("call_{}_{}", function_name, nanos)
}

/// Recover the function name from an id synthesized by [`synthesize_tool_call_id`], or from the
/// vendor-native id if it doesn't follow that scheme. Used by Gemini's tool-result conversion
/// when no prior assistant `tool_calls` entry has the matching id (§4.5).
pub fn function_name_from_synthetic_id(id: &str) -> Option<&str> {
    let rest = id.strip_prefix("call_")?;
    let (name, _nanos) = rest.rsplit_once('_')?;
    Some(name)
}
