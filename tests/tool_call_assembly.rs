//! Seed scenario 2: tool-call arguments arriving as three index-keyed deltas must reassemble
//! byte-for-byte in arrival order, then surface as a single complete `ToolCall` followed by `done`.

use cloudllm::cloudllm::decode::shape_b::ShapeBDecoder;
use cloudllm::CompletionChunk;

#[test]
fn three_deltas_reassemble_into_one_tool_call() {
    let mut decoder = ShapeBDecoder::new();

    decoder.handle_tool_call_delta(0, Some("call_1"), Some("get_weather"), None);
    decoder.handle_tool_call_delta(0, None, None, Some("{\"city\":"));
    decoder.handle_tool_call_delta(0, None, None, Some("\"London\"}"));

    let finish_chunks = decoder.handle_finish_reason("tool_calls");
    assert_eq!(finish_chunks.len(), 1);
    match &finish_chunks[0] {
        CompletionChunk::ToolCall { call } => {
            assert_eq!(call.id, "call_1");
            assert_eq!(call.name, "get_weather");
            assert_eq!(call.input, serde_json::json!({"city": "London"}));
        }
        other => panic!("expected ToolCall, got {:?}", other),
    }

    // The facade appends `done` once the underlying byte stream reaches its `[DONE]` sentinel.
    let eof_chunks = decoder.finalize_on_eof();
    assert_eq!(eof_chunks.len(), 1);
    assert!(matches!(eof_chunks[0], CompletionChunk::Done { .. }));
    assert!(decoder.is_done());
}
