//! Seed scenario 5: replaying a tape in strict mode against a request whose model differs from
//! the one it was recorded with serves the recorded chunks unchanged and exposes the mismatch.

use cloudllm::cloudllm::tape::{FieldMismatch, ReplayMode, Replayer, Tape, Turn};
use cloudllm::{CompletionChunk, CompletionMessage, CompletionProvider, CompletionRequest, Usage};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

fn tape_with_one_turn(recorded_model: &str) -> Tape {
    let mut tape = Tape::new(recorded_model, None);
    tape.turns.push(Turn {
        index: 0,
        request: CompletionRequest::new(recorded_model, vec![CompletionMessage::user("Hi")]),
        chunks: vec![
            CompletionChunk::Text { text: "Hello".to_string() },
            CompletionChunk::Done { usage: Usage { input_tokens: 3, output_tokens: 1 } },
        ],
        text: "Hello".to_string(),
        stop_reason: Some("done".to_string()),
        duration_ms: 7,
        timestamp: chrono::Utc::now(),
    });
    tape
}

#[tokio::test]
async fn strict_replay_serves_recorded_chunks_and_reports_model_mismatch() {
    let tape = tape_with_one_turn("A");
    let replayer = Replayer::new(tape, ReplayMode::Strict);

    let observed_request = CompletionRequest::new("B", vec![CompletionMessage::user("Hi")]);
    let mut stream = replayer
        .complete(CancellationToken::new(), observed_request)
        .await
        .expect("a recorded turn is available");

    let chunks: Vec<CompletionChunk> = {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.push(chunk);
        }
        out
    };
    assert_eq!(chunks.len(), 2);
    assert!(matches!(&chunks[0], CompletionChunk::Text { text } if text == "Hello"));
    assert!(matches!(chunks[1], CompletionChunk::Done { .. }));

    let mismatches: Vec<FieldMismatch> = replayer.mismatches();
    assert_eq!(mismatches.len(), 1);
    assert_eq!(mismatches[0].field, "model");
    assert_eq!(mismatches[0].recorded, "A");
    assert_eq!(mismatches[0].observed, "B");
}

#[test]
fn tape_marshal_unmarshal_preserves_turn_and_tool_run_counts() {
    let tape = tape_with_one_turn("A");
    let json = tape.to_json().expect("tape serializes");
    let restored = Tape::from_json(&json).expect("tape deserializes");

    assert_eq!(restored.turns.len(), tape.turns.len());
    assert_eq!(restored.tool_runs.len(), tape.tool_runs.len());
    assert_eq!(restored.turns[0].chunks.len(), tape.turns[0].chunks.len());
    assert_eq!(restored.version, tape.version);
}
