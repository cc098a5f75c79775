//! Record/replay subsystem for deterministic testing (§2 "Tape", §4.8).
//!
//! A [`Tape`] is a versioned, self-describing artifact capturing one or more turns: the request
//! that opened them, the chunk sequence each produced, and any tool runs executed along the way.
//! [`Recorder`] wraps any [`CompletionProvider`] and builds a tape as turns complete; [`Replayer`]
//! is itself a `CompletionProvider` that serves a tape back without touching the network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cloudllm::completion::{CompletionChunk, CompletionRequest, ToolCall, ToolResult};
use crate::cloudllm::error::{FailoverReason, ProviderError};
use crate::cloudllm::provider::{ChunkStream, CompletionProvider, Model};

/// The only tape format version this crate knows how to read or write (§6 "Tape file format").
pub const TAPE_VERSION: &str = "1.0";

/// One recorded turn: its request, the full ordered chunk sequence it produced, and a few
/// convenience fields derived from that sequence for quick inspection without re-walking it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub index: u64,
    pub request: CompletionRequest,
    pub chunks: Vec<CompletionChunk>,
    pub text: String,
    pub stop_reason: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// One recorded tool execution, linked back to the turn whose assistant message requested it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRun {
    pub turn_index: u64,
    pub call: ToolCall,
    pub result: ToolResult,
    pub duration_ms: u64,
}

/// A versioned, self-describing record of one or more turns (§6 "Tape file format").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tape {
    pub version: String,
    pub model: String,
    pub system_prompt: Option<String>,
    pub turns: Vec<Turn>,
    pub tool_runs: Vec<ToolRun>,
}

impl Tape {
    pub fn new(model: impl Into<String>, system_prompt: Option<String>) -> Self {
        Tape {
            version: TAPE_VERSION.to_string(),
            model: model.into(),
            system_prompt,
            turns: Vec::new(),
            tool_runs: Vec::new(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

/// Wraps any provider, tees its output chunks into a buffer, and snapshots a [`Turn`] into the
/// tape once a terminal chunk is observed (§4.8 "Recorder").
///
/// The tape is single-writer per instance (§5): concurrent `complete` calls against the same
/// `Recorder` are not supported, matching the spec's stated constraint.
pub struct Recorder {
    inner: Arc<dyn CompletionProvider>,
    tape: Arc<Mutex<Tape>>,
    next_index: Mutex<u64>,
}

impl Recorder {
    pub fn new(inner: Arc<dyn CompletionProvider>, model: impl Into<String>, system_prompt: Option<String>) -> Self {
        Recorder {
            inner,
            tape: Arc::new(Mutex::new(Tape::new(model, system_prompt))),
            next_index: Mutex::new(0),
        }
    }

    /// A clone of the tape recorded so far.
    pub fn tape(&self) -> Tape {
        self.tape.lock().unwrap().clone()
    }

    /// Append a tool run to the in-progress tape. Called by the agent runtime after it executes a
    /// tool call surfaced by a recorded turn; the core never calls this itself (§1 "tool
    /// implementations" are out of scope).
    pub fn record_tool_run(&self, run: ToolRun) {
        self.tape.lock().unwrap().tool_runs.push(run);
    }
}

#[async_trait]
impl CompletionProvider for Recorder {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn models(&self) -> Vec<Model> {
        self.inner.models()
    }

    fn supports_tools(&self) -> bool {
        self.inner.supports_tools()
    }

    async fn complete(
        &self,
        cancel: CancellationToken,
        request: CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let index = {
            let mut next = self.next_index.lock().unwrap();
            let i = *next;
            *next += 1;
            i
        };
        let inner_stream = self.inner.complete(cancel, request.clone()).await?;
        Ok(tee_and_record(inner_stream, self.tape.clone(), index, request))
    }
}

struct TeeState {
    inner: ChunkStream,
    tape: Arc<Mutex<Tape>>,
    index: u64,
    request: Option<CompletionRequest>,
    started: Instant,
    chunks: Vec<CompletionChunk>,
    text: String,
    stop_reason: Option<String>,
    finished: bool,
}

fn tee_and_record(
    inner: ChunkStream,
    tape: Arc<Mutex<Tape>>,
    index: u64,
    request: CompletionRequest,
) -> ChunkStream {
    let state = TeeState {
        inner,
        tape,
        index,
        request: Some(request),
        started: Instant::now(),
        chunks: Vec::new(),
        text: String::new(),
        stop_reason: None,
        finished: false,
    };

    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        let chunk = state.inner.next().await?;
        state.chunks.push(chunk.clone());
        match &chunk {
            CompletionChunk::Text { text } => state.text.push_str(text),
            CompletionChunk::Done { .. } => state.stop_reason = Some("done".to_string()),
            CompletionChunk::Error { .. } => state.stop_reason = Some("error".to_string()),
            _ => {}
        }
        if chunk.is_terminal() {
            state.finished = true;
            let turn = Turn {
                index: state.index,
                request: state.request.take().expect("request taken exactly once"),
                chunks: state.chunks.clone(),
                text: state.text.clone(),
                stop_reason: state.stop_reason.clone(),
                duration_ms: state.started.elapsed().as_millis() as u64,
                timestamp: Utc::now(),
            };
            state.tape.lock().unwrap().turns.push(turn);
        }
        Some((chunk, state))
    }))
}

/// Whether an incoming request's field values must match the recorded turn's (§4.8 "Replayer").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Emit recorded chunks regardless of the incoming request. The default.
    Lenient,
    /// Also diff the incoming request against the recorded one, exposing mismatches without
    /// aborting the replay (Seed Scenario 5).
    Strict,
}

/// One field-level discrepancy between a recorded request and the one a strict replay observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMismatch {
    pub field: String,
    pub recorded: String,
    pub observed: String,
}

/// A provider that ignores the network and serves a [`Tape`] back turn by turn.
pub struct Replayer {
    tape: Tape,
    mode: ReplayMode,
    next_turn: Mutex<usize>,
    mismatches: Mutex<Vec<FieldMismatch>>,
}

impl Replayer {
    pub fn new(tape: Tape, mode: ReplayMode) -> Self {
        Replayer {
            tape,
            mode,
            next_turn: Mutex::new(0),
            mismatches: Mutex::new(Vec::new()),
        }
    }

    /// Mismatches accumulated by every strict-mode `complete` call so far, exposed to the test
    /// harness (§8 Seed Scenario 5).
    pub fn mismatches(&self) -> Vec<FieldMismatch> {
        self.mismatches.lock().unwrap().clone()
    }

    /// The index of the turn most recently served by `complete` — used by [`ReplayTools`] to
    /// find the matching recorded tool run. `next_turn` is post-incremented by `complete`, so
    /// this is `next_turn - 1`, saturating at 0 before any turn has been served.
    pub fn current_turn_index(&self) -> u64 {
        (next_turn_index(&self.next_turn)).saturating_sub(1)
    }

    fn diff_request(&self, turn: &Turn, request: &CompletionRequest) {
        if self.mode != ReplayMode::Strict {
            return;
        }
        let mut mismatches = self.mismatches.lock().unwrap();
        if turn.request.model != request.model {
            mismatches.push(FieldMismatch {
                field: "model".to_string(),
                recorded: turn.request.model.clone(),
                observed: request.model.clone(),
            });
        }
        for (i, (recorded_msg, observed_msg)) in turn.request.messages.iter().zip(&request.messages).enumerate() {
            if recorded_msg.content != observed_msg.content {
                mismatches.push(FieldMismatch {
                    field: format!("messages[{}].content", i),
                    recorded: recorded_msg.content.clone(),
                    observed: observed_msg.content.clone(),
                });
            }
        }
        if let (Some(recorded_tools), Some(observed_tools)) = (&turn.request.tools, &request.tools) {
            for (j, (rt, ot)) in recorded_tools.iter().zip(observed_tools).enumerate() {
                if rt.parameters_schema != ot.parameters_schema {
                    mismatches.push(FieldMismatch {
                        field: format!("tools[{}].schema", j),
                        recorded: rt.parameters_schema.to_string(),
                        observed: ot.parameters_schema.to_string(),
                    });
                }
            }
        }
    }
}

fn next_turn_index(next_turn: &Mutex<usize>) -> u64 {
    *next_turn.lock().unwrap() as u64
}

/// Returned (wrapped in a [`ProviderError`]) once a [`Replayer`] has served every recorded turn.
pub const TAPE_EXHAUSTED_CODE: &str = "tape_exhausted";

fn tape_exhausted(model: &str) -> ProviderError {
    ProviderError {
        provider: "replay".to_string(),
        model: model.to_string(),
        status: None,
        code: Some(TAPE_EXHAUSTED_CODE.to_string()),
        message: "tape exhausted: no more recorded turns to replay".to_string(),
        request_id: None,
        reason: FailoverReason::Unknown,
        cause: None,
    }
}

#[async_trait]
impl CompletionProvider for Replayer {
    fn name(&self) -> &str {
        "replay"
    }

    fn models(&self) -> Vec<Model> {
        Vec::new()
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        _cancel: CancellationToken,
        request: CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let index = {
            let mut next = self.next_turn.lock().unwrap();
            let i = *next;
            *next += 1;
            i
        };
        let turn = self.tape.turns.get(index).ok_or_else(|| tape_exhausted(&self.tape.model))?;
        self.diff_request(turn, &request);
        let chunks = turn.chunks.clone();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }
}

/// One tool synthesized from a tape's recorded [`ToolRun`]s, keyed by name; it replays the
/// recorded result for whichever turn a [`Replayer`] currently points at rather than executing
/// anything (§4.8 "ReplayTools").
pub struct ReplayTool {
    name: String,
    runs_by_turn: HashMap<u64, ToolResult>,
}

impl ReplayTool {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The recorded result for the given turn index, if this tool was invoked during that turn.
    pub fn execute_for_turn(&self, turn_index: u64) -> Option<ToolResult> {
        self.runs_by_turn.get(&turn_index).cloned()
    }
}

impl crate::cloudllm::completion::Tool for ReplayTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "replayed tool result, synthesized from a recorded tape"
    }

    fn schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }
}

/// A registry of [`ReplayTool`]s synthesized from a tape's recorded tool runs.
pub struct ReplayTools {
    tools: HashMap<String, ReplayTool>,
}

impl ReplayTools {
    pub fn from_tape(tape: &Tape) -> Self {
        let mut tools: HashMap<String, ReplayTool> = HashMap::new();
        for run in &tape.tool_runs {
            let tool = tools.entry(run.call.name.clone()).or_insert_with(|| ReplayTool {
                name: run.call.name.clone(),
                runs_by_turn: HashMap::new(),
            });
            tool.runs_by_turn.insert(run.turn_index, run.result.clone());
        }
        ReplayTools { tools }
    }

    pub fn get(&self, name: &str) -> Option<&ReplayTool> {
        self.tools.get(name)
    }

    /// Execute the named tool for whatever turn `replayer` currently points at.
    pub fn execute(&self, name: &str, replayer: &Replayer) -> Option<ToolResult> {
        self.get(name)?.execute_for_turn(replayer.current_turn_index())
    }
}
