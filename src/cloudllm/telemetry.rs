//! Interface-only telemetry hooks (§2 "Telemetry hooks", 5% share).
//!
//! Mirrors the shape of an event-handler trait with default no-op async methods, shared across
//! callers as `Arc<dyn TelemetryHook>`: implement only the hooks you care about.

use async_trait::async_trait;

use crate::cloudllm::completion::Usage;

/// One signal emitted around a [`crate::cloudllm::provider::CompletionProvider::complete`] call.
#[async_trait]
pub trait TelemetryHook: Send + Sync {
    /// Fired immediately before the facade opens the vendor stream.
    async fn on_turn_started(&self, _provider: &str, _model: &str) {}

    /// Fired once the turn's terminal chunk has been observed.
    async fn on_turn_completed(&self, _provider: &str, _model: &str, _latency_ms: u64, _usage: Usage) {}

    /// Fired once per retry attempt (§4.2), including the attempt number and whether it is about
    /// to sleep before trying again.
    async fn on_retry(&self, _provider: &str, _model: &str, _attempt: u32, _reason: &str) {}
}

/// The default, silent implementation. Used when no caller has registered a hook.
pub struct NoopTelemetry;

#[async_trait]
impl TelemetryHook for NoopTelemetry {}
