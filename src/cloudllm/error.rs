//! Failure taxonomy shared by every vendor facade.
//!
//! [`FailoverReason`] is the small, decision-ready enum every heterogeneous error surface (HTTP
//! status, vendor code string, native SDK error) gets classified into. [`ProviderError`] wraps a
//! [`FailoverReason`] with enough context (provider, model, status, code, request id, cause) for
//! logging and for a higher-level router to decide same-provider retry vs. cross-provider
//! failover.
//!
//! # Example
//!
//! ```rust
//! use cloudllm::error::{FailoverReason, ProviderError};
//!
//! let err = ProviderError::from_status("anthropic", "claude-haiku-4-5", 429, "rate limited");
//! assert_eq!(err.reason, FailoverReason::RateLimit);
//! assert!(err.reason.is_retryable());
//! assert!(!err.reason.should_failover());
//! ```

use std::fmt;
use std::sync::Arc;

use serde::de::Deserializer;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};

/// The classification every heterogeneous error surface collapses into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverReason {
    RateLimit,
    Timeout,
    ServerError,
    InvalidRequest,
    Auth,
    Billing,
    ContentFilter,
    ModelUnavailable,
    Unknown,
}

impl FailoverReason {
    /// True for transient failures worth retrying against the same provider.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailoverReason::RateLimit | FailoverReason::Timeout | FailoverReason::ServerError
        )
    }

    /// True for failures that a router should treat as "try a different provider", not "retry
    /// this one".
    pub fn should_failover(self) -> bool {
        matches!(
            self,
            FailoverReason::Billing | FailoverReason::Auth | FailoverReason::ModelUnavailable
        )
    }
}

impl fmt::Display for FailoverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailoverReason::RateLimit => "rate_limit",
            FailoverReason::Timeout => "timeout",
            FailoverReason::ServerError => "server_error",
            FailoverReason::InvalidRequest => "invalid_request",
            FailoverReason::Auth => "auth",
            FailoverReason::Billing => "billing",
            FailoverReason::ContentFilter => "content_filter",
            FailoverReason::ModelUnavailable => "model_unavailable",
            FailoverReason::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A classified provider failure.
///
/// Constructed via [`ProviderError::from_status`], [`ProviderError::from_vendor_code`], or
/// [`ProviderError::from_cause`] depending on what the failing call surfaced; classification
/// precedence (status → vendor code → message substring → unknown) is enforced by routing every
/// vendor facade through these three constructors in that order (§4.1, §9 "error classification
/// ordering matters").
#[derive(Debug, Clone, thiserror::Error)]
#[error("{provider}/{model}: {message} ({reason})")]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub status: Option<u16>,
    pub code: Option<String>,
    pub message: String,
    pub request_id: Option<String>,
    pub reason: FailoverReason,
    /// `Arc` rather than `Box` so `ProviderError` (and the `ChunkError`/`CompletionChunk` it's
    /// embedded in) stays `Clone` without needing the underlying error to be.
    #[source]
    pub cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

/// `cause` is a boxed trait object and has no general `Serialize` impl; the tape subsystem (§4.8)
/// only needs the chunk sequence to round-trip, so `cause` is carried across JSON as its
/// `Display` string and reboxed as a plain error on the way back in.
impl Serialize for ProviderError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ProviderError", 8)?;
        state.serialize_field("provider", &self.provider)?;
        state.serialize_field("model", &self.model)?;
        state.serialize_field("status", &self.status)?;
        state.serialize_field("code", &self.code)?;
        state.serialize_field("message", &self.message)?;
        state.serialize_field("request_id", &self.request_id)?;
        state.serialize_field("reason", &self.reason)?;
        let cause_message = self.cause.as_ref().map(|c| c.to_string());
        state.serialize_field("cause", &cause_message)?;
        state.end()
    }
}

#[derive(Deserialize)]
struct ProviderErrorWire {
    provider: String,
    model: String,
    status: Option<u16>,
    code: Option<String>,
    message: String,
    request_id: Option<String>,
    reason: FailoverReason,
    cause: Option<String>,
}

impl<'de> Deserialize<'de> for ProviderError {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let wire = ProviderErrorWire::deserialize(deserializer)?;
        Ok(ProviderError {
            provider: wire.provider,
            model: wire.model,
            status: wire.status,
            code: wire.code,
            message: wire.message,
            request_id: wire.request_id,
            reason: wire.reason,
            cause: wire.cause.map(|s| Arc::from(s) as Arc<dyn std::error::Error + Send + Sync>),
        })
    }
}

impl ProviderError {
    /// Step (2) of the precedence: classify from a known HTTP status code.
    pub fn from_status(
        provider: impl Into<String>,
        model: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        let reason = reason_from_status(status);
        ProviderError {
            provider: provider.into(),
            model: model.into(),
            status: Some(status),
            code: None,
            message: message.into(),
            request_id: None,
            reason,
            cause: None,
        }
    }

    /// Step (3): classify from a vendor-specific error code string (e.g. `"rate_limit_error"`,
    /// `"insufficient_quota"`).
    pub fn from_vendor_code(
        provider: impl Into<String>,
        model: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let code = code.into();
        let reason = reason_from_vendor_code(&code).unwrap_or(FailoverReason::Unknown);
        ProviderError {
            provider: provider.into(),
            model: model.into(),
            status: None,
            code: Some(code),
            message: message.into(),
            request_id: None,
            reason,
            cause: None,
        }
    }

    /// Step (4): classify from a case-insensitive substring search of the cause's message
    /// against the fixed pattern table. A `None` cause classifies to `Unknown`.
    pub fn from_cause(
        provider: impl Into<String>,
        model: impl Into<String>,
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        let message = cause
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        let reason = reason_from_message(&message);
        ProviderError {
            provider: provider.into(),
            model: model.into(),
            status: None,
            code: None,
            message,
            request_id: None,
            reason,
            cause: cause.map(Arc::from),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.reason.is_retryable()
    }

    pub fn should_failover(&self) -> bool {
        self.reason.should_failover()
    }
}

/// Step (2): HTTP status → [`FailoverReason`].
fn reason_from_status(status: u16) -> FailoverReason {
    match status {
        429 => FailoverReason::RateLimit,
        401 | 403 => FailoverReason::Auth,
        402 => FailoverReason::Billing,
        404 => FailoverReason::ModelUnavailable,
        400 | 422 => FailoverReason::InvalidRequest,
        408 | 504 => FailoverReason::Timeout,
        500..=599 => FailoverReason::ServerError,
        _ => FailoverReason::Unknown,
    }
}

/// Step (3): vendor error-code strings used across Anthropic/OpenAI/Gemini/Bedrock.
fn reason_from_vendor_code(code: &str) -> Option<FailoverReason> {
    let c = code.to_ascii_lowercase();
    Some(match c.as_str() {
        "rate_limit_error" | "rate_limit_exceeded" => FailoverReason::RateLimit,
        "insufficient_quota" | "billing_not_active" => FailoverReason::Billing,
        "authentication_error" | "invalid_api_key" | "permission_error" => FailoverReason::Auth,
        "content_policy_violation" | "content_filter" => FailoverReason::ContentFilter,
        "model_not_found" | "model_unavailable" => FailoverReason::ModelUnavailable,
        "invalid_request_error" | "invalid_argument" => FailoverReason::InvalidRequest,
        "api_error" | "internal_server_error" | "server_error" => FailoverReason::ServerError,
        "timeout" | "deadline_exceeded" => FailoverReason::Timeout,
        _ => return None,
    })
}

/// Step (4): the fixed case-insensitive substring pattern table (§4.1).
const PATTERNS: &[(&str, FailoverReason)] = &[
    ("timeout", FailoverReason::Timeout),
    ("deadline exceeded", FailoverReason::Timeout),
    ("etimedout", FailoverReason::Timeout),
    ("rate limit", FailoverReason::RateLimit),
    ("429", FailoverReason::RateLimit),
    ("too many requests", FailoverReason::RateLimit),
    ("unauthorized", FailoverReason::Auth),
    ("invalid api key", FailoverReason::Auth),
    ("authentication", FailoverReason::Auth),
    ("401", FailoverReason::Auth),
    ("403", FailoverReason::Auth),
    ("billing", FailoverReason::Billing),
    ("payment", FailoverReason::Billing),
    ("quota", FailoverReason::Billing),
    ("insufficient", FailoverReason::Billing),
    ("402", FailoverReason::Billing),
    ("content_filter", FailoverReason::ContentFilter),
    ("content policy", FailoverReason::ContentFilter),
    ("safety", FailoverReason::ContentFilter),
    ("blocked", FailoverReason::ContentFilter),
    ("model not found", FailoverReason::ModelUnavailable),
    ("does not exist", FailoverReason::ModelUnavailable),
    ("unavailable", FailoverReason::ModelUnavailable),
    ("500", FailoverReason::ServerError),
    ("502", FailoverReason::ServerError),
    ("503", FailoverReason::ServerError),
    ("504", FailoverReason::ServerError),
    ("internal server error", FailoverReason::ServerError),
    ("bad gateway", FailoverReason::ServerError),
    ("service unavailable", FailoverReason::ServerError),
    ("gateway timeout", FailoverReason::ServerError),
];

fn reason_from_message(message: &str) -> FailoverReason {
    let lower = message.to_ascii_lowercase();
    for (pattern, reason) in PATTERNS {
        if lower.contains(pattern) {
            return *reason;
        }
    }
    FailoverReason::Unknown
}

/// Free-function mirror of [`ProviderError::is_retryable`] for callers holding a
/// `&dyn std::error::Error` that may or may not already be a [`ProviderError`].
pub fn is_retryable(err: &ProviderError) -> bool {
    err.is_retryable()
}

pub fn should_failover(err: &ProviderError) -> bool {
    err.should_failover()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_precedence() {
        let e = ProviderError::from_status("openai", "gpt-4.1", 429, "slow down");
        assert_eq!(e.reason, FailoverReason::RateLimit);
        assert!(e.is_retryable());
        assert!(!e.should_failover());
    }

    #[test]
    fn vendor_code_precedence() {
        let e = ProviderError::from_vendor_code(
            "anthropic",
            "claude-haiku-4-5",
            "authentication_error",
            "bad key",
        );
        assert_eq!(e.reason, FailoverReason::Auth);
        assert!(!e.is_retryable());
        assert!(e.should_failover());
    }

    #[test]
    fn substring_fallback_case_insensitive() {
        let e = ProviderError::from_cause(
            "gemini",
            "gemini-2.5-flash",
            Some(Box::from("Request TIMED OUT waiting for upstream".to_string())
                as Box<dyn std::error::Error + Send + Sync>),
        );
        assert_eq!(e.reason, FailoverReason::Timeout);
        assert!(e.is_retryable());
    }

    #[test]
    fn no_cause_classifies_unknown() {
        let e = ProviderError::from_cause("ollama", "llama3", None);
        assert_eq!(e.reason, FailoverReason::Unknown);
        assert!(!e.is_retryable());
        assert!(!e.should_failover());
    }

    #[test]
    fn billing_substring_detected() {
        let e = ProviderError::from_cause(
            "openai",
            "gpt-4.1",
            Some(Box::from("insufficient_quota: please add a payment method".to_string())
                as Box<dyn std::error::Error + Send + Sync>),
        );
        assert_eq!(e.reason, FailoverReason::Billing);
        assert!(e.should_failover());
    }

    #[test]
    fn predicates_stable_under_rewrap() {
        // Re-wrapping a classified error in a new ProviderError (e.g. when propagating across a
        // retry boundary) must preserve both predicates (§8 quantified invariant).
        let inner = ProviderError::from_status("azure", "gpt-4o", 500, "boom");
        let retryable_before = inner.is_retryable();
        let failover_before = inner.should_failover();

        let rewrapped = ProviderError {
            reason: inner.reason,
            ..ProviderError::from_cause("azure", "gpt-4o", None)
        };
        assert_eq!(rewrapped.is_retryable(), retryable_before);
        assert_eq!(rewrapped.should_failover(), failover_before);
    }

    #[test]
    fn provider_error_roundtrips_through_json() {
        let err = ProviderError::from_status("anthropic", "claude-haiku-4-5", 429, "slow down")
            .with_request_id("req_123")
            .with_code("rate_limit_error");
        let json = serde_json::to_string(&err).unwrap();
        let restored: ProviderError = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.provider, err.provider);
        assert_eq!(restored.status, err.status);
        assert_eq!(restored.reason, err.reason);
        assert_eq!(restored.request_id, err.request_id);
    }

    #[test]
    fn all_statuses_classify() {
        assert_eq!(reason_from_status(400), FailoverReason::InvalidRequest);
        assert_eq!(reason_from_status(401), FailoverReason::Auth);
        assert_eq!(reason_from_status(402), FailoverReason::Billing);
        assert_eq!(reason_from_status(404), FailoverReason::ModelUnavailable);
        assert_eq!(reason_from_status(408), FailoverReason::Timeout);
        assert_eq!(reason_from_status(503), FailoverReason::ServerError);
        assert_eq!(reason_from_status(200), FailoverReason::Unknown);
    }
}
