//! One module per vendor facade, all implementing [`crate::cloudllm::provider::CompletionProvider`]
//! (§4.7).
//!
//! [`common`] holds the shared HTTP client, `ProviderConfig`, and the OpenAI-compatible
//! message/tool conversion helpers reused by [`openai`] and the thin wrappers built on top of it
//! ([`azure`], [`openrouter`], [`copilot`]). [`claude`] and [`gemini`] are native Shape A / Shape C
//! implementations respectively; [`ollama`] is NDJSON collapsed into Shape B; [`bedrock`] is
//! typed `ConverseStream` events collapsed into Shape B, gated behind the `bedrock` feature since
//! it pulls in the AWS SDK (§6, §9).

pub mod common;

pub mod azure;
#[cfg(feature = "bedrock")]
pub mod bedrock;
pub mod claude;
pub mod copilot;
pub mod gemini;
pub mod ollama;
pub mod openai;
pub mod openrouter;
