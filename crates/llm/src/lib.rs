//! Chat completion transport over multiple LLM providers
//!
//! This crate implements:
//! - A common interface for chat completions via the ChatTransport trait
//! - Provider wire protocols (Anthropic, Gemini, Ollama, OpenAI-compatible)
//! - Normalization of streamed responses into ordered text deltas with
//!   exactly one terminal event per stream
//! - Endpoint-based provider resolution with an OpenAI-compatible fallback
//! - Provider settings persisted to providers.json


mod anthropic;
mod gemini;
mod ollama;
mod openai;
mod utils;

pub mod client;
pub mod resolver;
pub mod settings;
pub mod streaming;
pub mod types;

pub use client::HttpChatTransport;
pub use resolver::{resolve, ProviderKind};
pub use settings::{ProviderRegistry, ProviderStore};
pub use streaming::{stream_channel, DeltaStream, LineBuffer, StreamFrame, StreamHandle};
pub use tokio_util::sync::CancellationToken;
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;

/// Trait for chat completion backends.
///
/// The transport owns no conversation state. Callers pass the provider
/// settings with every call, so switching providers between requests
/// needs no teardown.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Opens a streaming completion.
    ///
    /// Returns once the stream is established; text arrives through the
    /// returned [`DeltaStream`]. Cancelling the token stops delivery
    /// promptly without waiting for the provider.
    async fn stream_chat(
        &self,
        provider: &ProviderSettings,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream>;

    /// Runs a completion to the end and returns the accumulated text.
    async fn complete(
        &self,
        provider: &ProviderSettings,
        request: ChatRequest,
    ) -> Result<Completion>;

    /// Model identifiers the provider advertises. Unreachable providers
    /// yield an empty list rather than an error.
    async fn list_models(&self, provider: &ProviderSettings) -> Vec<String>;
}
