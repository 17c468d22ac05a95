use crate::anthropic::AnthropicTransport;
use crate::gemini::GeminiTransport;
use crate::ollama::OllamaTransport;
use crate::openai::OpenAiCompatTransport;
use crate::resolver::{resolve, ProviderKind};
use crate::streaming::{stream_channel, DeltaStream, StreamHandle};
use crate::types::*;
use crate::{anthropic, gemini, utils, ChatTransport};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// HTTP implementation of [`ChatTransport`]. Resolves the wire protocol
/// on every call and owns the one shared connection pool.
///
/// Vendor transports that fail during setup are retried once through the
/// vendor's OpenAI-compatible surface before the error is reported.
/// Configuration errors are never retried; nothing downstream can fix
/// them.
pub struct HttpChatTransport {
    http: Client,
}

impl HttpChatTransport {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }

    async fn open_stream_as(
        &self,
        kind: ProviderKind,
        provider: &ProviderSettings,
        request: &ChatRequest,
        handle: StreamHandle,
    ) -> Result<()> {
        match kind {
            ProviderKind::Anthropic => {
                AnthropicTransport::new(self.http.clone(), provider)
                    .open_stream(request, handle)
                    .await
            }
            ProviderKind::Gemini => {
                GeminiTransport::new(self.http.clone(), provider)
                    .open_stream(request, handle)
                    .await
            }
            ProviderKind::Ollama => {
                OllamaTransport::new(self.http.clone(), provider)
                    .open_stream(request, handle)
                    .await
            }
            ProviderKind::OpenAiCompat => {
                OpenAiCompatTransport::new(self.http.clone(), provider)
                    .open_stream(request, handle)
                    .await
            }
        }
    }

    async fn complete_as(
        &self,
        kind: ProviderKind,
        provider: &ProviderSettings,
        request: &ChatRequest,
    ) -> Result<Completion> {
        match kind {
            ProviderKind::Anthropic => {
                AnthropicTransport::new(self.http.clone(), provider)
                    .complete(request)
                    .await
            }
            ProviderKind::Gemini => {
                GeminiTransport::new(self.http.clone(), provider)
                    .complete(request)
                    .await
            }
            ProviderKind::Ollama => {
                OllamaTransport::new(self.http.clone(), provider)
                    .complete(request)
                    .await
            }
            ProviderKind::OpenAiCompat => {
                OpenAiCompatTransport::new(self.http.clone(), provider)
                    .complete(request)
                    .await
            }
        }
    }

    async fn list_models_as(
        &self,
        kind: ProviderKind,
        provider: &ProviderSettings,
    ) -> Result<Vec<String>> {
        match kind {
            ProviderKind::Anthropic => {
                AnthropicTransport::new(self.http.clone(), provider)
                    .list_models()
                    .await
            }
            ProviderKind::Gemini => {
                GeminiTransport::new(self.http.clone(), provider)
                    .list_models()
                    .await
            }
            ProviderKind::Ollama => {
                OllamaTransport::new(self.http.clone(), provider)
                    .list_models()
                    .await
            }
            ProviderKind::OpenAiCompat => {
                OpenAiCompatTransport::new(self.http.clone(), provider)
                    .list_models()
                    .await
            }
        }
    }

    fn compat_transport(
        &self,
        kind: ProviderKind,
        provider: &ProviderSettings,
    ) -> OpenAiCompatTransport {
        OpenAiCompatTransport::with_base_url(
            self.http.clone(),
            compat_base(kind, &provider.endpoint),
            provider.api_key.clone(),
        )
    }
}

impl Default for HttpChatTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatTransport for HttpChatTransport {
    async fn stream_chat(
        &self,
        provider: &ProviderSettings,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        validate(provider, &request)?;
        let kind = resolve(&provider.endpoint, Some(&provider.name));
        debug!("Streaming via {} transport: {}", kind, provider.endpoint);

        let (handle, stream) = stream_channel(cancel.clone());
        match self.open_stream_as(kind, provider, &request, handle).await {
            Ok(()) => Ok(stream),
            Err(error) if kind != ProviderKind::OpenAiCompat && worth_compat_retry(&error) => {
                warn!(
                    "{} stream setup failed ({}), retrying via the OpenAI-compatible surface",
                    kind, error
                );
                let (handle, stream) = stream_channel(cancel);
                self.compat_transport(kind, provider)
                    .open_stream(&request, handle)
                    .await?;
                Ok(stream)
            }
            Err(error) => Err(error),
        }
    }

    async fn complete(
        &self,
        provider: &ProviderSettings,
        request: ChatRequest,
    ) -> Result<Completion> {
        validate(provider, &request)?;
        let kind = resolve(&provider.endpoint, Some(&provider.name));
        debug!("Completing via {} transport: {}", kind, provider.endpoint);

        match self.complete_as(kind, provider, &request).await {
            Ok(completion) => Ok(completion),
            Err(error) if kind != ProviderKind::OpenAiCompat && worth_compat_retry(&error) => {
                warn!(
                    "{} completion failed ({}), retrying via the OpenAI-compatible surface",
                    kind, error
                );
                self.compat_transport(kind, provider).complete(&request).await
            }
            Err(error) => Err(error),
        }
    }

    async fn list_models(&self, provider: &ProviderSettings) -> Vec<String> {
        if provider.endpoint.trim().is_empty() {
            warn!("Cannot list models: no endpoint configured");
            return Vec::new();
        }
        let kind = resolve(&provider.endpoint, Some(&provider.name));

        match self.list_models_as(kind, provider).await {
            Ok(models) => models,
            Err(error) => {
                warn!("Failed to list {} models: {}", kind, error);
                if kind == ProviderKind::OpenAiCompat {
                    return Vec::new();
                }
                match self.compat_transport(kind, provider).list_models().await {
                    Ok(models) => models,
                    Err(error) => {
                        warn!("Model list fallback failed too: {}", error);
                        Vec::new()
                    }
                }
            }
        }
    }
}

fn validate(provider: &ProviderSettings, request: &ChatRequest) -> Result<()> {
    if provider.endpoint.trim().is_empty() {
        return Err(ApiError::Configuration(
            "no endpoint configured for the active provider".to_string(),
        )
        .into());
    }
    if request.model.trim().is_empty() {
        return Err(
            ApiError::Configuration("no model selected for the active provider".to_string()).into(),
        );
    }
    Ok(())
}

fn worth_compat_retry(error: &anyhow::Error) -> bool {
    !matches!(
        error.downcast_ref::<ApiError>(),
        Some(ApiError::Configuration(_))
    )
}

/// Where a vendor's OpenAI-compatible surface lives, derived from the
/// configured endpoint so custom hosts keep working.
fn compat_base(kind: ProviderKind, endpoint: &str) -> String {
    match kind {
        ProviderKind::Anthropic => anthropic::normalized_base(endpoint),
        ProviderKind::Gemini => utils::join_url(&gemini::normalized_base(endpoint), "openai"),
        ProviderKind::Ollama => utils::join_url(endpoint.trim_end_matches('/'), "v1"),
        ProviderKind::OpenAiCompat => endpoint.trim_end_matches('/').to_string(),
    }
}
