//! Picks the wire protocol for a configured provider.
//!
//! Resolution is a pure function of the endpoint string plus an optional
//! provider-name hint. It runs on every call, so editing the settings
//! takes effect on the next send without any sticky state.

/// The transport family used to talk to an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    Gemini,
    Ollama,
    /// Default for anything speaking the OpenAI chat-completions protocol.
    OpenAiCompat,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Ollama => "ollama",
            ProviderKind::OpenAiCompat => "openai-compatible",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolves the transport for an endpoint. A recognizable provider name
/// wins over the endpoint shape; unknown names fall back to inspecting
/// the endpoint; anything unrecognized speaks OpenAI-compatible.
pub fn resolve(endpoint: &str, hint: Option<&str>) -> ProviderKind {
    if let Some(kind) = hint.and_then(resolve_hint) {
        return kind;
    }

    let endpoint = endpoint.to_ascii_lowercase();
    if endpoint.contains("api.anthropic.com") {
        ProviderKind::Anthropic
    } else if endpoint.contains("generativelanguage.googleapis.com")
        || endpoint.contains("aiplatform.googleapis.com")
    {
        ProviderKind::Gemini
    } else if endpoint.contains(":11434") {
        ProviderKind::Ollama
    } else {
        ProviderKind::OpenAiCompat
    }
}

fn resolve_hint(hint: &str) -> Option<ProviderKind> {
    let hint = hint.to_ascii_lowercase();
    if hint.contains("anthropic") || hint.contains("claude") {
        Some(ProviderKind::Anthropic)
    } else if hint.contains("gemini") || hint.contains("google") {
        Some(ProviderKind::Gemini)
    } else if hint.contains("ollama") {
        Some(ProviderKind::Ollama)
    } else if hint.contains("openai") {
        Some(ProviderKind::OpenAiCompat)
    } else {
        None
    }
}
