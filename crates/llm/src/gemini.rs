use crate::streaming::{sse_data, LineBuffer, StreamHandle};
use crate::types::*;
use crate::utils;
use anyhow::Result;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Normalizes a configured endpoint to the versioned Gemini API base.
pub(crate) fn normalized_base(endpoint: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if base.ends_with("/v1beta") || base.ends_with("/v1") {
        base.to_string()
    } else {
        format!("{}/v1beta", base)
    }
}

/// Transport for the Gemini generateContent API.
pub(crate) struct GeminiTransport {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

// Gemini has no dedicated image part on assistant turns; inline data and
// text share one part shape on the wire.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    error: Option<GeminiError>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<GeminiContent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    name: String,
}

fn map_error(error: GeminiError) -> ApiError {
    match error.code {
        429 => ApiError::RateLimit(error.message),
        401 | 403 => ApiError::Authentication(error.message),
        400 => ApiError::InvalidRequest(error.message),
        code if code >= 500 => ApiError::ServiceError(error.message),
        _ => ApiError::Unknown(error.message),
    }
}

impl GeminiTransport {
    pub(crate) fn new(client: Client, provider: &ProviderSettings) -> Self {
        Self {
            client,
            base_url: normalized_base(&provider.endpoint),
            api_key: provider.api_key.clone(),
        }
    }

    fn build_request(&self, request: &ChatRequest) -> GeminiRequest {
        let (system_instruction, contents) = convert_messages(&request.messages);
        GeminiRequest {
            system_instruction,
            contents,
            generation_config: Some(GenerationConfig {
                temperature: request.temperature,
                max_output_tokens: request.max_tokens,
            }),
        }
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<Response> {
        let action = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let url = format!(
            "{}/models/{}:{}",
            self.base_url, request.model, action
        );

        let mut builder = self.client.post(&url);
        builder = if stream {
            builder.query(&[("key", self.api_key.as_str()), ("alt", "sse")])
        } else {
            builder.query(&[("key", self.api_key.as_str())])
        };

        let response = builder
            .json(&self.build_request(request))
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;
        utils::check_response_error(response).await
    }

    pub(crate) async fn open_stream(
        &self,
        request: &ChatRequest,
        handle: StreamHandle,
    ) -> Result<()> {
        let response = self.send(request, true).await?;
        tokio::spawn(pump(response, handle));
        Ok(())
    }

    pub(crate) async fn complete(&self, request: &ChatRequest) -> Result<Completion> {
        let response = self.send(request, false).await?;
        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Unknown(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = parsed.error {
            return Err(map_error(error).into());
        }

        Ok(Completion {
            text: candidate_text(&parsed),
            usage: usage_from(&parsed),
        })
    }

    pub(crate) async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(utils::join_url(&self.base_url, "models"))
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;
        let response = utils::check_response_error(response).await?;
        let parsed: ModelsResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Unknown(format!("Failed to parse model list: {}", e)))?;
        Ok(parsed
            .models
            .into_iter()
            .map(|entry| {
                entry
                    .name
                    .strip_prefix("models/")
                    .map(str::to_string)
                    .unwrap_or(entry.name)
            })
            .collect())
    }
}

/// Maps canonical messages onto Gemini roles. System messages become the
/// systemInstruction (order preserved); assistant turns use the "model"
/// role.
fn convert_messages(messages: &[Message]) -> (Option<GeminiContent>, Vec<GeminiContent>) {
    let mut system_parts: Vec<GeminiPart> = Vec::new();
    let mut contents: Vec<GeminiContent> = Vec::new();

    for message in messages {
        if message.role == Role::System {
            let text = message.text_content();
            if !text.is_empty() {
                system_parts.push(text_part(text));
            }
            continue;
        }

        let role = match message.role {
            Role::Assistant => "model",
            _ => "user",
        };
        let parts = convert_parts(&message.content);
        if parts.is_empty() {
            continue;
        }
        contents.push(GeminiContent {
            role: Some(role.to_string()),
            parts,
        });
    }

    let system_instruction = if system_parts.is_empty() {
        None
    } else {
        Some(GeminiContent {
            role: None,
            parts: system_parts,
        })
    };
    (system_instruction, contents)
}

fn convert_parts(content: &MessageContent) -> Vec<GeminiPart> {
    match content {
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![text_part(text.clone())]
            }
        }
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text_part(text.clone())),
                ContentPart::Image { media_type, data } => Some(GeminiPart {
                    text: None,
                    inline_data: Some(InlineData {
                        mime_type: media_type.clone(),
                        data: data.clone(),
                    }),
                }),
                ContentPart::ImageRef { reference } => {
                    warn!("Unresolved image reference in outgoing message: {}", reference);
                    None
                }
            })
            .collect(),
    }
}

fn text_part(text: String) -> GeminiPart {
    GeminiPart {
        text: Some(text),
        inline_data: None,
    }
}

fn candidate_text(response: &GenerateContentResponse) -> String {
    response
        .candidates
        .iter()
        .filter_map(|candidate| candidate.content.as_ref())
        .flat_map(|content| content.parts.iter())
        .filter_map(|part| part.text.as_deref())
        .collect()
}

fn usage_from(response: &GenerateContentResponse) -> Usage {
    response
        .usage_metadata
        .as_ref()
        .map(|meta| Usage {
            input_tokens: meta.prompt_token_count,
            output_tokens: meta.candidates_token_count,
        })
        .unwrap_or_default()
}

/// Gemini SSE has no explicit end-of-stream event; an orderly body close
/// is the terminal. Error payloads arrive as regular data frames.
async fn pump(mut response: Response, handle: StreamHandle) {
    let mut lines = LineBuffer::new();
    let mut usage = Usage::default();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = handle.cancelled() => return,
            chunk = response.chunk() => chunk,
        };
        match chunk {
            Ok(Some(bytes)) => {
                for line in lines.push(&bytes) {
                    if handle_line(&line, &handle, &mut usage) {
                        return;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                handle.fail(ApiError::NetworkError(e.to_string()));
                return;
            }
        }
    }

    if let Some(line) = lines.finish() {
        if handle_line(&line, &handle, &mut usage) {
            return;
        }
    }
    handle.done(usage);
}

fn handle_line(line: &str, handle: &StreamHandle, usage: &mut Usage) -> bool {
    let Some(data) = sse_data(line) else {
        return false;
    };

    match serde_json::from_str::<GenerateContentResponse>(data) {
        Ok(chunk) => {
            if let Some(error) = chunk.error {
                handle.fail(map_error(error));
                return true;
            }
            let text = candidate_text(&chunk);
            handle.emit(&text);
            if chunk.usage_metadata.is_some() {
                *usage = usage_from(&chunk);
            }
        }
        Err(e) => warn!("Failed to parse stream event: '{}' ({})", data, e),
    }
    false
}
