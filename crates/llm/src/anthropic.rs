use crate::streaming::{sse_data, LineBuffer, StreamHandle};
use crate::types::*;
use crate::utils;
use anyhow::Result;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Normalizes a configured endpoint to the versioned API base, so both
/// "https://api.anthropic.com" and ".../v1" work in settings.
pub(crate) fn normalized_base(endpoint: &str) -> String {
    let base = endpoint.trim_end_matches('/');
    if base.ends_with("/v1") {
        base.to_string()
    } else {
        format!("{}/v1", base)
    }
}

/// Transport for the Anthropic Messages API.
pub(crate) struct AnthropicTransport {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<AnthropicBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicBlock {
    Text { text: String },
    Image { source: ImageSource },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart { message: StartedMessage },
    ContentBlockStart,
    ContentBlockDelta { delta: ContentDelta },
    ContentBlockStop,
    MessageDelta { usage: Option<EventUsage> },
    MessageStop,
    Ping,
    Error { error: ErrorDetail },
}

#[derive(Debug, Deserialize)]
struct StartedMessage {
    #[serde(default)]
    usage: Option<EventUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentDelta {
    TextDelta { text: String },
    InputJsonDelta,
    ThinkingDelta,
    SignatureDelta,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
struct EventUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    usage: Option<EventUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

fn map_error_event(error: ErrorDetail) -> ApiError {
    match error.kind.as_str() {
        "overloaded_error" => ApiError::Overloaded(error.message),
        "rate_limit_error" => ApiError::RateLimit(error.message),
        "authentication_error" => ApiError::Authentication(error.message),
        _ => ApiError::ServiceError(format!("{}: {}", error.kind, error.message)),
    }
}

impl AnthropicTransport {
    pub(crate) fn new(client: Client, provider: &ProviderSettings) -> Self {
        Self {
            client,
            base_url: normalized_base(&provider.endpoint),
            api_key: provider.api_key.clone(),
        }
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> AnthropicRequest {
        let (system, messages) = convert_messages(&request.messages);
        AnthropicRequest {
            model: request.model.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system,
            messages,
            stream: stream.then_some(true),
        }
    }

    async fn send(&self, payload: &AnthropicRequest) -> Result<Response> {
        let response = self
            .client
            .post(utils::join_url(&self.base_url, "messages"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(payload)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;
        utils::check_response_error(response).await
    }

    /// Opens the SSE stream and hands the response body to a pump task.
    /// Errors here are setup failures; after `Ok` all outcomes arrive as
    /// stream frames.
    pub(crate) async fn open_stream(
        &self,
        request: &ChatRequest,
        handle: StreamHandle,
    ) -> Result<()> {
        let payload = self.build_request(request, true);
        let response = self.send(&payload).await?;
        tokio::spawn(pump(response, handle));
        Ok(())
    }

    pub(crate) async fn complete(&self, request: &ChatRequest) -> Result<Completion> {
        let payload = self.build_request(request, false);
        let response = self.send(&payload).await?;
        let parsed: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Unknown(format!("Failed to parse response: {}", e)))?;

        let text = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(text.as_str()),
                ResponseBlock::Other => None,
            })
            .collect::<String>();

        Ok(Completion {
            text,
            usage: parsed.usage.map(into_usage).unwrap_or_default(),
        })
    }

    pub(crate) async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(utils::join_url(&self.base_url, "models"))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;
        let response = utils::check_response_error(response).await?;
        let parsed: ModelsResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Unknown(format!("Failed to parse model list: {}", e)))?;
        Ok(parsed.data.into_iter().map(|entry| entry.id).collect())
    }
}

fn into_usage(usage: EventUsage) -> Usage {
    Usage {
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
    }
}

/// Splits canonical messages into the top-level system prompt and the
/// user/assistant turn list the Messages API expects. System messages
/// keep their relative order; consecutive same-role turns are merged
/// because the API rejects them.
fn convert_messages(messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
    let mut system_parts: Vec<String> = Vec::new();
    let mut turns: Vec<AnthropicMessage> = Vec::new();

    for message in messages {
        if message.role == Role::System {
            let text = message.text_content();
            if !text.is_empty() {
                system_parts.push(text);
            }
            continue;
        }

        let role = match message.role {
            Role::Assistant => "assistant",
            _ => "user",
        };
        let blocks = convert_blocks(&message.content);
        if blocks.is_empty() {
            continue;
        }

        match turns.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => turns.push(AnthropicMessage {
                role,
                content: blocks,
            }),
        }
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };
    (system, turns)
}

fn convert_blocks(content: &MessageContent) -> Vec<AnthropicBlock> {
    match content {
        MessageContent::Text(text) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![AnthropicBlock::Text { text: text.clone() }]
            }
        }
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(AnthropicBlock::Text { text: text.clone() }),
                ContentPart::Image { media_type, data } => Some(AnthropicBlock::Image {
                    source: ImageSource {
                        source_type: "base64",
                        media_type: media_type.clone(),
                        data: data.clone(),
                    },
                }),
                ContentPart::ImageRef { reference } => {
                    warn!("Unresolved image reference in outgoing message: {}", reference);
                    None
                }
            })
            .collect(),
    }
}

/// Drains the SSE body into the stream handle. `message_stop` and error
/// events terminate the stream; an exhausted body without either leaves
/// the handle unterminated so the consumer observes an abnormal close.
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
}

/// Returns true once a terminal event was handled.
fn handle_line(line: &str, handle: &StreamHandle, usage: &mut Usage) -> bool {
    let Some(data) = sse_data(line) else {
        return false;
    };

    match serde_json::from_str::<StreamEvent>(data) {
        Ok(StreamEvent::ContentBlockDelta {
            delta: ContentDelta::TextDelta { text },
        }) => handle.emit(&text),
        Ok(StreamEvent::MessageStart { message }) => {
            if let Some(event_usage) = message.usage {
                usage.input_tokens = event_usage.input_tokens;
            }
        }
        Ok(StreamEvent::MessageDelta {
            usage: Some(event_usage),
        }) => {
            usage.output_tokens = event_usage.output_tokens;
        }
        Ok(StreamEvent::MessageStop) => {
            handle.done(*usage);
            return true;
        }
        Ok(StreamEvent::Error { error }) => {
            handle.fail(map_error_event(error));
            return true;
        }
        Ok(_) => {}
        Err(e) => warn!("Failed to parse stream event: '{}' ({})", data, e),
    }
    false
}
