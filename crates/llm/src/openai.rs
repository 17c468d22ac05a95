use crate::streaming::{sse_data, LineBuffer, StreamHandle};
use crate::types::*;
use crate::utils;
use anyhow::Result;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Transport for OpenAI-compatible chat-completions endpoints. This is
/// the default protocol and also serves as the fallback surface for
/// vendors that expose a compatibility layer.
pub(crate) struct OpenAiCompatTransport {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Clone, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Clone, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl OpenAiRequest {
    fn into_streaming(mut self) -> Self {
        self.stream = Some(true);
        self.stream_options = Some(StreamOptions {
            include_usage: true,
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAiStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl OpenAiCompatTransport {
    pub(crate) fn new(client: Client, provider: &ProviderSettings) -> Self {
        Self::with_base_url(
            client,
            provider.endpoint.trim_end_matches('/').to_string(),
            provider.api_key.clone(),
        )
    }

    /// Used by the vendor-fallback path, which substitutes the vendor's
    /// compatibility base for the configured endpoint.
    pub(crate) fn with_base_url(client: Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    fn build_request(&self, request: &ChatRequest) -> OpenAiRequest {
        OpenAiRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(convert_message).collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: None,
            stream_options: None,
        }
    }

    async fn send(&self, payload: &OpenAiRequest) -> Result<Response> {
        let mut builder = self
            .client
            .post(utils::join_url(&self.base_url, "chat/completions"))
            .header("Content-Type", "application/json");
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let response = builder
            .json(payload)
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
        let payload = self.build_request(request).into_streaming();
        let response = self.send(&payload).await?;
        tokio::spawn(pump(response, handle));
        Ok(())
    }

    pub(crate) async fn complete(&self, request: &ChatRequest) -> Result<Completion> {
        let payload = self.build_request(request);
        let response = self.send(&payload).await?;
        let parsed: OpenAiResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Unknown(format!("Failed to parse response: {}", e)))?;

        let text = parsed
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_str())
            .unwrap_or_default()
            .to_string();

        Ok(Completion {
            text,
            usage: parsed.usage.map(into_usage).unwrap_or_default(),
        })
    }

    pub(crate) async fn list_models(&self) -> Result<Vec<String>> {
        let mut builder = self.client.get(utils::join_url(&self.base_url, "models"));
        if !self.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.api_key));
        }
        let response = builder
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

fn into_usage(usage: OpenAiUsage) -> Usage {
    Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
    }
}

/// Text-only messages use the simple string form; multimodal content
/// uses the structured part array with data-URL images.
fn convert_message(message: &Message) -> OpenAiMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    let content = match &message.content {
        MessageContent::Text(text) => serde_json::json!(text),
        MessageContent::Parts(parts) => {
            let converted: Vec<serde_json::Value> = parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(serde_json::json!({
                        "type": "text",
                        "text": text,
                    })),
                    ContentPart::Image { media_type, data } => Some(serde_json::json!({
                        "type": "image_url",
                        "image_url": {
                            "url": format!("data:{};base64,{}", media_type, data),
                        },
                    })),
                    ContentPart::ImageRef { reference } => {
                        warn!("Unresolved image reference in outgoing message: {}", reference);
                        None
                    }
                })
                .collect();
            if converted.len() == 1 && converted[0].get("type") == Some(&serde_json::json!("text"))
            {
                serde_json::json!(converted[0]["text"].as_str().unwrap_or(""))
            } else {
                serde_json::json!(converted)
            }
        }
    };

    OpenAiMessage {
        role: role.to_string(),
        content,
    }
}

/// Drains the SSE body into the stream handle. The literal `[DONE]`
/// frame is the terminal; usage rides on the final data frame when the
/// server honors `stream_options.include_usage`.
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

fn handle_line(line: &str, handle: &StreamHandle, usage: &mut Usage) -> bool {
    let Some(data) = sse_data(line) else {
        return false;
    };

    if data.trim() == "[DONE]" {
        handle.done(*usage);
        return true;
    }

    match serde_json::from_str::<OpenAiStreamResponse>(data) {
        Ok(chunk) => {
            if let Some(choice) = chunk.choices.first() {
                if let Some(content) = &choice.delta.content {
                    handle.emit(content);
                }
            }
            if let Some(chunk_usage) = chunk.usage {
                *usage = into_usage(chunk_usage);
            }
        }
        Err(e) => warn!("Failed to parse stream event: '{}' ({})", data, e),
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_delta_parsing() {
        let data = r#"{"choices":[{"index":0,"delta":{"content":"Hi "},"finish_reason":null}]}"#;
        let parsed: OpenAiStreamResponse = serde_json::from_str(data).unwrap();
        assert_eq!(
            parsed.choices[0].delta.content.as_deref(),
            Some("Hi ")
        );
    }

    #[test]
    fn test_usage_rides_on_final_chunk() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":3}}"#;
        let parsed: OpenAiStreamResponse = serde_json::from_str(data).unwrap();
        assert_eq!(
            parsed.usage.map(into_usage),
            Some(Usage {
                input_tokens: 9,
                output_tokens: 3
            })
        );
    }

    #[test]
    fn test_convert_message_single_text_part_collapses() {
        let message = Message::parts(
            Role::User,
            vec![ContentPart::Text {
                text: "plain".to_string(),
            }],
        );
        let converted = convert_message(&message);
        assert_eq!(converted.content, serde_json::json!("plain"));
    }

    #[test]
    fn test_convert_message_images_use_data_urls() {
        let message = Message::parts(
            Role::User,
            vec![
                ContentPart::Text {
                    text: "look".to_string(),
                },
                ContentPart::Image {
                    media_type: "image/png".to_string(),
                    data: "aGVsbG8=".to_string(),
                },
            ],
        );
        let converted = convert_message(&message);
        let parts = converted.content.as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(
            parts[1]["image_url"]["url"],
            "data:image/png;base64,aGVsbG8="
        );
    }
}
