use crate::streaming::{LineBuffer, StreamHandle};
use crate::types::*;
use crate::utils;
use anyhow::Result;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Transport for Ollama's native NDJSON chat API.
pub(crate) struct OllamaTransport {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    num_predict: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    images: Option<Vec<String>>,
}

/// One NDJSON line of a chat response. The final line carries
/// `done: true` plus the token counters.
#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    message: Option<OllamaMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

impl OllamaTransport {
    pub(crate) fn new(client: Client, provider: &ProviderSettings) -> Self {
        Self {
            client,
            base_url: provider.endpoint.trim_end_matches('/').to_string(),
        }
    }

    fn build_request(&self, request: &ChatRequest, stream: bool) -> OllamaRequest {
        OllamaRequest {
            model: request.model.clone(),
            messages: request.messages.iter().map(convert_message).collect(),
            stream,
            options: OllamaOptions {
                num_predict: request.max_tokens,
                temperature: request.temperature,
            },
        }
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<Response> {
        let response = self
            .client
            .post(utils::join_url(&self.base_url, "api/chat"))
            .json(&self.build_request(request, stream))
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
        let parsed: OllamaResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Unknown(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = parsed.error {
            return Err(ApiError::ServiceError(error).into());
        }

        let usage = usage_from(&parsed);
        Ok(Completion {
            text: parsed.message.map(|m| m.content).unwrap_or_default(),
            usage,
        })
    }

    pub(crate) async fn list_models(&self) -> Result<Vec<String>> {
        let response = self
            .client
            .get(utils::join_url(&self.base_url, "api/tags"))
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;
        let response = utils::check_response_error(response).await?;
        let parsed: TagsResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Unknown(format!("Failed to parse model list: {}", e)))?;
        Ok(parsed.models.into_iter().map(|entry| entry.name).collect())
    }
}

fn convert_message(message: &Message) -> OllamaMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };

    let mut images = Vec::new();
    if let MessageContent::Parts(parts) = &message.content {
        for part in parts {
            match part {
                ContentPart::Image { data, .. } => images.push(data.clone()),
                ContentPart::ImageRef { reference } => {
                    warn!("Unresolved image reference in outgoing message: {}", reference);
                }
                ContentPart::Text { .. } => {}
            }
        }
    }

    OllamaMessage {
        role: role.to_string(),
        content: message.text_content(),
        images: if images.is_empty() {
            None
        } else {
            Some(images)
        },
    }
}

fn usage_from(response: &OllamaResponse) -> Usage {
    Usage {
        input_tokens: response.prompt_eval_count.unwrap_or(0),
        output_tokens: response.eval_count.unwrap_or(0),
    }
}

/// Drains NDJSON lines into the stream handle. The `done: true` line is
/// the terminal; a body that ends without one surfaces as an abnormal
/// close through the dropped handle.
async fn pump(mut response: Response, handle: StreamHandle) {
    let mut lines = LineBuffer::new();

    loop {
        let chunk = tokio::select! {
            biased;
            _ = handle.cancelled() => return,
            chunk = response.chunk() => chunk,
        };
        match chunk {
            Ok(Some(bytes)) => {
                for line in lines.push(&bytes) {
                    if handle_line(&line, &handle) {
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
        if handle_line(&line, &handle) {
            return;
        }
    }
}

fn handle_line(line: &str, handle: &StreamHandle) -> bool {
    if line.trim().is_empty() {
        return false;
    }

    match serde_json::from_str::<OllamaResponse>(line) {
        Ok(parsed) => {
            if let Some(error) = parsed.error {
                handle.fail(ApiError::ServiceError(error));
                return true;
            }
            if let Some(message) = &parsed.message {
                handle.emit(&message.content);
            }
            if parsed.done {
                handle.done(usage_from(&parsed));
                return true;
            }
        }
        Err(e) => warn!("Failed to parse chunk line '{}': {}", line, e),
    }
    false
}
