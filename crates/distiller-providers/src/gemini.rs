use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use distiller_types::{
    ArtifactState, ModelInfo, ProviderInfo, RemoteFileHandle, SourceArtifact, TokenUsage,
    TurnMetadata,
};

use crate::{
    truncate_for_error, ArtifactStateSink, ChunkStream, RemoteModelClient, StreamChunk,
    TurnReply, TurnRequest, DEFAULT_MODEL,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(3);

pub struct GeminiClient {
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    client: Client,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            client: Client::new(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    async fn start_resumable_upload(&self, artifact: &SourceArtifact) -> anyhow::Result<String> {
        let resp = self
            .client
            .post(format!("{}/upload/v1beta/files", self.base_url))
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header(
                "X-Goog-Upload-Header-Content-Length",
                artifact.len().to_string(),
            )
            .header("X-Goog-Upload-Header-Content-Type", &artifact.mime_type)
            .json(&json!({ "file": { "display_name": artifact.display_name } }))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "Failed to create file resource ({}): {}",
                status,
                truncate_for_error(&text, 500)
            );
        }
        let Some(upload_url) = resp
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
        else {
            anyhow::bail!("Failed to create file resource: response carried no upload URL");
        };
        Ok(upload_url.to_string())
    }

    async fn fetch_file(&self, name: &str) -> anyhow::Result<Value> {
        let resp = self
            .client
            .get(format!("{}/v1beta/{}", self.base_url, name))
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("Polling failed with status: {}", status);
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl RemoteModelClient for GeminiClient {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "gemini".to_string(),
            name: "Google Gemini".to_string(),
            models: ["gemini-2.5-flash", "gemini-2.5-pro"]
                .into_iter()
                .map(|id| ModelInfo {
                    id: id.to_string(),
                    provider_id: "gemini".to_string(),
                    display_name: id.to_string(),
                })
                .collect(),
        }
    }

    async fn upload(
        &self,
        artifact: &SourceArtifact,
        on_state: ArtifactStateSink<'_>,
    ) -> anyhow::Result<RemoteFileHandle> {
        on_state(ArtifactState::Uploading);
        let upload_url = self.start_resumable_upload(artifact).await?;

        let resp = self
            .client
            .post(upload_url)
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(artifact.bytes.as_ref().clone())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "Failed to upload file bytes ({}): {}",
                status,
                truncate_for_error(&text, 500)
            );
        }
        let value: Value = resp.json().await?;
        let mut file = value.get("file").cloned().unwrap_or(value);

        on_state(ArtifactState::Processing);
        loop {
            let Some(name) = file.get("name").and_then(Value::as_str).map(str::to_string) else {
                anyhow::bail!("upload response carried no file name");
            };
            let state = file
                .get("state")
                .and_then(Value::as_str)
                .and_then(ArtifactState::parse)
                .unwrap_or(ArtifactState::Processing);
            match state {
                ArtifactState::Active => {
                    on_state(ArtifactState::Active);
                    return parse_file_handle(&file, &artifact.mime_type);
                }
                ArtifactState::Failed => {
                    on_state(ArtifactState::Failed);
                    let detail = file
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown error");
                    anyhow::bail!("File processing failed: {detail}");
                }
                ArtifactState::Uploading | ArtifactState::Processing => {
                    tokio::time::sleep(self.poll_interval).await;
                    file = self.fetch_file(&name).await?;
                }
            }
        }
    }

    async fn generate(&self, request: TurnRequest) -> anyhow::Result<TurnReply> {
        let model = model_or_default(&request.model);
        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, model);
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&wire_body(&request))
            .send()
            .await?;
        let status = resp.status();
        let value: Value = resp.json().await?;
        if !status.is_success() {
            let detail = extract_gemini_error(&value)
                .unwrap_or_else(|| format!("API request failed with status {}", status));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_gemini_error(&value) {
            anyhow::bail!(detail);
        }
        Ok(TurnReply {
            text: extract_text(&value),
            metadata: extract_metadata(&value),
        })
    }

    async fn stream(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let model = model_or_default(&request.model);
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
            self.base_url, model
        );
        let resp = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&wire_body(&request))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "API request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer: Vec<u8> = Vec::new();
            let mut last_payload: Option<Value> = None;
            let mut cancelled = false;
            loop {
                let next = bytes.next().await;
                if cancel.is_cancelled() {
                    cancelled = true;
                    break;
                }
                let ended = next.is_none();
                if let Some(chunk) = next {
                    let chunk = chunk?;
                    buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));
                }
                // The last frame may arrive without its blank-line terminator.
                let payloads = if ended {
                    flush_sse_tail(&mut buffer)
                } else {
                    drain_sse_payloads(&mut buffer)
                };
                for payload in payloads {
                    let Ok(value) = serde_json::from_str::<Value>(&payload) else {
                        tracing::debug!(target: "distiller.providers", "skipping unparsable SSE payload");
                        continue;
                    };
                    if let Some(detail) = extract_gemini_error(&value) {
                        Err(anyhow::anyhow!(detail))?;
                    }
                    let text = extract_text(&value);
                    if !text.is_empty() {
                        yield StreamChunk::TextDelta(text);
                    }
                    last_payload = Some(value);
                }
                if ended {
                    break;
                }
            }
            let metadata = if cancelled {
                TurnMetadata {
                    finish_reason: Some("cancelled".to_string()),
                    ..TurnMetadata::default()
                }
            } else {
                last_payload
                    .as_ref()
                    .map(extract_metadata)
                    .unwrap_or_default()
            };
            yield StreamChunk::Done { metadata };
        };
        Ok(Box::pin(stream))
    }
}

fn model_or_default(model: &str) -> &str {
    let trimmed = model.trim();
    if trimmed.is_empty() {
        DEFAULT_MODEL
    } else {
        trimmed
    }
}

pub(crate) fn wire_body(request: &TurnRequest) -> Value {
    let contents = request
        .messages
        .iter()
        .map(|message| {
            let mut parts = Vec::new();
            if let Some(file) = message.attachment.as_ref() {
                parts.push(json!({
                    "file_data": { "mime_type": file.mime_type, "file_uri": file.uri }
                }));
            }
            parts.push(json!({ "text": message.text }));
            json!({ "role": message.role.as_str(), "parts": parts })
        })
        .collect::<Vec<_>>();
    json!({
        "contents": contents,
        "generationConfig": { "temperature": request.temperature },
    })
}

/// Removes every complete `data:` frame from the buffer and returns the payloads.
pub(crate) fn drain_sse_payloads(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut payloads = Vec::new();
    while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
        let frame = String::from_utf8_lossy(&buffer[..pos]).to_string();
        buffer.drain(..pos + 2);
        payloads.extend(frame_payload(&frame));
    }
    payloads
}

/// Drains complete frames, then treats whatever is left as a final frame.
pub(crate) fn flush_sse_tail(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut payloads = drain_sse_payloads(buffer);
    let tail = String::from_utf8_lossy(buffer).to_string();
    buffer.clear();
    payloads.extend(frame_payload(&tail));
    payloads
}

fn frame_payload(frame: &str) -> Option<String> {
    let data = frame
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim_start)
        .collect::<Vec<_>>()
        .join("\n");
    let trimmed = data.trim();
    (!trimmed.is_empty() && trimmed != "[DONE]").then_some(data)
}

fn parse_file_handle(file: &Value, fallback_mime: &str) -> anyhow::Result<RemoteFileHandle> {
    let name = file.get("name").and_then(Value::as_str).unwrap_or_default();
    let Some(uri) = file.get("uri").and_then(Value::as_str) else {
        anyhow::bail!("file `{}` is active but has no URI", name);
    };
    Ok(RemoteFileHandle {
        name: name.to_string(),
        uri: uri.to_string(),
        mime_type: file
            .get("mimeType")
            .and_then(Value::as_str)
            .unwrap_or(fallback_mime)
            .to_string(),
    })
}

pub(crate) fn extract_text(value: &Value) -> String {
    value
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter(|p| !p.get("thought").and_then(Value::as_bool).unwrap_or(false))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<String>()
        })
        .unwrap_or_default()
}

pub(crate) fn extract_metadata(value: &Value) -> TurnMetadata {
    let usage = value.get("usageMetadata").map(|u| {
        let prompt_tokens = u
            .get("promptTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let completion_tokens = u
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        TokenUsage {
            prompt_tokens,
            completion_tokens,
            total_tokens: u
                .get("totalTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(prompt_tokens.saturating_add(completion_tokens)),
        }
    });
    let mut raw = value.clone();
    if let Some(candidates) = raw.get_mut("candidates").and_then(Value::as_array_mut) {
        for candidate in candidates {
            if let Some(obj) = candidate.as_object_mut() {
                obj.remove("content");
            }
        }
    }
    TurnMetadata {
        finish_reason: value
            .get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finishReason"))
            .and_then(Value::as_str)
            .map(str::to_string),
        model_version: value
            .get("modelVersion")
            .and_then(Value::as_str)
            .map(str::to_string),
        usage,
        raw: Some(raw),
    }
}

fn extract_gemini_error(value: &Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            value
                .get("promptFeedback")
                .and_then(|v| v.get("blockReason"))
                .and_then(Value::as_str)
                .map(|reason| format!("prompt blocked: {reason}"))
        })
}
