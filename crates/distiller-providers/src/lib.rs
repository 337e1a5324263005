use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use distiller_types::{
    ArtifactState, ModelInfo, ProviderInfo, RemoteFileHandle, SourceArtifact, TurnMetadata,
    END_OF_BOOK_MARKER,
};

mod conversation;
mod gemini;

pub use conversation::Conversation;
pub use gemini::GeminiClient;

pub const DEFAULT_PROVIDER_ID: &str = "gemini";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Model,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Model => "model",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversationMessage {
    pub role: MessageRole,
    pub text: String,
    /// Only ever set on the opening user message of a job.
    pub attachment: Option<RemoteFileHandle>,
}

/// Everything one outbound call needs: the committed history followed by the
/// new user message.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub model: String,
    pub temperature: f32,
    pub messages: Vec<ConversationMessage>,
}

impl TurnRequest {
    pub fn last_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.text.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TurnReply {
    pub text: String,
    pub metadata: TurnMetadata,
}

/// Zero or more text deltas followed by exactly one `Done`.
#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    Done { metadata: TurnMetadata },
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

pub type ArtifactStateSink<'a> = &'a (dyn Fn(ArtifactState) + Send + Sync);

#[async_trait]
pub trait RemoteModelClient: Send + Sync {
    fn info(&self) -> ProviderInfo;

    /// Uploads the artifact and waits until the remote side can use it.
    async fn upload(
        &self,
        artifact: &SourceArtifact,
        on_state: ArtifactStateSink<'_>,
    ) -> anyhow::Result<RemoteFileHandle>;

    async fn generate(&self, request: TurnRequest) -> anyhow::Result<TurnReply>;

    async fn stream(
        &self,
        request: TurnRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        let reply = self.generate(request).await?;
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta(reply.text)),
            Ok(StreamChunk::Done {
                metadata: reply.metadata,
            }),
        ]);
        Ok(Box::pin(stream))
    }
}

/// Builds a client bound to one credential. A fresh client is created per job.
pub trait ClientFactory: Send + Sync {
    fn connect(&self, credential: &str) -> anyhow::Result<Arc<dyn RemoteModelClient>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_id")]
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Turns the local echo provider produces before it ends the book.
    #[serde(default)]
    pub echo_turns: Option<usize>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            id: default_provider_id(),
            url: None,
            poll_interval_ms: None,
            echo_turns: None,
        }
    }
}

fn default_provider_id() -> String {
    DEFAULT_PROVIDER_ID.to_string()
}

pub const SUPPORTED_PROVIDER_IDS: [&str; 2] = ["gemini", "local"];

#[derive(Debug, Clone, Default)]
pub struct ProviderFactory {
    config: ProviderConfig,
}

impl ProviderFactory {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }

    pub fn provider_id(&self) -> &str {
        self.config.id.as_str()
    }
}

impl ClientFactory for ProviderFactory {
    fn connect(&self, credential: &str) -> anyhow::Result<Arc<dyn RemoteModelClient>> {
        match self.config.id.trim().to_ascii_lowercase().as_str() {
            "gemini" => {
                if is_placeholder_api_key(credential) {
                    anyhow::bail!(
                        "a Gemini API key is required (set `GEMINI_API_KEY` or run `distiller config set-key`)"
                    );
                }
                let mut client = GeminiClient::new(credential.trim());
                if let Some(url) = self.config.url.as_deref() {
                    client = client.with_base_url(url);
                }
                if let Some(ms) = self.config.poll_interval_ms {
                    client = client.with_poll_interval(Duration::from_millis(ms));
                }
                Ok(Arc::new(client))
            }
            "local" => Ok(Arc::new(LocalEchoClient::new(
                self.config.echo_turns.unwrap_or(3),
            ))),
            other => anyhow::bail!(
                "provider `{}` is not supported. supported providers: {}",
                other,
                SUPPORTED_PROVIDER_IDS.join(", ")
            ),
        }
    }
}

pub fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

/// Offline provider for dry runs. Ends the book after `turns` replies.
pub struct LocalEchoClient {
    turns: usize,
}

impl LocalEchoClient {
    pub fn new(turns: usize) -> Self {
        Self {
            turns: turns.max(1),
        }
    }
}

#[async_trait]
impl RemoteModelClient for LocalEchoClient {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                id: "echo-1".to_string(),
                provider_id: "local".to_string(),
                display_name: "Echo Model".to_string(),
            }],
        }
    }

    async fn upload(
        &self,
        artifact: &SourceArtifact,
        on_state: ArtifactStateSink<'_>,
    ) -> anyhow::Result<RemoteFileHandle> {
        on_state(ArtifactState::Uploading);
        on_state(ArtifactState::Processing);
        on_state(ArtifactState::Active);
        Ok(RemoteFileHandle {
            name: format!("local/{}", artifact.display_name),
            uri: format!("local://{}", artifact.display_name),
            mime_type: artifact.mime_type.clone(),
        })
    }

    async fn generate(&self, request: TurnRequest) -> anyhow::Result<TurnReply> {
        let turn = request
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Model)
            .count()
            + 1;
        let prompt = request.last_user_text().unwrap_or_default();
        let first_line = prompt.lines().next().unwrap_or_default();
        let mut text = format!("## Section {turn}\n\nEcho: {first_line}");
        if turn >= self.turns {
            text.push_str("\n\n");
            text.push_str(END_OF_BOOK_MARKER);
        }
        Ok(TurnReply {
            text,
            metadata: TurnMetadata {
                finish_reason: Some("STOP".to_string()),
                model_version: Some(request.model),
                usage: None,
                raw: None,
            },
        })
    }
}

pub(crate) fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        return input.to_string();
    }
    let mut end = max_len;
    while !input.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &input[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn request(messages: Vec<ConversationMessage>) -> TurnRequest {
        TurnRequest {
            model: "echo-1".to_string(),
            temperature: 0.7,
            messages,
        }
    }

    fn user(text: &str) -> ConversationMessage {
        ConversationMessage {
            role: MessageRole::User,
            text: text.to_string(),
            attachment: None,
        }
    }

    fn model(text: &str) -> ConversationMessage {
        ConversationMessage {
            role: MessageRole::Model,
            text: text.to_string(),
            attachment: None,
        }
    }

    #[tokio::test]
    async fn default_stream_yields_text_then_done() {
        let client = LocalEchoClient::new(5);
        let mut stream = client
            .stream(request(vec![user("Seed prompt")]), CancellationToken::new())
            .await
            .expect("stream");
        let first = stream.next().await.expect("chunk").expect("ok");
        assert!(matches!(first, StreamChunk::TextDelta(ref t) if t.contains("Echo: Seed prompt")));
        let second = stream.next().await.expect("chunk").expect("ok");
        assert!(matches!(second, StreamChunk::Done { .. }));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn echo_client_emits_marker_on_final_turn() {
        let client = LocalEchoClient::new(2);
        let first = client
            .generate(request(vec![user("Seed")]))
            .await
            .expect("reply");
        assert!(!first.text.contains(END_OF_BOOK_MARKER));
        let second = client
            .generate(request(vec![user("Seed"), model("one"), user("Next")]))
            .await
            .expect("reply");
        assert!(second.text.ends_with(END_OF_BOOK_MARKER));
    }

    #[tokio::test]
    async fn echo_upload_reports_every_state_in_order() {
        let client = LocalEchoClient::new(1);
        let seen = std::sync::Mutex::new(Vec::new());
        let artifact = SourceArtifact::new("book.txt", "text/plain", b"text".to_vec());
        let handle = client
            .upload(&artifact, &|state| seen.lock().expect("lock").push(state))
            .await
            .expect("upload");
        assert_eq!(handle.uri, "local://book.txt");
        assert_eq!(
            *seen.lock().expect("lock"),
            vec![
                ArtifactState::Uploading,
                ArtifactState::Processing,
                ArtifactState::Active
            ]
        );
    }

    #[test]
    fn factory_rejects_unknown_provider() {
        let factory = ProviderFactory::new(ProviderConfig {
            id: "openruter".to_string(),
            ..ProviderConfig::default()
        });
        let err = factory.connect("key").err().expect("expected error");
        assert!(err
            .to_string()
            .contains("provider `openruter` is not supported"));
    }

    #[test]
    fn factory_requires_real_gemini_key() {
        let factory = ProviderFactory::default();
        assert!(factory.connect("  ").is_err());
        assert!(factory.connect("placeholder").is_err());
        assert!(factory.connect("AIza-test").is_ok());
    }

    #[test]
    fn truncate_for_error_respects_char_boundaries() {
        let text = "ééééé";
        let out = truncate_for_error(text, 3);
        assert_eq!(out, "é...");
        assert_eq!(truncate_for_error("short", 10), "short");
    }
}
