use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use distiller_core::{Distiller, DistillerOptions, MemorySettings, RetryPolicy, RunSettings};
use distiller_providers::{
    ArtifactStateSink, ChunkStream, ClientFactory, MessageRole, RemoteModelClient, StreamChunk,
    TurnReply, TurnRequest,
};
use distiller_types::{
    ArtifactState, JobSnapshot, ProviderInfo, RemoteFileHandle, SourceArtifact, TurnMetadata,
};
use futures::StreamExt;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// What the scripted remote side does for one outbound call.
pub enum Step {
    Reply(String),
    Fail(String),
    Empty,
    /// Holds the reply until the gate is notified.
    Gated(Arc<Notify>, String),
    /// Streams some text, then the connection drops.
    PartialThenFail(String, String),
    Hang,
}

pub fn reply(text: &str) -> Step {
    Step::Reply(text.to_string())
}

pub fn fail(message: &str) -> Step {
    Step::Fail(message.to_string())
}

#[derive(Default)]
pub struct ScriptedClient {
    steps: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<TurnRequest>>,
    fail_upload: Option<String>,
}

impl ScriptedClient {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            ..Self::default()
        })
    }

    pub fn failing_upload(message: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_upload: Some(message.to_string()),
            ..Self::default()
        })
    }

    pub fn push(&self, step: Step) {
        self.steps.lock().expect("steps").push_back(step);
    }

    pub fn requests(&self) -> Vec<TurnRequest> {
        self.requests.lock().expect("requests").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("requests").len()
    }
}

fn done() -> anyhow::Result<StreamChunk> {
    Ok(StreamChunk::Done {
        metadata: TurnMetadata {
            finish_reason: Some("STOP".to_string()),
            ..TurnMetadata::default()
        },
    })
}

#[async_trait]
impl RemoteModelClient for ScriptedClient {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            models: Vec::new(),
        }
    }

    async fn upload(
        &self,
        artifact: &SourceArtifact,
        on_state: ArtifactStateSink<'_>,
    ) -> anyhow::Result<RemoteFileHandle> {
        on_state(ArtifactState::Uploading);
        if let Some(message) = self.fail_upload.as_ref() {
            on_state(ArtifactState::Failed);
            anyhow::bail!("{message}");
        }
        on_state(ArtifactState::Processing);
        on_state(ArtifactState::Active);
        Ok(RemoteFileHandle {
            name: format!("files/{}", artifact.display_name),
            uri: format!("https://files.test/{}", artifact.display_name),
            mime_type: artifact.mime_type.clone(),
        })
    }

    async fn generate(&self, _request: TurnRequest) -> anyhow::Result<TurnReply> {
        anyhow::bail!("scripted client only streams")
    }

    async fn stream(
        &self,
        request: TurnRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ChunkStream> {
        self.requests.lock().expect("requests").push(request);
        let step = self
            .steps
            .lock()
            .expect("steps")
            .pop_front()
            .unwrap_or(Step::Hang);
        match step {
            Step::Fail(message) => anyhow::bail!("{message}"),
            Step::Reply(text) => Ok(Box::pin(futures::stream::iter(vec![
                Ok(StreamChunk::TextDelta(text)),
                done(),
            ]))),
            Step::Empty => Ok(Box::pin(futures::stream::iter(vec![done()]))),
            Step::Gated(gate, text) => Ok(Box::pin(
                futures::stream::once(async move {
                    gate.notified().await;
                    Ok(StreamChunk::TextDelta(text))
                })
                .chain(futures::stream::iter(vec![done()])),
            )),
            Step::PartialThenFail(text, message) => Ok(Box::pin(futures::stream::iter(vec![
                Ok(StreamChunk::TextDelta(text)),
                Err(anyhow::anyhow!(message)),
            ]))),
            Step::Hang => Ok(Box::pin(futures::stream::pending::<
                anyhow::Result<StreamChunk>,
            >())),
        }
    }
}

pub struct ScriptedFactory {
    clients: Mutex<VecDeque<Arc<ScriptedClient>>>,
}

impl ScriptedFactory {
    pub fn new(clients: Vec<Arc<ScriptedClient>>) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(clients.into()),
        })
    }
}

impl ClientFactory for ScriptedFactory {
    fn connect(&self, _credential: &str) -> anyhow::Result<Arc<dyn RemoteModelClient>> {
        let client = self
            .clients
            .lock()
            .expect("clients")
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted client left"))?;
        Ok(client)
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        jitter_max: Duration::ZERO,
    }
}

pub fn settings_with_key() -> Arc<MemorySettings> {
    Arc::new(MemorySettings::new(RunSettings {
        credential: Some("AIza-test".to_string()),
        seed_prompt: "Distill this book.".to_string(),
        ..RunSettings::default()
    }))
}

pub fn book() -> SourceArtifact {
    SourceArtifact::new("book.pdf", "application/pdf", b"%PDF-1.4".to_vec())
}

pub async fn distiller_for(
    clients: Vec<Arc<ScriptedClient>>,
    retry: RetryPolicy,
) -> Distiller {
    let distiller = Distiller::new(
        ScriptedFactory::new(clients),
        settings_with_key(),
        DistillerOptions {
            retry,
            ..DistillerOptions::default()
        },
    );
    distiller.select_artifact(book()).await;
    distiller
}

/// Polls snapshots until `predicate` holds or two seconds pass.
pub async fn wait_for_snapshot(
    distiller: &Distiller,
    predicate: impl Fn(&JobSnapshot) -> bool,
) -> JobSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = distiller.snapshot().await;
        if predicate(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached; last snapshot: {snapshot:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_requests(client: &ScriptedClient, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while client.request_count() < count {
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "expected {count} requests, saw {}",
                client.request_count()
            );
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn attachment_count(request: &TurnRequest) -> usize {
    request
        .messages
        .iter()
        .filter(|m| m.attachment.is_some())
        .count()
}

pub fn last_user_is(request: &TurnRequest, text: &str) -> bool {
    request
        .messages
        .last()
        .is_some_and(|m| m.role == MessageRole::User && m.text == text)
}
