use std::sync::Arc;

use distiller_observability::{emit_event, ObservabilityEvent, ProcessKind};
use distiller_orchestrator::{JobEffect, JobReducer, JobSignal, Transition, TransitionError};
use distiller_providers::{
    is_placeholder_api_key, ClientFactory, Conversation, RemoteModelClient,
};
use distiller_types::{
    ArtifactState, JobEvent, JobSnapshot, JobStatus, RemoteFileHandle, RetryState,
    SourceArtifact, TraceRole,
};
use serde_json::json;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use crate::turn_loop::TurnLoop;
use crate::{
    DistillError, EventBus, OutputLog, RetryPolicy, RunSettings, SettingsStore, TraceRecorder,
};

pub(crate) struct Job {
    pub(crate) id: String,
    pub(crate) settings: RunSettings,
    pub(crate) cancel: CancellationToken,
    pub(crate) provider_id: String,
    pub(crate) remote_file: Option<RemoteFileHandle>,
    /// `None` while a turn loop owns the conversation.
    pub(crate) conversation: Option<Conversation>,
    pub(crate) loop_active: bool,
    pub(crate) committed_turns: usize,
    pub(crate) output: OutputLog,
}

pub(crate) struct MachineState {
    pub(crate) status: JobStatus,
    pub(crate) artifact: Option<SourceArtifact>,
    pub(crate) job: Option<Job>,
    pub(crate) trace: TraceRecorder,
    pub(crate) retry_state: Option<RetryState>,
    pub(crate) retry_timer: Option<CancellationToken>,
    pub(crate) error: Option<String>,
}

impl MachineState {
    fn new() -> Self {
        Self {
            status: JobStatus::Idle,
            artifact: None,
            job: None,
            trace: TraceRecorder::new(),
            retry_state: None,
            retry_timer: None,
            error: None,
        }
    }

    pub(crate) fn owns(&self, job_id: &str) -> bool {
        self.job.as_ref().is_some_and(|job| job.id == job_id)
    }

    pub(crate) fn job_mut(&mut self, job_id: &str) -> Option<&mut Job> {
        self.job.as_mut().filter(|job| job.id == job_id)
    }

    fn job_id(&self) -> Option<String> {
        self.job.as_ref().map(|job| job.id.clone())
    }
}

pub(crate) struct Shared {
    pub(crate) state: Mutex<MachineState>,
    pub(crate) bus: EventBus,
    pub(crate) status_tx: watch::Sender<JobStatus>,
    pub(crate) process: ProcessKind,
}

impl Shared {
    pub(crate) fn apply(
        &self,
        state: &mut MachineState,
        signal: JobSignal,
    ) -> Result<Transition, TransitionError> {
        self.apply_with(state, signal, None)
    }

    /// Runs `signal` through the reducer and applies its effects. `install`
    /// becomes the job once the previous one has been discarded.
    pub(crate) fn apply_with(
        &self,
        state: &mut MachineState,
        signal: JobSignal,
        install: Option<Job>,
    ) -> Result<Transition, TransitionError> {
        let transition = JobReducer::reduce(state.status, &signal)?;
        for effect in &transition.effects {
            match effect {
                JobEffect::DiscardJob => {
                    if let Some(job) = state.job.take() {
                        job.cancel.cancel();
                    }
                    state.trace.clear();
                }
                JobEffect::ClearRetryState => {
                    state.retry_state = None;
                    if let Some(timer) = state.retry_timer.take() {
                        timer.cancel();
                    }
                }
                JobEffect::SetRetryState { retry } => state.retry_state = Some(retry.clone()),
                JobEffect::SetError { message } => state.error = Some(message.clone()),
                JobEffect::ClearError => state.error = None,
                // Recorded below so the entry carries the new job id.
                JobEffect::RecordTrace { .. } => {}
            }
        }
        if let Some(job) = install {
            state.job = Some(job);
        }
        state.status = transition.to;
        if let Some(content) = transition.trace() {
            self.record_trace(state, TraceRole::System, content.to_string());
        }
        self.status_tx.send_replace(transition.to);

        let job_id = state.job_id();
        self.bus.publish(JobEvent::new(
            "job.status",
            json!({
                "jobID": job_id,
                "status": transition.to,
                "from": transition.from,
                "label": transition.to.to_string(),
            }),
        ));
        emit_event(
            if transition.to == JobStatus::Error {
                Level::WARN
            } else {
                Level::INFO
            },
            self.process,
            ObservabilityEvent {
                event: "job.status",
                component: "distiller.machine",
                job_id: job_id.as_deref(),
                status: Some(transition.to.as_str()),
                detail: Some(signal.name()),
                ..Default::default()
            },
        );
        Ok(transition)
    }

    pub(crate) fn record_trace(&self, state: &mut MachineState, role: TraceRole, content: String) {
        let entry = state.trace.record(role, content).clone();
        self.bus.publish(JobEvent::new(
            "job.trace",
            json!({
                "jobID": state.job_id(),
                "role": entry.role,
                "content": entry.content,
                "timestamp": entry.timestamp,
            }),
        ));
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DistillerOptions {
    pub retry: RetryPolicy,
    pub process: ProcessKind,
}

impl Default for DistillerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            process: ProcessKind::Engine,
        }
    }
}

/// The job state machine. Owns the current status, the document produced so
/// far and the trace, and drives one job at a time.
pub struct Distiller {
    shared: Arc<Shared>,
    factory: Arc<dyn ClientFactory>,
    settings: Arc<dyn SettingsStore>,
    options: DistillerOptions,
}

impl Distiller {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        settings: Arc<dyn SettingsStore>,
        options: DistillerOptions,
    ) -> Self {
        let (status_tx, _) = watch::channel(JobStatus::Idle);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(MachineState::new()),
                bus: EventBus::new(),
                status_tx,
                process: options.process,
            }),
            factory,
            settings,
            options,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.shared.bus.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<JobStatus> {
        self.shared.status_tx.subscribe()
    }

    pub async fn status(&self) -> JobStatus {
        self.shared.state.lock().await.status
    }

    pub async fn snapshot(&self) -> JobSnapshot {
        let state = self.shared.state.lock().await;
        let (output_log, in_flight) = match state.job.as_ref() {
            Some(job) => (
                job.output.turns().to_vec(),
                job.output.in_flight().map(str::to_string),
            ),
            None => (Vec::new(), None),
        };
        JobSnapshot {
            job_id: state.job_id(),
            status: state.status,
            output_log,
            in_flight,
            trace_log: state.trace.entries().to_vec(),
            retry_state: state.retry_state.clone(),
            error: state.error.clone(),
        }
    }

    /// Finalized turns joined for export. Empty when no job exists.
    pub async fn document(&self) -> String {
        let state = self.shared.state.lock().await;
        state
            .job
            .as_ref()
            .map(|job| job.output.document())
            .unwrap_or_default()
    }

    pub async fn artifact(&self) -> Option<SourceArtifact> {
        self.shared.state.lock().await.artifact.clone()
    }

    /// Replaces the input artifact. A job belongs to exactly one artifact,
    /// so any existing job, running or settled, is stopped first.
    pub async fn select_artifact(&self, artifact: SourceArtifact) {
        let mut state = self.shared.state.lock().await;
        if state.job.is_some() {
            let job_id = state.job_id();
            match self.shared.apply(&mut state, JobSignal::Stop) {
                Ok(_) => emit_event(
                    Level::INFO,
                    self.options.process,
                    ObservabilityEvent {
                        event: "job.stopped",
                        component: "distiller.machine",
                        job_id: job_id.as_deref(),
                        detail: Some("artifact changed"),
                        ..Default::default()
                    },
                ),
                Err(err) => tracing::warn!(error = %err, "stop before artifact change"),
            }
        }
        state.artifact = Some(artifact);
    }

    /// Resolves once the job is no longer uploading, running or waiting.
    pub async fn wait_until_settled(&self) -> JobStatus {
        let mut rx = self.watch_status();
        let settled = rx
            .wait_for(|status| {
                !matches!(
                    status,
                    JobStatus::Uploading
                        | JobStatus::ProcessingFile
                        | JobStatus::Running
                        | JobStatus::WaitingToRetry
                )
            })
            .await
            .map(|status| *status);
        match settled {
            Ok(status) => status,
            Err(_) => self.status().await,
        }
    }

    /// Tears down any previous job and starts a new one. Returns the job id.
    pub async fn start(&self) -> Result<String, DistillError> {
        let settings = match self.settings.snapshot().await {
            Ok(settings) => settings,
            Err(err) => return self.reject(format!("Could not read settings: {err:#}")).await,
        };
        let Some(credential) = settings
            .credential
            .clone()
            .filter(|key| !is_placeholder_api_key(key))
        else {
            return self
                .reject("API key is not set. Provide a Gemini API key before starting.")
                .await;
        };
        let Some(artifact) = self.artifact().await else {
            return self
                .reject("No file selected. Choose a book to distill before starting.")
                .await;
        };
        let client = match self.factory.connect(&credential) {
            Ok(client) => client,
            Err(err) => return self.reject(format!("{err:#}")).await,
        };

        if let Err(err) = self.settings.record_prompt(&settings.seed_prompt).await {
            tracing::warn!(error = %err, "failed to record prompt history");
        }

        let job_id = Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        let provider_id = client.info().id;
        let job = Job {
            id: job_id.clone(),
            settings: settings.clone(),
            cancel: cancel.clone(),
            provider_id: provider_id.clone(),
            remote_file: None,
            conversation: None,
            loop_active: false,
            committed_turns: 0,
            output: OutputLog::new(),
        };
        {
            let mut state = self.shared.state.lock().await;
            self.shared.apply_with(
                &mut state,
                JobSignal::Start {
                    artifact_name: artifact.display_name.clone(),
                },
                Some(job),
            )?;
        }
        emit_event(
            Level::INFO,
            self.options.process,
            ObservabilityEvent {
                event: "job.start",
                component: "distiller.machine",
                job_id: Some(&job_id),
                provider_id: Some(&provider_id),
                model_id: Some(&settings.model),
                detail: Some(&format!(
                    "artifact={} bytes={}",
                    artifact.display_name,
                    artifact.len()
                )),
                ..Default::default()
            },
        );

        tokio::spawn(run_ingestion(
            self.shared.clone(),
            job_id.clone(),
            artifact,
            client,
            settings,
            self.options.retry,
            cancel,
        ));
        Ok(job_id)
    }

    pub async fn pause(&self) -> Result<(), DistillError> {
        let mut state = self.shared.state.lock().await;
        if state.job.is_none() {
            return Err(DistillError::NoActiveJob);
        }
        self.shared.apply(&mut state, JobSignal::Pause)?;
        Ok(())
    }

    /// Continues from the next turn. A loop that is still finishing a turn
    /// started before the pause keeps going instead of a new one starting.
    pub async fn resume(&self) -> Result<(), DistillError> {
        let mut state = self.shared.state.lock().await;
        if state.job.is_none() {
            return Err(DistillError::NoActiveJob);
        }
        self.shared.apply(&mut state, JobSignal::Resume)?;
        self.ensure_loop(&mut state);
        Ok(())
    }

    /// Discards the job unconditionally. Results still in flight are ignored.
    pub async fn stop(&self) -> Result<(), DistillError> {
        let mut state = self.shared.state.lock().await;
        let job_id = state.job_id();
        self.shared
            .apply(&mut state, JobSignal::Stop)
            .map_err(|_| DistillError::NoActiveJob)?;
        emit_event(
            Level::INFO,
            self.options.process,
            ObservabilityEvent {
                event: "job.stopped",
                component: "distiller.machine",
                job_id: job_id.as_deref(),
                ..Default::default()
            },
        );
        Ok(())
    }

    /// Manual retry from Error. Resumes the existing conversation when the
    /// artifact was ingested, otherwise starts over. A loop that has not yet
    /// parked after the failure simply picks the job up again.
    pub async fn retry(&self) -> Result<String, DistillError> {
        let mut state = self.shared.state.lock().await;
        JobReducer::reduce(state.status, &JobSignal::ManualRetry { next_turn: 0 })?;

        let resumable = state.job.as_ref().and_then(|job| {
            job.remote_file.as_ref()?;
            if job.conversation.is_none() && !job.loop_active {
                return None;
            }
            Some((job.id.clone(), job.committed_turns + 1))
        });
        let Some((job_id, next_turn)) = resumable else {
            drop(state);
            return self.start().await;
        };

        self.shared
            .apply(&mut state, JobSignal::ManualRetry { next_turn })?;
        self.ensure_loop(&mut state);
        Ok(job_id)
    }

    fn ensure_loop(&self, state: &mut MachineState) {
        let Some(job) = state.job.as_mut() else {
            return;
        };
        if job.loop_active {
            return;
        }
        let Some(conversation) = job.conversation.take() else {
            tracing::warn!(job_id = %job.id, "no conversation to resume");
            return;
        };
        job.loop_active = true;
        let turn_loop = TurnLoop::new(
            self.shared.clone(),
            job.id.clone(),
            job.cancel.clone(),
            self.options.retry,
        );
        tokio::spawn(turn_loop.run(conversation));
    }

    async fn reject<T>(&self, message: impl Into<String>) -> Result<T, DistillError> {
        let message = message.into();
        {
            let mut state = self.shared.state.lock().await;
            self.shared.apply(
                &mut state,
                JobSignal::ValidationFailed {
                    message: message.clone(),
                },
            )?;
        }
        emit_event(
            Level::WARN,
            self.options.process,
            ObservabilityEvent {
                event: "job.start",
                component: "distiller.machine",
                status: Some("rejected"),
                error_code: Some("VALIDATION"),
                detail: Some(&message),
                ..Default::default()
            },
        );
        Err(DistillError::Validation(message))
    }
}

async fn run_ingestion(
    shared: Arc<Shared>,
    job_id: String,
    artifact: SourceArtifact,
    client: Arc<dyn RemoteModelClient>,
    settings: RunSettings,
    policy: RetryPolicy,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ArtifactState>();
    let sink = move |state: ArtifactState| {
        let _ = tx.send(state);
    };

    let result = {
        let upload = client.upload(&artifact, &sink);
        tokio::pin!(upload);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                Some(state) = rx.recv() => on_artifact_state(&shared, &job_id, &artifact, state).await,
                result = &mut upload => break result,
            }
        }
    };
    while let Ok(state) = rx.try_recv() {
        on_artifact_state(&shared, &job_id, &artifact, state).await;
    }

    let handle = match result {
        Ok(handle) => handle,
        Err(err) => {
            let message = format!("{err:#}");
            let failure = DistillError::Ingestion(message.clone());
            let mut state = shared.state.lock().await;
            if !state.owns(&job_id) {
                return;
            }
            if let Err(err) = shared.apply(
                &mut state,
                JobSignal::IngestionFailed { message },
            ) {
                tracing::warn!(error = %err, "ingestion failure arrived out of order");
            }
            state.artifact = None;
            emit_event(
                Level::ERROR,
                shared.process,
                ObservabilityEvent {
                    event: "upload.state",
                    component: "distiller.ingest",
                    job_id: Some(&job_id),
                    status: Some("failed"),
                    error_code: Some(failure.code()),
                    detail: Some(&failure.to_string()),
                    ..Default::default()
                },
            );
            return;
        }
    };

    let conversation = Conversation::new(client, settings.model.clone(), settings.temperature);
    {
        let mut state = shared.state.lock().await;
        if !state.owns(&job_id) {
            return;
        }
        if state.status == JobStatus::Uploading {
            let _ = shared.apply(
                &mut state,
                JobSignal::FileUploaded {
                    remote_name: artifact.display_name.clone(),
                },
            );
        }
        if let Err(err) = shared.apply(
            &mut state,
            JobSignal::FileReady {
                uri: handle.uri.clone(),
            },
        ) {
            tracing::warn!(error = %err, "file ready arrived out of order");
            return;
        }
        let Some(job) = state.job_mut(&job_id) else {
            return;
        };
        job.remote_file = Some(handle);
        job.loop_active = true;
    }

    TurnLoop::new(shared, job_id, cancel, policy)
        .run(conversation)
        .await;
}

async fn on_artifact_state(
    shared: &Shared,
    job_id: &str,
    artifact: &SourceArtifact,
    artifact_state: ArtifactState,
) {
    let mut state = shared.state.lock().await;
    if !state.owns(job_id) {
        return;
    }
    let provider_id = state.job.as_ref().map(|job| job.provider_id.clone());
    emit_event(
        Level::INFO,
        shared.process,
        ObservabilityEvent {
            event: "upload.state",
            component: "distiller.ingest",
            job_id: Some(job_id),
            provider_id: provider_id.as_deref(),
            status: Some(match artifact_state {
                ArtifactState::Uploading => "uploading",
                ArtifactState::Processing => "processing",
                ArtifactState::Active => "active",
                ArtifactState::Failed => "failed",
            }),
            ..Default::default()
        },
    );
    let uploaded = matches!(
        artifact_state,
        ArtifactState::Processing | ArtifactState::Active
    );
    if uploaded && state.status == JobStatus::Uploading {
        let _ = shared.apply(
            &mut state,
            JobSignal::FileUploaded {
                remote_name: artifact.display_name.clone(),
            },
        );
    }
}
