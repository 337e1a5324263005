use distiller_types::{JobStatus, RetryState};
use serde::{Deserialize, Serialize};

/// Something that happened to a job, as reported by the machine or the
/// turn loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobSignal {
    Start {
        artifact_name: String,
    },
    ValidationFailed {
        message: String,
    },
    FileUploaded {
        remote_name: String,
    },
    FileReady {
        uri: String,
    },
    IngestionFailed {
        message: String,
    },
    TurnAccepted {
        turn: usize,
    },
    MarkerReceived,
    RetryScheduled {
        attempt: u32,
        max_attempts: u32,
        delay_seconds: u64,
        error: String,
    },
    RetryRecovered {
        attempt: u32,
    },
    RetriesExhausted {
        attempts: u32,
        error: String,
    },
    Pause,
    Resume,
    Stop,
    ManualRetry {
        next_turn: usize,
    },
}

impl JobSignal {
    pub fn name(&self) -> &'static str {
        match self {
            JobSignal::Start { .. } => "start",
            JobSignal::ValidationFailed { .. } => "validation_failed",
            JobSignal::FileUploaded { .. } => "file_uploaded",
            JobSignal::FileReady { .. } => "file_ready",
            JobSignal::IngestionFailed { .. } => "ingestion_failed",
            JobSignal::TurnAccepted { .. } => "turn_accepted",
            JobSignal::MarkerReceived => "marker_received",
            JobSignal::RetryScheduled { .. } => "retry_scheduled",
            JobSignal::RetryRecovered { .. } => "retry_recovered",
            JobSignal::RetriesExhausted { .. } => "retries_exhausted",
            JobSignal::Pause => "pause",
            JobSignal::Resume => "resume",
            JobSignal::Stop => "stop",
            JobSignal::ManualRetry { .. } => "manual_retry",
        }
    }
}

/// Side effect the caller must apply together with the status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEffect {
    /// Append a system entry to the job trace.
    RecordTrace { content: String },
    SetRetryState { retry: RetryState },
    ClearRetryState,
    /// Remember the failure message shown next to the Error status.
    SetError { message: String },
    ClearError,
    /// Drop output, trace, conversation and remote handle.
    DiscardJob,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub effects: Vec<JobEffect>,
}

impl Transition {
    pub fn trace(&self) -> Option<&str> {
        self.effects.iter().find_map(|effect| match effect {
            JobEffect::RecordTrace { content } => Some(content.as_str()),
            _ => None,
        })
    }

    pub fn retry_state(&self) -> Option<&RetryState> {
        self.effects.iter().find_map(|effect| match effect {
            JobEffect::SetRetryState { retry } => Some(retry),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot apply `{signal}` while {from}")]
pub struct TransitionError {
    pub from: JobStatus,
    pub signal: &'static str,
}
