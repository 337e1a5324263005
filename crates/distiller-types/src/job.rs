use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Uploading,
    ProcessingFile,
    Running,
    WaitingToRetry,
    Paused,
    Stopped,
    Finished,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Uploading => "uploading",
            JobStatus::ProcessingFile => "processing_file",
            JobStatus::Running => "running",
            JobStatus::WaitingToRetry => "waiting_to_retry",
            JobStatus::Paused => "paused",
            JobStatus::Stopped => "stopped",
            JobStatus::Finished => "finished",
            JobStatus::Error => "error",
        }
    }

    /// A turn loop may be driving the job in this status.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Uploading
                | JobStatus::ProcessingFile
                | JobStatus::Running
                | JobStatus::WaitingToRetry
                | JobStatus::Paused
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            JobStatus::Idle => "Idle",
            JobStatus::Uploading => "Uploading",
            JobStatus::ProcessingFile => "Processing File",
            JobStatus::Running => "Running",
            JobStatus::WaitingToRetry => "Waiting to Retry",
            JobStatus::Paused => "Paused",
            JobStatus::Stopped => "Stopped",
            JobStatus::Finished => "Finished",
            JobStatus::Error => "Error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEntry {
    pub timestamp: DateTime<Utc>,
    pub role: TraceRole,
    pub content: String,
}

impl TraceEntry {
    pub fn new(role: TraceRole, content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            role,
            content: content.into(),
        }
    }
}

/// Present only while a job is waiting to resend a failed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryState {
    pub attempt: u32,
    pub max_attempts: u32,
    pub remaining_seconds: u64,
    pub last_error: String,
}

/// Point-in-time copy of a job for display and export collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub status: JobStatus,
    /// Finalized turns, in turn order.
    #[serde(default)]
    pub output_log: Vec<String>,
    /// Text of the turn currently streaming, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<String>,
    #[serde(default)]
    pub trace_log: Vec<TraceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_state: Option<RetryState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobSnapshot {
    pub fn idle(status: JobStatus) -> Self {
        Self {
            job_id: None,
            status,
            output_log: Vec::new(),
            in_flight: None,
            trace_log: Vec::new(),
            retry_state: None,
            error: None,
        }
    }

    /// Entries as a live document view shows them: finalized turns plus the
    /// streaming one.
    pub fn visible_entries(&self) -> Vec<&str> {
        let mut out = self
            .output_log
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>();
        if let Some(current) = self.in_flight.as_deref() {
            out.push(current);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_labels_match_status_bar_text() {
        assert_eq!(JobStatus::WaitingToRetry.to_string(), "Waiting to Retry");
        assert_eq!(JobStatus::ProcessingFile.to_string(), "Processing File");
        assert_eq!(JobStatus::Idle.as_str(), "idle");
    }

    #[test]
    fn visible_entries_include_in_flight_turn() {
        let mut snapshot = JobSnapshot::idle(JobStatus::Running);
        snapshot.output_log = vec!["one".to_string()];
        snapshot.in_flight = Some("tw".to_string());
        assert_eq!(snapshot.visible_entries(), vec!["one", "tw"]);
    }

    #[test]
    fn snapshot_serializes_status_in_snake_case() {
        let snapshot = JobSnapshot::idle(JobStatus::WaitingToRetry);
        let value = serde_json::to_value(&snapshot).expect("serialize");
        assert_eq!(value["status"], "waiting_to_retry");
        assert!(value.get("retry_state").is_none());
    }
}
