use std::sync::Arc;
use std::time::Duration;

use distiller_observability::{emit_event, redact_text, ObservabilityEvent};
use distiller_orchestrator::JobSignal;
use distiller_providers::{Conversation, StreamChunk};
use distiller_types::{
    JobEvent, JobStatus, RemoteFileHandle, TraceRole, TurnMetadata, NEXT_PROMPT,
    THOUGHT_LEAK_MARKER,
};
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::machine::Shared;
use crate::{
    display_seconds, strip_end_marker, wait_for_retry, ContentRejection, DistillError,
    RetryPolicy,
};

/// Refuses replies that must never reach the document.
pub fn validate_reply(text: &str) -> Result<(), ContentRejection> {
    if text.trim().is_empty() {
        return Err(ContentRejection::EmptyResponse);
    }
    if text.contains(THOUGHT_LEAK_MARKER) {
        return Err(ContentRejection::ReasoningLeak);
    }
    Ok(())
}

/// Trace text for the user side of a turn.
pub fn user_trace_text(prompt: &str, opening: bool) -> String {
    if opening {
        format!("[DISTILLATION PROMPT]\n{prompt}")
    } else {
        prompt.to_string()
    }
}

/// Pretty metadata for the trace, with the reply text left out.
pub fn metadata_trace_text(metadata: &TurnMetadata) -> String {
    let value = match metadata.raw.as_ref() {
        Some(raw) => raw.clone(),
        None => serde_json::to_value(metadata).unwrap_or_default(),
    };
    let pretty = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
    format!("[METADATA]\n{pretty}")
}

struct TurnPlan {
    turn: usize,
    prompt: String,
    opening: bool,
    attachment: Option<RemoteFileHandle>,
    model: String,
    provider_id: String,
}

enum Checkpoint {
    Continue(Conversation, TurnPlan),
    Parked,
    Gone,
}

enum AttemptOutcome {
    Completed { text: String, metadata: TurnMetadata },
    Failed(DistillError),
    Gone,
}

enum FailureAction {
    Retry {
        delay: Duration,
        timer: CancellationToken,
    },
    /// Leave the turn; the next checkpoint decides what happens.
    Leave,
    Gone,
}

/// Drives turns for one job until the marker, a pause, a stop or an
/// unrecoverable failure. Turns are strictly sequential.
pub(crate) struct TurnLoop {
    shared: Arc<Shared>,
    job_id: String,
    cancel: CancellationToken,
    policy: RetryPolicy,
}

impl TurnLoop {
    pub(crate) fn new(
        shared: Arc<Shared>,
        job_id: String,
        cancel: CancellationToken,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            shared,
            job_id,
            cancel,
            policy,
        }
    }

    pub(crate) async fn run(self, mut conversation: Conversation) {
        loop {
            let plan = match self.checkpoint(conversation).await {
                Checkpoint::Continue(owned, plan) => {
                    conversation = owned;
                    plan
                }
                Checkpoint::Parked | Checkpoint::Gone => return,
            };
            if !self.drive_turn(&mut conversation, &plan).await {
                return;
            }
        }
    }

    /// Turn boundary. Hands the conversation back to the job unless the job
    /// is still Running.
    async fn checkpoint(&self, conversation: Conversation) -> Checkpoint {
        let mut state = self.shared.state.lock().await;
        let status = state.status;
        let Some(job) = state.job_mut(&self.job_id) else {
            return Checkpoint::Gone;
        };
        if status != JobStatus::Running {
            job.conversation = Some(conversation);
            job.loop_active = false;
            return Checkpoint::Parked;
        }
        let opening = conversation.is_fresh();
        let plan = TurnPlan {
            turn: conversation.committed_turns() + 1,
            prompt: if opening {
                job.settings.seed_prompt.clone()
            } else {
                NEXT_PROMPT.to_string()
            },
            opening,
            // Until a turn is committed the artifact has not been seen by
            // the remote side, so every attempt of the opening turn carries it.
            attachment: if opening {
                job.remote_file.clone()
            } else {
                None
            },
            model: conversation.model().to_string(),
            provider_id: job.provider_id.clone(),
        };
        Checkpoint::Continue(conversation, plan)
    }

    /// Returns false once the job no longer exists.
    async fn drive_turn(&self, conversation: &mut Conversation, plan: &TurnPlan) -> bool {
        {
            let mut state = self.shared.state.lock().await;
            if !state.owns(&self.job_id) {
                return false;
            }
            self.shared.record_trace(
                &mut state,
                TraceRole::User,
                user_trace_text(&plan.prompt, plan.opening),
            );
        }

        let mut attempt: u32 = 1;
        loop {
            match self.open_attempt().await {
                Some(true) => {}
                Some(false) => return true,
                None => return false,
            }
            self.emit(Level::INFO, "turn.call.start", plan, attempt, None, None);

            let failure = match self.attempt(conversation, plan, attempt).await {
                AttemptOutcome::Gone => return false,
                AttemptOutcome::Failed(err) => err,
                AttemptOutcome::Completed { text, metadata } => match validate_reply(&text) {
                    Ok(()) => return self.accept(conversation, plan, text, metadata).await,
                    Err(rejection) => DistillError::from(rejection),
                },
            };

            self.emit(
                Level::WARN,
                "turn.call.error",
                plan,
                attempt,
                Some(failure.code()),
                Some(&failure.to_string()),
            );
            match self.on_failure(plan, attempt, &failure).await {
                FailureAction::Retry { delay, timer } => {
                    wait_for_retry(delay, &timer).await;
                    attempt += 1;
                }
                FailureAction::Leave => return true,
                FailureAction::Gone => return false,
            }
        }
    }

    /// `Some(true)` to issue the call, `Some(false)` to leave the turn.
    async fn open_attempt(&self) -> Option<bool> {
        let mut state = self.shared.state.lock().await;
        let status = state.status;
        let job = state.job_mut(&self.job_id)?;
        match status {
            JobStatus::Running => {
                job.output.begin_turn();
                Some(true)
            }
            // The entry opens when the retried call produces its first text.
            JobStatus::WaitingToRetry => Some(true),
            _ => Some(false),
        }
    }

    async fn attempt(
        &self,
        conversation: &Conversation,
        plan: &TurnPlan,
        attempt: u32,
    ) -> AttemptOutcome {
        let stream = tokio::select! {
            _ = self.cancel.cancelled() => return AttemptOutcome::Gone,
            stream = conversation.stream(&plan.prompt, plan.attachment.as_ref(), self.cancel.clone()) => stream,
        };
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => return AttemptOutcome::Failed(err.into()),
        };

        let mut text = String::new();
        let mut first_byte = true;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return AttemptOutcome::Gone,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(StreamChunk::TextDelta(delta))) => {
                    if delta.is_empty() {
                        continue;
                    }
                    if first_byte {
                        first_byte = false;
                        self.emit(Level::INFO, "turn.call.first_byte", plan, attempt, None, None);
                    }
                    text.push_str(&delta);
                    if !self.on_delta(plan, attempt, &delta).await {
                        return AttemptOutcome::Gone;
                    }
                }
                Some(Ok(StreamChunk::Done { metadata })) => {
                    return AttemptOutcome::Completed { text, metadata };
                }
                Some(Err(err)) => return AttemptOutcome::Failed(err.into()),
                None => {
                    return AttemptOutcome::Failed(DistillError::TransientCall(
                        "Response stream ended before completion".to_string(),
                    ))
                }
            }
        }
    }

    async fn on_delta(&self, plan: &TurnPlan, attempt: u32, delta: &str) -> bool {
        let mut state = self.shared.state.lock().await;
        if !state.owns(&self.job_id) {
            return false;
        }
        match state.status {
            JobStatus::WaitingToRetry => {
                if let Err(err) = self
                    .shared
                    .apply(&mut state, JobSignal::RetryRecovered { attempt })
                {
                    tracing::warn!(error = %err, "retry recovery rejected");
                }
                if let Some(job) = state.job_mut(&self.job_id) {
                    job.output.begin_turn();
                }
            }
            JobStatus::Running => {}
            // Paused: the text still counts toward validation but is not shown.
            _ => return true,
        }
        if let Some(job) = state.job_mut(&self.job_id) {
            if !job.output.append(delta) {
                job.output.begin_turn();
                job.output.append(delta);
            }
        }
        self.shared.bus.publish(JobEvent::new(
            "job.output.delta",
            json!({
                "jobID": self.job_id,
                "turn": plan.turn,
                "delta": delta,
            }),
        ));
        true
    }

    async fn accept(
        &self,
        conversation: &mut Conversation,
        plan: &TurnPlan,
        text: String,
        metadata: TurnMetadata,
    ) -> bool {
        let mut state = self.shared.state.lock().await;
        if !state.owns(&self.job_id) {
            return false;
        }
        if state.status != JobStatus::Running {
            if let Some(job) = state.job_mut(&self.job_id) {
                job.output.discard_in_flight();
            }
            self.shared.record_trace(
                &mut state,
                TraceRole::System,
                format!(
                    "Turn {} finished after the job was paused; its output was discarded.",
                    plan.turn
                ),
            );
            return true;
        }

        self.shared
            .record_trace(&mut state, TraceRole::System, metadata_trace_text(&metadata));
        self.shared
            .record_trace(&mut state, TraceRole::Assistant, text.clone());

        let (cleaned, marker) = strip_end_marker(&text);
        let Some(job) = state.job_mut(&self.job_id) else {
            return false;
        };
        // One entry per accepted turn, even when only the marker came back.
        let index = job.output.finalize(cleaned.clone());
        self.shared.bus.publish(JobEvent::new(
            "job.turn.finalized",
            json!({
                "jobID": self.job_id,
                "turn": index,
                "text": cleaned,
            }),
        ));
        conversation.commit(&plan.prompt, plan.attachment.clone(), &text);
        job.committed_turns = conversation.committed_turns();

        let signal = if marker {
            JobSignal::MarkerReceived
        } else {
            JobSignal::TurnAccepted { turn: plan.turn }
        };
        if let Err(err) = self.shared.apply(&mut state, signal) {
            tracing::warn!(error = %err, "turn acceptance rejected");
        }
        drop(state);

        let usage = metadata
            .usage
            .as_ref()
            .map(|u| format!("total_tokens={}", u.total_tokens));
        self.emit(
            Level::INFO,
            "turn.call.finish",
            plan,
            0,
            None,
            usage.as_deref(),
        );
        if marker {
            self.emit(Level::INFO, "job.finished", plan, 0, None, None);
        }
        true
    }

    async fn on_failure(&self, plan: &TurnPlan, attempt: u32, failure: &DistillError) -> FailureAction {
        let message = failure.to_string();
        let mut state = self.shared.state.lock().await;
        if !state.owns(&self.job_id) {
            return FailureAction::Gone;
        }
        if let Some(job) = state.job_mut(&self.job_id) {
            job.output.discard_in_flight();
        }
        if !matches!(
            state.status,
            JobStatus::Running | JobStatus::WaitingToRetry
        ) {
            return FailureAction::Leave;
        }

        if schedules_retry(&self.policy, attempt, failure) {
            let delay = self.policy.compute_delay(attempt);
            if let Some(previous) = state.retry_timer.take() {
                previous.cancel();
            }
            if let Err(err) = self.shared.apply(
                &mut state,
                JobSignal::RetryScheduled {
                    attempt,
                    max_attempts: self.policy.max_attempts,
                    delay_seconds: display_seconds(delay),
                    error: message.clone(),
                },
            ) {
                tracing::warn!(error = %err, "retry scheduling rejected");
                return FailureAction::Leave;
            }
            let timer = self.cancel.child_token();
            state.retry_timer = Some(timer.clone());
            drop(state);
            spawn_countdown(self.shared.clone(), self.job_id.clone(), timer.clone());
            self.emit(
                Level::WARN,
                "turn.retry.scheduled",
                plan,
                attempt,
                Some(failure.code()),
                Some(&format!("delay_ms={}", delay.as_millis())),
            );
            return FailureAction::Retry { delay, timer };
        }

        let exhausted = DistillError::RetriesExhausted {
            attempts: attempt,
            last_error: message.clone(),
        };
        if let Err(err) = self.shared.apply(
            &mut state,
            JobSignal::RetriesExhausted {
                attempts: attempt,
                error: message,
            },
        ) {
            tracing::warn!(error = %err, "retry exhaustion rejected");
        }
        drop(state);
        self.emit(
            Level::ERROR,
            "turn.retry.exhausted",
            plan,
            attempt,
            Some(exhausted.code()),
            Some(&exhausted.to_string()),
        );
        FailureAction::Leave
    }

    fn emit(
        &self,
        level: Level,
        event: &str,
        plan: &TurnPlan,
        attempt: u32,
        error_code: Option<&str>,
        detail: Option<&str>,
    ) {
        let prompt = if event == "turn.call.start" {
            Some(redact_text(&plan.prompt))
        } else {
            None
        };
        emit_event(
            level,
            self.shared.process,
            ObservabilityEvent {
                event,
                component: "distiller.turn_loop",
                job_id: Some(&self.job_id),
                turn: Some(plan.turn),
                attempt: (attempt > 0).then_some(attempt),
                provider_id: Some(&plan.provider_id),
                model_id: Some(&plan.model),
                error_code,
                detail: detail.or(prompt.as_deref()),
                ..Default::default()
            },
        );
    }
}

/// A failed attempt is retried only when the failure class allows it and
/// attempts remain.
fn schedules_retry(policy: &RetryPolicy, attempt: u32, failure: &DistillError) -> bool {
    failure.is_retryable() && policy.should_retry(attempt)
}

/// Advisory countdown for display. Never gates the retry itself.
fn spawn_countdown(shared: Arc<Shared>, job_id: String, timer: CancellationToken) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
            let mut state = shared.state.lock().await;
            if timer.is_cancelled() || !state.owns(&job_id) {
                return;
            }
            let Some(retry) = state.retry_state.as_mut() else {
                return;
            };
            retry.remaining_seconds = retry.remaining_seconds.saturating_sub(1);
            let remaining = retry.remaining_seconds;
            let attempt = retry.attempt;
            shared.bus.publish(JobEvent::new(
                "job.retry.countdown",
                json!({
                    "jobID": job_id,
                    "attempt": attempt,
                    "remainingSeconds": remaining,
                }),
            ));
            if remaining == 0 {
                return;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_and_leaky_replies_are_rejected() {
        assert_eq!(validate_reply("  \n"), Err(ContentRejection::EmptyResponse));
        assert_eq!(
            validate_reply("thinking <ctrl94> out loud"),
            Err(ContentRejection::ReasoningLeak)
        );
        assert_eq!(validate_reply("## Chapter One"), Ok(()));
    }

    #[test]
    fn only_retryable_failures_with_attempts_left_are_retried() {
        let policy = RetryPolicy::default();
        let transient = DistillError::TransientCall("503".to_string());
        let leak = DistillError::from(ContentRejection::ReasoningLeak);
        assert!(schedules_retry(&policy, 1, &transient));
        assert!(schedules_retry(&policy, 4, &leak));
        assert!(!schedules_retry(&policy, 5, &transient));
        assert!(!schedules_retry(
            &policy,
            1,
            &DistillError::Validation("no key".to_string())
        ));
    }

    #[test]
    fn opening_turn_is_labelled_in_the_trace() {
        assert_eq!(
            user_trace_text("Read this", true),
            "[DISTILLATION PROMPT]\nRead this"
        );
        assert_eq!(user_trace_text(NEXT_PROMPT, false), "Next");
    }

    #[test]
    fn metadata_trace_prefers_raw_payload() {
        let metadata = TurnMetadata {
            finish_reason: Some("STOP".to_string()),
            raw: Some(json!({ "modelVersion": "gemini-2.5-flash" })),
            ..TurnMetadata::default()
        };
        let text = metadata_trace_text(&metadata);
        assert!(text.starts_with("[METADATA]\n{"));
        assert!(text.contains("\"modelVersion\": \"gemini-2.5-flash\""));

        let bare = metadata_trace_text(&TurnMetadata::default());
        assert!(bare.starts_with("[METADATA]\n"));
    }
}
