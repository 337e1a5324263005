use distiller_types::{JobStatus, RetryState};

use crate::{JobEffect, JobSignal, Transition, TransitionError};

/// Pure transition table for the job lifecycle.
///
/// Every entry into Uploading, ProcessingFile, Running, WaitingToRetry,
/// Finished and Error carries exactly one `RecordTrace` effect. Retry state
/// is only ever set or cleared through the effects returned here.
pub struct JobReducer;

impl JobReducer {
    pub fn reduce(from: JobStatus, signal: &JobSignal) -> Result<Transition, TransitionError> {
        use JobStatus::*;

        let illegal = || TransitionError {
            from,
            signal: signal.name(),
        };

        let (to, effects) = match signal {
            JobSignal::Start { artifact_name } => (
                Uploading,
                vec![
                    JobEffect::DiscardJob,
                    JobEffect::ClearRetryState,
                    JobEffect::ClearError,
                    trace(format!("Uploading {artifact_name}...")),
                ],
            ),
            JobSignal::ValidationFailed { message } => (
                Error,
                vec![
                    JobEffect::DiscardJob,
                    JobEffect::ClearRetryState,
                    JobEffect::SetError {
                        message: message.clone(),
                    },
                    trace(message.clone()),
                ],
            ),
            JobSignal::FileUploaded { remote_name } => match from {
                Uploading => (
                    ProcessingFile,
                    vec![trace(format!(
                        "File uploaded. Waiting for processing to complete. File name: {remote_name}"
                    ))],
                ),
                _ => return Err(illegal()),
            },
            JobSignal::FileReady { uri } => match from {
                ProcessingFile => (Running, vec![trace(format!("File ready. URI: {uri}"))]),
                _ => return Err(illegal()),
            },
            JobSignal::IngestionFailed { message } => match from {
                Uploading | ProcessingFile => {
                    let text = format!("File ingestion failed: {message}");
                    (
                        Error,
                        vec![
                            JobEffect::SetError {
                                message: text.clone(),
                            },
                            trace(text),
                        ],
                    )
                }
                _ => return Err(illegal()),
            },
            JobSignal::TurnAccepted { .. } => match from {
                Running => (Running, Vec::new()),
                _ => return Err(illegal()),
            },
            JobSignal::MarkerReceived => match from {
                Running => (
                    Finished,
                    vec![trace(
                        "End of book marker received. Distillation finished.".to_string(),
                    )],
                ),
                _ => return Err(illegal()),
            },
            JobSignal::RetryScheduled {
                attempt,
                max_attempts,
                delay_seconds,
                error,
            } => match from {
                Running | WaitingToRetry => (
                    WaitingToRetry,
                    vec![
                        JobEffect::SetRetryState {
                            retry: RetryState {
                                attempt: *attempt,
                                max_attempts: *max_attempts,
                                remaining_seconds: *delay_seconds,
                                last_error: error.clone(),
                            },
                        },
                        trace(format!(
                            "Attempt {attempt}/{max_attempts} failed: {error}. Retrying in {delay_seconds}s."
                        )),
                    ],
                ),
                _ => return Err(illegal()),
            },
            JobSignal::RetryRecovered { attempt } => match from {
                WaitingToRetry => (
                    Running,
                    vec![
                        JobEffect::ClearRetryState,
                        trace(format!("Retry attempt {attempt} succeeded. Resuming.")),
                    ],
                ),
                _ => return Err(illegal()),
            },
            JobSignal::RetriesExhausted { attempts, error } => match from {
                Running | WaitingToRetry => {
                    let text = format!("Failed after {attempts} attempts. Last error: {error}");
                    (
                        Error,
                        vec![
                            JobEffect::ClearRetryState,
                            JobEffect::SetError {
                                message: text.clone(),
                            },
                            trace(text),
                        ],
                    )
                }
                _ => return Err(illegal()),
            },
            JobSignal::Pause => match from {
                Running | WaitingToRetry => (
                    Paused,
                    vec![
                        JobEffect::ClearRetryState,
                        trace("Paused by user.".to_string()),
                    ],
                ),
                _ => return Err(illegal()),
            },
            JobSignal::Resume => match from {
                Paused => (Running, vec![trace("Resumed by user.".to_string())]),
                _ => return Err(illegal()),
            },
            JobSignal::Stop => match from {
                Idle | Stopped => return Err(illegal()),
                _ => (
                    Stopped,
                    vec![
                        JobEffect::DiscardJob,
                        JobEffect::ClearRetryState,
                        JobEffect::ClearError,
                    ],
                ),
            },
            JobSignal::ManualRetry { next_turn } => match from {
                Error => (
                    Running,
                    vec![
                        JobEffect::ClearError,
                        trace(format!(
                            "Manual retry requested. Resuming at turn {next_turn}."
                        )),
                    ],
                ),
                _ => return Err(illegal()),
            },
        };

        Ok(Transition { from, to, effects })
    }

    /// Statuses from which `signal` is accepted.
    pub fn accepts(from: JobStatus, signal: &JobSignal) -> bool {
        Self::reduce(from, signal).is_ok()
    }
}

fn trace(content: String) -> JobEffect {
    JobEffect::RecordTrace { content }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    const ALL: [JobStatus; 9] = [
        Idle,
        Uploading,
        ProcessingFile,
        Running,
        WaitingToRetry,
        Paused,
        Stopped,
        Finished,
        Error,
    ];

    fn traces(transition: &Transition) -> usize {
        transition
            .effects
            .iter()
            .filter(|e| matches!(e, JobEffect::RecordTrace { .. }))
            .count()
    }

    #[test]
    fn happy_path_walks_upload_to_finish() {
        let start = JobReducer::reduce(
            Idle,
            &JobSignal::Start {
                artifact_name: "book.pdf".to_string(),
            },
        )
        .expect("start");
        assert_eq!(start.to, Uploading);
        assert_eq!(start.trace(), Some("Uploading book.pdf..."));

        let uploaded = JobReducer::reduce(
            start.to,
            &JobSignal::FileUploaded {
                remote_name: "files/abc".to_string(),
            },
        )
        .expect("uploaded");
        assert_eq!(uploaded.to, ProcessingFile);

        let ready = JobReducer::reduce(
            uploaded.to,
            &JobSignal::FileReady {
                uri: "https://files/abc".to_string(),
            },
        )
        .expect("ready");
        assert_eq!(ready.to, Running);
        assert_eq!(ready.trace(), Some("File ready. URI: https://files/abc"));

        let accepted =
            JobReducer::reduce(Running, &JobSignal::TurnAccepted { turn: 1 }).expect("turn");
        assert_eq!(accepted.to, Running);
        assert!(accepted.effects.is_empty());

        let finished = JobReducer::reduce(Running, &JobSignal::MarkerReceived).expect("finish");
        assert_eq!(finished.to, Finished);
        assert_eq!(traces(&finished), 1);
    }

    #[test]
    fn retry_schedule_sets_state_and_recovery_clears_it() {
        let scheduled = JobReducer::reduce(
            Running,
            &JobSignal::RetryScheduled {
                attempt: 1,
                max_attempts: 5,
                delay_seconds: 7,
                error: "503".to_string(),
            },
        )
        .expect("schedule");
        assert_eq!(scheduled.to, WaitingToRetry);
        let retry = scheduled.retry_state().expect("retry state");
        assert_eq!(retry.attempt, 1);
        assert_eq!(retry.remaining_seconds, 7);
        assert_eq!(
            scheduled.trace(),
            Some("Attempt 1/5 failed: 503. Retrying in 7s.")
        );

        let again = JobReducer::reduce(
            WaitingToRetry,
            &JobSignal::RetryScheduled {
                attempt: 2,
                max_attempts: 5,
                delay_seconds: 12,
                error: "503".to_string(),
            },
        )
        .expect("reschedule");
        assert_eq!(again.to, WaitingToRetry);

        let recovered =
            JobReducer::reduce(WaitingToRetry, &JobSignal::RetryRecovered { attempt: 3 })
                .expect("recover");
        assert_eq!(recovered.to, Running);
        assert!(recovered.effects.contains(&JobEffect::ClearRetryState));
    }

    #[test]
    fn exhaustion_clears_retry_state_and_keeps_message() {
        let transition = JobReducer::reduce(
            WaitingToRetry,
            &JobSignal::RetriesExhausted {
                attempts: 5,
                error: "quota".to_string(),
            },
        )
        .expect("exhaust");
        assert_eq!(transition.to, Error);
        assert!(transition.effects.contains(&JobEffect::ClearRetryState));
        assert!(transition.effects.contains(&JobEffect::SetError {
            message: "Failed after 5 attempts. Last error: quota".to_string()
        }));
    }

    #[test]
    fn pause_is_only_legal_while_running_or_waiting() {
        for status in ALL {
            let legal = JobReducer::accepts(status, &JobSignal::Pause);
            assert_eq!(
                legal,
                matches!(status, Running | WaitingToRetry),
                "pause from {status:?}"
            );
        }
        assert!(JobReducer::accepts(Paused, &JobSignal::Resume));
        assert!(!JobReducer::accepts(Running, &JobSignal::Resume));
    }

    #[test]
    fn stop_needs_a_job_and_discards_it() {
        assert!(JobReducer::reduce(Idle, &JobSignal::Stop).is_err());
        assert!(JobReducer::reduce(Stopped, &JobSignal::Stop).is_err());
        let stopped = JobReducer::reduce(Paused, &JobSignal::Stop).expect("stop");
        assert_eq!(stopped.to, Stopped);
        assert!(stopped.effects.contains(&JobEffect::DiscardJob));
        assert_eq!(traces(&stopped), 0);
    }

    #[test]
    fn manual_retry_only_from_error() {
        let err = JobReducer::reduce(Finished, &JobSignal::ManualRetry { next_turn: 3 })
            .expect_err("finished");
        assert_eq!(err.to_string(), "cannot apply `manual_retry` while Finished");
        let ok = JobReducer::reduce(Error, &JobSignal::ManualRetry { next_turn: 3 })
            .expect("retry");
        assert_eq!(ok.to, Running);
        assert_eq!(ok.trace(), Some("Manual retry requested. Resuming at turn 3."));
    }

    #[test]
    fn start_is_accepted_from_every_status() {
        for status in ALL {
            let t = JobReducer::reduce(
                status,
                &JobSignal::Start {
                    artifact_name: "a".to_string(),
                },
            )
            .expect("start");
            assert_eq!(t.to, Uploading);
            assert_eq!(t.effects.first(), Some(&JobEffect::DiscardJob));
        }
    }

    #[test]
    fn ingestion_failure_only_during_upload_phases() {
        let signal = JobSignal::IngestionFailed {
            message: "FAILED".to_string(),
        };
        assert!(JobReducer::accepts(Uploading, &signal));
        assert!(JobReducer::accepts(ProcessingFile, &signal));
        assert!(!JobReducer::accepts(Running, &signal));
    }
}
