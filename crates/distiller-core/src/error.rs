use distiller_orchestrator::TransitionError;

/// Reasons a finalized turn is refused even though the call itself succeeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContentRejection {
    #[error("Received an empty response from the model")]
    EmptyResponse,
    #[error("Response contained leaked internal reasoning")]
    ReasoningLeak,
}

#[derive(Debug, thiserror::Error)]
pub enum DistillError {
    #[error("{0}")]
    Validation(String),
    #[error("File ingestion failed: {0}")]
    Ingestion(String),
    #[error("{0}")]
    TransientCall(String),
    #[error(transparent)]
    ContentValidation(#[from] ContentRejection),
    #[error("Failed after {attempts} attempts. Last error: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
    #[error("no distillation job is active")]
    NoActiveJob,
}

impl DistillError {
    /// Turn failures are all retried the same way; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DistillError::TransientCall(_) | DistillError::ContentValidation(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            DistillError::Validation(_) => "VALIDATION",
            DistillError::Ingestion(_) => "INGESTION",
            DistillError::TransientCall(_) => "TRANSIENT_CALL",
            DistillError::ContentValidation(ContentRejection::EmptyResponse) => "EMPTY_RESPONSE",
            DistillError::ContentValidation(ContentRejection::ReasoningLeak) => "REASONING_LEAK",
            DistillError::RetriesExhausted { .. } => "RETRIES_EXHAUSTED",
            DistillError::InvalidTransition(_) => "INVALID_TRANSITION",
            DistillError::NoActiveJob => "NO_ACTIVE_JOB",
        }
    }
}

impl From<anyhow::Error> for DistillError {
    fn from(value: anyhow::Error) -> Self {
        DistillError::TransientCall(format!("{value:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_rejections_are_retryable() {
        assert!(DistillError::from(ContentRejection::EmptyResponse).is_retryable());
        assert!(DistillError::TransientCall("503".to_string()).is_retryable());
        assert!(!DistillError::Validation("no key".to_string()).is_retryable());
        assert!(!DistillError::Ingestion("FAILED".to_string()).is_retryable());
    }

    #[test]
    fn exhaustion_message_keeps_last_error_verbatim() {
        let err = DistillError::RetriesExhausted {
            attempts: 5,
            last_error: "upstream 503: overloaded".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Failed after 5 attempts. Last error: upstream 503: overloaded"
        );
    }
}
