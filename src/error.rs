use thiserror::Error;

/// Semantic failure classes. The stage runner's classifier is the single
/// place that maps these to retry-or-fail decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Input fails a precondition. Reported to the client, never retried.
    Validation,
    /// Rate limits, timeouts, transient storage errors. Retried with backoff.
    TransientExternal,
    /// The external service rejected the work outright. Retried at the job
    /// level only, since a re-run may hit a different replica or input path.
    PermanentExternal,
    /// Checkpoint corruption or a missing precondition from a prior stage.
    /// Fails the job immediately.
    Internal,
    /// Not an error; the job observed its cancellation flag.
    Cancelled,
}

/// Pipeline-wide error: a machine-readable code plus the §-taxonomy kind.
#[derive(Error, Debug)]
#[error("{code}: {message}")]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub code: String,
    pub message: String,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, code: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn validation(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, code, message)
    }

    pub fn transient(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientExternal, code, message)
    }

    pub fn permanent(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermanentExternal, code, message)
    }

    pub fn internal(code: &str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, code, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "CANCELLED", "job cancelled by request")
    }

    /// Whether the runner may re-enter the failed stage from its checkpoint.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::TransientExternal | ErrorKind::PermanentExternal
        )
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        // Store unavailability is retryable; the caller must not assume the
        // mutation applied.
        Self::transient("STORE_ERROR", err.to_string())
    }
}
