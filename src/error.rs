use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Errors produced inside the research pipeline.
///
/// Only `FatalDiscovery` and `JobTimeout` terminate a job. Everything else
/// is recorded on the relevant page result or phase record and the job
/// continues with degraded completeness.
#[derive(Debug, Clone)]
pub enum PipelineError {
    /// Timeout, connection reset, DNS failure. Retried at the fetch level.
    TransientNetwork(String),
    /// HTTP 403/429/503-style refusal. Recorded, never retried in-job.
    BlockedOrForbidden(u16),
    /// Both extraction tiers produced less text than the sufficiency threshold.
    ExtractionInsufficient(usize),
    /// No rate token became available within the caller's timeout.
    RateLimitExceeded { waited_ms: u64 },
    /// The AI circuit breaker is open; callers should back off.
    CircuitOpen { retry_after: Duration },
    /// The model returned something that could not be parsed as the expected JSON.
    ModelResponseInvalid(String),
    /// The job-level deadline expired during the named phase.
    JobTimeout(String),
    /// The origin is fully unreachable; there is nothing to research.
    FatalDiscovery(String),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::TransientNetwork(msg) => write!(f, "Transient network error: {}", msg),
            PipelineError::BlockedOrForbidden(status) => {
                write!(f, "Blocked or forbidden by origin (HTTP {})", status)
            }
            PipelineError::ExtractionInsufficient(len) => {
                write!(f, "Extracted content too short ({} chars)", len)
            }
            PipelineError::RateLimitExceeded { waited_ms } => {
                write!(f, "Rate limit exceeded after waiting {}ms", waited_ms)
            }
            PipelineError::CircuitOpen { retry_after } => {
                write!(f, "AI circuit open, retry after {:.0?}", retry_after)
            }
            PipelineError::ModelResponseInvalid(msg) => {
                write!(f, "Model response invalid: {}", msg)
            }
            PipelineError::JobTimeout(phase) => {
                write!(f, "Job timed out during phase: {}", phase)
            }
            PipelineError::FatalDiscovery(msg) => write!(f, "Discovery failed: {}", msg),
        }
    }
}

impl std::error::Error for PipelineError {}

impl PipelineError {
    /// Whether this error terminates the whole job.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::JobTimeout(_) | PipelineError::FatalDiscovery(_)
        )
    }
}

/// Errors surfaced by the HTTP API.
#[derive(Debug)]
pub enum ApiError {
    InvalidRequest(String),
    JobNotFound(String),
    JobNotFinished(String),
    InternalError(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            ApiError::JobNotFound(id) => write!(f, "Job not found: {}", id),
            ApiError::JobNotFinished(id) => write!(f, "Job not finished: {}", id),
            ApiError::InternalError(msg) => write!(f, "Internal Server Error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::InternalError(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ApiError::JobNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            ApiError::JobNotFinished(_) => (StatusCode::CONFLICT, self.to_string()),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeout_and_discovery_are_fatal() {
        assert!(PipelineError::JobTimeout("ai_analysis".into()).is_fatal());
        assert!(PipelineError::FatalDiscovery("unreachable".into()).is_fatal());
        assert!(!PipelineError::TransientNetwork("reset".into()).is_fatal());
        assert!(!PipelineError::BlockedOrForbidden(403).is_fatal());
        assert!(!PipelineError::ModelResponseInvalid("not json".into()).is_fatal());
        assert!(!PipelineError::RateLimitExceeded { waited_ms: 500 }.is_fatal());
    }

    #[test]
    fn display_includes_status_code() {
        let err = PipelineError::BlockedOrForbidden(429);
        assert!(err.to_string().contains("429"));
    }
}
