use thiserror::Error;

use super::transport::TransportError;

/// Terminal failure of a call made through the pipeline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("Not signed in")]
    Unauthenticated,

    #[error("Session expired - sign in again")]
    SessionExpired,

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Server error {status}: {body}")]
    ServerError { status: u16, body: String },

    #[error("Request rejected with status {status}: {body}")]
    ClientError { status: u16, body: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl PipelineError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Classify a non-success status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let body = Self::truncate_body(body);
        match status {
            500..=599 => PipelineError::ServerError { status, body },
            _ => PipelineError::ClientError { status, body },
        }
    }

    /// Transient failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Timeout | PipelineError::NetworkError(_) | PipelineError::ServerError { .. }
        )
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            PipelineError::ServerError { status, .. } | PipelineError::ClientError { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl From<TransportError> for PipelineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout(_) => PipelineError::Timeout,
            TransportError::Network(msg) => PipelineError::NetworkError(msg),
            TransportError::InvalidRequest(msg) => PipelineError::InvalidRequest(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_from_status() {
        assert!(matches!(
            PipelineError::from_status(503, "down"),
            PipelineError::ServerError { status: 503, .. }
        ));
        assert!(matches!(
            PipelineError::from_status(404, "missing"),
            PipelineError::ClientError { status: 404, .. }
        ));
        assert!(PipelineError::from_status(500, "").is_transient());
        assert!(!PipelineError::from_status(429, "").is_transient());
        assert!(!PipelineError::from_status(401, "").is_transient());
    }

    #[test]
    fn test_truncates_long_bodies() {
        let body = "é".repeat(400); // 800 bytes, 2 per char
        let err = PipelineError::from_status(500, &body);
        let PipelineError::ServerError { body: shown, .. } = err else {
            panic!("expected server error");
        };
        assert!(shown.contains("truncated, 800 total bytes"));
        assert!(shown.len() < 600);
    }

    #[test]
    fn test_transport_errors_map_to_taxonomy() {
        assert_eq!(
            PipelineError::from(TransportError::Timeout(Duration::from_secs(1))),
            PipelineError::Timeout
        );
        assert!(PipelineError::from(TransportError::Network("reset".into())).is_transient());
        assert!(!PipelineError::from(TransportError::InvalidRequest("bad".into())).is_transient());
    }
}
