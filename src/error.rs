// Pipeline error kinds
//
// Every stage surfaces failures as a PipelineError carrying a reason string.
// The orchestrator decides about retries from `is_retryable()`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Fetching from the upstream rates API failed (transport or non-2xx).
    #[error("Network error: {0}")]
    Network(String),

    /// Data is present but out of tolerance. Halts the run by design.
    #[error("Quality gate failed: {}", reasons.join("; "))]
    QualityGate { reasons: Vec<String> },

    /// Missing or malformed columns in a CSV batch.
    #[error("Schema error: {0}")]
    Schema(String),

    /// The remote blob store rejected our credentials.
    #[error("Storage auth error: {0}")]
    StorageAuth(String),

    /// Any other blob store failure (unreachable, 5xx, corrupt blob).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Snapshot history violates ordering/uniqueness.
    #[error("Invalid history: {0}")]
    History(String),

    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    /// Errors worth retrying on the next schedule tick (or by the orchestrator).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Network(_) | PipelineError::StorageAuth(_) | PipelineError::Storage(_)
        )
    }

    /// Errors that halt the run without being a bug: the data is out of tolerance.
    /// Schema errors are treated exactly like quality gate failures.
    pub fn halts_pipeline(&self) -> bool {
        matches!(
            self,
            PipelineError::QualityGate { .. } | PipelineError::Schema(_)
        )
    }

    /// Reasons to surface to the operator.
    pub fn reasons(&self) -> Vec<String> {
        match self {
            PipelineError::QualityGate { reasons } => reasons.clone(),
            other => vec![other.to_string()],
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(PipelineError::Network("timeout".to_string()).is_retryable());
        assert!(PipelineError::StorageAuth("401".to_string()).is_retryable());
        assert!(!PipelineError::QualityGate { reasons: vec![] }.is_retryable());
        assert!(!PipelineError::Schema("bad".to_string()).is_retryable());
    }

    #[test]
    fn test_schema_error_halts_like_quality_gate() {
        assert!(PipelineError::Schema("missing api_date".to_string()).halts_pipeline());
        assert!(PipelineError::QualityGate { reasons: vec![] }.halts_pipeline());
        assert!(!PipelineError::Network("x".to_string()).halts_pipeline());
    }

    #[test]
    fn test_quality_gate_message_lists_reasons() {
        let err = PipelineError::QualityGate {
            reasons: vec![
                "null_ratio 0.20 exceeds 0.01".to_string(),
                "currency_count 8 below minimum 10".to_string(),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("null_ratio 0.20 exceeds 0.01"));
        assert!(msg.contains("currency_count 8 below minimum 10"));
        assert_eq!(err.reasons().len(), 2);
    }
}
