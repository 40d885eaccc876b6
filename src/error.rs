use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Analyzer unavailable: {0}")]
    AnalyzerUnavailable(String),

    #[error("Analyzer timed out after {0}s")]
    AnalyzerTimeout(u64),

    #[error("Admission rejected: {0}")]
    AdmissionRejected(String),

    #[error("Journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("Operation {operation_id} is not reversible: {}", .diff.join("; "))]
    NotReversible {
        operation_id: String,
        diff: Vec<String>,
    },

    #[error("Filesystem error: {0}")]
    Filesystem(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    General(String),
}

/// Contract violations on the operation journal. These indicate a logic defect in the
/// caller rather than an environmental failure.
#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("operation {id} is {actual}, expected {expected}")]
    InvalidTransition {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("path has an operation in flight: {0}")]
    PathBusy(String),

    #[error("operation {0} did not take effect on disk")]
    NotVerified(String),
}

impl AppError {
    /// Analyzer failures route a file to user review instead of failing the batch.
    pub fn is_analyzer_failure(&self) -> bool {
        matches!(
            self,
            Self::AnalyzerUnavailable(_) | Self::AnalyzerTimeout(_)
        )
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_reversible_lists_every_difference() {
        let err = AppError::NotReversible {
            operation_id: "op-1".to_string(),
            diff: vec!["size 3 -> 5".to_string(), "hash changed".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Operation op-1 is not reversible: size 3 -> 5; hash changed"
        );
    }

    #[test]
    fn journal_errors_convert_and_serialize_as_text() {
        let err: AppError = JournalError::PathBusy("/tmp/a".to_string()).into();
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(
            json,
            "\"Journal error: path has an operation in flight: /tmp/a\""
        );
    }

    #[test]
    fn analyzer_failures_are_recognised() {
        assert!(AppError::AnalyzerTimeout(30).is_analyzer_failure());
        assert!(AppError::AnalyzerUnavailable("down".into()).is_analyzer_failure());
        assert!(!AppError::General("x".into()).is_analyzer_failure());
    }
}
