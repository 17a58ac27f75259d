use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] postgres::Error),

    #[error("Parquet write error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("Source {source_name} unavailable: {message}")]
    SourceUnavailable {
        source_name: String,
        message: String,
    },

    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    #[error("Insufficient training data: {available} rows available, {required} required")]
    InsufficientTrainingData { available: usize, required: usize },

    #[error("Grid geometry mismatch: {0}")]
    GeometryMismatch(String),

    #[error("Storage conflict: {0}")]
    StorageConflict(String),

    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Station {station_id} not found")]
    StationNotFound { station_id: String },

    #[error("Another forecast run holds the lock at {}", .0.display())]
    ForecastInProgress(PathBuf),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),
}

/// Operational classification used for skip/abort accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorCategory {
    SourceUnavailable,
    MalformedRecord,
    InsufficientTrainingData,
    GeometryMismatch,
    StorageConflict,
    Infrastructure,
}

impl PipelineError {
    pub fn source_unavailable(source_name: impl Into<String>, message: impl ToString) -> Self {
        PipelineError::SourceUnavailable {
            source_name: source_name.into(),
            message: message.to_string(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            PipelineError::SourceUnavailable { .. } | PipelineError::Http(_) => {
                ErrorCategory::SourceUnavailable
            }
            PipelineError::MalformedRecord(_)
            | PipelineError::InvalidCoordinate(_)
            | PipelineError::DateParse(_)
            | PipelineError::Csv(_)
            | PipelineError::Json(_)
            | PipelineError::Validation(_) => ErrorCategory::MalformedRecord,
            PipelineError::InsufficientTrainingData { .. } => {
                ErrorCategory::InsufficientTrainingData
            }
            PipelineError::GeometryMismatch(_) => ErrorCategory::GeometryMismatch,
            PipelineError::StorageConflict(_) => ErrorCategory::StorageConflict,
            _ => ErrorCategory::Infrastructure,
        }
    }

    /// Only training starvation is allowed to stop its own run; everything
    /// else in the taxonomy is skipped and counted.
    pub fn halts_run(&self) -> bool {
        self.category() == ErrorCategory::InsufficientTrainingData
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_mapping() {
        let err = PipelineError::source_unavailable("ground", "timeout");
        assert_eq!(err.category(), ErrorCategory::SourceUnavailable);
        assert!(!err.halts_run());

        let err = PipelineError::InsufficientTrainingData {
            available: 8,
            required: 10,
        };
        assert_eq!(err.category(), ErrorCategory::InsufficientTrainingData);
        assert!(err.halts_run());

        let err = PipelineError::GeometryMismatch("max latitude 1.2".to_string());
        assert!(!err.halts_run());

        let err = PipelineError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(err.category(), ErrorCategory::Infrastructure);
        assert!(!err.halts_run());
    }
}
