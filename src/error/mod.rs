use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Answer not found: {answer_id}")]
    AnswerNotFound { answer_id: i64 },

    #[error("Cycle not found: {cycle_id}")]
    CycleNotFound { cycle_id: i64 },

    #[error("Snapshot not found: {snapshot_id}")]
    SnapshotNotFound { snapshot_id: i64 },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Store not initialized; writes are refused until initialization succeeds")]
    NotInitialized,

    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    #[error("Transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Byte-store transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unreachable: {message}")]
    Unreachable { message: String },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Flow navigation and catalog errors
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("Unknown situation: {situation}")]
    UnknownSituation { situation: String },

    #[error("Unknown question '{question_id}' in situation {situation}")]
    UnknownQuestion {
        situation: String,
        question_id: String,
    },

    #[error("Invalid answer for {question_id}: {reason}")]
    InvalidAnswer { question_id: String, reason: String },

    #[error("Invalid catalog: {message}")]
    InvalidCatalog { message: String },
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Result type alias for flow operations
pub type FlowResult<T> = Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");

        let err = AppError::Internal {
            message: "unexpected".to_string(),
        };
        assert_eq!(err.to_string(), "Internal error: unexpected");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Unavailable {
            message: "no cache".to_string(),
        };
        assert_eq!(err.to_string(), "Store unavailable: no cache");

        let err = StorageError::CycleNotFound { cycle_id: 7 };
        assert_eq!(err.to_string(), "Cycle not found: 7");

        let err = StorageError::SnapshotNotFound { snapshot_id: 3 };
        assert_eq!(err.to_string(), "Snapshot not found: 3");

        let err = StorageError::Migration {
            message: "disk full".to_string(),
        };
        assert_eq!(err.to_string(), "Migration failed: disk full");
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::Api {
            status: 503,
            message: "maintenance".to_string(),
        };
        assert_eq!(err.to_string(), "API error: 503 - maintenance");

        let err = TransportError::Timeout { timeout_ms: 5000 };
        assert_eq!(err.to_string(), "Request timeout after 5000ms");
    }

    #[test]
    fn test_flow_error_display() {
        let err = FlowError::UnknownQuestion {
            situation: "Designing".to_string(),
            question_id: "nope".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Unknown question 'nope' in situation Designing"
        );

        let err = FlowError::InvalidAnswer {
            question_id: "ready-yesno".to_string(),
            reason: "expected true or false".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid answer for ready-yesno: expected true or false"
        );
    }

    #[test]
    fn test_storage_error_conversion_to_app_error() {
        let storage_err = StorageError::CycleNotFound { cycle_id: 1 };
        let app_err: AppError = storage_err.into();
        assert!(matches!(app_err, AppError::Storage(_)));
    }

    #[test]
    fn test_transport_error_conversion_to_storage_error() {
        let err = TransportError::Unreachable {
            message: "connection refused".to_string(),
        };
        let storage_err: StorageError = err.into();
        assert!(matches!(storage_err, StorageError::Transport(_)));
    }

    #[test]
    fn test_flow_error_conversion_to_app_error() {
        let err = FlowError::UnknownSituation {
            situation: "Dreaming".to_string(),
        };
        let app_err: AppError = err.into();
        assert!(matches!(app_err, AppError::Flow(_)));
        assert!(app_err.to_string().contains("Dreaming"));
    }
}
