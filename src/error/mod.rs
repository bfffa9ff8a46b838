use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Assignment error: {0}")]
    Assignment(#[from] AssignmentError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Stored JSON is malformed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Stimulus assignment errors
#[derive(Debug, Error)]
pub enum AssignmentError {
    #[error("Stimulus pool is empty: {pool_id}")]
    EmptyPool { pool_id: String },

    #[error("Stimulus {item_id} was claimed concurrently")]
    AssignmentConflict { item_id: String },

    #[error("Could not assign stimuli from {pool_id} after {attempts} attempts")]
    AssignmentFailed { pool_id: String, attempts: u32 },

    #[error("Storage error during assignment: {0}")]
    Storage(#[from] StorageError),
}

impl AssignmentError {
    /// Message safe to show to a participant whose session could not start.
    pub fn participant_message(&self) -> &'static str {
        match self {
            AssignmentError::EmptyPool { .. } => {
                "There are no stimuli available for this study right now. Please return the study."
            }
            _ => "We could not prepare your session. Please reload the page in a moment.",
        }
    }
}

/// Result forwarding errors
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Persistence unavailable: {message}")]
    PersistenceUnavailable { message: String },

    #[error("Result queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Result forwarder is closed")]
    Closed,
}

/// Rendering collaborator errors
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Connection to participant lost")]
    Disconnected,

    #[error("Plugin failed to present {kind}: {message}")]
    Plugin { kind: String, message: String },
}

/// Wire protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unknown method: {method}")]
    UnknownMethod { method: String },

    #[error("Invalid parameters for {method}: {message}")]
    InvalidParameters { method: String, message: String },

    #[error("Session already started on this connection: {session_id}")]
    SessionAlreadyStarted { session_id: String },

    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<RecorderError> for AppError {
    fn from(err: RecorderError) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for stimulus assignment
pub type AssignmentResult<T> = Result<T, AssignmentError>;

/// Result type alias for result forwarding
pub type RecorderResult<T> = Result<T, RecorderError>;

/// Result type alias for wire protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "bad port".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: bad port");

        let err = AppError::Internal {
            message: "unexpected".to_string(),
        };
        assert_eq!(err.to_string(), "Internal error: unexpected");
    }

    #[test]
    fn test_assignment_error_display() {
        let err = AssignmentError::EmptyPool {
            pool_id: "dominoes".to_string(),
        };
        assert_eq!(err.to_string(), "Stimulus pool is empty: dominoes");

        let err = AssignmentError::AssignmentConflict {
            item_id: "stim-1".to_string(),
        };
        assert_eq!(err.to_string(), "Stimulus stim-1 was claimed concurrently");

        let err = AssignmentError::AssignmentFailed {
            pool_id: "dominoes".to_string(),
            attempts: 4,
        };
        assert_eq!(
            err.to_string(),
            "Could not assign stimuli from dominoes after 4 attempts"
        );
    }

    #[test]
    fn test_participant_message_distinguishes_empty_pool() {
        let empty = AssignmentError::EmptyPool {
            pool_id: "p".to_string(),
        };
        let failed = AssignmentError::AssignmentFailed {
            pool_id: "p".to_string(),
            attempts: 3,
        };
        assert!(empty.participant_message().contains("no stimuli"));
        assert!(failed.participant_message().contains("reload"));
    }

    #[test]
    fn test_recorder_error_display() {
        let err = RecorderError::PersistenceUnavailable {
            message: "refused".to_string(),
        };
        assert_eq!(err.to_string(), "Persistence unavailable: refused");

        let err = RecorderError::QueueFull { capacity: 8 };
        assert_eq!(err.to_string(), "Result queue is full (capacity 8)");
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnknownMethod {
            method: "foo".to_string(),
        };
        assert_eq!(err.to_string(), "Unknown method: foo");

        let err = ProtocolError::InvalidParameters {
            method: "session/start".to_string(),
            message: "count must be positive".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid parameters for session/start: count must be positive"
        );
    }

    #[test]
    fn test_storage_error_conversion_to_app_error() {
        let storage_err = StorageError::Query {
            message: "locked".to_string(),
        };
        let app_err: AppError = storage_err.into();
        assert!(matches!(app_err, AppError::Storage(_)));
    }

    #[test]
    fn test_assignment_error_conversion_to_app_error() {
        let err = AssignmentError::EmptyPool {
            pool_id: "p".to_string(),
        };
        let app_err: AppError = err.into();
        assert!(matches!(app_err, AppError::Assignment(_)));
    }

    #[test]
    fn test_recorder_error_conversion_to_app_error() {
        let app_err: AppError = RecorderError::Closed.into();
        assert!(matches!(app_err, AppError::Internal { .. }));
        assert!(app_err.to_string().contains("closed"));
    }
}
