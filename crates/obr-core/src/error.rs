//! Error types for the OBR annotation workflow.

use thiserror::Error;

/// Result type alias using the workflow's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for annotation workflow operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Stored concept reference could not be parsed
    #[error("Malformed concept reference: {0:?}")]
    MalformedConcept(String),

    /// Workflow row is not in the state a stage expects
    #[error("Invalid transition: cannot run {stage} on a row in state {from}")]
    InvalidTransition { from: String, stage: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A transient failure persisted through every retry attempt
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// A stage did not complete within its time budget
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// SQLSTATE codes that indicate the server went away or the transaction lost
/// a race and can be replayed unchanged.
const TRANSIENT_SQLSTATES: &[&str] = &["57P01", "57P02", "57P03", "40001", "40P01"];

impl Error {
    /// Whether the failure is a transient infrastructure failure that the
    /// retry controller may replay.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(e) => is_transient_sqlx(e),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

fn is_transient_sqlx(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => {
                let code: &str = &code;
                code.starts_with("08") || TRANSIENT_SQLSTATES.iter().any(|c| *c == code)
            }
            None => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("resource GEO".to_string());
        assert_eq!(err.to_string(), "Not found: resource GEO");
    }

    #[test]
    fn test_error_display_malformed_concept() {
        let err = Error::MalformedConcept("NCI".to_string());
        assert_eq!(err.to_string(), "Malformed concept reference: \"NCI\"");
    }

    #[test]
    fn test_error_display_invalid_transition() {
        let err = Error::InvalidTransition {
            from: "indexing_done".to_string(),
            stage: "isa_closure".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid transition: cannot run isa_closure on a row in state indexing_done"
        );
    }

    #[test]
    fn test_error_display_retries_exhausted() {
        let err = Error::RetriesExhausted {
            operation: "commit_expansion".to_string(),
            attempts: 5,
            last_error: "connection refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "commit_expansion failed after 5 attempts: connection refused"
        );
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(Error::Database(sqlx::Error::PoolClosed).is_transient());
    }

    #[test]
    fn test_row_not_found_is_not_transient() {
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_transient());
    }

    #[test]
    fn test_io_connection_reset_is_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert!(Error::Io(io).is_transient());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(!Error::Io(io).is_transient());
    }

    #[test]
    fn test_domain_errors_are_not_transient() {
        assert!(!Error::InvalidInput("x".into()).is_transient());
        assert!(!Error::MalformedConcept("x".into()).is_transient());
        assert!(!Error::Timeout("x".into()).is_transient());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
