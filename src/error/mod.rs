use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Who is responsible for a failure.
///
/// `User` failures come from bad input (malformed identifiers, missing
/// linkage, unknown threads) and are never worth retrying. `ThirdParty`
/// failures come from the database engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    User,
    ThirdParty,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "user"),
            ErrorCategory::ThirdParty => write!(f, "third_party"),
        }
    }
}

/// Structured context attached to a wrapped engine error.
pub type ErrorDetails = BTreeMap<&'static str, String>;

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Schema {schema} unavailable: {message}")]
    Schema { schema: String, message: String },

    #[error("Invalid {kind} '{name}': {reason}")]
    InvalidIdentifier {
        kind: String,
        name: String,
        reason: String,
    },

    #[error("Thread not found: {thread_id}")]
    ThreadNotFound { thread_id: String },

    #[error("Message {message_id} is missing required {field}")]
    MissingLinkage {
        message_id: String,
        field: &'static str,
    },

    #[error("{code} ({}): {source}", format_details(.details))]
    Operation {
        code: &'static str,
        category: ErrorCategory,
        details: ErrorDetails,
        #[source]
        source: sqlx::Error,
    },

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

fn format_details(details: &ErrorDetails) -> String {
    details
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(", ")
}

impl StorageError {
    /// Wrap an engine failure with a stable code and call context.
    pub fn operation<I>(code: &'static str, details: I, source: sqlx::Error) -> Self
    where
        I: IntoIterator<Item = (&'static str, String)>,
    {
        StorageError::Operation {
            code,
            category: ErrorCategory::ThirdParty,
            details: details.into_iter().collect(),
            source,
        }
    }

    /// Stable identifying code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::Connection { .. } => "STORAGE_SQLITE_CONNECTION_FAILED",
            StorageError::Schema { .. } => "STORAGE_SQLITE_SCHEMA_SETUP_FAILED",
            StorageError::InvalidIdentifier { .. } => "STORAGE_INVALID_IDENTIFIER",
            StorageError::ThreadNotFound { .. } => "STORAGE_THREAD_NOT_FOUND",
            StorageError::MissingLinkage { .. } => "STORAGE_MESSAGE_MISSING_LINKAGE",
            StorageError::Operation { code, .. } => code,
            StorageError::Sqlx(_) => "STORAGE_SQLITE_QUERY_FAILED",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            StorageError::InvalidIdentifier { .. }
            | StorageError::ThreadNotFound { .. }
            | StorageError::MissingLinkage { .. } => ErrorCategory::User,
            StorageError::Operation { category, .. } => *category,
            StorageError::Connection { .. }
            | StorageError::Schema { .. }
            | StorageError::Sqlx(_) => ErrorCategory::ThirdParty,
        }
    }

    /// Call context recorded when the error was wrapped, if any.
    pub fn details(&self) -> Option<&ErrorDetails> {
        match self {
            StorageError::Operation { details, .. } => Some(details),
            _ => None,
        }
    }

    /// Whether the engine reported that the target table does not exist.
    pub fn is_missing_table(&self) -> bool {
        let source = match self {
            StorageError::Operation { source, .. } => source,
            StorageError::Sqlx(source) => source,
            _ => return false,
        };
        match source {
            sqlx::Error::Database(db) => db.message().contains("no such table"),
            _ => false,
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_error_display() {
        let err = AppError::Config {
            message: "missing key".to_string(),
        };
        assert_eq!(err.to_string(), "Configuration error: missing key");

        let err = AppError::from(StorageError::ThreadNotFound {
            thread_id: "t1".to_string(),
        });
        assert_eq!(err.to_string(), "Storage error: Thread not found: t1");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::Connection {
            message: "failed to connect".to_string(),
        };
        assert_eq!(err.to_string(), "Database connection failed: failed to connect");

        let err = StorageError::ThreadNotFound {
            thread_id: "thread-123".to_string(),
        };
        assert_eq!(err.to_string(), "Thread not found: thread-123");

        let err = StorageError::MissingLinkage {
            message_id: "msg-1".to_string(),
            field: "resourceId",
        };
        assert_eq!(err.to_string(), "Message msg-1 is missing required resourceId");

        let err = StorageError::InvalidIdentifier {
            kind: "table name".to_string(),
            name: "bad name".to_string(),
            reason: "contains invalid characters".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid table name 'bad name': contains invalid characters"
        );
    }

    #[test]
    fn test_operation_error_carries_code_and_details() {
        let err = StorageError::operation(
            "STORAGE_SQLITE_INSERT_FAILED",
            [("tableName", "threads".to_string()), ("records", "3".to_string())],
            sqlx::Error::RowNotFound,
        );

        assert_eq!(err.code(), "STORAGE_SQLITE_INSERT_FAILED");
        assert_eq!(err.category(), ErrorCategory::ThirdParty);
        let details = err.details().unwrap();
        assert_eq!(details["tableName"], "threads");
        assert_eq!(details["records"], "3");
        assert!(err.to_string().contains("records=3, tableName=threads"));
    }

    #[test]
    fn test_user_errors_are_categorised() {
        let err = StorageError::ThreadNotFound {
            thread_id: "t".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::User);

        let err = StorageError::MissingLinkage {
            message_id: "m".to_string(),
            field: "threadId",
        };
        assert_eq!(err.category(), ErrorCategory::User);
        assert_eq!(err.code(), "STORAGE_MESSAGE_MISSING_LINKAGE");
    }

    #[test]
    fn test_missing_table_detection_ignores_other_errors() {
        let err = StorageError::Sqlx(sqlx::Error::RowNotFound);
        assert!(!err.is_missing_table());

        let err = StorageError::ThreadNotFound {
            thread_id: "t".to_string(),
        };
        assert!(!err.is_missing_table());
    }

    #[test]
    fn test_storage_error_conversion_to_app_error() {
        let storage_err = StorageError::ThreadNotFound {
            thread_id: "test-123".to_string(),
        };
        let app_err: AppError = storage_err.into();
        assert!(matches!(app_err, AppError::Storage(_)));
    }
}
