//! Error types for the transactional SQL service.
//!
//! All errors are defined with `thiserror`. Connection and processing errors
//! carry a list of context messages (driver, mapping name, statement text) that
//! callers append while the error travels up the stack.

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum SqlError {
    #[error("Connection pool exhausted: {pool} (size {size}){}", format_context(.context))]
    PoolExhausted {
        pool: String,
        size: usize,
        context: Vec<String>,
    },

    #[error("Connection failed: {message}{}", format_context(.context))]
    Connection {
        message: String,
        context: Vec<String>,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Processing error: {message}{}", format_context(.context))]
    Processing {
        message: String,
        context: Vec<String>,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Illegal argument: {message}")]
    IllegalArgument { message: String },

    #[error("Request rejected: {message}")]
    Rejected { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Transaction cancelled: {transaction_id}")]
    Cancelled { transaction_id: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn format_context(context: &[String]) -> String {
    if context.is_empty() {
        String::new()
    } else {
        format!(" [{}]", context.join(", "))
    }
}

impl SqlError {
    /// Create a pool exhausted error.
    pub fn pool_exhausted(pool: impl Into<String>, size: usize) -> Self {
        Self::PoolExhausted {
            pool: pool.into(),
            size,
            context: Vec::new(),
        }
    }

    /// Create a connection error without an underlying cause.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            context: Vec::new(),
            source: None,
        }
    }

    /// Create a connection error wrapping the failure that caused it.
    pub fn connection_caused_by(
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            context: Vec::new(),
            source: Some(source.into()),
        }
    }

    /// Create a processing error.
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing {
            message: message.into(),
            context: Vec::new(),
            source: None,
        }
    }

    /// Create a processing error wrapping the failure that caused it.
    pub fn processing_caused_by(
        message: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self::Processing {
            message: message.into(),
            context: Vec::new(),
            source: Some(source.into()),
        }
    }

    /// Create an illegal argument error.
    pub fn illegal_argument(message: impl Into<String>) -> Self {
        Self::IllegalArgument {
            message: message.into(),
        }
    }

    /// Create a rejection error.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(transaction_id: impl Into<String>) -> Self {
        Self::Cancelled {
            transaction_id: transaction_id.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Append a context message. Variants without a context list are returned unchanged.
    pub fn with_context(mut self, message: impl Into<String>) -> Self {
        match &mut self {
            Self::PoolExhausted { context, .. }
            | Self::Connection { context, .. }
            | Self::Processing { context, .. } => context.push(message.into()),
            _ => {}
        }
        self
    }

    /// Context messages collected so far.
    pub fn context(&self) -> &[String] {
        match self {
            Self::PoolExhausted { context, .. }
            | Self::Connection { context, .. }
            | Self::Processing { context, .. } => context,
            _ => &[],
        }
    }

    /// Check if this error means the connection could not be acquired.
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. } | Self::Connection { .. })
    }
}

/// Convert sqlx errors to SqlError.
impl From<sqlx::Error> for SqlError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => {
                SqlError::connection(format!("Invalid connection configuration: {}", msg))
            }
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_string();
                let code = db_err.code().map(|c| c.to_string());
                let err = SqlError::processing(message);
                match code {
                    Some(code) => err.with_context(format!("sqlState={}", code)),
                    None => err,
                }
            }
            sqlx::Error::RowNotFound => SqlError::processing("No rows returned"),
            sqlx::Error::PoolTimedOut => SqlError::pool_exhausted("sqlx", 0),
            sqlx::Error::PoolClosed => SqlError::connection("Connection pool is closed"),
            sqlx::Error::Io(io_err) => SqlError::connection_caused_by("I/O error", io_err),
            sqlx::Error::Tls(tls_err) => SqlError::connection_caused_by("TLS error", tls_err),
            sqlx::Error::Protocol(msg) => {
                SqlError::connection(format!("Protocol error: {}", msg))
            }
            sqlx::Error::ColumnNotFound(col) => {
                SqlError::processing(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => SqlError::processing(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => SqlError::processing_caused_by(
                format!("Failed to decode column {}", index),
                source,
            ),
            sqlx::Error::Decode(source) => SqlError::processing_caused_by("Decode error", source),
            sqlx::Error::WorkerCrashed => SqlError::internal("Database worker crashed"),
            _ => SqlError::processing(format!("Unexpected database error: {}", err)),
        }
    }
}

/// Result type alias for SQL service operations.
pub type SqlResult<T> = Result<T, SqlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_without_context() {
        let err = SqlError::processing("statement failed");
        assert_eq!(err.to_string(), "Processing error: statement failed");
    }

    #[test]
    fn test_error_display_with_context() {
        let err = SqlError::connection("unexpected exception")
            .with_context("jdbcDriverName=sqlite, jdbcMappingName=sqlite::memory:");
        assert_eq!(
            err.to_string(),
            "Connection failed: unexpected exception [jdbcDriverName=sqlite, jdbcMappingName=sqlite::memory:]"
        );
    }

    #[test]
    fn test_context_ignored_for_plain_variants() {
        let err = SqlError::illegal_argument("bad").with_context("ignored");
        assert!(err.context().is_empty());
        assert_eq!(err.to_string(), "Illegal argument: bad");
    }

    #[test]
    fn test_source_is_kept() {
        use std::error::Error as _;
        let io = std::io::Error::other("boom");
        let err = SqlError::processing_caused_by("wrapped", io);
        assert_eq!(err.source().map(|s| s.to_string()), Some("boom".to_string()));
    }

    #[test]
    fn test_acquisition_failures() {
        assert!(SqlError::pool_exhausted("svc", 1).is_acquisition_failure());
        assert!(SqlError::connection("down").is_acquisition_failure());
        assert!(!SqlError::processing("sql").is_acquisition_failure());
    }
}
