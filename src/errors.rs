//! Error types for the driver.

use thiserror::Error;

/// All seventeen fields PostgreSQL may attach to an `ErrorResponse` or
/// `NoticeResponse`, plus the non-localized severity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PgServerError {
    pub severity: String,
    pub sql_state: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub internal_position: Option<u32>,
    pub internal_query: Option<String>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub routine: Option<String>,
}

impl PgServerError {
    /// A FATAL or PANIC response terminates the backend; the connection is
    /// closed before the error is raised.
    pub fn is_fatal(&self) -> bool {
        self.severity == "FATAL" || self.severity == "PANIC"
    }

    /// Password or authorization rejection, which aborts host fallback.
    pub fn is_auth_failure(&self) -> bool {
        self.sql_state == "28P01" || self.sql_state == "28000"
    }
}

impl std::fmt::Display for PgServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (SQLSTATE {})",
            self.severity, self.message, self.sql_state
        )
    }
}

/// Error type for all driver operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket/TLS open failure, authentication rejection, or an unexpected
    /// message during startup. Carries the server's SQLSTATE when the
    /// failure originated in an `ErrorResponse`, so host fallback can tell
    /// a bad password from a dead host.
    #[error("connection failed: {message}")]
    Connect {
        message: String,
        sql_state: Option<String>,
    },

    /// Read or write on a broken or closed socket.
    #[error("connection closed: {0}")]
    Closed(String),

    /// Message framing or decoding failed; the wire is out of sync and the
    /// connection has been closed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server-originated `ErrorResponse`.
    #[error("{0}")]
    Pg(Box<PgServerError>),

    /// Operation attempted while the connection is BUSY or CLOSED.
    #[error("lock error: {0}")]
    Lock(String),

    /// Unlock attempted on a connection that is not BUSY.
    #[error("unlock error: {0}")]
    Unlock(String),

    /// Cancellation observed at a suspension point before the server had a
    /// chance to respond.
    #[error("operation cancelled")]
    Cancelled,

    /// Client-side argument validation failed.
    #[error("{0}")]
    InvalidArgument(String),

    /// SCRAM exchange violated the protocol.
    #[error("SASL error: {0}")]
    Sasl(String),

    /// Connection string, URI, passfile, or service file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// Failure in a caller-supplied stream (COPY source or sink).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn connect(message: impl Into<String>) -> Self {
        Error::Connect {
            message: message.into(),
            sql_state: None,
        }
    }

    pub(crate) fn closed(message: impl Into<String>) -> Self {
        Error::Closed(message.into())
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::ConfigParse(message.into())
    }

    /// True when host fallback must stop instead of trying the next host.
    pub(crate) fn aborts_fallback(&self) -> bool {
        match self {
            Error::Connect {
                sql_state: Some(state),
                ..
            } => state == "28P01" || state == "28000",
            Error::Pg(e) => e.is_auth_failure(),
            _ => false,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
