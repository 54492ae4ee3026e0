//! Error types and result handling for pg-row-capture.
//!
//! This module defines the main error type [`Error`], the classified
//! connection failure [`ConnectError`], and a convenience [`Result`] alias
//! used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use pg_row_capture::{ConnectErrorKind, Error, Result};
//!
//! fn load() -> Result<()> {
//!     Err(Error::Config("table identifier is empty".to_string()))
//! }
//!
//! match load() {
//!     Ok(()) => println!("Loaded"),
//!     Err(e) if e.kind() == ConnectErrorKind::ConfigurationError => eprintln!("Bad config: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// Boxed driver error as produced by a [`Connector`](crate::connection::Connector).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The main error type for pg-row-capture operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, detected before any network attempt.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be loaded or deserialized.
    #[error("Configuration error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Classified failure while establishing the source connection.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// PostgreSQL client or protocol error after the connection is up.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding records or history lines.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A serializer could not be built or rejected a record.
    #[error(transparent)]
    Serializer(#[from] crate::serializer::SerializerError),

    /// I/O error, typically from schema history file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Schema history is missing or corrupt where a resume was expected.
    #[error("Schema history error: {message}")]
    History {
        /// Description of what was wrong with the history
        message: String,
    },

    /// Invalid or malformed replication message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// Graceful shutdown was requested (e.g., via Ctrl+C).
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit retry waits and the capture loop.
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Maps any error onto the connection failure taxonomy.
    pub fn kind(&self) -> ConnectErrorKind {
        match self {
            Error::Connect(e) => e.kind(),
            Error::Config(_) | Error::ConfigLoad(_) => ConnectErrorKind::ConfigurationError,
            _ => ConnectErrorKind::Other,
        }
    }

    pub(crate) fn history(message: impl Into<String>) -> Self {
        Error::History {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_message(message: impl Into<String>) -> Self {
        Error::InvalidMessage {
            message: message.into(),
        }
    }
}

/// Closed set of connection failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectErrorKind {
    /// Credentials were rejected.
    AuthenticationFailed,
    /// Nothing is listening at the address. The only transient kind.
    ConnectionRefused,
    /// No route, network unreachable, connect timeout or failed name lookup.
    HostUnreachable,
    /// The configuration is invalid or names something that does not exist.
    ConfigurationError,
    /// Anything else.
    Other,
}

impl ConnectErrorKind {
    /// Whether a retry policy may retry this kind.
    pub fn is_transient(self) -> bool {
        matches!(self, ConnectErrorKind::ConnectionRefused)
    }
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectErrorKind::AuthenticationFailed => "authentication failed",
            ConnectErrorKind::ConnectionRefused => "connection refused",
            ConnectErrorKind::HostUnreachable => "host unreachable",
            ConnectErrorKind::ConfigurationError => "configuration error",
            ConnectErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// A classified connection failure.
///
/// Keeps the raw error as [`source`](std::error::Error::source) and the
/// rendered cause chain, outermost first, so callers can inspect the root
/// cause without downcasting.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct ConnectError {
    kind: ConnectErrorKind,
    subject: Option<String>,
    message: String,
    chain: Vec<String>,
    attempts: u32,
    #[source]
    source: Option<BoxError>,
}

impl ConnectError {
    pub(crate) fn new(
        kind: ConnectErrorKind,
        subject: Option<String>,
        message: String,
        source: Option<BoxError>,
    ) -> Self {
        let chain = match &source {
            Some(raw) => render_chain(raw.as_ref()),
            None => Vec::new(),
        };
        Self {
            kind,
            subject,
            message,
            chain,
            attempts: 1,
            source,
        }
    }

    /// A configuration failure detected before any network attempt.
    pub fn configuration(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ConnectErrorKind::ConfigurationError,
            subject: None,
            chain: vec![message.clone()],
            message: format!("invalid configuration: {}", message),
            attempts: 0,
            source: None,
        }
    }

    pub(crate) fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn kind(&self) -> ConnectErrorKind {
        self.kind
    }

    /// The rejected user for [`ConnectErrorKind::AuthenticationFailed`].
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Number of connection attempts made before surfacing this error.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Rendered causes, outermost first.
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    /// The innermost cause message.
    pub fn root_cause(&self) -> &str {
        self.chain.last().map(String::as_str).unwrap_or(&self.message)
    }
}

/// Renders every link of an error chain, outermost first.
pub(crate) fn render_chain(err: &(dyn std::error::Error + 'static)) -> Vec<String> {
    std::iter::successors(Some(err), |e| e.source())
        .map(|e| e.to_string())
        .collect()
}

/// A convenient Result type alias for pg-row-capture operations.
pub type Result<T> = std::result::Result<T, Error>;
