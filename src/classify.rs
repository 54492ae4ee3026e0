//! Classification of raw driver failures into [`ConnectErrorKind`]s.
//!
//! Each link of the cause chain is inspected, outermost first, and the first
//! link that can be recognised decides the kind:
//!
//! 1. PostgreSQL SQLSTATE codes (`28P01`, `28000` are authentication,
//!    `3D000` is an unknown database).
//! 2. `std::io::Error` kinds and OS error numbers.
//! 3. Message fragments other drivers are known to produce.
//!
//! Nothing is discarded: the raw error becomes the classified error's source.

use std::io;
use tokio_postgres::error::{DbError, SqlState};

use crate::config::ConnectionConfig;
use crate::error::{render_chain, BoxError, ConnectError, ConnectErrorKind};

// Linux errno values, for drivers that only hand back raw OS errors.
const ECONNREFUSED: i32 = 111;
const ENETUNREACH: i32 = 101;
const ETIMEDOUT: i32 = 110;
const EHOSTUNREACH: i32 = 113;

const AUTH_FRAGMENTS: &[&str] = &[
    "password authentication failed",
    "access denied for user",
    "authentication failed",
    "no password supplied",
];

const UNREACHABLE_FRAGMENTS: &[&str] = &[
    "failed to lookup address",
    "name or service not known",
    "no route to host",
    "network is unreachable",
    "timed out",
];

/// Classifies a raw connection failure against the configuration it was
/// produced for.
pub fn classify(raw: BoxError, config: &ConnectionConfig) -> ConnectError {
    let kind = classify_chain(raw.as_ref());
    let root = render_chain(raw.as_ref()).pop().unwrap_or_default();

    let (subject, message) = match kind {
        ConnectErrorKind::AuthenticationFailed => (
            Some(config.username.clone()),
            format!(
                "authentication failed for user \"{}\" (check user name and password): {}",
                config.username, root
            ),
        ),
        ConnectErrorKind::ConnectionRefused => (
            None,
            format!(
                "connection to {}:{} refused: {}",
                config.host, config.port, root
            ),
        ),
        ConnectErrorKind::HostUnreachable => (
            None,
            format!("host {}:{} is unreachable: {}", config.host, config.port, root),
        ),
        ConnectErrorKind::ConfigurationError => (None, format!("invalid configuration: {}", root)),
        ConnectErrorKind::Other => (None, raw.to_string()),
    };

    ConnectError::new(kind, subject, message, Some(raw))
}

/// Decides the kind of a failure by walking its cause chain.
pub fn classify_chain(err: &(dyn std::error::Error + 'static)) -> ConnectErrorKind {
    let chain: Vec<&(dyn std::error::Error + 'static)> =
        std::iter::successors(Some(err), |e| e.source()).collect();

    for link in &chain {
        if let Some(db) = link.downcast_ref::<DbError>() {
            if let Some(kind) = classify_sqlstate(db.code()) {
                return kind;
            }
        }
        if let Some(pg) = link.downcast_ref::<tokio_postgres::Error>() {
            if let Some(kind) = pg.code().and_then(classify_sqlstate) {
                return kind;
            }
        }
        if let Some(io_err) = link.downcast_ref::<io::Error>() {
            if let Some(kind) = classify_io(io_err) {
                return kind;
            }
        }
    }

    for link in &chain {
        if let Some(kind) = classify_message(&link.to_string()) {
            return kind;
        }
    }

    ConnectErrorKind::Other
}

fn classify_sqlstate(code: &SqlState) -> Option<ConnectErrorKind> {
    if *code == SqlState::INVALID_PASSWORD || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION {
        Some(ConnectErrorKind::AuthenticationFailed)
    } else if *code == SqlState::INVALID_CATALOG_NAME {
        Some(ConnectErrorKind::ConfigurationError)
    } else {
        None
    }
}

fn classify_io(err: &io::Error) -> Option<ConnectErrorKind> {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => return Some(ConnectErrorKind::ConnectionRefused),
        io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::TimedOut
        | io::ErrorKind::AddrNotAvailable => return Some(ConnectErrorKind::HostUnreachable),
        _ => {}
    }
    match err.raw_os_error() {
        Some(ECONNREFUSED) => Some(ConnectErrorKind::ConnectionRefused),
        Some(ENETUNREACH) | Some(EHOSTUNREACH) | Some(ETIMEDOUT) => {
            Some(ConnectErrorKind::HostUnreachable)
        }
        _ => None,
    }
}

fn classify_message(message: &str) -> Option<ConnectErrorKind> {
    let lower = message.to_lowercase();
    if AUTH_FRAGMENTS.iter().any(|f| lower.contains(f)) {
        Some(ConnectErrorKind::AuthenticationFailed)
    } else if lower.contains("connection refused") {
        Some(ConnectErrorKind::ConnectionRefused)
    } else if UNREACHABLE_FRAGMENTS.iter().any(|f| lower.contains(f)) {
        Some(ConnectErrorKind::HostUnreachable)
    } else if lower.contains("does not exist") && lower.contains("database") {
        Some(ConnectErrorKind::ConfigurationError)
    } else {
        None
    }
}
