//! Row-level change capture for a single PostgreSQL table.
//!
//! A [`Replicator`] connects through a retrying
//! [`ConnectionManager`](connection::ConnectionManager), snapshots the table,
//! streams its changes from a logical replication slot, and emits each one as
//! a fixed-shape [`StructuredRecord`](mapper::StructuredRecord) to a
//! [`RecordSink`](sink::RecordSink).

pub mod classify;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod history;
pub mod mapper;
pub mod postgres;
pub mod replicator;
pub mod serializer;
pub mod sink;

pub use config::Config;
pub use error::{ConnectError, ConnectErrorKind, Error, Result};
pub use replicator::{Replicator, RunSummary};
