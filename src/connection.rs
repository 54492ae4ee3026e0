//! Connection lifecycle against the source database.
//!
//! [`ConnectionManager::connect`] validates the configuration, reads the
//! resume position from the schema history, then calls the [`Connector`]
//! until it succeeds or fails in a way the [`RetryPolicy`] does not retry.
//! Only [`ConnectionRefused`](crate::ConnectErrorKind::ConnectionRefused) is retried, at a fixed
//! interval. Retry waits end early when the shutdown signal fires.
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_row_capture::config::{ConnectionConfig, RetryPolicy};
//! use pg_row_capture::connection::ConnectionManager;
//! use pg_row_capture::history::SchemaHistoryStore;
//! use pg_row_capture::postgres::PgConnector;
//! use std::sync::Arc;
//!
//! # async fn example(config: ConnectionConfig) -> pg_row_capture::Result<()> {
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! let history = Arc::new(SchemaHistoryStore::new(&config.schema_history_path));
//! let manager = ConnectionManager::new(PgConnector, history, shutdown);
//!
//! let established = manager.connect(&config, &RetryPolicy::default()).await?;
//! println!("Connected after {} attempt(s)", established.attempts);
//! # Ok(())
//! # }
//! ```

use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::classify::classify;
use crate::config::{ConnectionConfig, RetryPolicy};
use crate::error::BoxError;
use crate::history::{ResumePosition, SchemaHistoryStore};
use crate::{Error, Result};

/// Opens one connection attempt to a source database.
///
/// Implementations return the driver's error untouched; classification is
/// the manager's job.
pub trait Connector {
    type Connection: Send;

    fn connect<'a>(
        &'a self,
        config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, std::result::Result<Self::Connection, BoxError>>;
}

/// A live connection plus the state it should resume from.
#[derive(Debug)]
pub struct Established<C> {
    pub connection: C,
    pub resume: ResumePosition,
    pub attempts: u32,
}

pub struct ConnectionManager<C> {
    connector: C,
    history: Arc<SchemaHistoryStore>,
    shutdown: watch::Receiver<bool>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, history: Arc<SchemaHistoryStore>, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            connector,
            history,
            shutdown,
        }
    }

    pub fn history(&self) -> &Arc<SchemaHistoryStore> {
        &self.history
    }

    #[instrument(skip_all, fields(host = %config.host, port = config.port, table = %config.table))]
    pub async fn connect(
        &self,
        config: &ConnectionConfig,
        policy: &RetryPolicy,
    ) -> Result<Established<C::Connection>> {
        config.validate()?;

        let mut shutdown = self.shutdown.clone();
        let stopping = *shutdown.borrow();
        if stopping {
            return Err(Error::Shutdown);
        }

        let resume = self.history.load_resume_position().await?;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.connector.connect(config).await {
                Ok(connection) => {
                    info!(attempt, resume = ?resume, "Connected to source database");
                    return Ok(Established {
                        connection,
                        resume,
                        attempts: attempt,
                    });
                }
                Err(raw) => {
                    let err = classify(raw, config).with_attempts(attempt);
                    let kind = err.kind();

                    if !kind.is_transient() {
                        error!(%kind, attempt, "Connection failed: {}", err);
                        return Err(err.into());
                    }
                    if attempt > policy.max_retries {
                        error!(
                            %kind,
                            attempts = attempt,
                            root_cause = err.root_cause(),
                            "Connection retries exhausted"
                        );
                        return Err(err.into());
                    }

                    warn!(
                        attempt,
                        max_retries = policy.max_retries,
                        root_cause = err.root_cause(),
                        "Connection refused, retrying in {:?}",
                        policy.retry_interval()
                    );
                    wait_or_shutdown(policy.retry_interval(), &mut shutdown).await?;
                }
            }
        }
    }
}

/// Sleeps for `interval` unless shutdown is signalled first.
pub async fn wait_or_shutdown(interval: Duration, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
    tokio::select! {
        _ = tokio::time::sleep(interval) => Ok(()),
        _ = shutdown_requested(shutdown) => {
            info!("Shutdown requested, abandoning wait");
            Err(Error::Shutdown)
        }
    }
}

/// Resolves once shutdown is signalled. Never resolves if the sender is gone.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let sender_gone = shutdown.wait_for(|stop| *stop).await.is_err();
    if sender_gone {
        std::future::pending::<()>().await;
    }
}
