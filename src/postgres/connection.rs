//! PostgreSQL transport over the SQL logical-slot interface.
//!
//! Changes are read with `pg_logical_slot_peek_binary_changes` and
//! acknowledged with `pg_replication_slot_advance`, so a plain client
//! connection is enough; no replication-protocol connection is opened.
//! A batch that is peeked but never acknowledged is read again on the next
//! poll.

use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use postgres_protocol::escape::escape_identifier;
use serde_json::Value;
use std::fmt;
use tokio::task::JoinHandle;
use tokio_postgres::{Client, NoTls};
use tracing::{debug, error, info, instrument, warn};

use super::decoder::{DecodedMessage, PgOutputDecoder, RelationInfo, CONNECTOR_NAME};
use crate::config::{CaptureConfig, ConnectionConfig};
use crate::connection::Connector;
use crate::error::{BoxError, ConnectError};
use crate::event::{ChangeEvent, Operation, SourceMetadata, SourceTimestamp};
use crate::history::{Position, ResumePosition};
use crate::{Error, Result};

/// Opens plain `tokio-postgres` connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgConnector;

/// A client plus the task driving its socket.
pub struct PgConnection {
    client: Client,
    task: JoinHandle<()>,
}

impl PgConnection {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("closed", &self.client.is_closed())
            .finish_non_exhaustive()
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Connector for PgConnector {
    type Connection = PgConnection;

    fn connect<'a>(
        &'a self,
        config: &'a ConnectionConfig,
    ) -> BoxFuture<'a, std::result::Result<PgConnection, BoxError>> {
        Box::pin(async move {
            let mut pg = tokio_postgres::Config::new();
            pg.host(&config.host)
                .port(config.port)
                .user(&config.username)
                .password(&config.password)
                .dbname(&config.database)
                .application_name(env!("CARGO_PKG_NAME"))
                .connect_timeout(config.connect_timeout());

            let (client, connection) = pg.connect(NoTls).await?;
            let task = tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("PostgreSQL connection error: {}", e);
                }
            });

            Ok(PgConnection { client, task })
        })
    }
}

/// A `schema.table` identifier split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedTable {
    pub schema: String,
    pub name: String,
}

impl QualifiedTable {
    /// Splits on the first `.`. Both parts are required.
    pub fn parse(identifier: &str) -> std::result::Result<Self, ConnectError> {
        match identifier.split_once('.') {
            Some((schema, name)) if !schema.is_empty() && !name.is_empty() => Ok(Self {
                schema: schema.to_string(),
                name: name.to_string(),
            }),
            _ => Err(ConnectError::configuration(format!(
                "PostgreSQL table identifier '{}' must be schema-qualified (schema.table)",
                identifier
            ))),
        }
    }

    /// The identifier quoted for use in SQL text.
    pub fn quoted(&self) -> String {
        format!("{}.{}", escape_identifier(&self.schema), escape_identifier(&self.name))
    }
}

impl fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// How capture starts on a freshly opened source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
    /// The slot was just created at `at`; the table must be snapshotted.
    Snapshot { at: Position },
    /// Continue streaming after `from`.
    Resume { from: Position },
}

/// Committed changes read by one [`PgSource::poll`].
#[derive(Debug, Default)]
pub struct Batch {
    pub events: Vec<ChangeEvent>,
    pub relations: Vec<RelationInfo>,
    /// End of the last complete transaction, to acknowledge once delivered.
    pub end: Option<Position>,
}

pub struct PgSource {
    connection: PgConnection,
    table: QualifiedTable,
    identifier: String,
    database: String,
    server_name: String,
    slot_name: String,
    publication: String,
    max_batch_changes: i32,
    decoder: PgOutputDecoder,
}

impl PgSource {
    /// Ensures the publication and slot exist and checks them against the
    /// resume position read from the schema history.
    #[instrument(skip_all, fields(table = %config.table))]
    pub async fn open(
        connection: PgConnection,
        config: &ConnectionConfig,
        capture: &CaptureConfig,
        resume: ResumePosition,
    ) -> Result<(Self, StartMode)> {
        let table = QualifiedTable::parse(&config.table)?;
        let source = Self {
            connection,
            table,
            identifier: config.table.clone(),
            database: config.database.clone(),
            server_name: config.server_name(),
            slot_name: config.slot_name(),
            publication: config.publication_name(),
            max_batch_changes: capture.max_batch_changes,
            decoder: PgOutputDecoder::new(config.database.clone(), config.server_name()),
        };

        source.ensure_publication().await?;
        let start = source.prepare_slot(resume).await?;
        info!(slot = %source.slot_name, publication = %source.publication, ?start, "Source ready");

        Ok((source, start))
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn table(&self) -> &QualifiedTable {
        &self.table
    }

    /// Creates the publication, or adds the table to an existing one that
    /// does not list it. Runs before the slot is created, so the slot never
    /// decodes a publication without the table.
    async fn ensure_publication(&self) -> Result<()> {
        let client = &self.connection.client;
        let exists = client
            .query_opt(
                "SELECT 1 FROM pg_publication WHERE pubname = $1",
                &[&self.publication],
            )
            .await?
            .is_some();

        if !exists {
            let sql = format!(
                "CREATE PUBLICATION {} FOR TABLE {}",
                escape_identifier(&self.publication),
                self.table.quoted()
            );
            client.batch_execute(&sql).await?;
            info!(publication = %self.publication, table = %self.table, "Created publication");
            return Ok(());
        }

        if self.publication_covers_table().await? {
            debug!(publication = %self.publication, "Publication exists and covers the table");
            return Ok(());
        }

        warn!(
            publication = %self.publication,
            table = %self.table,
            "Publication does not cover the table, adding it"
        );
        let sql = format!(
            "ALTER PUBLICATION {} ADD TABLE {}",
            escape_identifier(&self.publication),
            self.table.quoted()
        );
        client.batch_execute(&sql).await?;
        Ok(())
    }

    async fn publication_covers_table(&self) -> Result<bool> {
        let row = self
            .connection
            .client
            .query_opt(
                "SELECT 1 FROM pg_publication_tables \
                 WHERE pubname = $1 AND schemaname = $2 AND tablename = $3",
                &[&self.publication, &self.table.schema, &self.table.name],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn prepare_slot(&self, resume: ResumePosition) -> Result<StartMode> {
        let row = self
            .connection
            .client
            .query_opt(
                "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.slot_name],
            )
            .await?;
        let slot = match row {
            Some(row) => {
                let flushed: Option<String> = row.try_get(0)?;
                Some(flushed.map(|s| s.parse::<Position>()).transpose()?)
            }
            None => None,
        };

        match (slot, resume) {
            (None, ResumePosition::NotFound) => {
                let at = self.create_slot().await?;
                Ok(StartMode::Snapshot { at })
            }
            (Some(_), ResumePosition::NotFound) => Err(Error::history(format!(
                "replication slot '{}' exists but no schema history was found; \
                 restore the history file or drop the slot to start over",
                self.slot_name
            ))),
            (None, ResumePosition::At(position)) => Err(Error::history(format!(
                "schema history resumes at {} but replication slot '{}' does not exist",
                position, self.slot_name
            ))),
            (Some(flushed), ResumePosition::At(position)) => {
                if flushed.map_or(true, |f| f < position) {
                    warn!(
                        slot = %self.slot_name,
                        confirmed = ?flushed.map(|f| f.to_string()),
                        %position,
                        "Slot is behind the schema history, advancing"
                    );
                    self.acknowledge(position).await?;
                }
                Ok(StartMode::Resume { from: position })
            }
        }
    }

    async fn create_slot(&self) -> Result<Position> {
        let row = self
            .connection
            .client
            .query_one(
                "SELECT lsn::text FROM pg_create_logical_replication_slot($1, 'pgoutput')",
                &[&self.slot_name],
            )
            .await?;
        let lsn: String = row.try_get(0)?;
        let at = lsn.parse()?;
        info!(slot = %self.slot_name, lsn = %at, "Created replication slot");
        Ok(at)
    }

    /// Streams every current row of the table as a snapshot `Read` event.
    ///
    /// Rows are decoded as they arrive instead of being collected first.
    pub async fn snapshot(
        &self,
        at: Position,
    ) -> Result<impl Stream<Item = Result<ChangeEvent>> + '_> {
        let sql = format!("SELECT row_to_json(t)::text FROM {} t", self.table.quoted());
        let rows = self
            .connection
            .client
            .query_raw(sql.as_str(), std::iter::empty::<&str>())
            .await?;
        let ts_us = chrono::Utc::now().timestamp_micros();
        debug!(table = %self.table, lsn = %at, "Snapshot query started");

        Ok(rows.map(move |row| {
            let text: String = row?.try_get(0)?;
            self.snapshot_event(serde_json::from_str(&text)?, at, ts_us)
        }))
    }

    fn snapshot_event(&self, after: Value, at: Position, ts_us: i64) -> Result<ChangeEvent> {
        let mut source = SourceMetadata::new(
            CONNECTOR_NAME,
            self.server_name.clone(),
            self.database.clone(),
            self.identifier.clone(),
        )
        .with_lsn(at.to_string());
        source.snapshot = true;

        Ok(ChangeEvent {
            op: Operation::Read,
            before: None,
            after: Some(after),
            source,
            transaction: None,
            timestamp: Some(SourceTimestamp::Micros(ts_us)),
        })
    }

    /// Peeks the next committed transactions without consuming them.
    ///
    /// Events of a transaction whose commit is not in this batch are left
    /// for the next poll.
    pub async fn poll(&mut self) -> Result<Batch> {
        let rows = self
            .connection
            .client
            .query(
                "SELECT lsn::text, data FROM pg_logical_slot_peek_binary_changes(\
                 $1, NULL, $2, 'proto_version', '1', 'publication_names', $3)",
                &[&self.slot_name, &self.max_batch_changes, &self.publication],
            )
            .await?;

        let mut batch = Batch::default();
        let mut pending = Vec::new();
        for row in rows {
            let lsn: String = row.try_get(0)?;
            let data: Vec<u8> = row.try_get(1)?;
            let lsn: Position = lsn.parse()?;

            match self.decoder.decode(lsn, &data)? {
                Some(DecodedMessage::Relation(relation)) => batch.relations.push(relation),
                Some(DecodedMessage::Change(event)) => pending.push(event),
                Some(DecodedMessage::Truncate(events)) => pending.extend(events),
                Some(DecodedMessage::Commit { end_lsn }) => {
                    batch.events.append(&mut pending);
                    batch.end = Some(end_lsn);
                }
                Some(DecodedMessage::Begin { .. }) | None => {}
            }
        }

        if !pending.is_empty() {
            debug!(count = pending.len(), "Deferring changes of an incomplete transaction");
        }
        Ok(batch)
    }

    /// Moves the slot past `position`, releasing the WAL before it.
    pub async fn acknowledge(&self, position: Position) -> Result<()> {
        self.connection
            .client
            .execute(
                "SELECT pg_replication_slot_advance($1, $2::text::pg_lsn)",
                &[&self.slot_name, &position.to_string()],
            )
            .await?;
        debug!(slot = %self.slot_name, %position, "Advanced replication slot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_table_parse() {
        let table = QualifiedTable::parse("inventory.customers").unwrap();
        assert_eq!(table.schema, "inventory");
        assert_eq!(table.name, "customers");
        assert_eq!(table.to_string(), "inventory.customers");
    }

    #[test]
    fn test_unqualified_table_is_a_configuration_error() {
        let err = QualifiedTable::parse("customers").unwrap_err();
        assert_eq!(err.kind(), crate::ConnectErrorKind::ConfigurationError);
        assert!(err.to_string().contains("schema-qualified"));
        assert!(QualifiedTable::parse(".customers").is_err());
    }

    #[test]
    fn test_quoted_identifier() {
        let table = QualifiedTable::parse("Sales.order\"items").unwrap();
        assert_eq!(table.quoted(), "\"Sales\".\"order\"\"items\"");
    }
}
