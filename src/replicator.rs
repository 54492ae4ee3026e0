//! The capture run loop.
//!
//! Connects through [`ConnectionManager`], snapshots the table on a first
//! run, then polls the replication slot: each committed batch is mapped,
//! handed to the sink, flushed, and only then acknowledged on the slot.
//! Delivery is therefore at-least-once across restarts.

use futures::TryStreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::connection::{shutdown_requested, ConnectionManager};
use crate::history::{ColumnSchema, HistoryEntry, Position, SchemaHistoryRecord, SchemaHistoryStore};
use crate::mapper::ChangeEventMapper;
use crate::postgres::{PgConnector, PgSource, QualifiedTable, RelationInfo, StartMode};
use crate::sink::RecordSink;
use crate::{Config, Result};

/// What one [`Replicator::run`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub snapshot_rows: u64,
    pub streamed: u64,
    /// Last position acknowledged on the slot.
    pub position: Option<Position>,
}

pub struct Replicator {
    config: Config,
    shutdown: watch::Receiver<bool>,
    history: Arc<SchemaHistoryStore>,
}

impl Replicator {
    pub fn new(config: Config, shutdown: watch::Receiver<bool>) -> Self {
        let history = Arc::new(SchemaHistoryStore::new(&config.source.schema_history_path));
        Self {
            config,
            shutdown,
            history,
        }
    }

    pub fn history(&self) -> &Arc<SchemaHistoryStore> {
        &self.history
    }

    /// Runs until shutdown, or until the snapshot (or backlog) is done when
    /// `retry.unbounded` is false.
    #[instrument(skip_all, fields(table = %self.config.source.table))]
    pub async fn run<S: RecordSink>(&self, sink: &mut S) -> Result<RunSummary> {
        let source_config = &self.config.source;
        source_config.validate()?;
        QualifiedTable::parse(&source_config.table)?;

        let manager = ConnectionManager::new(PgConnector, self.history.clone(), self.shutdown.clone());
        let established = manager.connect(source_config, &self.config.retry).await?;
        let (mut source, start) = PgSource::open(
            established.connection,
            source_config,
            &self.config.capture,
            established.resume,
        )
        .await?;

        let mapper = ChangeEventMapper::new(source_config.table.clone());
        let mut summary = RunSummary::default();

        let from = match start {
            StartMode::Snapshot { at } => {
                summary.snapshot_rows = self.snapshot(&source, &mapper, sink, at).await?;
                summary.position = Some(at);
                if !self.config.retry.unbounded {
                    info!(rows = summary.snapshot_rows, "Snapshot complete, bounded run stopping");
                    return Ok(summary);
                }
                at
            }
            StartMode::Resume { from } => {
                info!(position = %from, "Resuming capture");
                summary.position = Some(from);
                from
            }
        };

        self.stream(&mut source, &mapper, sink, from, &mut summary).await?;
        info!(
            streamed = summary.streamed,
            position = ?summary.position.map(|p| p.to_string()),
            "Capture stopped"
        );
        Ok(summary)
    }

    async fn snapshot<S: RecordSink>(
        &self,
        source: &PgSource,
        mapper: &ChangeEventMapper,
        sink: &mut S,
        at: Position,
    ) -> Result<u64> {
        let mut rows = 0;
        let events = source.snapshot(at).await?;
        futures::pin_mut!(events);
        while let Some(event) = events.try_next().await? {
            if let Some(record) = mapper.map(event) {
                sink.send(&record).await?;
                rows += 1;
            }
        }
        sink.flush().await?;
        info!(table = %mapper.table(), rows, "Snapshot sent");

        self.history
            .append(&SchemaHistoryRecord::new(
                at,
                HistoryEntry::SnapshotCompleted {
                    table: mapper.table().to_string(),
                    rows,
                },
            ))
            .await?;
        Ok(rows)
    }

    async fn stream<S: RecordSink>(
        &self,
        source: &mut PgSource,
        mapper: &ChangeEventMapper,
        sink: &mut S,
        from: Position,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let bounded = !self.config.retry.unbounded;
        let checkpoint_interval = self.config.capture.checkpoint_interval();
        let mut schemas = self.history.load_table_schemas().await?;
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.config.capture.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut position = from;
        let mut last_checkpoint = Instant::now();
        let mut unrecorded = None;

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Shutdown requested, stopping capture");
                    break;
                }
                _ = ticker.tick() => {}
            }

            let batch = source.poll().await?;
            for relation in batch.relations {
                self.record_schema(relation, mapper, position, &mut schemas).await?;
            }
            for event in batch.events {
                if let Some(record) = mapper.map(event) {
                    sink.send(&record).await?;
                    summary.streamed += 1;
                }
            }

            match batch.end {
                Some(end) => {
                    sink.flush().await?;
                    source.acknowledge(end).await?;
                    position = end;
                    summary.position = Some(end);
                    unrecorded = Some(end);

                    if last_checkpoint.elapsed() >= checkpoint_interval {
                        self.history.append(&SchemaHistoryRecord::checkpoint(end)).await?;
                        last_checkpoint = Instant::now();
                        unrecorded = None;
                    }
                }
                None if bounded => {
                    info!("Backlog drained, bounded run stopping");
                    break;
                }
                None => {}
            }
        }

        if let Some(position) = unrecorded {
            self.history.append(&SchemaHistoryRecord::checkpoint(position)).await?;
        }
        Ok(())
    }

    /// Appends the table's column layout when it differs from the last one recorded.
    async fn record_schema(
        &self,
        relation: RelationInfo,
        mapper: &ChangeEventMapper,
        position: Position,
        schemas: &mut HashMap<String, Vec<ColumnSchema>>,
    ) -> Result<()> {
        let table = relation.qualified_name();
        if table != mapper.table() || schemas.get(&table) == Some(&relation.columns) {
            return Ok(());
        }

        debug!(%table, columns = relation.columns.len(), "Recording table schema");
        self.history
            .append(&SchemaHistoryRecord::new(
                position,
                HistoryEntry::TableSchema {
                    table: table.clone(),
                    columns: relation.columns.clone(),
                },
            ))
            .await?;
        schemas.insert(table, relation.columns);
        Ok(())
    }
}
