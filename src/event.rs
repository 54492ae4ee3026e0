use serde::{Deserialize, Serialize};

/// Kind of row change, with the single-letter codes downstream consumers expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "c")]
    Create,
    #[serde(rename = "u")]
    Update,
    #[serde(rename = "d")]
    Delete,
    /// Row read during the initial snapshot.
    #[serde(rename = "r")]
    Read,
    #[serde(rename = "t")]
    Truncate,
}

impl Operation {
    pub fn code(&self) -> &'static str {
        match self {
            Operation::Create => "c",
            Operation::Update => "u",
            Operation::Delete => "d",
            Operation::Read => "r",
            Operation::Truncate => "t",
        }
    }
}

/// Source timestamp at whatever resolution the database provided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTimestamp {
    Millis(i64),
    Micros(i64),
    Nanos(i64),
}

/// Where an event came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub version: String,
    pub connector: String,
    pub name: String,
    pub ts_ms: Option<i64>,
    pub snapshot: bool,
    pub db: String,
    /// Table identifier exactly as the source dialect spells it.
    pub table: String,
    pub lsn: Option<String>,
    pub tx_id: Option<u32>,
}

impl SourceMetadata {
    pub fn new(connector: &str, name: String, db: String, table: String) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            connector: connector.to_string(),
            name,
            ts_ms: None,
            snapshot: false,
            db,
            table,
            lsn: None,
            tx_id: None,
        }
    }

    pub fn with_lsn(mut self, lsn: String) -> Self {
        self.lsn = Some(lsn);
        self
    }

    pub fn with_xid(mut self, xid: u32) -> Self {
        self.tx_id = Some(xid);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub id: String,
    pub total_order: u64,
    pub data_collection_order: u64,
}

/// A row change as captured, before mapping into a [`StructuredRecord`](crate::mapper::StructuredRecord).
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub op: Operation,
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub source: SourceMetadata,
    pub transaction: Option<TransactionMetadata>,
    pub timestamp: Option<SourceTimestamp>,
}

impl ChangeEvent {
    /// The table identifier this event belongs to.
    pub fn table(&self) -> &str {
        &self.source.table
    }
}
