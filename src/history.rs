//! Schema history persistence for resumable capture.
//!
//! The history is an append-only file of JSON lines. Each line records a
//! replication [`Position`] together with what happened there: the initial
//! snapshot finished, a table's column layout was seen, or a plain
//! checkpoint. The last line's position is where a restarted capture resumes.
//!
//! # Example
//!
//! ```rust,no_run
//! use pg_row_capture::history::{Position, ResumePosition, SchemaHistoryRecord, SchemaHistoryStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SchemaHistoryStore::new("schema_history.dat");
//!
//!     if let ResumePosition::At(position) = store.load_resume_position().await? {
//!         println!("Resuming from LSN: {}", position);
//!     }
//!
//!     store.append(&SchemaHistoryRecord::checkpoint(Position::new(0x1_6B37_4D48))).await?;
//!     Ok(())
//! }
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// A position in the PostgreSQL write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Position(u64);

impl Position {
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    pub fn lsn(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Position {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (hi, lo) = s
            .split_once('/')
            .ok_or_else(|| Error::invalid_message(format!("Invalid LSN '{}'", s)))?;
        let hi = u32::from_str_radix(hi, 16)
            .map_err(|_| Error::invalid_message(format!("Invalid LSN '{}'", s)))?;
        let lo = u32::from_str_radix(lo, 16)
            .map_err(|_| Error::invalid_message(format!("Invalid LSN '{}'", s)))?;
        Ok(Self(((hi as u64) << 32) | lo as u64))
    }
}

impl Serialize for Position {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Column layout of a captured table, as seen in the replication stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub type_id: u32,
    pub is_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEntry {
    SnapshotCompleted { table: String, rows: u64 },
    TableSchema { table: String, columns: Vec<ColumnSchema> },
    Checkpoint,
}

/// One line of the schema history file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaHistoryRecord {
    pub position: Position,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(flatten)]
    pub entry: HistoryEntry,
}

impl SchemaHistoryRecord {
    pub fn new(position: Position, entry: HistoryEntry) -> Self {
        Self {
            position,
            timestamp: chrono::Utc::now(),
            entry,
        }
    }

    pub fn checkpoint(position: Position) -> Self {
        Self::new(position, HistoryEntry::Checkpoint)
    }
}

/// Outcome of reading the history at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePosition {
    /// Capture has run before and must continue from here.
    At(Position),
    /// No history file: this is the first run.
    NotFound,
}

impl ResumePosition {
    pub fn position(&self) -> Option<Position> {
        match self {
            ResumePosition::At(p) => Some(*p),
            ResumePosition::NotFound => None,
        }
    }
}

/// Append-only, single-writer store for [`SchemaHistoryRecord`]s.
///
/// Appends are serialized through an internal lock and synced to disk
/// before returning. Reads take no lock; they are meant for startup, before
/// any writer exists.
pub struct SchemaHistoryStore {
    file_path: PathBuf,
    writer: Mutex<Option<fs::File>>,
}

impl SchemaHistoryStore {
    pub fn new(history_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: history_path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Appends one record and syncs it to disk.
    pub async fn append(&self, record: &SchemaHistoryRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if writer.is_none() {
            if let Some(parent) = self.file_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).await?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)
                .await?;
            *writer = Some(file);
        }
        if let Some(file) = writer.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.sync_data().await?;
        }

        debug!(position = %record.position, "Appended schema history record");
        Ok(())
    }

    /// Reads every record, failing on the first line that does not parse.
    pub async fn load(&self) -> Result<Option<Vec<SchemaHistoryRecord>>> {
        if !fs::try_exists(&self.file_path).await? {
            debug!("No schema history found at {:?}", self.file_path);
            return Ok(None);
        }

        let content = fs::read_to_string(&self.file_path).await.map_err(|e| {
            error!("Failed to read schema history: {}", e);
            Error::history(format!("cannot read {:?}: {}", self.file_path, e))
        })?;

        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record = serde_json::from_str::<SchemaHistoryRecord>(line).map_err(|e| {
                error!("Corrupt schema history line {}: {}", index + 1, e);
                Error::history(format!(
                    "corrupt record at {:?} line {}: {}",
                    self.file_path,
                    index + 1,
                    e
                ))
            })?;
            records.push(record);
        }

        if records.is_empty() {
            return Err(Error::history(format!(
                "{:?} exists but holds no records",
                self.file_path
            )));
        }
        Ok(Some(records))
    }

    /// Where a restarted capture continues from.
    pub async fn load_resume_position(&self) -> Result<ResumePosition> {
        match self.load().await? {
            Some(records) => {
                let position = records
                    .iter()
                    .map(|r| r.position)
                    .max()
                    .ok_or_else(|| Error::history("no position recorded"))?;
                info!("Loaded resume position {} from {:?}", position, self.file_path);
                Ok(ResumePosition::At(position))
            }
            None => Ok(ResumePosition::NotFound),
        }
    }

    /// Latest known column layout per table.
    pub async fn load_table_schemas(&self) -> Result<HashMap<String, Vec<ColumnSchema>>> {
        let mut schemas = HashMap::new();
        for record in self.load().await?.unwrap_or_default() {
            if let HistoryEntry::TableSchema { table, columns } = record.entry {
                schemas.insert(table, columns);
            }
        }
        Ok(schemas)
    }
}
