//! Decoder for the `pgoutput` logical replication protocol, version 1.
//!
//! Each call to [`PgOutputDecoder::decode`] takes one message body as
//! returned by `pg_logical_slot_peek_binary_changes`, i.e. without the
//! streaming-replication `w` header. Relation messages are remembered so
//! later row messages can be resolved to column names and types.

use base64::Engine;
use bytes::Buf;
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, trace};

use crate::event::{ChangeEvent, Operation, SourceMetadata, SourceTimestamp, TransactionMetadata};
use crate::history::{ColumnSchema, Position};
use crate::{Error, Result};

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
const PG_EPOCH_OFFSET_US: i64 = 946_684_800_000_000;

pub const CONNECTOR_NAME: &str = "postgresql";

#[derive(Debug, Clone, PartialEq)]
pub struct RelationInfo {
    pub id: u32,
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnSchema>,
}

impl RelationInfo {
    /// `schema.table`, the identifier PostgreSQL events carry.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Begin { xid: u32, final_lsn: Position },
    Commit { end_lsn: Position },
    Relation(RelationInfo),
    Change(ChangeEvent),
    /// One event per truncated relation.
    Truncate(Vec<ChangeEvent>),
}

#[derive(Debug, Default)]
struct Transaction {
    xid: u32,
    final_lsn: u64,
    commit_ts_us: i64,
    total_order: u64,
    per_table: HashMap<String, u64>,
}

pub struct PgOutputDecoder {
    relations: HashMap<u32, RelationInfo>,
    transaction: Option<Transaction>,
    database_name: String,
    server_name: String,
}

impl PgOutputDecoder {
    pub fn new(database_name: String, server_name: String) -> Self {
        Self {
            relations: HashMap::new(),
            transaction: None,
            database_name,
            server_name,
        }
    }

    pub fn relation(&self, id: u32) -> Option<&RelationInfo> {
        self.relations.get(&id)
    }

    /// Decodes one message read at `lsn`.
    ///
    /// Returns `Ok(None)` for message types that carry nothing to capture
    /// (origin, type, logical messages).
    pub fn decode(&mut self, lsn: Position, data: &[u8]) -> Result<Option<DecodedMessage>> {
        let mut cursor = data;
        if cursor.is_empty() {
            return Ok(None);
        }

        match cursor.get_u8() {
            b'B' => self.decode_begin(&mut cursor).map(Some),
            b'C' => self.decode_commit(&mut cursor).map(Some),
            b'R' => self.decode_relation(&mut cursor).map(Some),
            b'I' => self.decode_insert(lsn, &mut cursor).map(Some),
            b'U' => self.decode_update(lsn, &mut cursor).map(Some),
            b'D' => self.decode_delete(lsn, &mut cursor).map(Some),
            b'T' => self.decode_truncate(lsn, &mut cursor).map(Some),
            other => {
                debug!("Ignoring pgoutput message type: {}", other as char);
                Ok(None)
            }
        }
    }

    fn decode_begin(&mut self, cursor: &mut &[u8]) -> Result<DecodedMessage> {
        ensure(cursor, 20, "BEGIN")?;
        let final_lsn = cursor.get_u64();
        let commit_ts = cursor.get_i64();
        let xid = cursor.get_u32();

        trace!(xid, lsn = %Position::new(final_lsn), "BEGIN");
        self.transaction = Some(Transaction {
            xid,
            final_lsn,
            commit_ts_us: commit_ts.saturating_add(PG_EPOCH_OFFSET_US),
            ..Default::default()
        });

        Ok(DecodedMessage::Begin {
            xid,
            final_lsn: Position::new(final_lsn),
        })
    }

    fn decode_commit(&mut self, cursor: &mut &[u8]) -> Result<DecodedMessage> {
        ensure(cursor, 25, "COMMIT")?;
        let _flags = cursor.get_u8();
        let _commit_lsn = cursor.get_u64();
        let end_lsn = cursor.get_u64();
        let _commit_ts = cursor.get_i64();

        trace!(lsn = %Position::new(end_lsn), "COMMIT");
        self.transaction = None;

        Ok(DecodedMessage::Commit {
            end_lsn: Position::new(end_lsn),
        })
    }

    fn decode_relation(&mut self, cursor: &mut &[u8]) -> Result<DecodedMessage> {
        ensure(cursor, 4, "RELATION")?;
        let id = cursor.get_u32();
        let schema = read_cstr(cursor, "RELATION namespace")?;
        let table = read_cstr(cursor, "RELATION name")?;

        ensure(cursor, 3, "RELATION")?;
        let _replica_identity = cursor.get_u8();
        let ncols = cursor.get_u16();

        let mut columns = Vec::with_capacity(ncols as usize);
        for _ in 0..ncols {
            ensure(cursor, 1, "RELATION column")?;
            let flags = cursor.get_u8();
            let name = read_cstr(cursor, "RELATION column name")?;
            ensure(cursor, 8, "RELATION column")?;
            let type_id = cursor.get_u32();
            let _type_modifier = cursor.get_i32();

            columns.push(ColumnSchema {
                name,
                type_id,
                is_key: flags & 1 != 0,
            });
        }

        let relation = RelationInfo {
            id,
            schema,
            table,
            columns,
        };
        debug!(id, table = %relation.qualified_name(), "RELATION");
        self.relations.insert(id, relation.clone());

        Ok(DecodedMessage::Relation(relation))
    }

    fn decode_insert(&mut self, lsn: Position, cursor: &mut &[u8]) -> Result<DecodedMessage> {
        ensure(cursor, 5, "INSERT")?;
        let rel_id = cursor.get_u32();
        let tag = cursor.get_u8();
        if tag != b'N' {
            return Err(Error::invalid_message(format!(
                "Unexpected tuple type in INSERT: {}",
                tag as char
            )));
        }

        let relation = self.lookup(rel_id)?;
        let after = decode_tuple(cursor, &relation.columns)?;
        Ok(DecodedMessage::Change(self.event(
            Operation::Create,
            &relation,
            lsn,
            None,
            Some(after),
        )))
    }

    fn decode_update(&mut self, lsn: Position, cursor: &mut &[u8]) -> Result<DecodedMessage> {
        ensure(cursor, 5, "UPDATE")?;
        let rel_id = cursor.get_u32();
        let relation = self.lookup(rel_id)?;

        let mut before = None;
        let mut tag = cursor.get_u8();
        if tag == b'K' || tag == b'O' {
            before = Some(decode_tuple(cursor, &relation.columns)?);
            ensure(cursor, 1, "UPDATE")?;
            tag = cursor.get_u8();
        }
        if tag != b'N' {
            return Err(Error::invalid_message(format!(
                "Unexpected tuple type in UPDATE: {}",
                tag as char
            )));
        }
        let after = decode_tuple(cursor, &relation.columns)?;

        Ok(DecodedMessage::Change(self.event(
            Operation::Update,
            &relation,
            lsn,
            before,
            Some(after),
        )))
    }

    fn decode_delete(&mut self, lsn: Position, cursor: &mut &[u8]) -> Result<DecodedMessage> {
        ensure(cursor, 5, "DELETE")?;
        let rel_id = cursor.get_u32();
        let tag = cursor.get_u8();
        if tag != b'K' && tag != b'O' {
            return Err(Error::invalid_message(format!(
                "Unexpected tuple type in DELETE: {}",
                tag as char
            )));
        }

        let relation = self.lookup(rel_id)?;
        let before = decode_tuple(cursor, &relation.columns)?;
        Ok(DecodedMessage::Change(self.event(
            Operation::Delete,
            &relation,
            lsn,
            Some(before),
            None,
        )))
    }

    fn decode_truncate(&mut self, lsn: Position, cursor: &mut &[u8]) -> Result<DecodedMessage> {
        ensure(cursor, 5, "TRUNCATE")?;
        let count = cursor.get_u32() as usize;
        let _options = cursor.get_u8();
        ensure(cursor, count.saturating_mul(4), "TRUNCATE relation ids")?;

        let mut events = Vec::with_capacity(count);
        for _ in 0..count {
            let relation = self.lookup(cursor.get_u32())?;
            events.push(self.event(Operation::Truncate, &relation, lsn, None, None));
        }
        Ok(DecodedMessage::Truncate(events))
    }

    fn lookup(&self, rel_id: u32) -> Result<RelationInfo> {
        self.relations
            .get(&rel_id)
            .cloned()
            .ok_or_else(|| Error::invalid_message(format!("Unknown relation ID: {}", rel_id)))
    }

    fn event(
        &mut self,
        op: Operation,
        relation: &RelationInfo,
        lsn: Position,
        before: Option<Value>,
        after: Option<Value>,
    ) -> ChangeEvent {
        let table = relation.qualified_name();
        let mut source = SourceMetadata::new(
            CONNECTOR_NAME,
            self.server_name.clone(),
            self.database_name.clone(),
            table.clone(),
        )
        .with_lsn(lsn.to_string());

        let (transaction, timestamp) = match self.transaction.as_mut() {
            Some(tx) => {
                tx.total_order += 1;
                let per_table = tx.per_table.entry(table).or_insert(0);
                *per_table += 1;
                source = source.with_xid(tx.xid);
                (
                    Some(TransactionMetadata {
                        id: format!("{}:{}", tx.xid, tx.final_lsn),
                        total_order: tx.total_order,
                        data_collection_order: *per_table,
                    }),
                    Some(SourceTimestamp::Micros(tx.commit_ts_us)),
                )
            }
            None => (None, None),
        };

        ChangeEvent {
            op,
            before,
            after,
            source,
            transaction,
            timestamp,
        }
    }
}

fn ensure(cursor: &&[u8], needed: usize, what: &str) -> Result<()> {
    if cursor.remaining() < needed {
        return Err(Error::invalid_message(format!(
            "Truncated {} message: need {} bytes, have {}",
            what,
            needed,
            cursor.remaining()
        )));
    }
    Ok(())
}

fn read_cstr(cursor: &mut &[u8], what: &str) -> Result<String> {
    let end = cursor
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::invalid_message(format!("Unterminated string in {}", what)))?;
    let value = String::from_utf8_lossy(&cursor[..end]).into_owned();
    cursor.advance(end + 1);
    Ok(value)
}

/// Reads a TupleData block into a JSON object keyed by column name.
///
/// Unchanged TOAST values are left out of the image: their content is not in
/// the WAL record.
fn decode_tuple(cursor: &mut &[u8], columns: &[ColumnSchema]) -> Result<Value> {
    ensure(cursor, 2, "tuple")?;
    let ncols = cursor.get_u16() as usize;
    if ncols != columns.len() {
        return Err(Error::invalid_message(format!(
            "Column count mismatch: {} vs {}",
            ncols,
            columns.len()
        )));
    }

    let mut tuple = serde_json::Map::with_capacity(ncols);
    for column in columns {
        ensure(cursor, 1, "tuple column")?;
        match cursor.get_u8() {
            b'n' => {
                tuple.insert(column.name.clone(), Value::Null);
            }
            b'u' => {
                trace!(column = %column.name, "Unchanged TOAST value");
            }
            kind @ (b't' | b'b') => {
                ensure(cursor, 4, "tuple value")?;
                let len = cursor.get_i32();
                let len = usize::try_from(len).map_err(|_| {
                    Error::invalid_message(format!("Negative value length {}", len))
                })?;
                ensure(cursor, len, "tuple value")?;
                let raw = &cursor[..len];
                let value = if kind == b't' {
                    parse_postgres_value(&String::from_utf8_lossy(raw), column.type_id)
                } else {
                    Value::String(base64::engine::general_purpose::STANDARD.encode(raw))
                };
                cursor.advance(len);
                tuple.insert(column.name.clone(), value);
            }
            other => {
                return Err(Error::invalid_message(format!(
                    "Unknown column kind: {}",
                    other as char
                )));
            }
        }
    }

    Ok(Value::Object(tuple))
}

/// Converts a text-format column value to JSON by type OID.
///
/// Numeric, temporal and other types whose JSON rendering would lose
/// precision stay strings.
pub fn parse_postgres_value(text: &str, type_id: u32) -> Value {
    match type_id {
        16 => match text {
            "t" => Value::Bool(true),
            "f" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        20 | 21 | 23 | 26 => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        700 | 701 => match text.parse::<f64>() {
            Ok(f) if f.is_finite() => Value::from(f),
            _ => Value::String(text.to_string()),
        },
        114 | 3802 => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        _ => Value::String(text.to_string()),
    }
}

#[cfg(test)]
#[path = "decoder_tests.rs"]
mod tests;
