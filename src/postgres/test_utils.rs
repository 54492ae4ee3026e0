//! Builders for `pgoutput` message bodies, as the slot functions return them.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;

/// 2023-10-15 10:30:00 UTC, in microseconds since 2000-01-01.
pub const PG_TIMESTAMP: i64 = 750_681_000_000_000;
/// The same instant in Unix microseconds.
pub const UNIX_TIMESTAMP_US: i64 = 1_697_365_800_000_000;

pub struct MockMessageBuilder {
    lsn: u64,
    timestamp: i64,
    relations: HashMap<u32, MockRelation>,
}

#[derive(Debug, Clone)]
pub struct MockRelation {
    pub schema: String,
    pub table: String,
    pub columns: Vec<(String, u32, bool)>,
}

/// A column value in a TupleData block.
#[derive(Debug, Clone)]
pub enum TupleValue {
    Null,
    UnchangedToast,
    Text(String),
    Binary(Vec<u8>),
}

impl From<Option<&str>> for TupleValue {
    fn from(value: Option<&str>) -> Self {
        match value {
            Some(v) => TupleValue::Text(v.to_string()),
            None => TupleValue::Null,
        }
    }
}

impl MockMessageBuilder {
    pub fn new() -> Self {
        Self {
            lsn: 0x16B_3748,
            timestamp: PG_TIMESTAMP,
            relations: HashMap::new(),
        }
    }

    pub fn with_lsn(mut self, lsn: u64) -> Self {
        self.lsn = lsn;
        self
    }

    pub fn lsn(&self) -> u64 {
        self.lsn
    }

    pub fn add_relation(mut self, id: u32, schema: &str, table: &str, columns: Vec<(&str, u32, bool)>) -> Self {
        self.relations.insert(
            id,
            MockRelation {
                schema: schema.to_string(),
                table: table.to_string(),
                columns: columns
                    .into_iter()
                    .map(|(name, type_id, is_key)| (name.to_string(), type_id, is_key))
                    .collect(),
            },
        );
        self
    }

    pub fn begin_message(&self, xid: u32) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_u64(self.lsn + 100);
        buf.put_i64(self.timestamp);
        buf.put_u32(xid);
        buf.freeze()
    }

    pub fn commit_message(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'C');
        buf.put_u8(0);
        buf.put_u64(self.lsn + 100);
        buf.put_u64(self.lsn + 200);
        buf.put_i64(self.timestamp);
        buf.freeze()
    }

    pub fn relation_message(&self, rel_id: u32) -> Bytes {
        let relation = self
            .relations
            .get(&rel_id)
            .expect("Relation not found. Use add_relation() first.");

        let mut buf = BytesMut::new();
        buf.put_u8(b'R');
        buf.put_u32(rel_id);
        put_cstr(&mut buf, &relation.schema);
        put_cstr(&mut buf, &relation.table);
        buf.put_u8(b'd');
        buf.put_u16(relation.columns.len() as u16);
        for (name, type_id, is_key) in &relation.columns {
            buf.put_u8(u8::from(*is_key));
            put_cstr(&mut buf, name);
            buf.put_u32(*type_id);
            buf.put_i32(-1);
        }
        buf.freeze()
    }

    pub fn insert_message(&self, rel_id: u32, values: Vec<Option<&str>>) -> Bytes {
        self.insert_values(rel_id, values.into_iter().map(TupleValue::from).collect())
    }

    pub fn insert_values(&self, rel_id: u32, values: Vec<TupleValue>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'I');
        buf.put_u32(rel_id);
        buf.put_u8(b'N');
        put_tuple(&mut buf, values);
        buf.freeze()
    }

    /// `old` is sent as a full old tuple (`O`), as with REPLICA IDENTITY FULL.
    pub fn update_message(&self, rel_id: u32, old: Option<Vec<Option<&str>>>, new: Vec<Option<&str>>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'U');
        buf.put_u32(rel_id);
        if let Some(old) = old {
            buf.put_u8(b'O');
            put_tuple(&mut buf, old.into_iter().map(TupleValue::from).collect());
        }
        buf.put_u8(b'N');
        put_tuple(&mut buf, new.into_iter().map(TupleValue::from).collect());
        buf.freeze()
    }

    pub fn delete_message(&self, rel_id: u32, key: Vec<Option<&str>>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'D');
        buf.put_u32(rel_id);
        buf.put_u8(b'K');
        put_tuple(&mut buf, key.into_iter().map(TupleValue::from).collect());
        buf.freeze()
    }

    pub fn truncate_message(&self, rel_ids: Vec<u32>) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(b'T');
        buf.put_u32(rel_ids.len() as u32);
        buf.put_u8(0);
        for rel_id in rel_ids {
            buf.put_u32(rel_id);
        }
        buf.freeze()
    }
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put(s.as_bytes());
    buf.put_u8(0);
}

fn put_tuple(buf: &mut BytesMut, values: Vec<TupleValue>) {
    buf.put_u16(values.len() as u16);
    for value in values {
        match value {
            TupleValue::Null => buf.put_u8(b'n'),
            TupleValue::UnchangedToast => buf.put_u8(b'u'),
            TupleValue::Text(text) => {
                buf.put_u8(b't');
                buf.put_i32(text.len() as i32);
                buf.put(text.as_bytes());
            }
            TupleValue::Binary(data) => {
                buf.put_u8(b'b');
                buf.put_i32(data.len() as i32);
                buf.put(data.as_slice());
            }
        }
    }
}

pub mod type_oids {
    pub const BOOL: u32 = 16;
    pub const INT2: u32 = 21;
    pub const INT4: u32 = 23;
    pub const INT8: u32 = 20;
    pub const FLOAT4: u32 = 700;
    pub const FLOAT8: u32 = 701;
    pub const TEXT: u32 = 25;
    pub const VARCHAR: u32 = 1043;
    pub const BYTEA: u32 = 17;
    pub const TIMESTAMPTZ: u32 = 1184;
    pub const JSON: u32 = 114;
    pub const JSONB: u32 = 3802;
    pub const NUMERIC: u32 = 1700;
}
