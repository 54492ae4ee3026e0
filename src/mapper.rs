//! Mapping of captured [`ChangeEvent`]s into fixed-shape [`StructuredRecord`]s.
//!
//! Every record carries the same eight fields whatever database produced it.
//! Fields that cannot be derived from an event are present and null.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::event::{ChangeEvent, Operation, SourceMetadata, SourceTimestamp, TransactionMetadata};
use crate::serializer::{FieldSchema, FieldType, RecordSchema};

/// The output record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredRecord {
    pub before: Option<serde_json::Value>,
    pub after: Option<serde_json::Value>,
    pub source: SourceMetadata,
    pub transaction: Option<TransactionMetadata>,
    pub op: Operation,
    pub ts_ms: Option<i64>,
    pub ts_us: Option<i64>,
    pub ts_ns: Option<i64>,
}

impl StructuredRecord {
    pub const FIELD_NAMES: [&'static str; 8] = [
        "before",
        "after",
        "source",
        "transaction",
        "op",
        "ts_ms",
        "ts_us",
        "ts_ns",
    ];

    /// Schema shared by every record, used to key serializers.
    pub fn schema() -> RecordSchema {
        let field = |name: &str, field_type: FieldType, optional: bool| FieldSchema {
            name: name.to_string(),
            field_type,
            optional,
        };
        RecordSchema {
            name: "io.pgrowcapture.Envelope".to_string(),
            fields: vec![
                field("before", FieldType::Struct, true),
                field("after", FieldType::Struct, true),
                field("source", FieldType::Struct, false),
                field("transaction", FieldType::Struct, true),
                field("op", FieldType::String, false),
                field("ts_ms", FieldType::Int64, true),
                field("ts_us", FieldType::Int64, true),
                field("ts_ns", FieldType::Int64, true),
            ],
        }
    }
}

/// Maps events of one configured table into [`StructuredRecord`]s.
///
/// The table identifier is compared verbatim with the event's; its separator
/// belongs to the source dialect and is never interpreted here.
#[derive(Debug, Clone)]
pub struct ChangeEventMapper {
    table: String,
}

impl ChangeEventMapper {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        event.table() == self.table
    }

    /// Returns `None` for events of other tables.
    pub fn map(&self, event: ChangeEvent) -> Option<StructuredRecord> {
        if !self.accepts(&event) {
            trace!(table = event.table(), "Skipping event for unconfigured table");
            return None;
        }

        let (ts_ms, ts_us, ts_ns) = resolve_timestamps(event.timestamp);
        let mut source = event.source;
        if source.ts_ms.is_none() {
            source.ts_ms = ts_ms;
        }

        Some(StructuredRecord {
            before: event.before,
            after: event.after,
            source,
            transaction: event.transaction,
            op: event.op,
            ts_ms,
            ts_us,
            ts_ns,
        })
    }
}

/// Millisecond, microsecond and nanosecond views of a source timestamp.
///
/// Finer resolutions are used as given; coarser ones are floored from them.
/// A millisecond-only timestamp is scaled up.
pub fn resolve_timestamps(ts: Option<SourceTimestamp>) -> (Option<i64>, Option<i64>, Option<i64>) {
    match ts {
        Some(SourceTimestamp::Millis(ms)) => (Some(ms), ms.checked_mul(1_000), ms.checked_mul(1_000_000)),
        Some(SourceTimestamp::Micros(us)) => (Some(us.div_euclid(1_000)), Some(us), us.checked_mul(1_000)),
        Some(SourceTimestamp::Nanos(ns)) => (
            Some(ns.div_euclid(1_000_000)),
            Some(ns.div_euclid(1_000)),
            Some(ns),
        ),
        None => (None, None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn event(table: &str, timestamp: Option<SourceTimestamp>) -> ChangeEvent {
        ChangeEvent {
            op: Operation::Create,
            before: None,
            after: Some(json!({"id": 1001, "first_name": "Sally"})),
            source: SourceMetadata::new(
                "postgresql",
                "inventory".to_string(),
                "inventory".to_string(),
                table.to_string(),
            ),
            transaction: None,
            timestamp,
        }
    }

    #[test]
    fn test_field_set_is_exactly_eight() {
        let mapper = ChangeEventMapper::new("inventory.customers");
        let record = mapper
            .map(event("inventory.customers", Some(SourceTimestamp::Millis(1))))
            .unwrap();

        let value = serde_json::to_value(&record).unwrap();
        let keys: BTreeSet<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        let expected: BTreeSet<&str> = StructuredRecord::FIELD_NAMES.into_iter().collect();
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_missing_fields_are_null_not_omitted() {
        let mapper = ChangeEventMapper::new("inventory.customers");
        let record = mapper.map(event("inventory.customers", None)).unwrap();

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["before"], serde_json::Value::Null);
        assert_eq!(value["transaction"], serde_json::Value::Null);
        assert_eq!(value["ts_ns"], serde_json::Value::Null);
        assert_eq!(value["op"], "c");
        assert_eq!(value.as_object().unwrap().len(), 8);
    }

    #[test]
    fn test_millisecond_timestamps_are_scaled() {
        let t = 1_697_369_400_123;
        assert_eq!(
            resolve_timestamps(Some(SourceTimestamp::Millis(t))),
            (Some(t), Some(t * 1000), Some(t * 1_000_000))
        );
    }

    #[test]
    fn test_native_micros_used_directly() {
        let us = 1_697_369_400_123_456;
        let (ms, got_us, ns) = resolve_timestamps(Some(SourceTimestamp::Micros(us)));
        assert_eq!(ms, Some(1_697_369_400_123));
        assert_eq!(got_us, Some(us));
        assert_eq!(ns, Some(us * 1000));

        let ns_in = 1_697_369_400_123_456_789;
        let (ms, us, ns) = resolve_timestamps(Some(SourceTimestamp::Nanos(ns_in)));
        assert_eq!(ms, Some(1_697_369_400_123));
        assert_eq!(us, Some(1_697_369_400_123_456));
        assert_eq!(ns, Some(ns_in));
    }

    #[test]
    fn test_source_ts_filled_from_event() {
        let mapper = ChangeEventMapper::new("inventory.customers");
        let record = mapper
            .map(event("inventory.customers", Some(SourceTimestamp::Micros(5_000_000))))
            .unwrap();
        assert_eq!(record.source.ts_ms, Some(5_000));
    }

    #[test]
    fn test_identifier_matched_verbatim() {
        // "database.table" and "schema.table" look alike; only exact text matches.
        let mapper = ChangeEventMapper::new("inventory.customers");
        assert!(mapper.map(event("public.customers", None)).is_none());
        assert!(mapper.map(event("inventory.customers.archive", None)).is_none());
        assert!(mapper.map(event("customers", None)).is_none());

        let unqualified = ChangeEventMapper::new("customers");
        assert!(unqualified.map(event("customers", None)).is_some());
    }

    #[test]
    fn test_schema_lists_the_record_fields() {
        let schema = StructuredRecord::schema();
        let names: Vec<&str> = schema.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, StructuredRecord::FIELD_NAMES);
    }
}
