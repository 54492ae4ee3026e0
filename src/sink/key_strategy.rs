use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::event::Operation;
use crate::mapper::StructuredRecord;

/// How the Kafka message key is derived from a record.
///
/// Configured as e.g. `key_strategy = { type = "primary_key", value = ["id"] }`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum KeyStrategy {
    TableName,
    PrimaryKey(Vec<String>),
    FieldPath(String),
    #[default]
    None,
}

impl KeyStrategy {
    pub fn extract_key(&self, record: &StructuredRecord) -> Option<String> {
        match self {
            KeyStrategy::TableName => Some(record.source.table.clone()),
            KeyStrategy::PrimaryKey(columns) => {
                row_image(record).and_then(|row| extract_composite_key(row, columns))
            }
            KeyStrategy::FieldPath(path) => {
                row_image(record).and_then(|row| extract_field_value(row, path))
            }
            KeyStrategy::None => None,
        }
    }
}

/// The image a key is read from: `before` for deletes, `after` otherwise.
fn row_image(record: &StructuredRecord) -> Option<&Value> {
    let image = match record.op {
        Operation::Delete => record.before.as_ref(),
        _ => record.after.as_ref(),
    };
    if image.is_none() && record.op != Operation::Truncate {
        warn!(op = record.op.code(), "No row image available for key extraction");
    }
    image
}

fn extract_field_value(record: &Value, field_path: &str) -> Option<String> {
    let mut current = record;
    for part in field_path.split('.') {
        match current.get(part) {
            Some(value) => current = value,
            None => {
                debug!("Field '{}' not found in record", part);
                return None;
            }
        }
    }

    match current {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn extract_composite_key(record: &Value, fields: &[String]) -> Option<String> {
    let parts = fields
        .iter()
        .map(|field| extract_field_value(record, field))
        .collect::<Option<Vec<_>>>()?;

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(":"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SourceMetadata;
    use serde_json::json;

    fn record(op: Operation, before: Option<Value>, after: Option<Value>) -> StructuredRecord {
        StructuredRecord {
            before,
            after,
            source: SourceMetadata::new(
                "postgresql",
                "dbserver1".to_string(),
                "inventory".to_string(),
                "public.users".to_string(),
            ),
            transaction: None,
            op,
            ts_ms: None,
            ts_us: None,
            ts_ns: None,
        }
    }

    #[test]
    fn test_table_name_strategy() {
        let record = record(Operation::Create, None, Some(json!({})));
        assert_eq!(
            KeyStrategy::TableName.extract_key(&record),
            Some("public.users".to_string())
        );
    }

    #[test]
    fn test_primary_key_strategy() {
        let record = record(Operation::Create, None, Some(json!({"org_id": 456, "user_id": 789})));
        let single = KeyStrategy::PrimaryKey(vec!["user_id".to_string()]);
        let composite = KeyStrategy::PrimaryKey(vec!["org_id".to_string(), "user_id".to_string()]);

        assert_eq!(single.extract_key(&record), Some("789".to_string()));
        assert_eq!(composite.extract_key(&record), Some("456:789".to_string()));
    }

    #[test]
    fn test_missing_key_column_yields_no_key() {
        let record = record(Operation::Create, None, Some(json!({"org_id": 456})));
        let composite = KeyStrategy::PrimaryKey(vec!["org_id".to_string(), "user_id".to_string()]);
        assert_eq!(composite.extract_key(&record), None);
    }

    #[test]
    fn test_field_path_strategy() {
        let record = record(
            Operation::Read,
            None,
            Some(json!({"user": {"profile": {"email": "john@example.com"}}})),
        );
        let strategy = KeyStrategy::FieldPath("user.profile.email".to_string());
        assert_eq!(strategy.extract_key(&record), Some("john@example.com".to_string()));
    }

    #[test]
    fn test_delete_uses_before_image() {
        let record = record(Operation::Delete, Some(json!({"id": 999})), None);
        let strategy = KeyStrategy::PrimaryKey(vec!["id".to_string()]);
        assert_eq!(strategy.extract_key(&record), Some("999".to_string()));
    }

    #[test]
    fn test_strategy_from_config() {
        let strategy: KeyStrategy =
            serde_json::from_value(json!({"type": "primary_key", "value": ["id"]})).unwrap();
        assert_eq!(strategy, KeyStrategy::PrimaryKey(vec!["id".to_string()]));

        let none: KeyStrategy = serde_json::from_value(json!({"type": "none"})).unwrap();
        assert_eq!(none, KeyStrategy::default());
    }
}
