use serde_json::{json, Value};
use thiserror::Error;

use super::schema::{FieldType, RecordSchema, SchemaFingerprint};
use crate::mapper::StructuredRecord;

/// Failure to build a serializer or to encode a record with it.
///
/// Cloneable so one failed construction can be handed to every caller that
/// was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerializerError {
    #[error("Invalid schema {schema}: {message}")]
    InvalidSchema { schema: String, message: String },

    #[error("Record does not match schema {schema}: {message}")]
    Mismatch { schema: String, message: String },

    #[error("Serializer construction for schema {0} panicked")]
    BuildPanicked(String),

    #[error("Serialization error: {0}")]
    Encode(String),
}

/// JSON encoder bound to one [`RecordSchema`].
///
/// Building one validates the schema and renders its schema header once;
/// encoding then only checks field presence and types.
#[derive(Debug)]
pub struct RecordSerializer {
    schema: RecordSchema,
    fingerprint: SchemaFingerprint,
    schema_json: Value,
    with_schema: bool,
}

impl RecordSerializer {
    pub fn build(schema: &RecordSchema) -> Result<Self, SerializerError> {
        let invalid = |message: String| SerializerError::InvalidSchema {
            schema: schema.name.clone(),
            message,
        };

        if schema.fields.is_empty() {
            return Err(invalid("schema has no fields".to_string()));
        }
        for (i, field) in schema.fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(invalid(format!("field {} has an empty name", i)));
            }
            if schema.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(invalid(format!("duplicate field '{}'", field.name)));
            }
        }

        let schema_json = json!({
            "type": "struct",
            "name": schema.name,
            "optional": false,
            "fields": schema.fields.iter().map(|f| json!({
                "field": f.name,
                "type": f.field_type,
                "optional": f.optional,
            })).collect::<Vec<_>>(),
        });

        Ok(Self {
            schema: schema.clone(),
            fingerprint: schema.fingerprint(),
            schema_json,
            with_schema: false,
        })
    }

    /// Wraps encoded records in a `{"schema": ..., "payload": ...}` envelope.
    pub fn with_schema(mut self, with_schema: bool) -> Self {
        self.with_schema = with_schema;
        self
    }

    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    pub fn fingerprint(&self) -> SchemaFingerprint {
        self.fingerprint
    }

    pub fn to_value(&self, record: &StructuredRecord) -> Result<Value, SerializerError> {
        let payload =
            serde_json::to_value(record).map_err(|e| SerializerError::Encode(e.to_string()))?;
        self.check(&payload)?;

        if self.with_schema {
            Ok(json!({ "schema": self.schema_json, "payload": payload }))
        } else {
            Ok(payload)
        }
    }

    pub fn encode(&self, record: &StructuredRecord) -> Result<Vec<u8>, SerializerError> {
        let value = self.to_value(record)?;
        serde_json::to_vec(&value).map_err(|e| SerializerError::Encode(e.to_string()))
    }

    fn check(&self, payload: &Value) -> Result<(), SerializerError> {
        let mismatch = |message: String| SerializerError::Mismatch {
            schema: self.schema.name.clone(),
            message,
        };
        let object = payload
            .as_object()
            .ok_or_else(|| mismatch("record is not an object".to_string()))?;

        if object.len() != self.schema.fields.len() {
            return Err(mismatch(format!(
                "expected {} fields, found {}",
                self.schema.fields.len(),
                object.len()
            )));
        }
        for field in &self.schema.fields {
            let value = object
                .get(&field.name)
                .ok_or_else(|| mismatch(format!("missing field '{}'", field.name)))?;
            let ok = match (value, field.field_type) {
                (Value::Null, _) => field.optional,
                (Value::Object(_), FieldType::Struct) => true,
                (Value::String(_), FieldType::String) => true,
                (Value::Number(n), FieldType::Int64) => n.is_i64(),
                (Value::Bool(_), FieldType::Boolean) => true,
                _ => false,
            };
            if !ok {
                return Err(mismatch(format!("field '{}' has the wrong type", field.name)));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Operation, SourceMetadata};
    use crate::serializer::FieldSchema;

    fn record() -> StructuredRecord {
        StructuredRecord {
            before: None,
            after: Some(json!({"id": 1004, "email": "annek@noanswer.org"})),
            source: SourceMetadata::new(
                "postgresql",
                "inventory".to_string(),
                "inventory".to_string(),
                "inventory.customers".to_string(),
            ),
            transaction: None,
            op: Operation::Read,
            ts_ms: Some(1),
            ts_us: Some(1_000),
            ts_ns: Some(1_000_000),
        }
    }

    #[test]
    fn test_encode_record() {
        let serializer = RecordSerializer::build(&StructuredRecord::schema()).unwrap();
        let bytes = serializer.encode(&record()).unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["op"], "r");
        assert_eq!(value["after"]["id"], 1004);
    }

    #[test]
    fn test_envelope_carries_schema() {
        let serializer = RecordSerializer::build(&StructuredRecord::schema())
            .unwrap()
            .with_schema(true);
        let value = serializer.to_value(&record()).unwrap();
        assert_eq!(value["schema"]["fields"].as_array().unwrap().len(), 8);
        assert_eq!(value["payload"]["ts_us"], 1_000);
    }

    #[test]
    fn test_duplicate_field_is_rejected() {
        let mut schema = StructuredRecord::schema();
        schema.fields.push(FieldSchema {
            name: "op".to_string(),
            field_type: FieldType::String,
            optional: false,
        });
        let err = RecordSerializer::build(&schema).unwrap_err();
        assert!(matches!(err, SerializerError::InvalidSchema { .. }));
    }

    #[test]
    fn test_schema_mismatch_is_reported() {
        let mut schema = StructuredRecord::schema();
        schema.fields[0].optional = false;
        let serializer = RecordSerializer::build(&schema).unwrap();
        let err = serializer.encode(&record()).unwrap_err();
        assert!(err.to_string().contains("before"));
    }
}
