//! Record schemas and their fingerprints.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Struct,
    String,
    Int64,
    Boolean,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub optional: bool,
}

/// Shape of an encoded record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordSchema {
    pub name: String,
    pub fields: Vec<FieldSchema>,
}

impl RecordSchema {
    pub fn fingerprint(&self) -> SchemaFingerprint {
        SchemaFingerprint::compute(self)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Value-equality key of a [`RecordSchema`].
///
/// SHA-256 of the schema's canonical JSON, so structurally equal schemas
/// fingerprint equal no matter where they were built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaFingerprint([u8; 32]);

impl SchemaFingerprint {
    pub fn compute(schema: &RecordSchema) -> Self {
        let canonical = canonical_json(schema);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&hasher.finalize());
        Self(digest)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for SchemaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is plenty for logs.
        f.write_str(&self.to_hex()[..16])
    }
}

// serde_json::Value keeps object keys sorted, which makes the output canonical.
fn canonical_json(schema: &RecordSchema) -> String {
    serde_json::to_value(schema)
        .map(|v| v.to_string())
        .unwrap_or_else(|_| format!("{:?}", schema))
}
