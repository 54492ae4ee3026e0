pub mod cache;
pub mod json;
pub mod schema;

pub use cache::{Cached, SerializerCache};
pub use json::{RecordSerializer, SerializerError};
pub use schema::{FieldSchema, FieldType, RecordSchema, SchemaFingerprint};
