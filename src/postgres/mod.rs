pub mod connection;
pub mod decoder;

#[cfg(test)]
pub(crate) mod test_utils;

pub use connection::{Batch, PgConnection, PgConnector, PgSource, QualifiedTable, StartMode};
pub use decoder::{parse_postgres_value, DecodedMessage, PgOutputDecoder, RelationInfo};
