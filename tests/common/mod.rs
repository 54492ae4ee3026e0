use pg_row_capture::config::ConnectionConfig;
use std::env;
use std::path::Path;

/// Source configuration for tests, overridable through `TEST_PG_*` variables.
#[allow(dead_code)]
pub fn source_config(history: &Path) -> ConnectionConfig {
    ConnectionConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(5432),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        table: "inventory.customers".to_string(),
        connector_properties: vec![
            format!("slot.name=test_slot_{}", std::process::id()),
            format!("publication.name=test_pub_{}", std::process::id()),
            "topic.prefix=dbserver1".to_string(),
        ],
        schema_history_path: history.to_path_buf(),
        connect_timeout_secs: 5,
    }
}
