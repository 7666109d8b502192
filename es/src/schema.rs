//! Schema creation

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::Result;

/// Schema version recorded in `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS task_definitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parameters TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS schedule_definitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    priority INTEGER NOT NULL,
    max_duration_seconds INTEGER NOT NULL,
    max_measurements INTEGER,
    max_rate_per_second INTEGER,
    matching_parameters TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS schedule_definitions_order
    ON schedule_definitions (priority, id);

CREATE TABLE IF NOT EXISTS active_schedule (
    schedule_id INTEGER PRIMARY KEY REFERENCES schedule_definitions (id),
    expiration_time INTEGER NOT NULL,
    measurements_remaining INTEGER,
    priority INTEGER NOT NULL,
    scheduled_time INTEGER NOT NULL,
    promotion_seq INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS queries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    remote_addr TEXT NOT NULL,
    task_id INTEGER NOT NULL,
    schedule_id INTEGER,
    raw_request BLOB NOT NULL,
    substrate TEXT NOT NULL,
    parameters_json TEXT NOT NULL,
    response_body BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS parsed_queries (
    query_id INTEGER PRIMARY KEY REFERENCES queries (id),
    measurement_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    client_ip TEXT,
    client_location TEXT NOT NULL,
    substrate TEXT NOT NULL,
    parameters TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    remote_addr TEXT NOT NULL,
    raw_request BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS parsed_results (
    result_id INTEGER PRIMARY KEY REFERENCES results (id),
    measurement_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    outcome TEXT NOT NULL,
    message TEXT NOT NULL,
    origin TEXT NOT NULL,
    referer TEXT NOT NULL,
    client_ip TEXT,
    client_location TEXT NOT NULL,
    user_agent TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS parsed_results_outcome ON parsed_results (outcome);

CREATE TABLE IF NOT EXISTS results_per_referer (referer TEXT, results INTEGER);
CREATE TABLE IF NOT EXISTS results_per_day (referer TEXT, day TEXT, results INTEGER);
CREATE TABLE IF NOT EXISTS results_per_country (referer TEXT, country TEXT, results INTEGER);
"#;

/// Apply connection pragmas and create any missing tables
pub(crate) fn initialize(conn: &Connection) -> Result<()> {
    debug!("initialize: called");
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    // In-memory databases answer "memory" and ignore the request
    let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    debug!(%mode, "initialize: journal mode set");

    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    conn.execute_batch(SCHEMA)?;
    if version < SCHEMA_VERSION {
        conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
        info!(from = version, to = SCHEMA_VERSION, "Schema initialized");
    }
    Ok(())
}
