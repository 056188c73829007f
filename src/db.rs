// 🗄️ Data Store - SQLite connection and measurement schema

use crate::error::Result;
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

pub const SOURCE_TABLE: &str = "msmt_source";
pub const SOURCE_DESTINATION_TABLE: &str = "msmt_source_destination";
pub const TRIGGER_TABLE: &str = "msmt_trigger";
pub const EVENT_REPORT_TABLE: &str = "msmt_event_report";
pub const AGGREGATE_REPORT_TABLE: &str = "msmt_aggregate_report";
pub const ATTRIBUTION_TABLE: &str = "msmt_attribution";
pub const XNA_IGNORED_SOURCES_TABLE: &str = "msmt_xna_ignored_sources";

/// Open (or create) a database file and make sure the schema exists
pub fn open<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let conn = Connection::open(path.as_ref())?;
    configure(&conn)?;
    setup_database(&conn)?;
    info!(path = %path.as_ref().display(), "Measurement database opened");
    Ok(conn)
}

/// In-memory database, used by tests and throwaway runs
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    setup_database(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; busy timeout so a second writer waits instead of failing
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Sources (registered elsewhere; attribution mutates ledger columns)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS msmt_source (
            id TEXT PRIMARY KEY NOT NULL,
            event_id INTEGER NOT NULL,
            publisher TEXT NOT NULL,
            publisher_type INTEGER NOT NULL,
            enrollment_id TEXT NOT NULL,
            registrant TEXT NOT NULL,
            event_time INTEGER NOT NULL,
            expiry_time INTEGER NOT NULL,
            event_report_window INTEGER NOT NULL,
            aggregatable_report_window INTEGER NOT NULL,
            priority INTEGER NOT NULL,
            status INTEGER NOT NULL,
            source_type INTEGER NOT NULL,
            attribution_mode INTEGER NOT NULL,
            install_attribution_window INTEGER NOT NULL DEFAULT 0,
            install_cooldown_window INTEGER NOT NULL DEFAULT 0,
            is_install_attributed INTEGER NOT NULL DEFAULT 0,
            filter_data TEXT,
            aggregate_source TEXT,
            event_report_dedup_keys TEXT,
            aggregate_report_dedup_keys TEXT,
            aggregate_contributions INTEGER NOT NULL DEFAULT 0,
            registration_origin TEXT NOT NULL,
            registration_id TEXT,
            shared_aggregation_keys TEXT,
            coarse_event_report_destinations INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS msmt_source_destination (
            source_id TEXT NOT NULL,
            destination TEXT NOT NULL,
            destination_type INTEGER NOT NULL,
            PRIMARY KEY (source_id, destination, destination_type),
            FOREIGN KEY (source_id) REFERENCES msmt_source(id) ON DELETE CASCADE
        )",
        [],
    )?;

    // ==========================================================================
    // Triggers
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS msmt_trigger (
            id TEXT PRIMARY KEY NOT NULL,
            attribution_destination TEXT NOT NULL,
            destination_type INTEGER NOT NULL,
            trigger_time INTEGER NOT NULL,
            status INTEGER NOT NULL,
            enrollment_id TEXT NOT NULL,
            registrant TEXT NOT NULL,
            registration_origin TEXT NOT NULL,
            event_triggers TEXT,
            filters TEXT,
            not_filters TEXT,
            aggregate_trigger_data TEXT,
            aggregate_values TEXT,
            aggregate_deduplication_keys TEXT,
            attribution_config TEXT
        )",
        [],
    )?;

    // ==========================================================================
    // Reports
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS msmt_event_report (
            id TEXT PRIMARY KEY NOT NULL,
            source_event_id INTEGER NOT NULL,
            enrollment_id TEXT NOT NULL,
            attribution_destinations TEXT NOT NULL,
            attribution_destination TEXT NOT NULL,
            trigger_time INTEGER NOT NULL,
            trigger_data INTEGER NOT NULL,
            trigger_priority INTEGER NOT NULL,
            trigger_dedup_key INTEGER,
            report_time INTEGER NOT NULL,
            status INTEGER NOT NULL,
            debug_report_status INTEGER NOT NULL,
            source_type INTEGER NOT NULL,
            randomized_trigger_rate REAL NOT NULL,
            source_id TEXT NOT NULL,
            trigger_id TEXT NOT NULL,
            registration_origin TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS msmt_aggregate_report (
            id TEXT PRIMARY KEY NOT NULL,
            publisher TEXT NOT NULL,
            attribution_destination TEXT NOT NULL,
            source_registration_time INTEGER NOT NULL,
            scheduled_report_time INTEGER NOT NULL,
            enrollment_id TEXT NOT NULL,
            debug_cleartext_payload TEXT NOT NULL,
            status INTEGER NOT NULL,
            api_version TEXT NOT NULL,
            source_id TEXT NOT NULL,
            trigger_id TEXT NOT NULL,
            registration_origin TEXT NOT NULL,
            dedup_key INTEGER
        )",
        [],
    )?;

    // ==========================================================================
    // Ledgers
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS msmt_attribution (
            id TEXT PRIMARY KEY NOT NULL,
            source_site TEXT NOT NULL,
            source_origin TEXT NOT NULL,
            destination_site TEXT NOT NULL,
            destination_origin TEXT NOT NULL,
            enrollment_id TEXT NOT NULL,
            trigger_time INTEGER NOT NULL,
            registrant TEXT NOT NULL,
            source_id TEXT NOT NULL,
            trigger_id TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS msmt_xna_ignored_sources (
            source_id TEXT NOT NULL,
            enrollment_id TEXT NOT NULL,
            PRIMARY KEY (source_id, enrollment_id)
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_source_status_times
         ON msmt_source(status, event_time, expiry_time)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_source_destination_dest
         ON msmt_source_destination(destination, destination_type)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_trigger_status_time ON msmt_trigger(status, trigger_time)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_event_report_source ON msmt_event_report(source_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_aggregate_report_source ON msmt_aggregate_report(source_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attribution_sites
         ON msmt_attribution(source_site, destination_site, enrollment_id, trigger_time)",
        [],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_is_idempotent() {
        let conn = open_in_memory().unwrap();
        setup_database(&conn).unwrap();

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name LIKE 'msmt_%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 7);
    }

    #[test]
    fn test_open_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("measurement.db");

        let conn = open(&path).unwrap();
        drop(conn);

        // Reopening an existing file keeps the schema
        let conn = open(&path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM msmt_trigger", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
