// 🔒 Datastore - Transaction manager and store handles
//
// One transaction per unit of work. `rollback` only records the request;
// `end` is where the transaction actually commits or rolls back.

use crate::dao::{MeasurementDao, SqliteMeasurementDao};
use crate::db;
use crate::error::{AttributionError, DatastoreError, Result};
use rusqlite::Connection;
use std::cell::Cell;
use std::path::Path;
use tracing::{debug, warn};

// ============================================================================
// SQLITE TRANSACTION
// ============================================================================

/// Exposes the connection to the DAO only while a transaction is open
pub struct SqliteTransaction<'c> {
    conn: &'c Connection,
    active: Cell<bool>,
    rollback_requested: Cell<bool>,
}

impl<'c> SqliteTransaction<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        SqliteTransaction {
            conn,
            active: Cell::new(false),
            rollback_requested: Cell::new(false),
        }
    }

    pub fn begin(&self) -> Result<()> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        self.active.set(true);
        self.rollback_requested.set(false);
        Ok(())
    }

    /// Mark the open transaction for rollback; takes effect at `end`
    pub fn rollback(&self) {
        if self.active.get() {
            self.rollback_requested.set(true);
        }
    }

    /// Commit, or roll back if requested. No-op without an open transaction.
    pub fn end(&self) -> Result<()> {
        if !self.active.get() {
            return Ok(());
        }
        self.active.set(false);

        if self.rollback_requested.replace(false) {
            self.conn.execute_batch("ROLLBACK")?;
            return Ok(());
        }

        if let Err(e) = self.conn.execute_batch("COMMIT") {
            // A failed COMMIT can leave the transaction open
            if !self.conn.is_autocommit() {
                if let Err(rollback_err) = self.conn.execute_batch("ROLLBACK") {
                    warn!(error = %rollback_err, "Rollback after failed commit also failed");
                }
            }
            return Err(e.into());
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    pub fn connection(&self) -> Result<&'c Connection> {
        if !self.active.get() {
            return Err(DatastoreError::NoActiveTransaction);
        }
        Ok(self.conn)
    }
}

impl Drop for SqliteTransaction<'_> {
    fn drop(&mut self) {
        if self.active.get() {
            self.rollback();
            if let Err(e) = self.end() {
                warn!(error = %e, "Failed to close abandoned transaction");
            }
        }
    }
}

// ============================================================================
// DATASTORE MANAGER
// ============================================================================

/// Runs a unit of work against a DAO inside one transaction.
///
/// The transaction commits when `op` returns `Ok` and rolls back otherwise.
pub trait DatastoreManager {
    fn run_in_transaction<T, F>(&self, op: F) -> std::result::Result<T, AttributionError>
    where
        F: FnOnce(&mut dyn MeasurementDao) -> std::result::Result<T, AttributionError>;
}

// ============================================================================
// SQLITE DATASTORE
// ============================================================================

/// Explicitly opened store handle; pass it to whatever needs it
pub struct SqliteDatastore {
    conn: Connection,
}

impl SqliteDatastore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(SqliteDatastore {
            conn: db::open(path)?,
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(SqliteDatastore {
            conn: db::open_in_memory()?,
        })
    }

    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, e)| DatastoreError::Sqlite(e))
    }
}

impl DatastoreManager for SqliteDatastore {
    fn run_in_transaction<T, F>(&self, op: F) -> std::result::Result<T, AttributionError>
    where
        F: FnOnce(&mut dyn MeasurementDao) -> std::result::Result<T, AttributionError>,
    {
        let tx = SqliteTransaction::new(&self.conn);
        tx.begin()?;

        let mut dao = SqliteMeasurementDao::new(&tx);
        let result = op(&mut dao);

        match result {
            Ok(value) => {
                tx.end()?;
                Ok(value)
            }
            Err(e) => {
                debug!(error = %e, "Rolling back transaction");
                tx.rollback();
                if let Err(end_err) = tx.end() {
                    warn!(error = %end_err, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}
