//! Shared SQLite handle.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::schema;

/// SQLite database for the integrity engine
pub struct GuardDb {
    conn: Mutex<Connection>,
}

impl GuardDb {
    /// Open or create the database at `db_path`
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        info!("Opening SQLite database at {:?}", db_path);

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(db_path)
            .map_err(|e| StoreError::Internal(format!("Failed to open SQLite: {}", e)))?;

        // WAL keeps sweep reads from blocking request writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::Internal(format!("Failed to set PRAGMA: {}", e)))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        debug!("Opening in-memory SQLite database");

        let conn = Connection::open_in_memory().map_err(|e| {
            StoreError::Internal(format!("Failed to open in-memory SQLite: {}", e))
        })?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.with_conn(schema::init_schema)
    }

    /// Run a read or single-statement write
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&conn)
    }

    /// Execute a write operation with exclusive access
    pub fn with_conn_mut<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Internal(format!("Lock poisoned: {}", e)))?;
        f(&mut conn)
    }

    /// Run `f` inside a transaction. Any error rolls back every write `f` made.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats, StoreError> {
        self.with_conn(|conn| {
            let count = |table: &str| -> Result<u64, StoreError> {
                let n: i64 = conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                    .map_err(|e| StoreError::Internal(format!("Query failed: {}", e)))?;
                Ok(n as u64)
            };

            Ok(DbStats {
                code_count: count("codes")?,
                claim_count: count("claims")?,
                trade_count: count("trades")?,
                user_count: count("user_status")?,
                violation_count: count("violations")?,
            })
        })
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub code_count: u64,
    pub claim_count: u64,
    pub trade_count: u64,
    pub user_count: u64,
    pub violation_count: u64,
}
