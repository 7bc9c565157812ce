//! Database schema and connection management.

use crate::{DatabaseError, LinkError, Result};
use rusqlite::Connection;
use std::path::Path;

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Local store for account state, recipients, identities, prekeys and queued jobs
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the specified path and make sure the schema exists
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(DatabaseError::Sqlite)?;

        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(DatabaseError::Sqlite)?;

        let db = Self { conn };
        db.initialize_schema()?;
        db.validate_schema_version()?;
        Ok(db)
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Sqlite)?;

        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;

        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize the database schema
    pub fn initialize_schema(&self) -> Result<()> {
        self.create_db_metadata_table()?;
        self.create_account_tables()?;
        self.create_recipient_tables()?;
        self.create_jobs_table()?;
        self.create_indexes()?;
        Ok(())
    }

    fn create_db_metadata_table(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS db_metadata (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    version INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                INSERT OR IGNORE INTO db_metadata (id, version, created_at)
                VALUES (1, {}, strftime('%s', 'now'));",
                CURRENT_SCHEMA_VERSION
            ))
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_account_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS account_state (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    device_id INTEGER,
                    account_id TEXT,
                    identity_private_key BLOB,
                    registration_id INTEGER,
                    signaling_key TEXT,
                    profile_key BLOB,
                    password TEXT,
                    push_token TEXT,
                    sender_certificate BLOB,
                    push_registered INTEGER NOT NULL DEFAULT 0,
                    signed_prekey_registered INTEGER NOT NULL DEFAULT 0,
                    websocket_registered INTEGER NOT NULL DEFAULT 0,
                    multi_device INTEGER NOT NULL DEFAULT 0,
                    push_disabled INTEGER NOT NULL DEFAULT 0,
                    unauthorized_received INTEGER NOT NULL DEFAULT 0,
                    next_prekey_id INTEGER NOT NULL DEFAULT 1,
                    next_signed_prekey_id INTEGER NOT NULL DEFAULT 1,
                    linked_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS prekeys (
                    prekey_id INTEGER NOT NULL,
                    signed INTEGER NOT NULL DEFAULT 0,
                    public_key BLOB NOT NULL,
                    private_key BLOB NOT NULL,
                    signature BLOB,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (prekey_id, signed)
                );",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_recipient_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS recipients (
                    recipient_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    identifier TEXT NOT NULL UNIQUE,
                    name TEXT,
                    color TEXT,
                    profile_key BLOB,
                    profile_name TEXT,
                    created_at INTEGER NOT NULL,
                    modified_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS identities (
                    identifier TEXT PRIMARY KEY,
                    identity_key BLOB NOT NULL,
                    verified_status TEXT NOT NULL DEFAULT 'default',
                    first_use INTEGER NOT NULL DEFAULT 0,
                    timestamp INTEGER NOT NULL,
                    nonblocking_approval INTEGER NOT NULL DEFAULT 0
                );",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_jobs_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS jobs (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    job_id TEXT NOT NULL UNIQUE,
                    factory_key TEXT NOT NULL,
                    parameters TEXT NOT NULL,
                    constraints TEXT NOT NULL,
                    attempt_count INTEGER NOT NULL DEFAULT 0,
                    max_attempts INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    next_run_at INTEGER NOT NULL DEFAULT 0
                )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_indexes(&self) -> Result<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_jobs_factory_key ON jobs(factory_key)",
            "CREATE INDEX IF NOT EXISTS idx_jobs_next_run_at ON jobs(next_run_at)",
        ];
        for sql in &indexes {
            self.conn.execute(sql, []).map_err(DatabaseError::Sqlite)?;
        }
        Ok(())
    }

    /// Validate the stored schema version against the one this build writes.
    pub fn validate_schema_version(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .query_row("SELECT version FROM db_metadata WHERE id = 1", [], |row| {
                row.get(0)
            })
            .map_err(DatabaseError::Sqlite)?;

        if version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        Err(LinkError::from(DatabaseError::SchemaMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: version,
        }))
    }

    /// Get a reference to the underlying connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().unwrap();

        let table_names: Vec<String> = db
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table'")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "db_metadata",
            "account_state",
            "prekeys",
            "recipients",
            "identities",
            "jobs",
        ] {
            assert!(table_names.contains(&table.to_string()), "missing {}", table);
        }

        db.validate_schema_version().unwrap();
    }

    #[test]
    fn schema_initialization_is_idempotent() {
        let db = Database::in_memory().unwrap();
        db.initialize_schema().unwrap();
        db.initialize_schema().unwrap();
        db.validate_schema_version().unwrap();
    }

    #[test]
    fn newer_schema_version_is_rejected() {
        let db = Database::in_memory().unwrap();
        db.conn
            .execute("UPDATE db_metadata SET version = 99 WHERE id = 1", [])
            .unwrap();
        let err = db.validate_schema_version().unwrap_err();
        assert!(matches!(
            err,
            LinkError::Database(DatabaseError::SchemaMismatch { found: 99, .. })
        ));
    }

    #[test]
    fn open_on_disk_creates_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("account.db");
        {
            let _db = Database::open(&path).unwrap();
        }
        let reopened = Database::open(&path).unwrap();
        reopened.validate_schema_version().unwrap();
    }
}
