//! SQLite database for vncdesk state persistence

use crate::Result;
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Expose the underlying connection for subsystems that manage
    /// their own queries against the shared state DB.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Remote machines
            CREATE TABLE IF NOT EXISTS endpoints (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                address TEXT,
                location TEXT NOT NULL,
                country TEXT NOT NULL,
                city TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'inactive',
                last_seen INTEGER,
                installation_key TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                port INTEGER NOT NULL,
                secret TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_endpoints_status ON endpoints(status);

            -- Single-use installation keys
            CREATE TABLE IF NOT EXISTS installation_keys (
                id TEXT PRIMARY KEY,
                key TEXT NOT NULL UNIQUE,
                machine_name TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                used INTEGER NOT NULL DEFAULT 0,
                used_at INTEGER,
                endpoint_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_installation_keys_endpoint ON installation_keys(endpoint_id);

            -- Activity log (append-only)
            CREATE TABLE IF NOT EXISTS activity_logs (
                id TEXT PRIMARY KEY,
                endpoint_id TEXT NOT NULL,
                action TEXT NOT NULL,
                details TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                origin_address TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_activity_logs_endpoint ON activity_logs(endpoint_id);
            CREATE INDEX IF NOT EXISTS idx_activity_logs_timestamp ON activity_logs(timestamp);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }
}
