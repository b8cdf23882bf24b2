//! Activity log sink
//!
//! Append-only record of endpoint lifecycle events. Writers never see a
//! failure: a store error is reported locally and the entry is dropped.

use rusqlite::params;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;
use vncdesk_common::{now_epoch_secs, ActivityLogEntry, Database, Error, Result};

/// Action tags written by the core and the HTTP layer
pub mod actions {
    pub const STATUS_AUTO_UPDATE: &str = "status_auto_update";
    pub const STATUS_UPDATE: &str = "status_update";
    pub const CONNECTION_DELETED: &str = "connection_deleted";
    pub const INSTALLER_GENERATED: &str = "installer_generated";
    pub const MACHINE_REGISTERED: &str = "machine_registered";
    pub const VNC_CONNECT: &str = "vnc_connect";
    pub const VNC_CONNECT_FAILED: &str = "vnc_connect_failed";
    pub const SESSION_START: &str = "vnc_websocket_connect";
    pub const SESSION_END: &str = "vnc_websocket_disconnect";
}

pub const DEFAULT_RECENT_LIMIT: u32 = 100;
pub const DEFAULT_ENDPOINT_LIMIT: u32 = 50;

#[derive(Clone)]
pub struct ActivityLog {
    db: Database,
}

impl ActivityLog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an entry (best effort)
    pub fn append(&self, endpoint_id: &str, action: &str, details: &str, origin: Option<&str>) {
        if let Err(e) = self.try_append(endpoint_id, action, details, origin) {
            warn!(
                "Dropped activity log entry {} for {}: {}",
                action, endpoint_id, e
            );
        }
    }

    /// Append on the blocking pool and wait for it. The calling task is
    /// suspended, the runtime is not.
    pub async fn record(&self, endpoint_id: &str, action: &str, details: &str, origin: Option<&str>) {
        if let Err(e) = self.record_detached(endpoint_id, action, details, origin).await {
            warn!("Activity log task for {} failed: {}", endpoint_id, e);
        }
    }

    /// Append on the blocking pool without waiting
    pub fn record_detached(
        &self,
        endpoint_id: &str,
        action: &str,
        details: &str,
        origin: Option<&str>,
    ) -> JoinHandle<()> {
        let log = self.clone();
        let endpoint_id = endpoint_id.to_string();
        let action = action.to_string();
        let details = details.to_string();
        let origin = origin.map(String::from);
        tokio::task::spawn_blocking(move || {
            log.append(&endpoint_id, &action, &details, origin.as_deref())
        })
    }

    /// Run read queries on the blocking pool
    pub async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ActivityLog) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let log = self.clone();
        tokio::task::spawn_blocking(move || f(&log))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    fn try_append(
        &self,
        endpoint_id: &str,
        action: &str,
        details: &str,
        origin: Option<&str>,
    ) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        conn.execute(
            "INSERT INTO activity_logs (id, endpoint_id, action, details, timestamp, origin_address)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                Uuid::new_v4().to_string(),
                endpoint_id,
                action,
                details,
                now_epoch_secs(),
                origin,
            ],
        )?;
        Ok(())
    }

    /// Newest entries across all endpoints
    pub fn recent(&self, limit: u32) -> Result<Vec<ActivityLogEntry>> {
        self.query(None, limit)
    }

    /// Newest entries for one endpoint
    pub fn for_endpoint(&self, endpoint_id: &str, limit: u32) -> Result<Vec<ActivityLogEntry>> {
        self.query(Some(endpoint_id), limit)
    }

    fn query(&self, endpoint_id: Option<&str>, limit: u32) -> Result<Vec<ActivityLogEntry>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, endpoint_id, action, details, timestamp, origin_address
             FROM activity_logs
             WHERE ?1 IS NULL OR endpoint_id = ?1
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![endpoint_id, limit], |row| {
            Ok(ActivityLogEntry {
                id: row.get(0)?,
                endpoint_id: row.get(1)?,
                action: row.get(2)?,
                details: row.get(3)?,
                timestamp: row.get(4)?,
                origin_address: row.get(5)?,
            })
        })?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Number of entries written at or after `since` (epoch seconds)
    pub fn count_since(&self, since: i64) -> Result<u64> {
        let conn = self.db.connection();
        let conn = conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM activity_logs WHERE timestamp >= ?1",
            params![since],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn test_log() -> ActivityLog {
        ActivityLog::new(Database::open_memory().unwrap())
    }

    #[test]
    fn test_append_and_read_back_newest_first() {
        let log = test_log();
        log.append("e1", actions::VNC_CONNECT, "first", None);
        log.append("e2", actions::VNC_CONNECT, "other", Some("192.168.1.20"));
        log.append("e1", actions::SESSION_END, "second", None);

        let recent = log.recent(10).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].details, "second");
        assert_eq!(recent[2].details, "first");

        let e1 = log.for_endpoint("e1", 10).unwrap();
        assert_eq!(e1.len(), 2);
        assert!(e1.iter().all(|e| e.endpoint_id == "e1"));

        let e2 = log.for_endpoint("e2", 10).unwrap();
        assert_eq!(e2[0].origin_address.as_deref(), Some("192.168.1.20"));
    }

    #[test]
    fn test_limit_and_count_since() {
        let log = test_log();
        for i in 0..5 {
            log.append("e1", actions::STATUS_UPDATE, &format!("n{}", i), None);
        }
        assert_eq!(log.recent(2).unwrap().len(), 2);
        assert_eq!(log.count_since(now_epoch_secs() - 60).unwrap(), 5);
        assert_eq!(log.count_since(now_epoch_secs() + 3600).unwrap(), 0);
    }

    #[test]
    fn test_append_failure_is_swallowed() {
        let log = test_log();
        {
            let conn = log.db.connection();
            let conn = conn.lock();
            conn.execute_batch("DROP TABLE activity_logs;").unwrap();
        }
        // Must not panic or propagate
        log.append("e1", actions::SESSION_START, "lost", None);
        assert!(log.recent(10).is_err());
    }

    #[tokio::test]
    async fn test_record_waits_off_the_runtime() {
        let log = test_log();
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let conn = log.db.connection();
        let holder = std::thread::spawn(move || {
            let _held = conn.lock();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(300));
        });
        locked_rx.recv().unwrap();

        let start = Instant::now();
        let ticker = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            start.elapsed()
        });

        log.record("e1", actions::SESSION_START, "contended", None).await;
        let ticked_after = ticker.await.unwrap();
        assert!(
            ticked_after < Duration::from_millis(200),
            "runtime stalled for {:?} behind the store",
            ticked_after
        );

        holder.join().unwrap();
        let entries = log.blocking(|l| l.for_endpoint("e1", 10)).await.unwrap();
        assert_eq!(entries[0].details, "contended");
    }

    #[tokio::test]
    async fn test_detached_record_lands() {
        let log = test_log();
        log.record_detached("e1", actions::VNC_CONNECT, "later", None)
            .await
            .unwrap();
        assert_eq!(log.recent(1).unwrap()[0].details, "later");
    }
}
