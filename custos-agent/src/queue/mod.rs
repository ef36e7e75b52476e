//! Durable, crash-safe queue of evidence bundles awaiting upload.
//!
//! The queue is the single source of truth for "has this bundle been
//! uploaded yet". Rows are deduplicated by bundle id, retried forever
//! (flagged for human attention past the attempt cap), and pruned only
//! under the retention constraints.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct QueuedBundle {
    pub bundle_id: String,
    pub bundle_path: String,
    pub signature_path: String,
    pub check_name: String,
    pub outcome: String,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub needs_attention: bool,
}

impl QueuedBundle {
    pub fn is_pending(&self) -> bool {
        self.uploaded_at.is_none()
    }
}

pub struct OfflineQueue {
    conn: Arc<Mutex<Connection>>,
    attempt_cap: u32,
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_bundle(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedBundle> {
    let created_at: String = row.get("created_at")?;
    let uploaded_at: Option<String> = row.get("uploaded_at")?;
    Ok(QueuedBundle {
        bundle_id: row.get("bundle_id")?,
        bundle_path: row.get("bundle_path")?,
        signature_path: row.get("signature_path")?,
        check_name: row.get("check_name")?,
        outcome: row.get("outcome")?,
        created_at: parse_ts(&created_at),
        retry_count: row.get("retry_count")?,
        last_error: row.get("last_error")?,
        uploaded_at: uploaded_at.as_deref().map(parse_ts),
        needs_attention: row.get::<_, i64>("needs_attention")? != 0,
    })
}

const COLUMNS: &str = "bundle_id, bundle_path, signature_path, check_name, outcome, \
                       created_at, retry_count, last_error, uploaded_at, needs_attention";

impl OfflineQueue {
    pub fn open(db_path: &Path, attempt_cap: u32) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open queue database {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL on queue database")?;
        conn.pragma_update(None, "synchronous", "FULL")
            .context("failed to set synchronous mode on queue database")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS evidence_queue (
                bundle_id       TEXT PRIMARY KEY,
                bundle_path     TEXT NOT NULL,
                signature_path  TEXT NOT NULL,
                check_name      TEXT NOT NULL,
                outcome         TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                retry_count     INTEGER NOT NULL DEFAULT 0,
                last_error      TEXT,
                uploaded_at     TEXT,
                needs_attention INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )
        .context("failed to initialize queue schema")?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_queue_pending
             ON evidence_queue (uploaded_at, created_at)",
            [],
        )?;

        Ok(OfflineQueue {
            conn: Arc::new(Mutex::new(conn)),
            attempt_cap,
        })
    }

    /// Insert a bundle; idempotent on `bundle_id`. Returns whether a new
    /// row was created.
    pub fn enqueue(
        &self,
        bundle_id: &str,
        bundle_path: &Path,
        signature_path: &Path,
        check_name: &str,
        outcome: &str,
        created_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn.lock().expect("queue poisoned");
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO evidence_queue
             (bundle_id, bundle_path, signature_path, check_name, outcome, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                bundle_id,
                bundle_path.to_string_lossy(),
                signature_path.to_string_lossy(),
                check_name,
                outcome,
                created_at.to_rfc3339(),
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Oldest unacknowledged records, up to `limit`.
    pub fn next_pending(&self, limit: usize) -> Result<Vec<QueuedBundle>> {
        let conn = self.conn.lock().expect("queue poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM evidence_queue
             WHERE uploaded_at IS NULL
             ORDER BY created_at ASC, bundle_id ASC
             LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_bundle)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Terminal: the bundle has been uploaded exactly once.
    pub fn mark_uploaded(&self, bundle_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().expect("queue poisoned");
        conn.execute(
            "UPDATE evidence_queue SET uploaded_at = ?2
             WHERE bundle_id = ?1 AND uploaded_at IS NULL",
            params![bundle_id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Record an upload failure; `retry_count` is monotonic. Past the
    /// attempt cap the row is flagged for human attention but preserved.
    pub fn mark_failure(&self, bundle_id: &str, error: &str) -> Result<u32> {
        let conn = self.conn.lock().expect("queue poisoned");
        conn.execute(
            "UPDATE evidence_queue
             SET retry_count = retry_count + 1, last_error = ?2
             WHERE bundle_id = ?1",
            params![bundle_id, error],
        )?;
        let retry_count: u32 = conn
            .query_row(
                "SELECT retry_count FROM evidence_queue WHERE bundle_id = ?1",
                params![bundle_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        if retry_count >= self.attempt_cap {
            conn.execute(
                "UPDATE evidence_queue SET needs_attention = 1 WHERE bundle_id = ?1",
                params![bundle_id],
            )?;
            warn!(bundle_id, retry_count, "bundle exceeded upload attempt cap");
        }
        Ok(retry_count)
    }

    pub fn get(&self, bundle_id: &str) -> Result<Option<QueuedBundle>> {
        let conn = self.conn.lock().expect("queue poisoned");
        let row = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM evidence_queue WHERE bundle_id = ?1"),
                params![bundle_id],
                row_to_bundle,
            )
            .optional()?;
        Ok(row)
    }

    pub fn pending_count(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("queue poisoned");
        let n: u64 = conn.query_row(
            "SELECT COUNT(*) FROM evidence_queue WHERE uploaded_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(n)
    }

    /// Rows flagged for operator attention.
    pub fn needs_attention(&self) -> Result<Vec<QueuedBundle>> {
        let conn = self.conn.lock().expect("queue poisoned");
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM evidence_queue
             WHERE needs_attention = 1 AND uploaded_at IS NULL
             ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map([], row_to_bundle)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Uploaded rows that every retention constraint allows deleting:
    /// older than both retention horizons, not among the `keep_last_n`
    /// most recent successes for their check, and never the most recent
    /// success for a check. Rows with `uploaded_at` null are untouchable.
    pub fn prunable(
        &self,
        retention_days: u32,
        retention_days_minimum: u32,
        keep_last_n: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<QueuedBundle>> {
        let horizon = now - Duration::days(retention_days.max(retention_days_minimum) as i64);

        let all = {
            let conn = self.conn.lock().expect("queue poisoned");
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM evidence_queue
                 WHERE uploaded_at IS NOT NULL
                 ORDER BY created_at DESC"
            ))?;
            let rows = stmt.query_map([], row_to_bundle)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };

        // Protect the keep_last_n most recent successes per check kind
        // (at least the latest one, always).
        let keep = keep_last_n.max(1) as usize;
        let mut protected: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut success_seen: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        for row in &all {
            if row.outcome == "success" {
                let seen = success_seen.entry(row.check_name.clone()).or_insert(0);
                if *seen < keep {
                    protected.insert(row.bundle_id.clone());
                }
                *seen += 1;
            }
        }

        Ok(all
            .into_iter()
            .filter(|row| row.created_at < horizon && !protected.contains(&row.bundle_id))
            .collect())
    }

    pub fn remove(&self, bundle_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("queue poisoned");
        conn.execute(
            "DELETE FROM evidence_queue WHERE bundle_id = ?1",
            params![bundle_id],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn queue(dir: &TempDir) -> OfflineQueue {
        OfflineQueue::open(&dir.path().join("queue.db"), 3).unwrap()
    }

    fn enqueue_at(
        q: &OfflineQueue,
        id: &str,
        check: &str,
        outcome: &str,
        created_at: DateTime<Utc>,
    ) {
        q.enqueue(
            id,
            Path::new("/tmp/b.json"),
            Path::new("/tmp/b.sig"),
            check,
            outcome,
            created_at,
        )
        .unwrap();
    }

    #[test]
    fn test_enqueue_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let now = Utc::now();
        assert!(q
            .enqueue(
                "b-1",
                Path::new("/tmp/b.json"),
                Path::new("/tmp/b.sig"),
                "services",
                "success",
                now
            )
            .unwrap());
        assert!(!q
            .enqueue(
                "b-1",
                Path::new("/tmp/other.json"),
                Path::new("/tmp/other.sig"),
                "services",
                "success",
                now
            )
            .unwrap());
        assert_eq!(q.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_next_pending_oldest_first() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let now = Utc::now();
        enqueue_at(&q, "b-new", "services", "success", now);
        enqueue_at(&q, "b-old", "services", "success", now - Duration::hours(2));
        let pending = q.next_pending(10).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].bundle_id, "b-old");
        assert_eq!(pending[1].bundle_id, "b-new");
    }

    #[test]
    fn test_mark_uploaded_is_terminal() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        enqueue_at(&q, "b-1", "services", "success", Utc::now());
        q.mark_uploaded("b-1", Utc::now()).unwrap();
        assert_eq!(q.pending_count().unwrap(), 0);
        assert!(q.next_pending(10).unwrap().is_empty());
        let row = q.get("b-1").unwrap().unwrap();
        assert!(!row.is_pending());
    }

    #[test]
    fn test_mark_failure_monotonic_and_attention_cap() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        enqueue_at(&q, "b-1", "services", "success", Utc::now());
        assert_eq!(q.mark_failure("b-1", "timeout").unwrap(), 1);
        assert_eq!(q.mark_failure("b-1", "timeout").unwrap(), 2);
        assert!(q.needs_attention().unwrap().is_empty());
        assert_eq!(q.mark_failure("b-1", "503").unwrap(), 3);
        let attention = q.needs_attention().unwrap();
        assert_eq!(attention.len(), 1);
        assert_eq!(attention[0].last_error.as_deref(), Some("503"));
        // still pending; never dropped
        assert_eq!(q.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_prune_never_touches_pending_rows() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let old = Utc::now() - Duration::days(400);
        enqueue_at(&q, "b-pending", "services", "success", old);
        assert!(q.prunable(30, 7, 1, Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn test_prune_keeps_latest_success_per_check() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let now = Utc::now();
        let old = now - Duration::days(400);
        enqueue_at(&q, "b-old-svc", "services", "success", old);
        enqueue_at(&q, "b-older-svc", "services", "success", old - Duration::days(1));
        enqueue_at(&q, "b-old-clk", "clock", "alert", old);
        for id in ["b-old-svc", "b-older-svc", "b-old-clk"] {
            q.mark_uploaded(id, now).unwrap();
        }

        let prunable = q.prunable(30, 7, 1, now).unwrap();
        let ids: Vec<&str> = prunable.iter().map(|b| b.bundle_id.as_str()).collect();
        // the latest services success survives; the older one and the
        // non-success clock alert are fair game
        assert!(!ids.contains(&"b-old-svc"));
        assert!(ids.contains(&"b-older-svc"));
        assert!(ids.contains(&"b-old-clk"));
    }

    #[test]
    fn test_prune_honors_minimum_age() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let now = Utc::now();
        enqueue_at(&q, "b-recent", "clock", "alert", now - Duration::days(3));
        q.mark_uploaded("b-recent", now).unwrap();
        // retention_days of 1 would allow deletion, but the 7-day minimum wins
        assert!(q.prunable(1, 7, 1, now).unwrap().is_empty());
    }

    #[test]
    fn test_prune_keep_last_n_successes() {
        let dir = TempDir::new().unwrap();
        let q = queue(&dir);
        let now = Utc::now();
        let base = now - Duration::days(100);
        for i in 0..5 {
            let id = format!("b-{i}");
            enqueue_at(&q, &id, "backup", "success", base - Duration::days(i));
            q.mark_uploaded(&id, now).unwrap();
        }
        let prunable = q.prunable(30, 7, 3, now).unwrap();
        let ids: Vec<&str> = prunable.iter().map(|b| b.bundle_id.as_str()).collect();
        // b-0, b-1, b-2 are the three most recent successes
        assert_eq!(ids, vec!["b-3", "b-4"]);
    }

    #[test]
    fn test_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");
        {
            let q = OfflineQueue::open(&path, 3).unwrap();
            q.enqueue(
                "b-1",
                Path::new("/tmp/b.json"),
                Path::new("/tmp/b.sig"),
                "manifest",
                "success",
                Utc::now(),
            )
            .unwrap();
        }
        let q = OfflineQueue::open(&path, 3).unwrap();
        assert_eq!(q.pending_count().unwrap(), 1);
    }
}
