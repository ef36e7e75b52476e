//! Durable nonce set for order replay protection.
//!
//! Survives agent restarts; written under the same transactional
//! discipline as the offline queue.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

pub struct NonceStore {
    conn: Arc<Mutex<Connection>>,
}

impl NonceStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open nonce database {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL on nonce database")?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS nonces (
                issuer      TEXT NOT NULL,
                nonce       TEXT NOT NULL,
                accepted_at TEXT NOT NULL,
                PRIMARY KEY (issuer, nonce)
            )",
            [],
        )
        .context("failed to initialize nonce schema")?;

        Ok(NonceStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn seen(&self, issuer: &str, nonce: &str) -> Result<bool> {
        let conn = self.conn.lock().expect("nonce store poisoned");
        let mut stmt =
            conn.prepare("SELECT 1 FROM nonces WHERE issuer = ?1 AND nonce = ?2 LIMIT 1")?;
        let mut rows = stmt.query(params![issuer, nonce])?;
        Ok(rows.next()?.is_some())
    }

    pub fn record(&self, issuer: &str, nonce: &str, accepted_at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().expect("nonce store poisoned");
        conn.execute(
            "INSERT OR IGNORE INTO nonces (issuer, nonce, accepted_at) VALUES (?1, ?2, ?3)",
            params![issuer, nonce, accepted_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().expect("nonce store poisoned");
        let n: u64 = conn.query_row("SELECT COUNT(*) FROM nonces", [], |row| row.get(0))?;
        Ok(n)
    }
}
