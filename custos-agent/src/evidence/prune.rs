//! Scheduled pruning of uploaded evidence.
//!
//! A bundle is deleted only when every constraint allows it: it has been
//! uploaded, it is past both retention horizons, and it is not among the
//! protected most-recent successes for its check kind. The queue decides;
//! this module removes the files and the rows.

use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::queue::OfflineQueue;

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: usize,
    pub failed: usize,
}

pub struct Pruner {
    retention_days: u32,
    retention_days_minimum: u32,
    keep_last_n: u32,
}

impl Pruner {
    pub fn new(retention_days: u32, retention_days_minimum: u32, keep_last_n: u32) -> Self {
        Pruner {
            retention_days,
            retention_days_minimum,
            keep_last_n,
        }
    }

    pub fn run(&self, queue: &OfflineQueue, now: DateTime<Utc>) -> Result<PruneReport> {
        let candidates = queue.prunable(
            self.retention_days,
            self.retention_days_minimum,
            self.keep_last_n,
            now,
        )?;

        let mut report = PruneReport::default();
        for row in candidates {
            match remove_bundle_files(Path::new(&row.bundle_path), Path::new(&row.signature_path))
            {
                Ok(()) => {
                    queue.remove(&row.bundle_id)?;
                    report.deleted += 1;
                }
                Err(err) => {
                    warn!(bundle_id = %row.bundle_id, %err, "failed to prune bundle files");
                    report.failed += 1;
                }
            }
        }
        if report.deleted > 0 {
            info!(deleted = report.deleted, "pruned uploaded evidence bundles");
        }
        Ok(report)
    }
}

fn remove_bundle_files(bundle_path: &Path, signature_path: &Path) -> std::io::Result<()> {
    for path in [bundle_path, signature_path] {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
    }
    // drop the now-empty bundle directory, best effort
    if let Some(dir) = bundle_path.parent() {
        let _ = fs::remove_dir(dir);
    }
    Ok(())
}
