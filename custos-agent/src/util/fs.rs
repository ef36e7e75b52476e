//! Filesystem helpers: atomic writes and key-file permission checks.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use tempfile::NamedTempFile;

/// Write `bytes` to `path` atomically (temp file in the same directory,
/// then rename), so a partial file is never observable.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create directory {}", dir.display()))?;

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;
    use std::io::Write;
    tmp.write_all(bytes)
        .with_context(|| format!("failed to write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to sync temp file for {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to persist {}", path.display()))?;
    Ok(())
}

/// Refuse key files readable by group or other.
#[cfg(unix)]
pub fn ensure_owner_only(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = fs::metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    let mode = meta.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(anyhow!(
            "{} is readable by group/other (mode {:o}); expected owner-only permissions",
            path.display(),
            mode & 0o777
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn ensure_owner_only(_path: &Path) -> Result<()> {
    Ok(())
}
