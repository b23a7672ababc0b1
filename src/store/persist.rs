//! Document persistence: exclusive lock file, atomic replace, snapshots
//!
//! Writes go to a temp file next to the document, are fsynced and then
//! renamed over it, so a failure mid-write leaves the previous document
//! intact. A `<doc>.lock` file created with create-new semantics keeps
//! concurrent processes from interleaving saves.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;

use super::document::Document;
use crate::{Error, Result};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Guard that removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    const fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Exclusive document lock, released on drop.
pub(crate) struct DocumentLock {
    path: PathBuf,
}

impl DocumentLock {
    /// Create `<document>.lock`, polling until `timeout` elapses.
    pub(crate) fn acquire(document: &Path, timeout: Duration) -> Result<Self> {
        let path = lock_path(document);
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = write!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if started.elapsed() >= timeout {
                        return Err(Error::LockTimeout {
                            path: path.display().to_string(),
                            waited_ms: started.elapsed().as_millis(),
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for DocumentLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to release document lock");
        }
    }
}

/// Lock file path for a document.
#[must_use]
pub fn lock_path(document: &Path) -> PathBuf {
    let mut name = document.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    document.with_file_name(name)
}

/// Snapshot retention settings for [`write_document`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct SnapshotPolicy {
    pub(crate) enabled: bool,
    pub(crate) max_snapshots: usize,
}

/// Serialize, verify, snapshot and atomically replace the document at `path`.
pub(crate) fn write_document(
    path: &Path,
    document: &Document,
    lock_timeout: Duration,
    snapshots: SnapshotPolicy,
) -> Result<()> {
    let payload = document.to_vec_pretty()?;
    // Re-parse before touching disk; a payload that cannot be loaded is never written.
    Document::from_slice(&payload, &path.display().to_string())?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let _lock = DocumentLock::acquire(path, lock_timeout)?;

    if snapshots.enabled && snapshots.max_snapshots > 0 && path.exists() {
        let snapshot = snapshot_path(path);
        fs::copy(path, &snapshot)?;
        tracing::debug!(snapshot = %snapshot.display(), "document snapshot written");
        rotate_snapshots(path, snapshots.max_snapshots)?;
    }

    write_atomic(path, &payload)
}

/// Write `contents` to a temp file beside `path`, fsync, and rename into place.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("tmp");
    let mut guard = TempFileGuard::new(tmp_path.clone());
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    guard.disarm();
    Ok(())
}

/// Read the document at `path`.
pub(crate) fn read_document(path: &Path) -> Result<Document> {
    let bytes = fs::read(path)?;
    Document::from_slice(&bytes, &path.display().to_string())
}

fn snapshot_prefix(document: &Path) -> String {
    let stem = document
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{stem}_")
}

fn snapshot_path(document: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S%.6f");
    document.with_file_name(format!("{}{stamp}.json", snapshot_prefix(document)))
}

/// Retained snapshots of `document`, oldest first.
///
/// # Errors
///
/// Returns `Io` if the document directory cannot be listed.
pub fn list_snapshots(document: &Path) -> Result<Vec<PathBuf>> {
    let dir = match document.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let prefix = snapshot_prefix(document);
    let mut snapshots: Vec<PathBuf> = fs::read_dir(&dir)?
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"))
        })
        .collect();
    // Timestamps sort lexicographically.
    snapshots.sort();
    Ok(snapshots)
}

fn rotate_snapshots(document: &Path, max_snapshots: usize) -> Result<()> {
    let snapshots = list_snapshots(document)?;
    let excess = snapshots.len().saturating_sub(max_snapshots);
    for old in &snapshots[..excess] {
        fs::remove_file(old)?;
        tracing::debug!(snapshot = %old.display(), "rotated out old snapshot");
    }
    Ok(())
}
