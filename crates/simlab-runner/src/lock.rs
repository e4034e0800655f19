use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use simlab_core::{ensure_dir, read_json, Result, SimlabError};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Exclusive claim on an output directory, released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LockOwner {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// The lock lives next to the output directory so it never ends up in the
/// results archive.
pub fn lock_path(output_directory: &Path) -> PathBuf {
    let name = output_directory
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "run".to_string());
    output_directory.with_file_name(format!(".{}.simlab.lock", name))
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}

/// A lock is stale only when its owner pid is readable and that process is
/// gone. An unreadable lock file is treated as held and must be removed by
/// hand.
fn is_stale(path: &Path) -> bool {
    match read_json::<LockOwner>(path) {
        Ok(owner) => owner.pid != std::process::id() && !process_alive(owner.pid),
        Err(_) => false,
    }
}

fn try_create(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

/// Claims `output_directory`. A lock left by a supervisor that died
/// without releasing it is reclaimed once.
pub fn acquire_run_lock(output_directory: &Path) -> Result<RunLock> {
    let path = lock_path(output_directory);
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let mut file = match try_create(&path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::AlreadyExists && is_stale(&path) => {
            warn!(lock = %path.display(), "removing lock left by a dead supervisor");
            match fs::remove_file(&path) {
                Err(e) if e.kind() != ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            }
            try_create(&path).map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => {
                    SimlabError::RunInProgress(output_directory.to_path_buf())
                }
                _ => e.into(),
            })?
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(SimlabError::RunInProgress(output_directory.to_path_buf()))
        }
        Err(e) => return Err(e.into()),
    };
    let lock = RunLock { path };
    let owner = LockOwner {
        pid: std::process::id(),
        acquired_at: Utc::now(),
    };
    file.write_all(&serde_json::to_vec(&owner)?)?;
    let _ = file.sync_all();
    Ok(lock)
}
