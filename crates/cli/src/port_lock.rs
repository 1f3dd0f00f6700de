// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Advisory file lock on a serial device path.
//!
//! Layout: `<lock_dir>/<sanitized_device>.lock` holds the flock; a sibling
//! `<...>.lock.info` JSON records the owner so contenders can report who is
//! holding the port. The `.info` file is advisory metadata — the flock on
//! the `.lock` file is the lock.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::procs::pid_alive;

/// Owner metadata stored next to the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: i32,
    pub process_name: String,
    pub started: DateTime<Utc>,
    pub port: String,
}

/// A process found holding the device node open (via lsof).
#[derive(Debug, Clone)]
pub struct PortUser {
    pub pid: i32,
    pub name: String,
    pub cmdline: String,
}

/// Outcome of a cleanup sweep, for operator reporting.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed_info: usize,
    pub removed_lock: usize,
    pub corrupt_info: usize,
    pub dead_pids: Vec<i32>,
}

pub struct PortLock {
    port: String,
    lock_path: PathBuf,
    info_path: PathBuf,
    held: Option<Flock<File>>,
}

/// Convert a device path into a flat lock file name.
/// `/dev/cu.usbmodem123` becomes `_dev_cu.usbmodem123.lock`.
fn sanitize_device(port: &str) -> String {
    port.replace(['/', '\\'], "_")
}

impl PortLock {
    pub fn new(lock_dir: &Path, port: &str) -> anyhow::Result<Self> {
        std::fs::create_dir_all(lock_dir)?;
        let lock_path = lock_dir.join(format!("{}.lock", sanitize_device(port)));
        let info_path = lock_dir.join(format!("{}.lock.info", sanitize_device(port)));
        Ok(Self { port: port.to_owned(), lock_path, info_path, held: None })
    }

    /// Attempt a non-blocking exclusive lock, retrying up to `timeout`.
    ///
    /// With `force`, a lock whose recorded owner PID is dead is reclaimed
    /// by deleting the stale artifacts and retrying.
    pub async fn acquire(&mut self, timeout: Duration, force: bool) -> bool {
        let start = tokio::time::Instant::now();
        let mut stole = false;

        loop {
            let file = match OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&self.lock_path)
            {
                Ok(f) => f,
                Err(e) => {
                    warn!("could not open lock file {}: {e}", self.lock_path.display());
                    return false;
                }
            };

            match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
                Ok(held) => {
                    self.held = Some(held);
                    if let Err(e) = self.write_owner_info() {
                        warn!("could not write lock info: {e}");
                    }
                    info!("acquired lock for {}", self.port);
                    return true;
                }
                Err((_file, _errno)) => {
                    let owner = self.owner();

                    if force && !stole {
                        if let Some(ref o) = owner {
                            if !pid_alive(o.pid) {
                                warn!("stealing lock from dead process {}", o.pid);
                                self.cleanup_stale();
                                stole = true;
                                continue;
                            }
                        }
                    }

                    if start.elapsed() < timeout {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }

                    match owner {
                        Some(o) => warn!(
                            "port {} locked by PID {} ({}) since {}",
                            self.port, o.pid, o.process_name, o.started
                        ),
                        None => warn!("port {} locked by unknown process", self.port),
                    }
                    return false;
                }
            }
        }
    }

    /// Release the flock and remove both artifacts. External tools (and
    /// the pause protocol) treat the files' absence as "port free".
    pub fn release(&mut self) {
        if let Some(held) = self.held.take() {
            let _ = held.unlock();
            let _ = std::fs::remove_file(&self.lock_path);
        }
        let _ = std::fs::remove_file(&self.info_path);
        info!("released lock for {}", self.port);
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Read the recorded owner, `None` if absent or unparseable.
    pub fn owner(&self) -> Option<LockOwner> {
        let contents = std::fs::read_to_string(&self.info_path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    fn write_owner_info(&self) -> anyhow::Result<()> {
        let owner = LockOwner {
            pid: std::process::id() as i32,
            process_name: process_name(),
            started: Utc::now(),
            port: self.port.clone(),
        };

        // Atomic publish so contenders never read half-written JSON.
        let dir = self.info_path.parent().unwrap_or(Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(serde_json::to_string_pretty(&owner)?.as_bytes())?;
        tmp.persist(&self.info_path)?;
        Ok(())
    }

    fn cleanup_stale(&self) {
        let _ = std::fs::remove_file(&self.lock_path);
        let _ = std::fs::remove_file(&self.info_path);
    }
}

impl Drop for PortLock {
    fn drop(&mut self) {
        if self.held.is_some() {
            self.release();
        }
    }
}

/// First few argv words, capped, as a human-readable process name.
fn process_name() -> String {
    let joined: String = std::env::args().take(3).collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        format!("eab:{}", std::process::id())
    } else {
        joined.chars().take(50).collect()
    }
}

/// List locks in `lock_dir` whose recorded owners are still alive.
pub fn list_all_locks(lock_dir: &Path) -> Vec<LockOwner> {
    let Ok(entries) = std::fs::read_dir(lock_dir) else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter(|e| e.path().extension().is_some_and(|x| x == "info"))
        .filter_map(|e| {
            let contents = std::fs::read_to_string(e.path()).ok()?;
            serde_json::from_str::<LockOwner>(&contents).ok()
        })
        .filter(|o| pid_alive(o.pid))
        .collect()
}

/// Remove lock artifacts whose recorded PID is provably dead.
///
/// A `.lock` is deleted only when its `.info` parses and the PID is dead.
/// Corrupt `.info` files are deleted alone — the lock may still be held,
/// and removing the inode under a live flock would let a second process
/// double-own the lock.
pub fn cleanup_dead_locks(lock_dir: &Path) -> CleanupReport {
    let mut report = CleanupReport::default();
    let Ok(entries) = std::fs::read_dir(lock_dir) else {
        return report;
    };

    for entry in entries.flatten() {
        let info_path = entry.path();
        let Some(name) = info_path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(lock_name) = name.strip_suffix(".info") else {
            continue;
        };
        if !lock_name.ends_with(".lock") {
            continue;
        }
        let lock_path = info_path.with_file_name(lock_name);

        let owner = std::fs::read_to_string(&info_path)
            .ok()
            .and_then(|c| serde_json::from_str::<LockOwner>(&c).ok());

        let Some(owner) = owner else {
            report.corrupt_info += 1;
            if std::fs::remove_file(&info_path).is_ok() {
                report.removed_info += 1;
                info!("removed corrupt lock info: {}", info_path.display());
            }
            continue;
        };

        if owner.pid > 0 && !pid_alive(owner.pid) {
            report.dead_pids.push(owner.pid);
            if std::fs::remove_file(&info_path).is_ok() {
                report.removed_info += 1;
            }
            // Info is gone and the PID is dead, so nothing holds the flock.
            if std::fs::remove_file(&lock_path).is_ok() {
                report.removed_lock += 1;
            }
        }
    }

    report
}

/// Find processes holding the device node open, via lsof.
pub async fn find_port_users(port: &str) -> Vec<PortUser> {
    let output = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new("lsof").arg(port).output(),
    )
    .await;

    let Ok(Ok(output)) = output else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .skip(1) // header
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let name = parts.next()?.to_owned();
            let pid = parts.next()?.parse().ok()?;
            Some(PortUser { pid, name, cmdline: line.to_owned() })
        })
        .collect()
}

/// SIGTERM every process holding the port open, except ourselves.
/// Returns the PIDs that were signaled.
pub async fn kill_port_users(port: &str, signal: nix::sys::signal::Signal) -> Vec<i32> {
    let own_pid = std::process::id() as i32;
    let mut signaled = Vec::new();
    for user in find_port_users(port).await {
        if user.pid == own_pid {
            continue;
        }
        if nix::sys::signal::kill(nix::unistd::Pid::from_raw(user.pid), signal).is_ok() {
            signaled.push(user.pid);
        }
    }
    signaled
}

#[cfg(test)]
#[path = "port_lock_tests.rs"]
mod tests;
