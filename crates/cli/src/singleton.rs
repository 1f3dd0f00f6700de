// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-device daemon singleton.
//!
//! `<session_dir>/daemon.pid` holds an exclusive flock while a daemon
//! runs; `<session_dir>/daemon.info` carries key=value metadata for
//! observers. The info file format is plain text so shell tooling can
//! grep it without a JSON parser.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use nix::fcntl::{Flock, FlockArg};
use tracing::{error, info, warn};

use crate::procs::{pid_alive, read_pid_file, stop_process_graceful};

/// Metadata describing a (possibly dead) daemon for a session directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonInfo {
    pub pid: i32,
    pub is_alive: bool,
    pub port: String,
    pub base_dir: String,
    pub started: String,
    pub device_name: String,
    pub device_type: String,
    pub chip: String,
}

pub struct Singleton {
    session_dir: PathBuf,
    device_name: String,
    held: Option<Flock<File>>,
}

fn pid_path(session_dir: &Path) -> PathBuf {
    session_dir.join("daemon.pid")
}

fn info_path(session_dir: &Path) -> PathBuf {
    session_dir.join("daemon.info")
}

/// Parse a daemon.info key=value file. Unknown keys are ignored.
pub fn parse_info_file(path: &Path) -> DaemonInfo {
    let mut out = DaemonInfo { device_type: "serial".to_owned(), ..DaemonInfo::default() };
    let Ok(contents) = std::fs::read_to_string(path) else {
        return out;
    };
    for line in contents.lines() {
        let Some((key, val)) = line.split_once('=') else {
            continue;
        };
        match key {
            "pid" => out.pid = val.trim().parse().unwrap_or(0),
            "port" => out.port = val.to_owned(),
            "base_dir" => out.base_dir = val.to_owned(),
            "started" => out.started = val.to_owned(),
            "device_name" => out.device_name = val.to_owned(),
            "type" => out.device_type = val.to_owned(),
            "chip" => out.chip = val.to_owned(),
            _ => {}
        }
    }
    out
}

/// Write a daemon.info file.
pub fn write_info_file(
    path: &Path,
    pid: i32,
    port: &str,
    base_dir: &str,
    device_name: &str,
    device_type: &str,
    chip: &str,
) -> anyhow::Result<()> {
    let mut f = File::create(path)?;
    writeln!(f, "pid={pid}")?;
    writeln!(f, "port={port}")?;
    writeln!(f, "base_dir={base_dir}")?;
    writeln!(f, "started={}", Utc::now().to_rfc3339())?;
    writeln!(f, "device_name={device_name}")?;
    writeln!(f, "type={device_type}")?;
    writeln!(f, "chip={chip}")?;
    Ok(())
}

impl Singleton {
    pub fn new(session_dir: &Path, device_name: &str) -> Self {
        Self {
            session_dir: session_dir.to_owned(),
            device_name: device_name.to_owned(),
            held: None,
        }
    }

    /// Inspect the session directory for an existing daemon.
    pub fn existing(&self) -> Option<DaemonInfo> {
        let pid = read_pid_file(&pid_path(&self.session_dir))?;
        let mut info = parse_info_file(&info_path(&self.session_dir));
        info.pid = pid;
        info.is_alive = pid_alive(pid);
        if info.device_name.is_empty() {
            info.device_name = self.device_name.clone();
        }
        Some(info)
    }

    /// Acquire the singleton lock.
    ///
    /// With `kill_existing`, a live holder is SIGTERM'd (5 s grace, then
    /// SIGKILL) before the lock is taken. Without it, a live holder makes
    /// acquisition fail with a report of who owns the session.
    pub async fn acquire(
        &mut self,
        port: &str,
        base_dir: &str,
        device_type: &str,
        chip: &str,
        kill_existing: bool,
    ) -> bool {
        if let Some(existing) = self.existing() {
            if existing.is_alive {
                if kill_existing {
                    warn!("killing existing daemon (PID {})...", existing.pid);
                    if !stop_process_graceful(existing.pid, Duration::from_secs(5)).await {
                        error!("could not kill existing daemon (PID {})", existing.pid);
                        return false;
                    }
                    info!("killed existing daemon");
                } else {
                    error!(
                        "another EAB daemon is already running: PID {} port {} started {} \
                         (use --force to kill it and take over)",
                        existing.pid, existing.port, existing.started
                    );
                    return false;
                }
            } else {
                info!("removing stale PID file (PID {} not running)", existing.pid);
                let _ = std::fs::remove_file(pid_path(&self.session_dir));
            }
        }

        if let Err(e) = std::fs::create_dir_all(&self.session_dir) {
            error!("could not create session dir: {e}");
            return false;
        }

        let file = match OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(pid_path(&self.session_dir))
        {
            Ok(f) => f,
            Err(e) => {
                error!("could not open PID file: {e}");
                return false;
            }
        };

        let mut held = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(h) => h,
            Err((_f, errno)) => {
                error!("could not acquire singleton lock: {errno}");
                return false;
            }
        };

        let pid = std::process::id() as i32;
        let written = (|| -> anyhow::Result<()> {
            held.set_len(0)?;
            held.seek(SeekFrom::Start(0))?;
            writeln!(held, "{pid}")?;
            held.sync_all()?;
            Ok(())
        })();
        if let Err(e) = written {
            error!("could not write PID file: {e}");
            return false;
        }

        if let Err(e) = write_info_file(
            &info_path(&self.session_dir),
            pid,
            port,
            base_dir,
            &self.device_name,
            device_type,
            chip,
        ) {
            warn!("could not write daemon.info: {e}");
        }

        self.held = Some(held);
        info!("acquired singleton lock (PID {pid})");
        true
    }

    /// Release the lock and remove both files.
    pub fn release(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        let _ = std::fs::remove_file(info_path(&self.session_dir));
        let _ = held.unlock();
        let _ = std::fs::remove_file(pid_path(&self.session_dir));
        info!("released singleton lock");
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

impl Drop for Singleton {
    fn drop(&mut self) {
        self.release();
    }
}

/// Quick liveness check for a session directory without taking the lock.
pub fn check_singleton(session_dir: &Path, device_name: &str) -> Option<DaemonInfo> {
    Singleton::new(session_dir, device_name).existing()
}

/// Stop any daemon recorded in the session directory, cleaning up stale
/// files when the holder is already gone.
pub async fn kill_existing_daemon(session_dir: &Path, timeout: Duration) -> bool {
    let singleton = Singleton::new(session_dir, "");
    let Some(existing) = singleton.existing() else {
        return true;
    };

    if !existing.is_alive {
        let _ = std::fs::remove_file(pid_path(session_dir));
        let _ = std::fs::remove_file(info_path(session_dir));
        return true;
    }

    stop_process_graceful(existing.pid, timeout).await
}

#[cfg(test)]
#[path = "singleton_tests.rs"]
mod tests;
