// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Process liveness and termination helpers shared by the lock modules
//! and the debug-probe subprocess managers.

use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

/// Check whether a process exists via `kill(pid, 0)`.
///
/// EPERM means the process exists but we may not signal it — sandboxed
/// platforms return it even for live processes, and treating that as dead
/// would make lock reclamation unsafe.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Read a PID from a file, `None` on any error.
pub fn read_pid_file(path: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

/// SIGTERM, poll up to `timeout`, then SIGKILL with a short grace period.
///
/// Returns true when the process is gone afterwards.
pub async fn stop_process_graceful(pid: i32, timeout: Duration) -> bool {
    if !pid_alive(pid) {
        return true;
    }

    if kill(Pid::from_raw(pid), Signal::SIGTERM).is_err() {
        return true;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if kill(Pid::from_raw(pid), Signal::SIGKILL).is_ok() {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    !pid_alive(pid)
}

/// Blocking variant for callers already off the async runtime (probe
/// teardown runs on a worker thread).
pub fn stop_process_graceful_blocking(pid: i32, timeout: Duration) -> bool {
    if !pid_alive(pid) {
        return true;
    }

    if kill(Pid::from_raw(pid), Signal::SIGTERM).is_err() {
        return true;
    }

    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    if kill(Pid::from_raw(pid), Signal::SIGKILL).is_ok() {
        std::thread::sleep(Duration::from_millis(500));
    }

    !pid_alive(pid)
}

#[cfg(test)]
#[path = "procs_tests.rs"]
mod tests;
