// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pause gate: filesystem-signaled port release.
//!
//! External tools write a Unix-epoch deadline to `pause.txt`; the daemon
//! releases the serial port and its lock until the deadline passes or
//! the file disappears. Rewriting the file with a later deadline extends
//! the pause; deleting it ends it early.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// What the orchestrator should do this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum PauseAction {
    /// No pause in effect.
    Run,
    /// A pause just began: release the port, then sleep.
    Enter { deadline: f64, sleep: Duration },
    /// Still paused: sleep and re-check.
    Hold { sleep: Duration },
    /// The pause ended: re-acquire the port.
    Resume { paused_for: f64 },
}

pub struct PauseGate {
    pause_path: PathBuf,
    paused: bool,
    pause_started: Option<f64>,
    original_port: Option<String>,
}

impl PauseGate {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            pause_path: session_dir.join("pause.txt"),
            paused: false,
            pause_started: None,
            original_port: None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// The port that was held when the pause began.
    pub fn original_port(&self) -> Option<&str> {
        self.original_port.as_deref()
    }

    /// Evaluate the pause file against the current time.
    pub fn check(&mut self, now: f64) -> PauseAction {
        let deadline = std::fs::read_to_string(&self.pause_path)
            .ok()
            .and_then(|contents| contents.trim().parse::<f64>().ok());

        let Some(deadline) = deadline else {
            // Missing, empty, or unparseable: not paused. A junk file is
            // cleared so tooling does not trip on it later.
            if self.pause_path.exists() {
                let _ = std::fs::write(&self.pause_path, "");
            }
            return self.resume_if_paused(now);
        };

        if now >= deadline {
            let _ = std::fs::remove_file(&self.pause_path);
            return self.resume_if_paused(now);
        }

        let sleep = adaptive_sleep(deadline - now);
        if self.paused {
            PauseAction::Hold { sleep }
        } else {
            self.paused = true;
            self.pause_started = Some(now);
            PauseAction::Enter { deadline, sleep }
        }
    }

    /// Record the port that is being released for this pause.
    pub fn mark_entered(&mut self, port: &str) {
        self.original_port = Some(port.to_owned());
    }

    fn resume_if_paused(&mut self, now: f64) -> PauseAction {
        if !self.paused {
            return PauseAction::Run;
        }
        let paused_for = self.pause_started.map(|at| now - at).unwrap_or(0.0);
        self.paused = false;
        self.pause_started = None;
        PauseAction::Resume { paused_for }
    }

    /// Clear resume bookkeeping once the port is back.
    pub fn mark_resumed(&mut self) {
        self.original_port = None;
    }
}

/// Sleep coarsely while the deadline is far, finely near the edge, so
/// resume latency stays low without spinning for the whole pause.
fn adaptive_sleep(remaining: f64) -> Duration {
    if remaining > 5.0 {
        Duration::from_millis(500)
    } else {
        Duration::from_millis(100)
    }
}

#[cfg(test)]
#[path = "pause_tests.rs"]
mod tests;
