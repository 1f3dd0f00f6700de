// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session log: timestamped line appends with header/footer framing, a
//! recent-line ring for crash context, and size-triggered rotation.

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::warn;

use crate::ports::Clock;
use crate::sanitize::Sanitizer;

const SEPARATOR: &str =
    "================================================================================";

/// Log rotation settings.
#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Bytes written before the current file is rotated out.
    pub max_size_bytes: u64,
    /// Rotated siblings to keep (`latest.log.1` .. `.N`).
    pub max_files: u32,
    /// Gzip rotated files.
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self { max_size_bytes: 100_000_000, max_files: 5, compress: true }
    }
}

pub struct SessionLogger {
    clock: Arc<dyn Clock>,
    sanitizer: Sanitizer,
    log_path: PathBuf,
    rotation: RotationConfig,

    session_id: String,
    port: String,
    baud: u32,
    started: Option<DateTime<Utc>>,
    lines_logged: u64,
    commands_sent: u64,
    bytes_written: u64,
    recent: VecDeque<String>,
    recent_capacity: usize,
}

impl SessionLogger {
    pub fn new(
        clock: Arc<dyn Clock>,
        base_dir: &Path,
        rotation: RotationConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            clock,
            sanitizer: Sanitizer::new()?,
            log_path: base_dir.join("latest.log"),
            rotation,
            session_id: String::new(),
            port: String::new(),
            baud: 0,
            started: None,
            lines_logged: 0,
            commands_sent: 0,
            bytes_written: 0,
            recent: VecDeque::new(),
            recent_capacity: 500,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn lines_logged(&self) -> u64 {
        self.lines_logged
    }

    pub fn commands_sent(&self) -> u64 {
        self.commands_sent
    }

    /// Begin a new session: archive the previous log, write the header.
    pub fn start_session(&mut self, port: &str, baud: u32) -> anyhow::Result<()> {
        let started = self.clock.now();
        self.port = port.to_owned();
        self.baud = baud;
        self.started = Some(started);
        self.lines_logged = 0;
        self.commands_sent = 0;
        self.bytes_written = 0;
        self.recent.clear();
        self.session_id = started.format("serial_%Y-%m-%d_%H-%M-%S").to_string();

        if self.log_path.exists() {
            self.archive_previous();
        }

        if let Some(dir) = self.log_path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let header = format!(
            "{SEPARATOR}\nSESSION: {}\nPORT: {}\nBAUD: {}\nSTARTED: {}\n{SEPARATOR}\n\n",
            self.session_id,
            self.port,
            self.baud,
            started.to_rfc3339(),
        );
        std::fs::write(&self.log_path, header)?;
        Ok(())
    }

    /// Log a line: `[HH:MM:SS.mmm] <text>`.
    pub fn log_line(&mut self, text: &str) {
        let formatted = self.format_entry(text, "");
        self.append(&formatted);
        self.lines_logged += 1;
        self.push_recent(&formatted);
        self.check_rotation();
    }

    /// Log a sent command: `[HH:MM:SS.mmm] >>> CMD: <command>`.
    pub fn log_command(&mut self, command: &str) {
        let formatted = self.format_entry(command, ">>> CMD: ");
        self.append(&formatted);
        self.commands_sent += 1;
        self.push_recent(&formatted);
        self.check_rotation();
    }

    /// Write the session footer with duration and counters.
    pub fn end_session(&mut self) {
        let now = self.clock.now();
        let duration = match self.started {
            Some(started) => {
                let total = (now - started).num_seconds().max(0);
                format!("{}h {}m {:02}s", total / 3600, (total % 3600) / 60, total % 60)
            }
            None => "unknown".to_owned(),
        };

        let footer = format!(
            "\n{SEPARATOR}\nSESSION ENDED: {}\nDURATION: {duration}\nLINES LOGGED: {}\nCOMMANDS SENT: {}\n{SEPARATOR}\n",
            now.format("%Y-%m-%d_%H-%M-%S"),
            self.lines_logged,
            self.commands_sent,
        );
        self.append(&footer);
    }

    /// Most recent logged entries (newest last), for crash context.
    pub fn recent_lines(&self, count: usize) -> Vec<String> {
        let skip = self.recent.len().saturating_sub(count);
        self.recent.iter().skip(skip).cloned().collect()
    }

    fn format_entry(&self, text: &str, marker: &str) -> String {
        let text = self.sanitizer.strip_ansi(text);
        let stamp = self.clock.now().format("%H:%M:%S%.3f");
        format!("[{stamp}] {marker}{text}\n")
    }

    fn append(&mut self, formatted: &str) {
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .and_then(|mut f| {
                f.write_all(formatted.as_bytes())?;
                f.flush()
            });
        match result {
            Ok(()) => self.bytes_written += formatted.len() as u64,
            Err(e) => warn!("could not append to session log: {e}"),
        }
    }

    fn push_recent(&mut self, formatted: &str) {
        if self.recent.len() == self.recent_capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(formatted.trim_end().to_owned());
    }

    fn check_rotation(&mut self) {
        if self.bytes_written >= self.rotation.max_size_bytes {
            self.rotate();
        }
    }

    fn archive_previous(&mut self) {
        let src = self.log_path.clone();
        let dst = self.sibling(1, false);
        self.rotate_file_to(&src, &dst);
    }

    /// Path of rotated sibling `.N` or `.N.gz`.
    fn sibling(&self, index: u32, gz: bool) -> PathBuf {
        let suffix = if gz { format!(".{index}.gz") } else { format!(".{index}") };
        let mut name = self.log_path.as_os_str().to_owned();
        name.push(suffix);
        PathBuf::from(name)
    }

    /// Rotate: drop the oldest slot, shift the rest backwards (oldest
    /// first, so no slot is overwritten before its occupant moved), then
    /// rotate the current file into `.1`.
    fn rotate(&mut self) {
        let max_files = self.rotation.max_files;

        // Compression setting may change between runs, so both extensions
        // can coexist; each slot drops or shifts whichever form exists.
        for gz in [false, true] {
            let oldest = self.sibling(max_files, gz);
            if oldest.exists() {
                let _ = std::fs::remove_file(&oldest);
            }
        }

        for i in (1..max_files).rev() {
            for gz in [false, true] {
                let src = self.sibling(i, gz);
                let dst = self.sibling(i + 1, gz);
                if src.exists() {
                    if let Err(e) = std::fs::rename(&src, &dst) {
                        warn!("rotation shift failed for {}: {e}", src.display());
                    }
                }
            }
        }

        if self.log_path.exists() {
            let src = self.log_path.clone();
            let dst = self.sibling(1, false);
            self.rotate_file_to(&src, &dst);
        }

        self.bytes_written = 0;
    }

    /// Move `src` into `dst`, gzipping when compression is enabled (the
    /// destination then gets a `.gz` suffix).
    fn rotate_file_to(&self, src: &Path, dst: &Path) {
        if self.rotation.compress {
            let mut gz_dst = dst.as_os_str().to_owned();
            gz_dst.push(".gz");
            let gz_dst = PathBuf::from(gz_dst);

            let result = (|| -> anyhow::Result<()> {
                let mut input = std::fs::File::open(src)?;
                let output = std::fs::File::create(&gz_dst)?;
                let mut encoder = GzEncoder::new(output, Compression::default());
                std::io::copy(&mut input, &mut encoder)?;
                encoder.finish()?;
                std::fs::remove_file(src)?;
                Ok(())
            })();
            if let Err(e) = result {
                warn!("could not compress rotated log: {e}");
                let _ = std::fs::rename(src, dst);
            }
        } else if let Err(e) = std::fs::rename(src, dst) {
            warn!("could not rotate {}: {e}", src.display());
        }
    }
}

#[cfg(test)]
#[path = "session_log_tests.rs"]
mod tests;
